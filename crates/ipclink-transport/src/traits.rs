use std::os::fd::OwnedFd;

use bytes::BytesMut;

use crate::buffer::MessageBuffer;
use crate::error::Result;

/// Largest payload the transport will carry in a single transfer.
///
/// Anything bigger is wrapped by the connection layer and chunked by the
/// transport, so the ceiling only matters for deciding when to wrap.
pub const MAX_SINGLE_TRANSFER_SIZE: usize = 128 * 1024;

/// Everything one non-blocking drain of the transport produced.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Raw bytes, in arrival order.
    pub bytes: BytesMut,
    /// Handles received alongside the bytes, in arrival order.
    pub handles: Vec<OwnedFd>,
    /// The peer closed its end (or the socket failed) during this drain.
    pub peer_closed: bool,
}

impl ReadOutcome {
    /// True when the drain produced neither bytes nor handles.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.handles.is_empty()
    }
}

/// A duplex byte transport that can also carry handles.
///
/// Implementations are shared between the connection's I/O context and its
/// send worker, so every method takes `&self`.
pub trait Transport: Send + Sync + 'static {
    /// Whether the transport has not been closed yet.
    fn is_open(&self) -> bool;

    /// Close the transport. Closing twice is a no-op.
    fn close(&self);

    /// Read everything currently available without blocking.
    fn read_as_much_as_possible_without_blocking(&self) -> ReadOutcome;

    /// Block until data is pending or the transport is closed.
    fn wait_until_readable(&self);

    /// Write one framed buffer and its handles, chunking as needed.
    fn transfer(&self, buffer: &MessageBuffer) -> Result<()>;

    /// Payloads larger than this are sent inside a large-message wrapper.
    fn max_single_transfer_size(&self) -> usize {
        MAX_SINGLE_TRANSFER_SIZE
    }
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn close(&self) {
        (**self).close()
    }

    fn read_as_much_as_possible_without_blocking(&self) -> ReadOutcome {
        (**self).read_as_much_as_possible_without_blocking()
    }

    fn wait_until_readable(&self) {
        (**self).wait_until_readable()
    }

    fn transfer(&self, buffer: &MessageBuffer) -> Result<()> {
        (**self).transfer(buffer)
    }

    fn max_single_transfer_size(&self) -> usize {
        (**self).max_single_transfer_size()
    }
}
