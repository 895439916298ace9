use std::collections::VecDeque;
use std::os::fd::OwnedFd;

use bytes::{BufMut, BytesMut};

use crate::error::{Result, TransportError};

/// Size of the length prefix in front of every frame on the wire.
pub const LENGTH_PREFIX_SIZE: usize = std::mem::size_of::<u32>();

/// An encoded message payload plus the handles that travel with it.
///
/// `data` never includes the length prefix; [`MessageBuffer::encode_frame`]
/// adds it when the buffer is put on the wire.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    data: BytesMut,
    handles: Vec<OwnedFd>,
}

impl MessageBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer from already-encoded payload bytes.
    pub fn from_parts(data: impl Into<BytesMut>, handles: Vec<OwnedFd>) -> Self {
        Self {
            data: data.into(),
            handles,
        }
    }

    /// The encoded payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the payload, for encoders.
    pub fn data_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    /// Handles attached to this buffer, in send order.
    pub fn handles(&self) -> &[OwnedFd] {
        &self.handles
    }

    /// Attach a handle. Handles are delivered in the order they were attached.
    pub fn push_handle(&mut self, handle: OwnedFd) {
        self.handles.push(handle);
    }

    /// Split the buffer into its payload and handles.
    pub fn into_parts(self) -> (BytesMut, Vec<OwnedFd>) {
        (self.data, self.handles)
    }

    /// Size of this buffer once framed.
    pub fn wire_size(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.data.len()
    }

    /// Write the frame for this buffer: `u32` native-endian length, then the payload.
    pub fn encode_frame(&self, dst: &mut BytesMut) -> Result<()> {
        let len = u32::try_from(self.data.len()).map_err(|_| TransportError::PayloadTooLarge {
            size: self.data.len(),
        })?;
        dst.reserve(self.wire_size());
        dst.put_u32_ne(len);
        dst.put_slice(&self.data);
        Ok(())
    }
}

/// Handles received out of band, consumed front to back by message decoding.
#[derive(Debug, Default)]
pub struct HandleQueue {
    handles: VecDeque<OwnedFd>,
}

impl HandleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handle received from the transport.
    pub fn enqueue(&mut self, handle: OwnedFd) {
        self.handles.push_back(handle);
    }

    /// Take the oldest handle.
    pub fn dequeue(&mut self) -> Option<OwnedFd> {
        self.handles.pop_front()
    }

    /// Take the `count` oldest handles, or none at all if fewer are queued.
    pub fn take(&mut self, count: usize) -> Option<Vec<OwnedFd>> {
        if count > self.handles.len() {
            return None;
        }
        Some(self.handles.drain(..count).collect())
    }

    /// Put handles back in front of the queue, keeping their relative order.
    ///
    /// A large-message wrapper hands its handles back this way so the inner
    /// message decodes them before anything received later.
    pub fn return_to_front(&mut self, handles: Vec<OwnedFd>) {
        for handle in handles.into_iter().rev() {
            self.handles.push_front(handle);
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Extend<OwnedFd> for HandleQueue {
    fn extend<I: IntoIterator<Item = OwnedFd>>(&mut self, iter: I) {
        self.handles.extend(iter);
    }
}
