use std::os::fd::OwnedFd;

use bytes::Bytes;
use ipclink_frame::{
    MessageHeader, PayloadReader, PayloadWriter, ACKNOWLEDGEMENT, LARGE_MESSAGE_WRAPPER,
};
use ipclink_transport::{HandleQueue, MessageBuffer};

use crate::error::Result;
use crate::message::MessageCatalog;

/// Tells the peer how many data frames have been received since the last
/// acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    endpoint_id: u32,
    count: u32,
}

impl Acknowledgement {
    pub fn new(endpoint_id: u32, count: u32) -> Self {
        Self { endpoint_id, count }
    }

    pub fn endpoint_id(&self) -> u32 {
        self.endpoint_id
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn encode(&self) -> MessageBuffer {
        let mut writer = PayloadWriter::new(MessageHeader::new(self.endpoint_id, ACKNOWLEDGEMENT));
        writer.put_u32(self.count);
        writer.finish()
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        let mut reader = PayloadReader::new(payload).ok()?;
        let header = reader.header();
        if header.kind_id != ACKNOWLEDGEMENT {
            return None;
        }
        let count = reader.get_u32().ok()?;
        Some(Self::new(header.endpoint_id, count))
    }
}

/// Carries a payload too large for a single transfer, handles included.
///
/// The wrapped payload is opaque here; the receiver decodes it as the real
/// message once the wrapper's handles are back in front of the queue.
#[derive(Debug)]
pub struct LargeMessageWrapper {
    endpoint_id: u32,
    wrapped: Bytes,
    handles: Vec<OwnedFd>,
}

impl LargeMessageWrapper {
    /// Wrap an encoded buffer addressed to `endpoint_id`.
    pub fn wrap(endpoint_id: u32, buffer: MessageBuffer) -> Result<MessageBuffer> {
        let (data, handles) = buffer.into_parts();
        let handle_count = u32::try_from(handles.len()).map_err(|_| {
            crate::error::ConnectionError::Encode(format!(
                "{} handles cannot be wrapped",
                handles.len()
            ))
        })?;

        let mut writer =
            PayloadWriter::new(MessageHeader::new(endpoint_id, LARGE_MESSAGE_WRAPPER));
        writer.put_u32(handle_count);
        writer.put_bytes(&data)?;
        for handle in handles {
            writer.put_handle(handle);
        }
        Ok(writer.finish())
    }

    /// Decode a wrapper, taking its handles from the queue.
    pub fn decode(payload: &[u8], handles: &mut HandleQueue) -> Option<Self> {
        let mut reader = PayloadReader::new(payload).ok()?;
        let header = reader.header();
        if header.kind_id != LARGE_MESSAGE_WRAPPER {
            return None;
        }
        let handle_count = reader.get_u32().ok()? as usize;
        let wrapped = Bytes::copy_from_slice(reader.get_bytes().ok()?);
        let handles = handles.take(handle_count)?;
        Some(Self {
            endpoint_id: header.endpoint_id,
            wrapped,
            handles,
        })
    }

    pub fn endpoint_id(&self) -> u32 {
        self.endpoint_id
    }

    pub fn wrapped_message_data(&self) -> &[u8] {
        &self.wrapped
    }

    /// Split into the inner payload and the handles that belong to it.
    pub fn into_parts(self) -> (Bytes, Vec<OwnedFd>) {
        (self.wrapped, self.handles)
    }
}

/// One decoded frame.
#[derive(Debug)]
pub enum Incoming<M> {
    Acknowledgement(Acknowledgement),
    LargeMessageWrapper(LargeMessageWrapper),
    Message(M),
}

/// Decode a frame payload: control messages here, everything else through
/// the catalog.
pub fn decode_incoming<C: MessageCatalog>(
    catalog: &C,
    payload: &[u8],
    handles: &mut HandleQueue,
) -> Option<Incoming<C::Message>> {
    let header = MessageHeader::peek(payload)?;
    match header.kind_id {
        ACKNOWLEDGEMENT => Acknowledgement::decode(payload).map(Incoming::Acknowledgement),
        LARGE_MESSAGE_WRAPPER => {
            LargeMessageWrapper::decode(payload, handles).map(Incoming::LargeMessageWrapper)
        }
        _ => catalog.decode(payload, handles).map(Incoming::Message),
    }
}
