//! A small two-endpoint protocol used by the CLI, the example and the
//! integration tests.
//!
//! The client sends [`DemoMessage::Echo`] and [`DemoMessage::ShareHandle`]
//! to the server endpoint; the server's [`EchoStub`] answers `Echo` with
//! [`DemoMessage::EchoReply`], which belongs to the server endpoint too.

use std::os::fd::OwnedFd;

use ipclink_connection::{ConnectionError, Message, MessageCatalog, Result, Stub};
use ipclink_frame::{MessageHeader, PayloadReader, PayloadWriter};
use ipclink_transport::{HandleQueue, MessageBuffer};

/// Endpoint id of the client side.
pub const CLIENT_ENDPOINT: u32 = 0x434c_4e54;
/// Endpoint id of the server side.
pub const SERVER_ENDPOINT: u32 = 0x5352_5652;

pub const ECHO: u32 = 1;
pub const ECHO_REPLY: u32 = 2;
pub const SHARE_HANDLE: u32 = 3;

#[derive(Debug)]
pub enum DemoMessage {
    Echo { seq: u64, text: String },
    EchoReply { seq: u64, text: String },
    /// Passes a handle to the server, with a note that may be large.
    ShareHandle { note: String, handle: OwnedFd },
}

impl Message for DemoMessage {
    fn endpoint_id(&self) -> u32 {
        SERVER_ENDPOINT
    }

    fn kind_id(&self) -> u32 {
        match self {
            DemoMessage::Echo { .. } => ECHO,
            DemoMessage::EchoReply { .. } => ECHO_REPLY,
            DemoMessage::ShareHandle { .. } => SHARE_HANDLE,
        }
    }

    fn encode(&self) -> Result<MessageBuffer> {
        let mut writer = PayloadWriter::new(MessageHeader::new(self.endpoint_id(), self.kind_id()));
        match self {
            DemoMessage::Echo { seq, text } | DemoMessage::EchoReply { seq, text } => {
                writer.put_u64(*seq).put_str(text)?;
            }
            DemoMessage::ShareHandle { note, handle } => {
                let handle = handle
                    .try_clone()
                    .map_err(|err| ConnectionError::Encode(format!("cannot duplicate handle: {err}")))?;
                writer.put_str(note)?;
                writer.put_handle(handle);
            }
        }
        Ok(writer.finish())
    }
}

/// Decodes [`DemoMessage`]s addressed to the server endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct DemoCatalog;

impl MessageCatalog for DemoCatalog {
    type Message = DemoMessage;

    fn decode(&self, payload: &[u8], handles: &mut HandleQueue) -> Option<DemoMessage> {
        let mut reader = PayloadReader::new(payload).ok()?;
        let header = reader.header();
        if header.endpoint_id != SERVER_ENDPOINT {
            return None;
        }

        let message = match header.kind_id {
            ECHO => DemoMessage::Echo {
                seq: reader.get_u64().ok()?,
                text: reader.get_str().ok()?.to_owned(),
            },
            ECHO_REPLY => DemoMessage::EchoReply {
                seq: reader.get_u64().ok()?,
                text: reader.get_str().ok()?.to_owned(),
            },
            SHARE_HANDLE => {
                let note = reader.get_str().ok()?.to_owned();
                let handle = reader.take_handle(handles).ok()?;
                DemoMessage::ShareHandle { note, handle }
            }
            _ => return None,
        };
        reader.is_empty().then_some(message)
    }
}

/// Server-side dispatcher: answers every `Echo` with an `EchoReply`.
#[derive(Debug, Default)]
pub struct EchoStub {
    echoed: u64,
}

impl EchoStub {
    pub fn echoed(&self) -> u64 {
        self.echoed
    }
}

impl Stub<DemoMessage> for EchoStub {
    fn handle(&mut self, message: DemoMessage) -> Result<Option<DemoMessage>> {
        match message {
            DemoMessage::Echo { seq, text } => {
                self.echoed += 1;
                tracing::info!(seq, size = text.len(), "echoing message");
                Ok(Some(DemoMessage::EchoReply { seq, text }))
            }
            DemoMessage::ShareHandle { note, handle } => {
                tracing::info!(note_size = note.len(), ?handle, "received handle");
                Ok(None)
            }
            DemoMessage::EchoReply { seq, .. } => Err(ConnectionError::Handler(format!(
                "unexpected echo reply {seq} on the server endpoint"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    fn decode(buffer: MessageBuffer) -> Option<DemoMessage> {
        let (data, handles) = buffer.into_parts();
        let mut queue = HandleQueue::new();
        queue.extend(handles);
        DemoCatalog.decode(&data, &mut queue)
    }

    #[test]
    fn echo_roundtrip() {
        let message = DemoMessage::Echo {
            seq: 7,
            text: "hello".to_string(),
        };
        match decode(message.encode().unwrap()) {
            Some(DemoMessage::Echo { seq, text }) => {
                assert_eq!(seq, 7);
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn echo_reply_roundtrip() {
        let message = DemoMessage::EchoReply {
            seq: 42,
            text: "pong".to_string(),
        };
        let buffer = message.encode().unwrap();
        assert_eq!(
            MessageHeader::peek(buffer.data()),
            Some(MessageHeader::new(SERVER_ENDPOINT, ECHO_REPLY))
        );
        match decode(buffer) {
            Some(DemoMessage::EchoReply { seq, text }) => {
                assert_eq!(seq, 42);
                assert_eq!(text, "pong");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn share_handle_carries_a_duplicate() {
        let (left, _right) = UnixStream::pair().unwrap();
        let original = OwnedFd::from(left);
        let message = DemoMessage::ShareHandle {
            note: "n".to_string(),
            handle: original,
        };
        let buffer = message.encode().unwrap();
        assert_eq!(buffer.handles().len(), 1);

        let DemoMessage::ShareHandle { handle: sent, .. } = &message else {
            unreachable!()
        };
        assert_ne!(buffer.handles()[0].as_raw_fd(), sent.as_raw_fd());
        assert!(matches!(
            decode(buffer),
            Some(DemoMessage::ShareHandle { .. })
        ));
    }

    #[test]
    fn share_handle_without_handle_fails() {
        let mut writer = PayloadWriter::new(MessageHeader::new(SERVER_ENDPOINT, SHARE_HANDLE));
        writer.put_str("lonely").unwrap();
        let (data, _) = writer.finish().into_parts();
        assert!(DemoCatalog.decode(&data, &mut HandleQueue::new()).is_none());
    }

    #[test]
    fn unknown_kind_and_trailing_bytes_are_rejected() {
        let mut writer = PayloadWriter::new(MessageHeader::new(SERVER_ENDPOINT, 42));
        writer.put_u32(1);
        assert!(decode(writer.finish()).is_none());

        let mut writer = PayloadWriter::new(MessageHeader::new(SERVER_ENDPOINT, ECHO));
        writer.put_u64(1).put_str("x").unwrap().put_u32(9);
        assert!(decode(writer.finish()).is_none());
    }

    #[test]
    fn echo_stub_replies_to_echo() {
        let mut stub = EchoStub::default();
        let reply = stub
            .handle(DemoMessage::Echo {
                seq: 3,
                text: "hi".to_string(),
            })
            .unwrap();
        assert!(matches!(reply, Some(DemoMessage::EchoReply { seq: 3, .. })));
        assert_eq!(stub.echoed(), 1);

        assert!(stub
            .handle(DemoMessage::EchoReply {
                seq: 1,
                text: String::new()
            })
            .is_err());
    }
}
