use ipclink_transport::{HandleQueue, MessageBuffer};

use crate::error::Result;

/// A decoded message that can be posted on a connection.
pub trait Message: Send + 'static {
    /// Which endpoint (message interface) this message belongs to.
    fn endpoint_id(&self) -> u32;

    /// The message kind within its endpoint. Must not be a reserved kind.
    fn kind_id(&self) -> u32;

    /// Encode into a payload, starting with the endpoint/kind header.
    fn encode(&self) -> Result<MessageBuffer>;
}

/// Decodes payloads into the messages of one protocol.
pub trait MessageCatalog: Send + 'static {
    type Message: Message;

    /// Decode one payload, taking any handles it carries from `handles`.
    ///
    /// Returns `None` if the payload is not a message of this catalog.
    fn decode(&self, payload: &[u8], handles: &mut HandleQueue) -> Option<Self::Message>;
}

/// The local dispatcher: interprets a message addressed to the local
/// endpoint and optionally produces a reply.
pub trait Stub<M>: Send {
    fn handle(&mut self, message: M) -> Result<Option<M>>;
}

impl<M, F> Stub<M> for F
where
    F: FnMut(M) -> Result<Option<M>> + Send,
{
    fn handle(&mut self, message: M) -> Result<Option<M>> {
        self(message)
    }
}

/// A dispatcher that accepts everything and never replies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStub;

impl<M> Stub<M> for NullStub {
    fn handle(&mut self, _message: M) -> Result<Option<M>> {
        Ok(None)
    }
}

/// Whether the peer must acknowledge a posted buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeedsAcknowledgement {
    Yes,
    No,
}

/// Hooks through which a connection reports to its owner.
///
/// `may_have_become_unresponsive` runs on the responsiveness timer thread;
/// the other hooks run on the connection's I/O context.
pub trait ConnectionObserver: Send + Sync {
    /// Nothing was read for a full responsiveness interval after a post.
    fn may_have_become_unresponsive(&self) {}

    /// Data arrived from the peer.
    fn did_become_responsive(&self) {}

    /// The connection shut down. Called once.
    fn die(&self) {}
}

/// An observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}
