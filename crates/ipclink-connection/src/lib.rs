//! Message-oriented connections for ipclink.
//!
//! A [`Connection`] frames messages over a [`Transport`], sends them from a
//! dedicated worker thread, acknowledges what it receives, wraps payloads
//! too large for one transfer and lets a caller block until a specific reply
//! arrives.
//!
//! # Example
//!
//! ```rust,ignore
//! use ipclink_connection::{ConnectionBuilder, Endpoints};
//! use ipclink_transport::UnixTransport;
//!
//! let (client, _server) = UnixTransport::pair()?;
//! let mut connection = ConnectionBuilder::new(client, MyCatalog, Endpoints::new(1, 2))
//!     .build()?;
//! connection.post_message(&my_request)?;
//! let reply = connection.wait_for_specific_endpoint_message(2, MY_REPLY_KIND);
//! ```

pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod message;
pub mod send;
pub mod timer;

#[cfg(test)]
mod test_support;

pub use config::{ConnectionConfig, Endpoints, DEFAULT_RESPONSIVENESS_TIMEOUT};
pub use connection::{Connection, ConnectionBuilder, Deferred};
pub use control::{decode_incoming, Acknowledgement, Incoming, LargeMessageWrapper};
pub use error::{ConnectionError, Result};
pub use message::{
    ConnectionObserver, Message, MessageCatalog, NeedsAcknowledgement, NoopObserver, NullStub,
    Stub,
};
pub use send::{
    AcknowledgementWaitQueue, MessageSender, OutgoingEnvelope, SendQueue, SendStats,
    SendStatsSnapshot,
};
pub use timer::ResponsivenessTimer;
