//! Transport layer for ipclink.
//!
//! Defines the [`Transport`] capability the connection layer is written
//! against, the [`MessageBuffer`] unit it transfers and the [`HandleQueue`]
//! received handles wait in. On Unix, [`UnixTransport`] implements it over a
//! stream socket, passing handles with `SCM_RIGHTS`.
//!
//! This is the lowest layer of ipclink. Everything else builds on top of it.

pub mod buffer;
pub mod error;
pub mod traits;

#[cfg(unix)]
pub mod socket;
#[cfg(unix)]
pub mod uds;

pub use buffer::{HandleQueue, MessageBuffer, LENGTH_PREFIX_SIZE};
pub use error::{Result, TransportError};
pub use traits::{ReadOutcome, Transport, MAX_SINGLE_TRANSFER_SIZE};

#[cfg(unix)]
pub use socket::{UnixTransport, UnixTransportConfig, MAX_HANDLES_PER_TRANSFER};
#[cfg(unix)]
pub use uds::UnixDomainSocket;
