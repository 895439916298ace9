//! Message-oriented inter-process communication.
//!
//! ipclink carries typed messages over a Unix stream socket: length-prefixed
//! framing, handle passing with `SCM_RIGHTS`, a dedicated send thread,
//! count-based acknowledgements, transparent wrapping of oversized messages
//! and a blocking wait for a specific reply.
//!
//! # Crate Structure
//!
//! - [`transport`]: Transport capability, buffers, handle queue, Unix sockets
//! - [`frame`]: Frame scanning and payload field helpers
//! - [`connection`]: Connections, send pipeline, acknowledgements
//! - [`demo`]: A small echo protocol built on the above

/// Re-export transport types.
pub mod transport {
    pub use ipclink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use ipclink_frame::*;
}

/// Re-export connection types.
pub mod connection {
    pub use ipclink_connection::*;
}

pub mod demo;
