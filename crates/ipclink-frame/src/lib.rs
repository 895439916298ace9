//! Length-prefixed framing for ipclink.
//!
//! Every message travels as one frame:
//! - A 4-byte native-endian payload length (never zero)
//! - The payload, which starts with a 4-byte endpoint id and a 4-byte kind id
//!
//! [`Frames`] finds the complete frames in a byte run and reports where the
//! unprocessed remainder starts; [`PayloadWriter`] and [`PayloadReader`]
//! encode the fields inside a payload.

pub mod codec;
pub mod error;
pub mod kind;
pub mod payload;

pub use codec::{Frames, MessageHeader, ScanStop, MESSAGE_HEADER_SIZE};
pub use error::{FrameError, Result};
pub use kind::{is_reserved, kind_name, ACKNOWLEDGEMENT, LARGE_MESSAGE_WRAPPER};
pub use payload::{PayloadReader, PayloadWriter};
