/// Errors that can occur while encoding or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload ended before a field could be read.
    #[error("payload truncated (needed {needed} bytes, {remaining} remaining)")]
    Truncated { needed: usize, remaining: usize },

    /// A string field was not valid UTF-8.
    #[error("string field is not valid utf-8")]
    InvalidUtf8,

    /// The payload references a handle that was not received.
    #[error("payload expects a handle but the handle queue is empty")]
    MissingHandle,

    /// A catalog message tried to use a kind id reserved for control traffic.
    #[error("kind id {0:#x} is reserved for control messages")]
    ReservedKind(u32),

    /// A field is too long for its 32-bit length prefix.
    #[error("field too large ({size} bytes)")]
    FieldTooLarge { size: usize },
}

pub type Result<T> = std::result::Result<T, FrameError>;
