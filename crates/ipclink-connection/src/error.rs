/// Errors that can occur in connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// A message was posted after the connection shut down.
    #[error("connection already closed")]
    AlreadyClosed,

    /// Transport-level error, including a failed transfer.
    #[error("transfer failed: {0}")]
    Transfer(#[from] ipclink_transport::TransportError),

    /// Payload encoding error.
    #[error("frame error: {0}")]
    Frame(#[from] ipclink_frame::FrameError),

    /// A message could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// A frame payload did not decode into any known message.
    #[error("failed to decode a {len}-byte message")]
    Decode { len: usize },

    /// A partial frame arrived while an earlier one was still pending.
    #[error("already have unprocessed bytes from an earlier partial frame")]
    DuplicatePartialFrame,

    /// A frame declared a zero-length payload.
    #[error("zero-length frame in stream")]
    ZeroLengthFrame,

    /// The peer closed the connection.
    #[error("end of stream")]
    EndOfStream,

    /// The local dispatcher failed to handle a message.
    #[error("handler failed: {0}")]
    Handler(String),

    /// A connection thread could not be started.
    #[error("failed to spawn connection thread: {0}")]
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
