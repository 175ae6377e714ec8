use thiserror::Error;

#[derive(Error, Debug)]
pub enum VstError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("Chunk for unknown message {0} is not a first chunk")]
    UnknownMessage(u64),

    #[error("Message {message_id} length mismatch: declared {expected} bytes, received {actual}")]
    LengthMismatch {
        message_id: u64,
        expected: u64,
        actual: u64,
    },

    #[error("Message payload is empty")]
    EmptyMessage,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl VstError {
    /// True for errors that mean the byte stream can no longer be trusted.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            Self::InvalidChunk(_) | Self::UnknownMessage(_) | Self::LengthMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, VstError>;
