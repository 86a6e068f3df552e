use std::io;

#[derive(Debug, thiserror::Error)]
pub enum RecitalError {
    #[error("audio error: {0}")]
    Audio(String),

    #[error("resample error: {0}")]
    Resample(String),

    #[error("synthesis error: {0}")]
    Synthesis(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

impl RecitalError {
    /// Whether this error only spoils the chunk it came from.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

pub type Result<T> = std::result::Result<T, RecitalError>;
