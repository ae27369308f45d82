//! Error types for PeerStream

use thiserror::Error;

/// Result type alias for PeerStream protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// PeerStream protocol errors
#[derive(Error, Debug)]
pub enum Error {
    /// Inbound frame could not be parsed into a known message
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Well-formed message that the receiver cannot process in its current state
    #[error("unexpected message {kind} in state {state}")]
    UnexpectedMessage { kind: String, state: String },

    /// Outbound message could not be encoded
    #[error("encode error: {0}")]
    EncodeError(String),

    /// Side-channel frame shorter than its declared layout
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    /// Unknown side-channel discriminator
    #[error("unknown side-channel message type: {0}")]
    UnknownMessageType(u8),

    /// Setting value rejected
    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    /// Settings document could not be read
    #[error("config error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedMessage(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
