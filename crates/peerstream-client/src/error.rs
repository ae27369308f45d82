//! Client error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Session description or candidate rejected by the peer session
    #[error("negotiation failed: {0}")]
    NegotiationFailure(String),

    /// Rendezvous channel or peer session closed unexpectedly
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("controller stopped")]
    ControllerStopped,

    #[error("unknown streamer: {0}")]
    UnknownStreamer(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] peerstream_core::Error),

    #[error("transport error: {0}")]
    Transport(#[from] peerstream_transport::TransportError),
}
