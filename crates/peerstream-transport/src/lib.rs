//! PeerStream Transport Layer
//!
//! This crate provides the two transports a PeerStream session runs over:
//! - The rendezvous channel to the signaling server (WebSocket)
//! - The peer session carrying media and the side channel (WebRTC, optional)

pub mod error;
pub mod peer;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use error::{Result, TransportError};
pub use peer::{ConnectivityState, PeerEvent, PeerSession, PeerSessionFactory, TrackInfo};
pub use traits::{Connector, TransportEvent, TransportReceiver, TransportSender};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};

#[cfg(feature = "webrtc")]
pub use webrtc::{WebRtcPeerSession, WebRtcPeerSessionFactory};
