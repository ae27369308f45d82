//! Peer session capability
//!
//! A peer session is the media connection to the streamer. The controller only
//! talks to it through [`PeerSession`], so the WebRTC stack can be swapped for a
//! test double. Asynchronous happenings on the session are pushed as
//! [`PeerEvent`]s into the channel handed to [`PeerSessionFactory::create`].

use async_trait::async_trait;
use bytes::Bytes;
use peerstream_core::{IceCandidate, MediaKind, PeerConnectionOptions, RawStat};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;

/// Connectivity of the underlying peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A remote media track that became available
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub kind: MediaKind,
    pub id: String,
    pub stream_id: String,
}

impl TrackInfo {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            id: String::new(),
            stream_id: String::new(),
        }
    }
}

/// Events emitted by a peer session
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    ConnectivityChange(ConnectivityState),
    Track(TrackInfo),
    DataChannelOpen,
    DataChannelClosed,
    /// One whole side-channel frame
    DataChannelMessage(Bytes),
    /// Locally gathered candidate to forward to the remote side
    IceCandidate(IceCandidate),
}

/// Negotiation and side-channel operations on one peer connection
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Apply the remote offer
    async fn set_remote_offer(&self, sdp: &str) -> Result<()>;

    /// Produce and apply the local answer for the last remote offer
    async fn create_answer(&self) -> Result<String>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Open pre-negotiated side channels on the given stream ids
    async fn open_negotiated_channels(&self, _send_stream_id: u16, _recv_stream_id: u16) -> Result<()> {
        Ok(())
    }

    /// Send one side-channel frame
    async fn send_data(&self, data: Bytes) -> Result<()>;

    fn is_data_channel_open(&self) -> bool;

    /// Raw statistics records
    async fn stats(&self) -> Result<Vec<RawStat>>;

    async fn close(&self) -> Result<()>;
}

/// Creates peer sessions from server supplied options
#[async_trait]
pub trait PeerSessionFactory: Send + Sync {
    async fn create(
        &self,
        options: &PeerConnectionOptions,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerSession>>;
}
