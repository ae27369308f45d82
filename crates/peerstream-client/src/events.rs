//! Session state and the events surfaced to the embedding application

use peerstream_core::{InitialSettings, LatencyTestResults, StatsSnapshot};
use std::fmt;
use std::sync::Arc;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    SignalingConnecting,
    AwaitingStreamerList,
    Subscribed,
    Negotiating,
    Connected,
    Closing,
    Disconnected,
}

impl SessionState {
    /// Anything between `connect()` and the end of teardown
    pub fn is_active(self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Events emitted by the session controller
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// The rendezvous channel is being opened
    Connecting,
    /// The peer session reached connectivity
    Connected,
    Disconnected {
        reason: String,
        /// Not caused by an explicit `disconnect()` or `reconnect()`
        abnormal: bool,
        show_in_ui: bool,
    },
    /// Terminal negotiation or connectivity failure, followed by `Disconnected`
    Failed { reason: String },
    /// A delayed reconnect is reopening the channel
    AutoConnect,
    /// The answer for a remote offer was sent
    SdpExchanged,
    /// A video track arrived
    StreamLoading,
    VideoInitialized,
    Stats(Arc<StatsSnapshot>),
    StreamerList {
        ids: Vec<String>,
        auto_selected: Option<String>,
    },
    PlayerCount(u32),
    DataChannelOpen,
    InitialSettings(InitialSettings),
    InputControlOwnership(bool),
    QualityControlOwnership(bool),
    VideoEncoderAvgQp(u32),
    LatencyTest(LatencyTestResults),
    OnScreenKeyboard { show: bool, x: f64, y: f64 },
    /// Free-form response from the streamer application
    Response(String),
}
