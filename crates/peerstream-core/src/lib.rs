//! PeerStream Core
//!
//! Protocol primitives shared by the PeerStream transport and client crates.
//!
//! This crate provides:
//! - Rendezvous signaling messages and their JSON codec ([`signaling`])
//! - The binary side-channel protocol spoken over the peer data channel ([`datachannel`])
//! - The shared settings object with change notification ([`Settings`])
//! - Raw and aggregated statistics records ([`stats`])

pub mod datachannel;
pub mod error;
pub mod settings;
pub mod signaling;
pub mod stats;

pub use datachannel::{FromStreamer, InitialSettings, InputEvent, LatencyTestResults, ToStreamer};
pub use error::{Error, Result};
pub use settings::{
    ChangeOrigin, Flag, NumericParam, SettingChange, SettingKey, Settings, SettingsFile, TextParam,
};
pub use signaling::{IceCandidate, InboundMessage, OutboundMessage, PeerConnectionOptions};
pub use stats::{MediaKind, RawStat, StatsSnapshot};

/// Delay before reopening the rendezvous channel after tearing down a session
/// that reached the connected state (milliseconds)
pub const RECONNECT_DELAY_MS: u64 = 3000;

/// Statistics polling interval (milliseconds)
pub const STATS_INTERVAL_MS: u64 = 1000;

/// Rendezvous keepalive ping interval (seconds)
pub const KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Default rendezvous server port
pub const DEFAULT_SIGNALING_PORT: u16 = 80;

/// Label of the reliable ordered side channel
pub const DATA_CHANNEL_LABEL: &str = "datachannel";
