//! PeerStream Client Library
//!
//! Session controller for interactive WebRTC streaming: rendezvous signaling,
//! streamer discovery, peer negotiation, reconnect, the side channel and
//! statistics aggregation, driven from one task and observed as events.
//!
//! # Example
//!
//! ```ignore
//! use peerstream_client::SessionControllerBuilder;
//! use peerstream_client::SessionEvent;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (session, mut events) = SessionControllerBuilder::new("ws://localhost:80").start()?;
//!     session.connect()?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let SessionEvent::Stats(stats) = event {
//!             println!("{:?} kbps", stats.inbound_video_bitrate_kbps);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod events;
pub mod negotiation;
pub mod stats;
pub mod timers;

pub use builder::SessionControllerBuilder;
pub use controller::{ControllerConfig, SessionHandle, SessionStatus};
pub use error::{ClientError, Result};
pub use events::{SessionEvent, SessionState};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::builder::SessionControllerBuilder;
    pub use crate::controller::{SessionHandle, SessionStatus};
    pub use crate::error::{ClientError, Result};
    pub use crate::events::{SessionEvent, SessionState};
    pub use peerstream_core::{Flag, InputEvent, NumericParam, Settings, TextParam};
}
