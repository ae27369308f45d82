//! Session controller builder

use peerstream_core::{Flag, Settings, TextParam};
use peerstream_transport::{Connector, PeerSessionFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::controller::{self, ControllerConfig, SessionHandle};
use crate::error::{ClientError, Result};
use crate::events::SessionEvent;

/// Builder for a session controller
///
/// ```no_run
/// # async fn run() -> peerstream_client::Result<()> {
/// use peerstream_client::SessionControllerBuilder;
///
/// let (session, mut events) = SessionControllerBuilder::new("ws://localhost:80")
///     .start()?;
/// session.connect()?;
/// while let Some(event) = events.recv().await {
///     println!("{:?}", event);
/// }
/// # Ok(())
/// # }
/// ```
pub struct SessionControllerBuilder {
    config: ControllerConfig,
    settings: Settings,
    connector: Option<Arc<dyn Connector>>,
    peer_factory: Option<Arc<dyn PeerSessionFactory>>,
}

impl SessionControllerBuilder {
    /// Create a builder for the given rendezvous URL
    pub fn new(url: &str) -> Self {
        Self {
            config: ControllerConfig {
                url: url.to_string(),
                ..Default::default()
            },
            settings: Settings::new(),
            connector: None,
            peer_factory: None,
        }
    }

    /// Create a builder that takes its URL from the `ss` setting
    pub fn from_settings(settings: Settings) -> Self {
        Self::new("").settings(settings)
    }

    /// Use a shared settings object instead of a private one
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.config.stats_interval = interval;
        self
    }

    /// Rendezvous keepalive period, `None` disables pings
    pub fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Transport used to open the rendezvous channel
    pub fn connector<C: Connector + 'static>(mut self, connector: C) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Factory that creates peer sessions
    pub fn peer_factory<F: PeerSessionFactory + 'static>(mut self, factory: F) -> Self {
        self.peer_factory = Some(Arc::new(factory));
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Spawn the controller task
    ///
    /// Sends `connect()` right away when the `AutoConnect` flag is set.
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>)> {
        if self.config.url.is_empty() && self.settings.text(TextParam::SignallingServerUrl).is_empty()
        {
            return Err(ClientError::Config(
                "no rendezvous server URL configured".to_string(),
            ));
        }

        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector()?,
        };
        let peer_factory = match self.peer_factory {
            Some(factory) => factory,
            None => default_peer_factory()?,
        };

        let auto_connect = self.settings.flag(Flag::AutoConnect);
        let (handle, events) = controller::spawn(self.config, self.settings, connector, peer_factory);

        if auto_connect {
            debug!("AutoConnect set, connecting");
            handle.connect()?;
        }

        Ok((handle, events))
    }
}

#[cfg(feature = "websocket")]
fn default_connector() -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(peerstream_transport::WebSocketTransport::new()))
}

#[cfg(not(feature = "websocket"))]
fn default_connector() -> Result<Arc<dyn Connector>> {
    Err(ClientError::Config(
        "no rendezvous connector configured (enable the websocket feature)".to_string(),
    ))
}

#[cfg(feature = "webrtc")]
fn default_peer_factory() -> Result<Arc<dyn PeerSessionFactory>> {
    Ok(Arc::new(peerstream_transport::WebRtcPeerSessionFactory::new()))
}

#[cfg(not(feature = "webrtc"))]
fn default_peer_factory() -> Result<Arc<dyn PeerSessionFactory>> {
    Err(ClientError::Config(
        "no peer session factory configured (enable the webrtc feature)".to_string(),
    ))
}
