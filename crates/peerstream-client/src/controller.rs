//! Session controller
//!
//! One task owns all session state and handles its inputs one at a time:
//! commands from [`SessionHandle`]s, rendezvous frames, peer session events,
//! finished negotiations, timer ticks and settings changes. Everything that
//! originates from a connection attempt carries that attempt's generation;
//! inputs from a superseded generation are discarded on arrival. Peer events
//! and negotiation results also carry the peer session instance they came
//! from, so a replaced peer session cannot drive the live one.

use bytes::Bytes;
use parking_lot::RwLock;
use peerstream_core::datachannel::{StreamerCommand, CONSOLE_COMMAND_KEY};
use peerstream_core::signaling;
use peerstream_core::{
    ChangeOrigin, Flag, FromStreamer, IceCandidate, InboundMessage, InitialSettings, InputEvent,
    MediaKind, NumericParam, OutboundMessage, PeerConnectionOptions, SettingChange, SettingKey,
    Settings, StatsSnapshot, TextParam, ToStreamer,
};
use peerstream_transport::{
    Connector, ConnectivityState, PeerEvent, PeerSession, PeerSessionFactory, TrackInfo,
    TransportError, TransportEvent, TransportReceiver, TransportSender,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::discovery::StreamerDirectory;
use crate::error::{ClientError, Result};
use crate::events::{SessionEvent, SessionState};
use crate::negotiation::NegotiationContext;
use crate::stats::{unix_time_ms, SessionFacts, StatsAggregator};
use crate::timers::{TimerKind, Timers};

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Rendezvous server URL; falls back to the `ss` setting when empty
    pub url: String,
    /// Wait before reopening after tearing down a session that had connected
    pub reconnect_delay: Duration,
    pub stats_interval: Duration,
    /// Rendezvous keepalive, `None` disables it
    pub keepalive_interval: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect_delay: Duration::from_millis(peerstream_core::RECONNECT_DELAY_MS),
            stats_interval: Duration::from_millis(peerstream_core::STATS_INTERVAL_MS),
            keepalive_interval: Some(Duration::from_secs(
                peerstream_core::KEEPALIVE_INTERVAL_SECS,
            )),
        }
    }
}

/// Externally observable view of the session
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    pub streamers: Vec<String>,
    pub selected_streamer: Option<String>,
    pub data_channel_open: bool,
    pub latest_stats: Option<Arc<StatsSnapshot>>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            streamers: Vec::new(),
            selected_streamer: None,
            data_channel_open: false,
            latest_stats: None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    Reconnect,
    Play,
    SelectStreamer(String),
    EmitCommand(Value),
    EmitConsoleCommand(String),
    EmitUiInteraction(Value),
    EmitInput(InputEvent),
    RequestLatencyTest,
    RequestKeyframe,
    RequestFps,
    RequestAverageBitrate,
    StartStreaming,
    StopStreaming,
    TestEcho(String),
}

pub(crate) enum Input {
    ChannelOpened {
        generation: u64,
        sender: Box<dyn TransportSender>,
        receiver: Box<dyn TransportReceiver>,
    },
    ChannelFailed {
        generation: u64,
        error: String,
    },
    Channel {
        generation: u64,
        event: TransportEvent,
    },
    Peer {
        generation: u64,
        instance: u64,
        event: PeerEvent,
    },
    NegotiationDone {
        generation: u64,
        instance: u64,
        offer: String,
        result: std::result::Result<String, TransportError>,
    },
    Timer {
        generation: u64,
        kind: TimerKind,
    },
}

impl Input {
    fn generation(&self) -> u64 {
        match self {
            Input::ChannelOpened { generation, .. }
            | Input::ChannelFailed { generation, .. }
            | Input::Channel { generation, .. }
            | Input::Peer { generation, .. }
            | Input::NegotiationDone { generation, .. }
            | Input::Timer { generation, .. } => *generation,
        }
    }

    /// Peer session instance for inputs that originate from one
    fn peer_instance(&self) -> Option<u64> {
        match self {
            Input::Peer { instance, .. } | Input::NegotiationDone { instance, .. } => {
                Some(*instance)
            }
            _ => None,
        }
    }
}

/// Cloneable handle to a running session controller
///
/// Every method only enqueues a request; outcomes are reported as
/// [`SessionEvent`]s. The controller stops once every handle is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<RwLock<SessionStatus>>,
    settings: Settings,
}

impl SessionHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::ControllerStopped)
    }

    /// Open the rendezvous channel and start a session
    pub fn connect(&self) -> Result<()> {
        self.send(Command::Connect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    /// Tear down and start over, after the reconnect delay if the session had connected
    pub fn reconnect(&self) -> Result<()> {
        self.send(Command::Reconnect)
    }

    /// Start playback of the video track, now or as soon as it arrives
    pub fn play(&self) -> Result<()> {
        self.send(Command::Play)
    }

    /// Subscribe to an advertised streamer, leaving the current one first
    pub fn select_streamer(&self, id: impl Into<String>) -> Result<()> {
        self.send(Command::SelectStreamer(id.into()))
    }

    /// Send a command descriptor to the streamer
    pub fn emit_command(&self, descriptor: Value) -> Result<()> {
        self.send(Command::EmitCommand(descriptor))
    }

    pub fn emit_console_command(&self, command: impl Into<String>) -> Result<()> {
        self.send(Command::EmitConsoleCommand(command.into()))
    }

    pub fn emit_ui_interaction(&self, descriptor: Value) -> Result<()> {
        self.send(Command::EmitUiInteraction(descriptor))
    }

    pub fn emit_input(&self, event: InputEvent) -> Result<()> {
        self.send(Command::EmitInput(event))
    }

    pub fn request_latency_test(&self) -> Result<()> {
        self.send(Command::RequestLatencyTest)
    }

    pub fn request_keyframe(&self) -> Result<()> {
        self.send(Command::RequestKeyframe)
    }

    /// Ask the streamer to report its frame rate
    pub fn request_fps(&self) -> Result<()> {
        self.send(Command::RequestFps)
    }

    /// Ask the streamer to report its average bitrate
    pub fn request_average_bitrate(&self) -> Result<()> {
        self.send(Command::RequestAverageBitrate)
    }

    pub fn start_streaming(&self) -> Result<()> {
        self.send(Command::StartStreaming)
    }

    pub fn stop_streaming(&self) -> Result<()> {
        self.send(Command::StopStreaming)
    }

    /// Send text the streamer echoes back as a response
    pub fn test_echo(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::TestEcho(text.into()))
    }

    pub fn state(&self) -> SessionState {
        self.status.read().state
    }

    pub fn status(&self) -> SessionStatus {
        self.status.read().clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Whether the controller task has exited
    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }
}

#[derive(Debug, Default)]
struct MediaState {
    video_track: bool,
    play_pending: bool,
    video_start: Option<Instant>,
}

#[derive(Debug)]
struct SideChannelState {
    open: bool,
    console_commands_allowed: bool,
    latency_test_allowed: bool,
    quality_owner: bool,
    input_owner: bool,
    avg_qp: Option<u32>,
    latency_start_ms: Option<f64>,
}

impl Default for SideChannelState {
    fn default() -> Self {
        Self {
            open: false,
            console_commands_allowed: false,
            latency_test_allowed: true,
            quality_owner: false,
            input_owner: false,
            avg_qp: None,
            latency_start_ms: None,
        }
    }
}

pub(crate) struct SessionController {
    config: ControllerConfig,
    settings: Settings,
    connector: Arc<dyn Connector>,
    peer_factory: Arc<dyn PeerSessionFactory>,
    inputs: mpsc::UnboundedSender<Input>,
    events: mpsc::UnboundedSender<SessionEvent>,
    status: Arc<RwLock<SessionStatus>>,

    state: SessionState,
    generation: u64,
    /// Whether the most recent connection attempt reached `Connected`
    was_connected: bool,

    channel: Option<Box<dyn TransportSender>>,
    peer: Option<Arc<dyn PeerSession>>,
    peer_instance: u64,
    peer_forwarder: Option<JoinHandle<()>>,
    /// Options from the latest `config`, reused when a peer session is recreated
    peer_options: Option<PeerConnectionOptions>,
    tasks: Vec<JoinHandle<()>>,

    negotiation: NegotiationContext,
    directory: StreamerDirectory,
    aggregator: StatsAggregator,
    timers: Timers,
    media: MediaState,
    side: SideChannelState,
}

/// Spawn a controller task and return its handle and event stream
pub(crate) fn spawn(
    config: ControllerConfig,
    settings: Settings,
    connector: Arc<dyn Connector>,
    peer_factory: Arc<dyn PeerSessionFactory>,
) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let status = Arc::new(RwLock::new(SessionStatus::default()));

    let controller = SessionController {
        config,
        settings: settings.clone(),
        connector,
        peer_factory,
        inputs: input_tx,
        events: event_tx,
        status: status.clone(),
        state: SessionState::Idle,
        generation: 0,
        was_connected: false,
        channel: None,
        peer: None,
        peer_instance: 0,
        peer_forwarder: None,
        peer_options: None,
        tasks: Vec::new(),
        negotiation: NegotiationContext::new(),
        directory: StreamerDirectory::new(),
        aggregator: StatsAggregator::new(),
        timers: Timers::new(),
        media: MediaState::default(),
        side: SideChannelState::default(),
    };

    // Subscribe before the task starts so no change published after this call is missed
    let changes = settings.subscribe();
    tokio::spawn(controller.run(command_rx, input_rx, changes));

    let handle = SessionHandle {
        commands: command_tx,
        status,
        settings,
    };
    (handle, event_rx)
}

impl SessionController {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        mut changes: broadcast::Receiver<SettingChange>,
    ) {
        debug!("Session controller started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(input) = inputs.recv() => self.handle_input(input).await,
                change = changes.recv() => match change {
                    Ok(change) => self.on_setting_change(change).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} setting changes", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
            }
        }

        self.close_session().await;
        info!("Session controller stopped");
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn handle_command(&mut self, command: Command) {
        trace!("Command {:?} in state {}", command, self.state);
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect().await,
            Command::Reconnect => self.reconnect().await,
            Command::Play => self.play(),
            Command::SelectStreamer(id) => self.select_streamer(id).await,
            Command::EmitCommand(descriptor) => {
                if descriptor.get(CONSOLE_COMMAND_KEY).is_some()
                    && !self.side.console_commands_allowed
                {
                    debug!("Console command suppressed, not permitted by the server");
                    return;
                }
                self.send_to_streamer(ToStreamer::Command(descriptor.to_string()))
                    .await;
            }
            Command::EmitConsoleCommand(text) => {
                if !self.side.console_commands_allowed {
                    debug!("Console command suppressed, not permitted by the server");
                    return;
                }
                let mut descriptor = Map::new();
                descriptor.insert(CONSOLE_COMMAND_KEY.to_string(), Value::String(text));
                self.send_to_streamer(ToStreamer::Command(Value::Object(descriptor).to_string()))
                    .await;
            }
            Command::EmitUiInteraction(descriptor) => {
                self.send_to_streamer(ToStreamer::UiInteraction(descriptor.to_string()))
                    .await;
            }
            Command::EmitInput(event) => {
                let flag = event.enabling_flag();
                if !self.settings.flag(flag) {
                    trace!("Input dropped, {} disabled", flag);
                    return;
                }
                self.send_to_streamer(ToStreamer::Input(event)).await;
            }
            Command::RequestLatencyTest => {
                if !self.side.open {
                    return;
                }
                if !self.side.latency_test_allowed {
                    debug!("Latency test disabled by the server");
                    return;
                }
                let start_time_ms = unix_time_ms() as f64;
                self.side.latency_start_ms = Some(start_time_ms);
                self.send_to_streamer(ToStreamer::LatencyTest { start_time_ms })
                    .await;
            }
            Command::RequestKeyframe => self.send_to_streamer(ToStreamer::IFrameRequest).await,
            Command::RequestFps => self.send_to_streamer(ToStreamer::FpsRequest).await,
            Command::RequestAverageBitrate => {
                self.send_to_streamer(ToStreamer::AverageBitrateRequest)
                    .await
            }
            Command::StartStreaming => self.send_to_streamer(ToStreamer::StartStreaming).await,
            Command::StopStreaming => self.send_to_streamer(ToStreamer::StopStreaming).await,
            Command::TestEcho(text) => self.send_to_streamer(ToStreamer::TestEcho(text)).await,
        }
    }

    fn connect(&mut self) {
        if self.state.is_active() {
            warn!("connect() ignored in state {}", self.state);
            return;
        }
        self.open_channel();
    }

    async fn disconnect(&mut self) {
        if !self.state.is_active() {
            debug!("disconnect() ignored, no active session");
            return;
        }
        self.teardown("Disconnected", false, true).await;
    }

    async fn reconnect(&mut self) {
        info!(
            "Reconnecting (previously connected: {})",
            self.was_connected
        );

        if self.state.is_active() {
            self.set_state(SessionState::Closing);
            self.close_session().await;
            self.emit(SessionEvent::Disconnected {
                reason: "Reconnecting".to_string(),
                abnormal: false,
                show_in_ui: false,
            });
        }

        if self.was_connected {
            self.set_state(SessionState::Closing);
            let inputs = self.inputs.clone();
            let generation = self.generation;
            self.timers.arm_once(
                TimerKind::ReconnectDelay,
                self.config.reconnect_delay,
                move || {
                    let _ = inputs.send(Input::Timer {
                        generation,
                        kind: TimerKind::ReconnectDelay,
                    });
                },
            );
        } else {
            self.open_channel();
        }
    }

    fn play(&mut self) {
        if !self.media.video_track {
            debug!("play() before the video track arrived, deferring");
            self.media.play_pending = true;
            return;
        }
        self.media.play_pending = false;
        if self.media.video_start.is_none() {
            self.media.video_start = Some(Instant::now());
            info!("Video playback started");
            self.emit(SessionEvent::VideoInitialized);
        }
    }

    /// Subscribe to `id`, switching streamers when already subscribed
    async fn select_streamer(&mut self, id: String) {
        let subscribed = match self.state {
            SessionState::AwaitingStreamerList => false,
            SessionState::Subscribed | SessionState::Negotiating | SessionState::Connected => {
                if self.directory.selected() == Some(id.as_str()) {
                    debug!("Already subscribed to streamer {}", id);
                    return;
                }
                true
            }
            _ => {
                warn!("select_streamer({}) ignored in state {}", id, self.state);
                return;
            }
        };

        if let Err(e) = self.directory.select(&id) {
            warn!("{}", e);
            return;
        }

        if subscribed {
            info!("Switching to streamer {}", id);
            self.send_signaling(OutboundMessage::Unsubscribe).await;
            self.release_peer().await;
            self.timers.cancel(TimerKind::StatsTick);
            self.reset_streamer_state();
        } else {
            self.publish_status();
        }
        self.subscribe(id).await;
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    async fn handle_input(&mut self, input: Input) {
        if input.generation() != self.generation {
            trace!("Discarding input from superseded session");
            if let Input::ChannelOpened { sender, .. } = input {
                let _ = sender.close().await;
            }
            return;
        }
        if input
            .peer_instance()
            .is_some_and(|instance| instance != self.peer_instance)
        {
            trace!("Discarding input from replaced peer session");
            return;
        }

        match input {
            Input::ChannelOpened {
                sender, receiver, ..
            } => self.on_channel_opened(sender, receiver).await,
            Input::ChannelFailed { error, .. } => {
                warn!("Rendezvous connection failed: {}", error);
                self.teardown(format!("Failed to connect: {}", error), true, true)
                    .await;
            }
            Input::Channel { event, .. } => self.on_channel_event(event).await,
            Input::Peer { event, .. } => self.on_peer_event(event).await,
            Input::NegotiationDone { offer, result, .. } => {
                self.on_negotiation_done(offer, result).await
            }
            Input::Timer { kind, .. } => self.on_timer(kind).await,
        }
    }

    fn open_channel(&mut self) {
        self.generation += 1;
        self.was_connected = false;
        let generation = self.generation;
        let url = if self.config.url.is_empty() {
            self.settings.text(TextParam::SignallingServerUrl)
        } else {
            self.config.url.clone()
        };

        self.set_state(SessionState::SignalingConnecting);
        self.emit(SessionEvent::Connecting);
        info!("Opening rendezvous channel to {}", url);

        let connector = self.connector.clone();
        let inputs = self.inputs.clone();
        self.track_task(tokio::spawn(async move {
            let input = match connector.connect(&url).await {
                Ok((sender, receiver)) => Input::ChannelOpened {
                    generation,
                    sender,
                    receiver,
                },
                Err(e) => Input::ChannelFailed {
                    generation,
                    error: e.to_string(),
                },
            };
            let _ = inputs.send(input);
        }));
    }

    async fn on_channel_opened(
        &mut self,
        sender: Box<dyn TransportSender>,
        mut receiver: Box<dyn TransportReceiver>,
    ) {
        if self.state != SessionState::SignalingConnecting {
            let _ = sender.close().await;
            return;
        }

        self.channel = Some(sender);

        let generation = self.generation;
        let inputs = self.inputs.clone();
        self.track_task(tokio::spawn(async move {
            loop {
                let event = match receiver.recv().await {
                    Some(event) => event,
                    None => TransportEvent::Disconnected { reason: None },
                };
                let closed = matches!(event, TransportEvent::Disconnected { .. });
                if inputs.send(Input::Channel { generation, event }).is_err() || closed {
                    break;
                }
            }
        }));

        info!("Rendezvous channel open");
        self.set_state(SessionState::AwaitingStreamerList);
        self.send_signaling(OutboundMessage::ListStreamers).await;

        if let Some(period) = self.config.keepalive_interval {
            let inputs = self.inputs.clone();
            self.timers
                .arm_interval(TimerKind::Keepalive, period, move || {
                    inputs
                        .send(Input::Timer {
                            generation,
                            kind: TimerKind::Keepalive,
                        })
                        .is_ok()
                });
        }
    }

    async fn on_channel_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data(frame) => self.on_signaling_frame(&frame).await,
            TransportEvent::Disconnected { reason } => {
                let reason = reason.unwrap_or_else(|| "Rendezvous channel closed".to_string());
                let error = ClientError::ChannelClosed(reason);
                warn!("{}", error);
                self.teardown(error.to_string(), true, true).await;
            }
            TransportEvent::Error(e) => warn!("Rendezvous channel error: {}", e),
            TransportEvent::Connected => trace!("Rendezvous transport connected"),
        }
    }

    // ========================================================================
    // Signaling
    // ========================================================================

    async fn on_signaling_frame(&mut self, frame: &[u8]) {
        let message = match signaling::decode_bytes(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping rendezvous frame: {}", e);
                return;
            }
        };

        debug!("Received {} in state {}", message.kind(), self.state);

        match message {
            InboundMessage::Config {
                peer_connection_options,
            } => self.on_config(peer_connection_options).await,
            InboundMessage::StreamerList { ids } => self.on_streamer_list(ids).await,
            InboundMessage::Offer { sdp } => self.on_offer(sdp).await,
            InboundMessage::IceCandidate { candidate } => self.on_remote_candidate(candidate).await,
            InboundMessage::PeerDataChannels {
                send_stream_id,
                recv_stream_id,
            } => match self.peer.clone() {
                Some(peer) => {
                    if let Err(e) = peer
                        .open_negotiated_channels(send_stream_id, recv_stream_id)
                        .await
                    {
                        warn!("Failed to open negotiated data channels: {}", e);
                    }
                }
                None => self.unexpected("peerDataChannels"),
            },
            InboundMessage::Pong { time } => trace!("Pong ({})", time),
            InboundMessage::PlayerCount { count } => {
                debug!("Player count: {}", count);
                self.emit(SessionEvent::PlayerCount(count));
            }
            InboundMessage::StreamerDisconnected => match self.state {
                SessionState::Subscribed | SessionState::Negotiating | SessionState::Connected => {
                    self.teardown("Streamer disconnected", true, true).await
                }
                _ => self.unexpected("streamerDisconnected"),
            },
            InboundMessage::Error { message } => warn!("Rendezvous server error: {}", message),
            InboundMessage::Disconnect { reason } => {
                info!("Rendezvous server requested disconnect: {}", reason);
                self.teardown(reason, true, true).await;
            }
            InboundMessage::Answer { .. } => self.unexpected("answer"),
        }
    }

    fn unexpected(&self, kind: &str) {
        let error = peerstream_core::Error::UnexpectedMessage {
            kind: kind.to_string(),
            state: self.state.to_string(),
        };
        warn!("Dropping message: {}", error);
    }

    async fn on_config(&mut self, options: PeerConnectionOptions) {
        if self.state != SessionState::AwaitingStreamerList {
            self.unexpected("config");
            return;
        }
        self.peer_options = Some(options.clone());
        if let Err(e) = self.create_peer(options).await {
            self.fail(e).await;
        }
    }

    async fn on_streamer_list(&mut self, ids: Vec<String>) {
        match self.state {
            SessionState::AwaitingStreamerList
            | SessionState::Subscribed
            | SessionState::Negotiating
            | SessionState::Connected => {}
            _ => {
                self.unexpected("streamerList");
                return;
            }
        }

        let preferred = self.settings.text(TextParam::StreamerId);
        let outcome = self.directory.on_streamer_list(ids, Some(preferred.as_str()));
        info!(
            "Streamer list: {:?} (auto-selected: {:?})",
            outcome.ids, outcome.auto_selected
        );
        self.publish_status();
        self.emit(SessionEvent::StreamerList {
            ids: outcome.ids,
            auto_selected: outcome.auto_selected.clone(),
        });

        if let Some(id) = outcome.auto_selected {
            if self.state == SessionState::AwaitingStreamerList {
                self.subscribe(id).await;
            }
        }
    }

    async fn subscribe(&mut self, streamer_id: String) {
        info!("Subscribing to streamer {}", streamer_id);
        self.send_signaling(OutboundMessage::Subscribe { streamer_id })
            .await;
        self.set_state(SessionState::Subscribed);
    }

    async fn on_offer(&mut self, sdp: String) {
        match self.state {
            SessionState::Subscribed => self.set_state(SessionState::Negotiating),
            SessionState::Negotiating | SessionState::Connected => {}
            _ => {
                self.unexpected("offer");
                return;
            }
        }

        if self.peer.is_none() {
            let options = match &self.peer_options {
                Some(options) => options.clone(),
                None => {
                    debug!("Offer before config, creating peer session with defaults");
                    PeerConnectionOptions::default()
                }
            };
            if let Err(e) = self.create_peer(options).await {
                self.fail(e).await;
                return;
            }
        }

        match self.negotiation.begin_offer(sdp) {
            Some(sdp) => self.start_negotiation(sdp),
            None => debug!("Offer queued behind in-flight negotiation"),
        }
    }

    fn start_negotiation(&mut self, offer: String) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        let generation = self.generation;
        let instance = self.peer_instance;
        let inputs = self.inputs.clone();
        self.track_task(tokio::spawn(async move {
            let result = match peer.set_remote_offer(&offer).await {
                Ok(()) => peer.create_answer().await,
                Err(e) => Err(e),
            };
            let _ = inputs.send(Input::NegotiationDone {
                generation,
                instance,
                offer,
                result,
            });
        }));
    }

    async fn on_negotiation_done(
        &mut self,
        offer: String,
        result: std::result::Result<String, TransportError>,
    ) {
        let answer = match result {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(ClientError::NegotiationFailure(e.to_string())).await;
                return;
            }
        };

        self.send_signaling(OutboundMessage::Answer { sdp: answer })
            .await;
        info!("Answer sent");
        self.emit(SessionEvent::SdpExchanged);

        let completion = self.negotiation.complete(offer);
        if !completion.flush.is_empty() {
            debug!("Applying {} buffered candidates", completion.flush.len());
        }
        for candidate in completion.flush {
            if let Err(e) = self.apply_candidate(&candidate).await {
                self.fail(e).await;
                return;
            }
        }

        if let Some(next) = completion.next_offer {
            self.start_negotiation(next);
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        match self.state {
            SessionState::Subscribed | SessionState::Negotiating | SessionState::Connected => {}
            _ => {
                self.unexpected("iceCandidate");
                return;
            }
        }

        match self.negotiation.on_candidate(candidate) {
            Some(candidate) => {
                if let Err(e) = self.apply_candidate(&candidate).await {
                    self.fail(e).await;
                }
            }
            None => trace!(
                "Buffered remote candidate ({} pending)",
                self.negotiation.pending_candidates()
            ),
        }
    }

    async fn apply_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let peer = self
            .peer
            .as_ref()
            .ok_or_else(|| ClientError::NegotiationFailure("no peer session".to_string()))?;
        peer.add_ice_candidate(candidate)
            .await
            .map_err(|e| ClientError::NegotiationFailure(e.to_string()))
    }

    async fn send_signaling(&self, message: OutboundMessage) {
        let Some(channel) = self.channel.as_ref() else {
            debug!("No rendezvous channel, dropping {}", message.kind());
            return;
        };
        match signaling::encode(&message) {
            Ok(text) => {
                if let Err(e) = channel.send(Bytes::from(text)).await {
                    warn!("Failed to send {}: {}", message.kind(), e);
                }
            }
            Err(e) => error!("Failed to encode {}: {}", message.kind(), e),
        }
    }

    // ========================================================================
    // Peer session
    // ========================================================================

    async fn create_peer(&mut self, mut options: PeerConnectionOptions) -> Result<()> {
        if self.settings.flag(Flag::ForceTurn) {
            options.ice_transport_policy = Some("relay".to_string());
        }

        self.release_peer().await;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let peer = self
            .peer_factory
            .create(&options, event_tx)
            .await
            .map_err(|e| ClientError::NegotiationFailure(e.to_string()))?;

        let generation = self.generation;
        let instance = self.peer_instance;
        let inputs = self.inputs.clone();
        self.peer_forwarder = Some(tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let input = Input::Peer {
                    generation,
                    instance,
                    event,
                };
                if inputs.send(input).is_err() {
                    break;
                }
            }
        }));

        info!(
            "Peer session {} created ({} ICE servers, relay only: {})",
            instance,
            options.ice_servers.len(),
            options.relay_only()
        );
        debug!("ICE server URLs: {:?}", options.ice_urls());
        self.peer = Some(peer);
        Ok(())
    }

    /// Close the current peer session and stop forwarding its events
    async fn release_peer(&mut self) {
        self.peer_instance += 1;
        if let Some(forwarder) = self.peer_forwarder.take() {
            forwarder.abort();
        }
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                warn!("Failed to close peer session: {}", e);
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::ConnectivityChange(connectivity) => self.on_connectivity(connectivity).await,
            PeerEvent::Track(track) => self.on_track(track),
            PeerEvent::DataChannelOpen => self.on_data_channel_open().await,
            PeerEvent::DataChannelClosed => {
                info!("Side channel closed");
                self.side.open = false;
                self.publish_status();
            }
            PeerEvent::DataChannelMessage(frame) => self.on_streamer_message(&frame),
            PeerEvent::IceCandidate(candidate) => {
                self.send_signaling(OutboundMessage::IceCandidate { candidate })
                    .await
            }
        }
    }

    async fn on_connectivity(&mut self, connectivity: ConnectivityState) {
        debug!("Peer connectivity {:?} in state {}", connectivity, self.state);
        match connectivity {
            ConnectivityState::Connected => {
                if self.state != SessionState::Negotiating {
                    return;
                }
                self.was_connected = true;
                self.set_state(SessionState::Connected);
                self.start_stats();
                info!("Peer session connected");
                self.emit(SessionEvent::Connected);
            }
            ConnectivityState::Failed => {
                self.fail(ClientError::NegotiationFailure(
                    "peer connectivity failed".to_string(),
                ))
                .await;
            }
            ConnectivityState::Closed => {
                let error = ClientError::ChannelClosed("peer session closed".to_string());
                warn!("{}", error);
                self.teardown(error.to_string(), true, true).await;
            }
            ConnectivityState::Disconnected => warn!("Peer connectivity interrupted"),
            ConnectivityState::New | ConnectivityState::Checking => {}
        }
    }

    fn on_track(&mut self, track: TrackInfo) {
        match track.kind {
            MediaKind::Video => {
                info!("Video track received");
                self.media.video_track = true;
                self.emit(SessionEvent::StreamLoading);
                if self.media.play_pending || self.settings.flag(Flag::AutoPlayVideo) {
                    self.play();
                }
            }
            MediaKind::Audio => debug!("Audio track received"),
        }
    }

    fn start_stats(&mut self) {
        let generation = self.generation;
        let inputs = self.inputs.clone();
        self.timers.arm_interval(
            TimerKind::StatsTick,
            self.config.stats_interval,
            move || {
                inputs
                    .send(Input::Timer {
                        generation,
                        kind: TimerKind::StatsTick,
                    })
                    .is_ok()
            },
        );
    }

    async fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::StatsTick => self.poll_stats().await,
            TimerKind::ReconnectDelay => {
                if self.state == SessionState::Closing {
                    info!("Reconnect delay elapsed");
                    self.emit(SessionEvent::AutoConnect);
                    self.open_channel();
                }
            }
            TimerKind::Keepalive => {
                self.send_signaling(OutboundMessage::Ping {
                    time: unix_time_ms(),
                })
                .await
            }
        }
    }

    async fn poll_stats(&mut self) {
        if self.state != SessionState::Connected {
            return;
        }
        let Some(peer) = self.peer.clone() else {
            return;
        };

        match peer.stats().await {
            Ok(raw) => {
                let facts = SessionFacts {
                    video_start: self.media.video_start,
                    input_control_owned: self.side.input_owner,
                    encoder_avg_qp: self.side.avg_qp,
                };
                let snapshot = self.aggregator.aggregate(raw, &facts, Instant::now());
                self.status.write().latest_stats = Some(snapshot.clone());
                self.emit(SessionEvent::Stats(snapshot));
            }
            Err(e) => warn!("Failed to read peer statistics: {}", e),
        }
    }

    // ========================================================================
    // Side channel
    // ========================================================================

    async fn on_data_channel_open(&mut self) {
        info!("Side channel open");
        self.side.open = true;
        self.publish_status();
        self.emit(SessionEvent::DataChannelOpen);

        self.send_to_streamer(ToStreamer::RequestInitialSettings)
            .await;
        if self.settings.flag(Flag::IsQualityController) {
            self.send_to_streamer(ToStreamer::RequestQualityControl)
                .await;
        }
    }

    async fn send_to_streamer(&self, message: ToStreamer) {
        if !self.side.open {
            trace!("Side channel not open, dropping {}", message.kind());
            return;
        }
        let Some(peer) = self.peer.as_ref() else {
            return;
        };
        if !peer.is_data_channel_open() {
            debug!("Peer data channel closed, dropping {}", message.kind());
            return;
        }
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode {}: {}", message.kind(), e);
                return;
            }
        };
        if let Err(e) = peer.send_data(frame).await {
            warn!("Failed to send {}: {}", message.kind(), e);
        }
    }

    fn on_streamer_message(&mut self, frame: &[u8]) {
        let message = match FromStreamer::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping side-channel frame: {}", e);
                return;
            }
        };

        match message {
            FromStreamer::QualityControlOwnership(owned) => {
                info!("Quality control ownership: {}", owned);
                self.side.quality_owner = owned;
                self.settings
                    .set_flag_from(Flag::IsQualityController, owned, ChangeOrigin::Remote);
                self.emit(SessionEvent::QualityControlOwnership(owned));
            }
            FromStreamer::InputControlOwnership(owned) => {
                info!("Input control ownership: {}", owned);
                self.side.input_owner = owned;
                self.emit(SessionEvent::InputControlOwnership(owned));
            }
            FromStreamer::Response(text) => self.emit(SessionEvent::Response(text)),
            FromStreamer::Command(text) => match StreamerCommand::parse(&text) {
                Ok(StreamerCommand::OnScreenKeyboard { show, x, y }) => {
                    self.emit(SessionEvent::OnScreenKeyboard { show, x, y })
                }
                Ok(StreamerCommand::Other(command)) => {
                    debug!("Unhandled streamer command: {}", command)
                }
                Err(e) => warn!("Malformed streamer command: {}", e),
            },
            FromStreamer::FreezeFrame { size } => debug!("Freeze frame ({} bytes)", size),
            FromStreamer::UnfreezeFrame => debug!("Unfreeze frame"),
            FromStreamer::VideoEncoderAvgQp(qp) => {
                self.side.avg_qp = Some(qp);
                self.emit(SessionEvent::VideoEncoderAvgQp(qp));
            }
            FromStreamer::LatencyTest(timings) => match self.side.latency_start_ms.take() {
                Some(start) => {
                    let results = timings.results(start, unix_time_ms() as f64);
                    self.emit(SessionEvent::LatencyTest(results));
                }
                None => warn!("Latency results without a pending test"),
            },
            FromStreamer::InitialSettings(settings) => self.on_initial_settings(settings),
        }
    }

    fn on_initial_settings(&mut self, initial: InitialSettings) {
        self.side.console_commands_allowed = initial.allows_console_commands();
        self.side.latency_test_allowed = !initial
            .permissions
            .as_ref()
            .map(|p| p.disable_latency_test)
            .unwrap_or(false);

        let remote = ChangeOrigin::Remote;
        if let Some(encoder) = &initial.encoder {
            if let Some(qp) = encoder.min_qp {
                self.settings.set_numeric_from(NumericParam::MinQp, qp, remote);
            }
            if let Some(qp) = encoder.max_qp {
                self.settings.set_numeric_from(NumericParam::MaxQp, qp, remote);
            }
        }
        // Bitrates arrive in bits per second, settings hold kilobits
        if let Some(web_rtc) = &initial.web_rtc {
            if let Some(fps) = web_rtc.fps {
                self.settings.set_numeric_from(NumericParam::WebRtcFps, fps, remote);
            }
            if let Some(bps) = web_rtc.min_bitrate {
                self.settings
                    .set_numeric_from(NumericParam::WebRtcMinBitrate, bps / 1000, remote);
            }
            if let Some(bps) = web_rtc.max_bitrate {
                self.settings
                    .set_numeric_from(NumericParam::WebRtcMaxBitrate, bps / 1000, remote);
            }
        }

        info!(
            "Initial settings received (console commands allowed: {})",
            self.side.console_commands_allowed
        );
        self.emit(SessionEvent::InitialSettings(initial));
    }

    async fn on_setting_change(&mut self, change: SettingChange) {
        if change.origin != ChangeOrigin::Local {
            return;
        }

        match change.key {
            SettingKey::Flag(Flag::IsQualityController) => {
                if self.settings.flag(Flag::IsQualityController) && !self.side.quality_owner {
                    self.send_to_streamer(ToStreamer::RequestQualityControl)
                        .await;
                }
            }
            SettingKey::Numeric(param) => {
                let value = self.settings.numeric(param);
                let (field, value) = match param {
                    NumericParam::MinQp => ("Encoder.MinQP", value),
                    NumericParam::MaxQp => ("Encoder.MaxQP", value),
                    NumericParam::WebRtcFps => ("WebRTC.Fps", value),
                    NumericParam::WebRtcMinBitrate => ("WebRTC.MinBitrate", value * 1000),
                    NumericParam::WebRtcMaxBitrate => ("WebRTC.MaxBitrate", value * 1000),
                };
                let mut descriptor = Map::new();
                descriptor.insert(field.to_string(), Value::from(value));
                self.send_to_streamer(ToStreamer::Command(Value::Object(descriptor).to_string()))
                    .await;
            }
            _ => {}
        }
    }

    // ========================================================================
    // Teardown and bookkeeping
    // ========================================================================

    async fn fail(&mut self, error: ClientError) {
        let reason = error.to_string();
        error!("Session failed: {}", reason);
        self.emit(SessionEvent::Failed {
            reason: reason.clone(),
        });
        self.teardown(reason, true, true).await;
    }

    async fn teardown(&mut self, reason: impl Into<String>, abnormal: bool, show_in_ui: bool) {
        if !self.state.is_active() {
            return;
        }
        let reason = reason.into();
        info!("Closing session: {} (abnormal: {})", reason, abnormal);

        self.set_state(SessionState::Closing);
        self.close_session().await;
        self.set_state(SessionState::Disconnected);
        self.emit(SessionEvent::Disconnected {
            reason,
            abnormal,
            show_in_ui,
        });
    }

    /// Release every resource of the current attempt and supersede its generation
    async fn close_session(&mut self) {
        self.timers.cancel_all();
        for task in self.tasks.drain(..) {
            task.abort();
        }

        self.release_peer().await;
        if let Some(channel) = self.channel.take() {
            let _ = channel.close().await;
        }

        self.generation += 1;
        self.peer_options = None;
        self.directory.clear();
        self.reset_streamer_state();
    }

    /// Forget everything tied to the current streamer's peer session
    fn reset_streamer_state(&mut self) {
        self.negotiation.reset();
        self.aggregator.reset();
        self.media = MediaState::default();
        self.side = SideChannelState::default();
        self.publish_status();
    }

    fn track_task(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!("State {} -> {}", self.state, state);
        if self.state == SessionState::Connected {
            self.timers.cancel(TimerKind::StatsTick);
        }
        self.state = state;
        self.status.write().state = state;
        self.emit(SessionEvent::StateChanged(state));
    }

    fn publish_status(&self) {
        let mut status = self.status.write();
        status.streamers = self.directory.ids().to_vec();
        status.selected_streamer = self.directory.selected().map(str::to_string);
        status.data_channel_open = self.side.open;
        status.latest_stats = self.aggregator.latest();
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
