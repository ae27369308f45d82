//! Common test helpers and utilities for PeerStream tests
//!
//! This crate provides:
//! - Condition-based waiting that also works under paused Tokio time
//! - Event stream helpers for [`SessionEvent`] receivers
//! - An in-memory rendezvous server ([`MockConnector`])
//! - A scriptable peer session ([`MockPeerFactory`], [`MockPeerSession`])
//! - A harness that drives a controller through the happy path ([`TestSession`])

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use peerstream_client::{SessionControllerBuilder, SessionEvent, SessionHandle, SessionState};
use peerstream_core::{
    IceCandidate, InboundMessage, MediaKind, OutboundMessage, PeerConnectionOptions, RawStat,
    Settings,
};
use peerstream_transport::{
    Connector, ConnectivityState, PeerEvent, PeerSession, PeerSessionFactory, TrackInfo,
    TransportError, TransportEvent, TransportReceiver, TransportSender,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{timeout, Instant};

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Install a test log subscriber; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout
///
/// Uses the Tokio clock so it behaves under `start_paused` tests.
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Receive events until one matches, discarding the rest
pub async fn wait_for_event<P>(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    mut predicate: P,
    max_wait: Duration,
) -> Option<SessionEvent>
where
    P: FnMut(&SessionEvent) -> bool,
{
    let deadline = Instant::now() + max_wait;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Some(event)) if predicate(&event) => return Some(event),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Collect events until none arrives for `quiet`
pub async fn drain_events(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    quiet: Duration,
) -> Vec<SessionEvent> {
    let mut collected = Vec::new();
    while let Ok(Some(event)) = timeout(quiet, events.recv()).await {
        collected.push(event);
    }
    collected
}

/// Let spawned tasks run without advancing the clock
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Text payload of an outbound side-channel frame (type byte, `u16` length, UTF-16LE)
pub fn decode_outbound_text(frame: &[u8]) -> Option<String> {
    let len = u16::from_le_bytes([*frame.get(1)?, *frame.get(2)?]) as usize;
    let body = frame.get(3..3 + len * 2)?;
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

// ============================================================================
// Mock Rendezvous Server
// ============================================================================

#[derive(Default)]
struct ConnectorState {
    connects: AtomicU32,
    failures_pending: AtomicU32,
    urls: Mutex<Vec<String>>,
    server: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    sent: Mutex<Vec<OutboundMessage>>,
}

/// In-memory rendezvous server
///
/// Every successful `connect` replaces the current channel. Frames pushed by the
/// test go to the most recent channel; everything the client sends is decoded
/// and recorded in one log across all channels.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<ConnectorState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful and failed connection attempts
    pub fn connect_count(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.state.urls.lock().clone()
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.state.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Deliver a message from the server
    pub fn push(&self, message: &InboundMessage) {
        let text = serde_json::to_string(message).expect("inbound message serializes");
        self.push_raw(&text);
    }

    /// Deliver a raw frame from the server
    pub fn push_raw(&self, text: &str) {
        if let Some(server) = self.state.server.lock().as_ref() {
            let _ = server.send(TransportEvent::Data(Bytes::from(text.to_string())));
        }
    }

    /// Close the current channel from the server side
    pub fn close(&self, reason: &str) {
        if let Some(server) = self.state.server.lock().take() {
            let _ = server.send(TransportEvent::Disconnected {
                reason: Some(reason.to_string()),
            });
        }
    }

    /// Every message the client sent, in order
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.state.sent.lock().clone()
    }

    /// Sent messages of one wire kind
    pub fn sent_of_kind(&self, kind: &str) -> Vec<OutboundMessage> {
        self.sent().into_iter().filter(|m| m.kind() == kind).collect()
    }

    pub fn clear_sent(&self) {
        self.state.sent.lock().clear();
    }

    /// Wait until at least `count` messages of `kind` were sent
    pub async fn wait_for_sent(&self, kind: &str, count: usize, max_wait: Duration) -> bool {
        wait_for(
            move || async move { self.sent_of_kind(kind).len() >= count },
            DEFAULT_CHECK_INTERVAL,
            max_wait,
        )
        .await
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> peerstream_transport::Result<(Box<dyn TransportSender>, Box<dyn TransportReceiver>)> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.urls.lock().push(url.to_string());

        let pending = self.state.failures_pending.load(Ordering::SeqCst);
        if pending > 0 {
            self.state.failures_pending.store(pending - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectionFailed("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Connected);
        *self.state.server.lock() = Some(tx);

        let sender = MockChannelSender {
            state: self.state.clone(),
            open: AtomicBool::new(true),
        };
        Ok((Box::new(sender), Box::new(MockChannelReceiver { rx })))
    }
}

struct MockChannelSender {
    state: Arc<ConnectorState>,
    open: AtomicBool,
}

#[async_trait]
impl TransportSender for MockChannelSender {
    async fn send(&self, data: Bytes) -> peerstream_transport::Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let message: OutboundMessage = serde_json::from_slice(&data)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.state.sent.lock().push(message);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> peerstream_transport::Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MockChannelReceiver {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for MockChannelReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

// ============================================================================
// Mock Peer Session
// ============================================================================

/// A call made on a [`MockPeerSession`]
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCall {
    SetRemoteOffer(String),
    CreateAnswer,
    AddCandidate(IceCandidate),
    OpenNegotiatedChannels(u16, u16),
    Close,
}

#[derive(Default)]
struct PeerScript {
    fail_create: AtomicBool,
    fail_offers: AtomicBool,
    fail_candidates: AtomicBool,
    hold_answers: AtomicBool,
    stats: Mutex<Vec<RawStat>>,
    options: Mutex<Vec<PeerConnectionOptions>>,
    sessions: Mutex<Vec<Arc<MockPeerSession>>>,
}

/// Creates [`MockPeerSession`]s and scripts their behavior
#[derive(Clone, Default)]
pub struct MockPeerFactory {
    script: Arc<PeerScript>,
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        self.script.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Reject every remote offer
    pub fn fail_offers(&self, fail: bool) {
        self.script.fail_offers.store(fail, Ordering::SeqCst);
    }

    /// Reject every remote candidate
    pub fn fail_candidates(&self, fail: bool) {
        self.script.fail_candidates.store(fail, Ordering::SeqCst);
    }

    /// Block `create_answer` until [`MockPeerSession::release_answer`]
    pub fn hold_answers(&self, hold: bool) {
        self.script.hold_answers.store(hold, Ordering::SeqCst);
    }

    /// Records returned by every session's `stats()`
    pub fn set_stats(&self, stats: Vec<RawStat>) {
        *self.script.stats.lock() = stats;
    }

    pub fn created(&self) -> usize {
        self.script.sessions.lock().len()
    }

    /// Options passed to each `create` call
    pub fn options(&self) -> Vec<PeerConnectionOptions> {
        self.script.options.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<MockPeerSession>> {
        self.script.sessions.lock().last().cloned()
    }

    /// Session returned by the `index`th `create` call
    pub fn session(&self, index: usize) -> Option<Arc<MockPeerSession>> {
        self.script.sessions.lock().get(index).cloned()
    }

    /// Wait until at least `count` sessions have been created
    pub async fn wait_for_created(&self, count: usize, max_wait: Duration) -> bool {
        wait_for(
            move || async move { self.created() >= count },
            DEFAULT_CHECK_INTERVAL,
            max_wait,
        )
        .await
    }

    pub async fn wait_for_session(&self, max_wait: Duration) -> Option<Arc<MockPeerSession>> {
        if wait_for(
            move || async move { self.created() > 0 },
            DEFAULT_CHECK_INTERVAL,
            max_wait,
        )
        .await
        {
            self.latest()
        } else {
            None
        }
    }
}

#[async_trait]
impl PeerSessionFactory for MockPeerFactory {
    async fn create(
        &self,
        options: &PeerConnectionOptions,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> peerstream_transport::Result<Arc<dyn PeerSession>> {
        self.script.options.lock().push(options.clone());
        if self.script.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::Negotiation("peer creation refused".to_string()));
        }

        let session = Arc::new(MockPeerSession {
            script: self.script.clone(),
            events,
            calls: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            data_open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            answers: AtomicU32::new(0),
            answer_gate: Semaphore::new(0),
        });
        self.script.sessions.lock().push(session.clone());
        Ok(session)
    }
}

/// Scriptable peer session that records every call
pub struct MockPeerSession {
    script: Arc<PeerScript>,
    events: mpsc::UnboundedSender<PeerEvent>,
    calls: Mutex<Vec<PeerCall>>,
    sent: Mutex<Vec<Bytes>>,
    data_open: AtomicBool,
    closed: AtomicBool,
    answers: AtomicU32,
    answer_gate: Semaphore,
}

impl MockPeerSession {
    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    /// Remote candidates applied so far, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                PeerCall::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Side-channel frames sent by the client
    pub fn sent_data(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Message type byte of each sent frame
    pub fn sent_codes(&self) -> Vec<u8> {
        self.sent_data()
            .iter()
            .filter_map(|frame| frame.first().copied())
            .collect()
    }

    /// Text payloads of sent frames with the given type byte
    pub fn sent_texts(&self, code: u8) -> Vec<String> {
        self.sent_data()
            .iter()
            .filter(|frame| frame.first() == Some(&code))
            .filter_map(|frame| decode_outbound_text(frame))
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Let one held `create_answer` complete
    pub fn release_answer(&self) {
        self.answer_gate.add_permits(1);
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_connectivity(&self, state: ConnectivityState) {
        self.emit(PeerEvent::ConnectivityChange(state));
    }

    /// Report connectivity established
    pub fn connect(&self) {
        self.set_connectivity(ConnectivityState::Connected);
    }

    pub fn add_track(&self, kind: MediaKind) {
        self.emit(PeerEvent::Track(TrackInfo::new(kind)));
    }

    pub fn open_data_channel(&self) {
        self.data_open.store(true, Ordering::SeqCst);
        self.emit(PeerEvent::DataChannelOpen);
    }

    pub fn close_data_channel(&self) {
        self.data_open.store(false, Ordering::SeqCst);
        self.emit(PeerEvent::DataChannelClosed);
    }

    /// Deliver a side-channel frame from the streamer
    pub fn receive(&self, frame: Bytes) {
        self.emit(PeerEvent::DataChannelMessage(frame));
    }

    /// Report a locally gathered candidate
    pub fn gather_candidate(&self, candidate: IceCandidate) {
        self.emit(PeerEvent::IceCandidate(candidate));
    }
}

#[async_trait]
impl PeerSession for MockPeerSession {
    async fn set_remote_offer(&self, sdp: &str) -> peerstream_transport::Result<()> {
        self.calls
            .lock()
            .push(PeerCall::SetRemoteOffer(sdp.to_string()));
        if self.script.fail_offers.load(Ordering::SeqCst) {
            return Err(TransportError::Negotiation("offer rejected".to_string()));
        }
        Ok(())
    }

    async fn create_answer(&self) -> peerstream_transport::Result<String> {
        self.calls.lock().push(PeerCall::CreateAnswer);
        if self.script.hold_answers.load(Ordering::SeqCst) {
            let permit = self
                .answer_gate
                .acquire()
                .await
                .map_err(|_| TransportError::ConnectionClosed)?;
            permit.forget();
        }
        let n = self.answers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("answer-{}", n))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> peerstream_transport::Result<()> {
        self.calls
            .lock()
            .push(PeerCall::AddCandidate(candidate.clone()));
        if self.script.fail_candidates.load(Ordering::SeqCst) {
            return Err(TransportError::Negotiation("candidate rejected".to_string()));
        }
        Ok(())
    }

    async fn open_negotiated_channels(
        &self,
        send_stream_id: u16,
        recv_stream_id: u16,
    ) -> peerstream_transport::Result<()> {
        self.calls
            .lock()
            .push(PeerCall::OpenNegotiatedChannels(send_stream_id, recv_stream_id));
        Ok(())
    }

    async fn send_data(&self, data: Bytes) -> peerstream_transport::Result<()> {
        if !self.data_open.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().push(data);
        Ok(())
    }

    fn is_data_channel_open(&self) -> bool {
        self.data_open.load(Ordering::SeqCst)
    }

    async fn stats(&self) -> peerstream_transport::Result<Vec<RawStat>> {
        Ok(self.script.stats.lock().clone())
    }

    async fn close(&self) -> peerstream_transport::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.data_open.store(false, Ordering::SeqCst);
        self.calls.lock().push(PeerCall::Close);
        Ok(())
    }
}

// ============================================================================
// Test Session - controller wired to the mocks
// ============================================================================

/// A running controller wired to a [`MockConnector`] and [`MockPeerFactory`]
pub struct TestSession {
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub server: MockConnector,
    pub peers: MockPeerFactory,
}

impl TestSession {
    /// Start with default settings and keepalive disabled
    pub fn start() -> Self {
        Self::start_with(Settings::new(), |builder| builder)
    }

    /// Start with the given settings and extra builder configuration
    pub fn start_with<F>(settings: Settings, configure: F) -> Self
    where
        F: FnOnce(SessionControllerBuilder) -> SessionControllerBuilder,
    {
        init_tracing();
        let server = MockConnector::new();
        let peers = MockPeerFactory::new();
        let builder = SessionControllerBuilder::new("ws://test.invalid:80")
            .settings(settings)
            .keepalive_interval(None)
            .connector(server.clone())
            .peer_factory(peers.clone());
        let (handle, events) = configure(builder)
            .start()
            .expect("controller starts with mocks");
        Self {
            handle,
            events,
            server,
            peers,
        }
    }

    /// Wait for a matching event or panic
    pub async fn expect<P>(&mut self, what: &str, predicate: P) -> SessionEvent
    where
        P: FnMut(&SessionEvent) -> bool,
    {
        match wait_for_event(&mut self.events, predicate, DEFAULT_TIMEOUT).await {
            Some(event) => event,
            None => panic!("timed out waiting for {}", what),
        }
    }

    pub async fn expect_state(&mut self, state: SessionState) {
        self.expect(&format!("state {}", state), |e| {
            *e == SessionEvent::StateChanged(state)
        })
        .await;
    }

    /// Connect and wait for the rendezvous channel to open
    pub async fn open_rendezvous(&mut self) {
        self.handle.connect().expect("controller running");
        self.expect_state(SessionState::AwaitingStreamerList).await;
    }

    /// Deliver `config` and a streamer list, waiting for the subscription
    pub async fn subscribe_to(&mut self, ids: &[&str]) {
        self.server.push(&InboundMessage::Config {
            peer_connection_options: PeerConnectionOptions::default(),
        });
        self.server.push(&InboundMessage::StreamerList {
            ids: ids.iter().map(|id| id.to_string()).collect(),
        });
        self.expect_state(SessionState::Subscribed).await;
    }

    /// Deliver an offer and wait for the answer
    pub async fn negotiate(&mut self, sdp: &str) -> Arc<MockPeerSession> {
        self.server.push(&InboundMessage::Offer {
            sdp: sdp.to_string(),
        });
        self.expect("sdp exchange", |e| *e == SessionEvent::SdpExchanged)
            .await;
        self.peers.latest().expect("peer session created")
    }

    /// Drive the session to `Connected` with a single streamer
    pub async fn connect_fully(&mut self) -> Arc<MockPeerSession> {
        self.open_rendezvous().await;
        self.subscribe_to(&["streamer-1"]).await;
        let peer = self.negotiate("offer-1").await;
        peer.connect();
        self.expect("connected", |e| *e == SessionEvent::Connected)
            .await;
        peer
    }

    /// Open the side channel and wait for the controller to notice
    pub async fn open_side_channel(&mut self, peer: &MockPeerSession) {
        peer.open_data_channel();
        self.expect("side channel", |e| *e == SessionEvent::DataChannelOpen)
            .await;
    }
}
