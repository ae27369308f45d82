//! Peer session backed by webrtc-rs
//!
//! The client is always the answering side: the streamer offers audio, video and
//! the side channel, and the session answers with receive-only media. The side
//! channel normally arrives through `on_data_channel`; when the server assigns
//! stream ids instead, [`PeerSession::open_negotiated_channels`] creates the
//! pre-negotiated pair.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use peerstream_core::stats::{
    CandidatePairStats, CandidateStats, InboundRtpStats, OutboundRtpStats,
};
use peerstream_core::{
    IceCandidate, MediaKind, PeerConnectionOptions, RawStat, DATA_CHANNEL_LABEL,
};

use crate::error::{Result, TransportError};
use crate::peer::{ConnectivityState, PeerEvent, PeerSession, PeerSessionFactory, TrackInfo};

use webrtc_rs::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder,
    },
    data_channel::{
        data_channel_init::RTCDataChannelInit, data_channel_message::DataChannelMessage,
        data_channel_state::RTCDataChannelState, RTCDataChannel,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_connection_state::RTCIceConnectionState,
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, policy::ice_transport_policy::RTCIceTransportPolicy,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::rtp_codec::RTPCodecType,
    stats::StatsReportType,
};

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

/// Creates [`WebRtcPeerSession`]s
#[derive(Debug, Clone, Default)]
pub struct WebRtcPeerSessionFactory {
    /// Used when the server supplies no ICE servers
    pub fallback_ice_servers: Vec<String>,
}

impl WebRtcPeerSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback_ice_servers(servers: Vec<String>) -> Self {
        Self {
            fallback_ice_servers: servers,
        }
    }

    fn configuration(&self, options: &PeerConnectionOptions) -> RTCConfiguration {
        let mut ice_servers: Vec<RTCIceServer> = options
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.to_vec(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        if ice_servers.is_empty() {
            ice_servers = self
                .fallback_ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect();
        }

        let ice_transport_policy = if options.relay_only() {
            RTCIceTransportPolicy::Relay
        } else {
            RTCIceTransportPolicy::All
        };

        RTCConfiguration {
            ice_servers,
            ice_transport_policy,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerSessionFactory for WebRtcPeerSessionFactory {
    async fn create(
        &self,
        options: &PeerConnectionOptions,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerSession>> {
        let mut m = MediaEngine::default();
        m.register_default_codecs().map_err(|e| {
            TransportError::ConnectionFailed(format!("Codec registration failed: {}", e))
        })?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m).map_err(|e| {
            TransportError::ConnectionFailed(format!("Interceptor registration failed: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api
            .new_peer_connection(self.configuration(options))
            .await
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("PeerConnection creation failed: {}", e))
            })?;

        let session = WebRtcPeerSession {
            peer_connection: Arc::new(peer_connection),
            channel: Arc::new(Mutex::new(None)),
            events,
        };
        session.install_handlers();

        info!(
            "Created peer session (relay only: {})",
            options.relay_only()
        );
        Ok(Arc::new(session))
    }
}

/// WebRTC peer session
pub struct WebRtcPeerSession {
    peer_connection: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl WebRtcPeerSession {
    fn install_handlers(&self) {
        let events = self.events.clone();
        self.peer_connection
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                debug!("ICE connection state: {:?}", state);
                let mapped = match state {
                    RTCIceConnectionState::New => Some(ConnectivityState::New),
                    RTCIceConnectionState::Checking => Some(ConnectivityState::Checking),
                    RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                        Some(ConnectivityState::Connected)
                    }
                    RTCIceConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
                    RTCIceConnectionState::Failed => Some(ConnectivityState::Failed),
                    RTCIceConnectionState::Closed => Some(ConnectivityState::Closed),
                    _ => None,
                };
                if let Some(state) = mapped {
                    let _ = events.send(PeerEvent::ConnectivityChange(state));
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(MediaKind::Audio),
                    RTPCodecType::Video => Some(MediaKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    info!("Remote {:?} track", kind);
                    let _ = events.send(PeerEvent::Track(TrackInfo {
                        kind,
                        id: track.id().to_string(),
                        stream_id: track.stream_id().to_string(),
                    }));
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(PeerEvent::IceCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => warn!("Failed to convert ICE candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        let slot = self.channel.clone();
        self.peer_connection
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                info!("Received data channel: {}", channel.label());
                attach_channel(&channel, Some(&slot), &events);
                Box::pin(async {})
            }));
    }

    fn current_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.lock().clone()
    }
}

/// Wire channel callbacks into peer events; `slot` receives the channel used for sending
fn attach_channel(
    channel: &Arc<RTCDataChannel>,
    slot: Option<&ChannelSlot>,
    events: &mpsc::UnboundedSender<PeerEvent>,
) {
    let tx = events.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = tx.send(PeerEvent::DataChannelMessage(msg.data));
        Box::pin(async {})
    }));

    let Some(slot) = slot else {
        return;
    };
    *slot.lock() = Some(channel.clone());

    let tx = events.clone();
    channel.on_close(Box::new(move || {
        let _ = tx.send(PeerEvent::DataChannelClosed);
        Box::pin(async {})
    }));

    if channel.ready_state() == RTCDataChannelState::Open {
        let _ = events.send(PeerEvent::DataChannelOpen);
    } else {
        let tx = events.clone();
        channel.on_open(Box::new(move || {
            let _ = tx.send(PeerEvent::DataChannelOpen);
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl PeerSession for WebRtcPeerSession {
    async fn set_remote_offer(&self, sdp: &str) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| TransportError::Negotiation(format!("Invalid offer: {}", e)))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| {
                TransportError::Negotiation(format!("Set remote description failed: {}", e))
            })
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Negotiation(format!("Create answer failed: {}", e)))?;

        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| {
                TransportError::Negotiation(format!("Set local description failed: {}", e))
            })?;

        Ok(answer.sdp)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Negotiation(format!("Add ICE candidate failed: {}", e)))
    }

    async fn open_negotiated_channels(&self, send_stream_id: u16, recv_stream_id: u16) -> Result<()> {
        let send = self
            .peer_connection
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    negotiated: Some(send_stream_id),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("DataChannel creation failed: {}", e))
            })?;
        attach_channel(&send, Some(&self.channel), &self.events);

        if recv_stream_id != send_stream_id {
            let recv = self
                .peer_connection
                .create_data_channel(
                    DATA_CHANNEL_LABEL,
                    Some(RTCDataChannelInit {
                        ordered: Some(true),
                        negotiated: Some(recv_stream_id),
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| {
                    TransportError::ConnectionFailed(format!("DataChannel creation failed: {}", e))
                })?;
            attach_channel(&recv, None, &self.events);
        }

        info!(
            "Opened negotiated data channels (send {}, recv {})",
            send_stream_id, recv_stream_id
        );
        Ok(())
    }

    async fn send_data(&self, data: Bytes) -> Result<()> {
        let channel = self.current_channel().ok_or(TransportError::NotConnected)?;
        channel
            .send(&data)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    fn is_data_channel_open(&self) -> bool {
        self.current_channel()
            .map(|c| c.ready_state() == RTCDataChannelState::Open)
            .unwrap_or(false)
    }

    async fn stats(&self) -> Result<Vec<RawStat>> {
        let report = self.peer_connection.get_stats().await;
        let mut records = Vec::with_capacity(report.reports.len());

        for stat in report.reports.values() {
            match stat {
                StatsReportType::CandidatePair(pair) => {
                    records.push(RawStat::CandidatePair(CandidatePairStats {
                        id: pair.id.clone(),
                        local_candidate_id: pair.local_candidate_id.clone(),
                        remote_candidate_id: pair.remote_candidate_id.clone(),
                        nominated: pair.nominated,
                        bytes_sent: pair.bytes_sent,
                        bytes_received: pair.bytes_received,
                        packets_sent: pair.packets_sent as u64,
                        packets_received: pair.packets_received as u64,
                        current_round_trip_time: Some(pair.current_round_trip_time),
                        available_outgoing_bitrate: Some(pair.available_outgoing_bitrate),
                    }));
                }
                StatsReportType::LocalCandidate(candidate) => {
                    records.push(RawStat::LocalCandidate(candidate_stats(candidate)));
                }
                StatsReportType::RemoteCandidate(candidate) => {
                    records.push(RawStat::RemoteCandidate(candidate_stats(candidate)));
                }
                StatsReportType::InboundRTP(inbound) => {
                    let Some(kind) = media_kind(inbound.kind) else {
                        continue;
                    };
                    let mut stats = InboundRtpStats::new(kind, inbound.ssrc);
                    stats.bytes_received = inbound.bytes_received;
                    stats.packets_received = inbound.packets_received;
                    records.push(RawStat::InboundRtp(stats));
                }
                StatsReportType::OutboundRTP(outbound) => {
                    let Some(kind) = media_kind(outbound.kind) else {
                        continue;
                    };
                    let mut stats = OutboundRtpStats::new(kind, outbound.ssrc);
                    stats.bytes_sent = outbound.bytes_sent;
                    stats.packets_sent = outbound.packets_sent;
                    records.push(RawStat::OutboundRtp(stats));
                }
                _ => {}
            }
        }

        Ok(records)
    }

    async fn close(&self) -> Result<()> {
        *self.channel.lock() = None;
        self.peer_connection
            .close()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

fn media_kind(kind: &str) -> Option<MediaKind> {
    match kind {
        "audio" => Some(MediaKind::Audio),
        "video" => Some(MediaKind::Video),
        _ => None,
    }
}

fn candidate_stats(candidate: &webrtc_rs::stats::ICECandidateStats) -> CandidateStats {
    CandidateStats {
        id: candidate.id.clone(),
        address: candidate.ip.clone(),
        port: candidate.port,
        protocol: format!("{:?}", candidate.network_type),
        candidate_type: format!("{:?}", candidate.candidate_type),
        relay_protocol: Some(candidate.relay_protocol.clone()).filter(|p| !p.is_empty()),
    }
}
