//! Statistics records
//!
//! [`RawStat`] is what a peer session reports when polled. [`StatsSnapshot`] is the
//! merged, immutable view produced once per polling tick.

use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Transport candidate pair
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CandidatePairStats {
    pub id: String,
    pub local_candidate_id: String,
    pub remote_candidate_id: String,
    pub nominated: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Seconds
    pub current_round_trip_time: Option<f64>,
    /// Bits per second
    pub available_outgoing_bitrate: Option<f64>,
}

/// Local or remote network candidate
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CandidateStats {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub candidate_type: String,
    pub relay_protocol: Option<String>,
}

/// Inbound media stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundRtpStats {
    pub kind: MediaKind,
    pub ssrc: u32,
    pub bytes_received: u64,
    pub packets_received: u64,
    pub packets_lost: i64,
    /// Seconds
    pub jitter: Option<f64>,
    pub frames_decoded: Option<u64>,
    pub frames_dropped: Option<u64>,
    pub frames_received: Option<u64>,
    pub freeze_count: Option<u64>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub frames_per_second: Option<f64>,
}

impl InboundRtpStats {
    pub fn new(kind: MediaKind, ssrc: u32) -> Self {
        Self {
            kind,
            ssrc,
            bytes_received: 0,
            packets_received: 0,
            packets_lost: 0,
            jitter: None,
            frames_decoded: None,
            frames_dropped: None,
            frames_received: None,
            freeze_count: None,
            frame_width: None,
            frame_height: None,
            frames_per_second: None,
        }
    }
}

/// Outbound media stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundRtpStats {
    pub kind: MediaKind,
    pub ssrc: u32,
    pub bytes_sent: u64,
    pub packets_sent: u64,
    /// Encoder target, bits per second
    pub target_bitrate: Option<f64>,
    pub qp_sum: Option<u64>,
    pub frames_encoded: Option<u64>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
}

impl OutboundRtpStats {
    pub fn new(kind: MediaKind, ssrc: u32) -> Self {
        Self {
            kind,
            ssrc,
            bytes_sent: 0,
            packets_sent: 0,
            target_bitrate: None,
            qp_sum: None,
            frames_encoded: None,
            frame_width: None,
            frame_height: None,
        }
    }

    /// Mean quantizer over all encoded frames
    pub fn mean_qp(&self) -> Option<f64> {
        match (self.qp_sum, self.frames_encoded) {
            (Some(sum), Some(frames)) if frames > 0 => Some(sum as f64 / frames as f64),
            _ => None,
        }
    }
}

/// One raw record reported by a peer session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RawStat {
    CandidatePair(CandidatePairStats),
    LocalCandidate(CandidateStats),
    RemoteCandidate(CandidateStats),
    InboundRtp(InboundRtpStats),
    OutboundRtp(OutboundRtpStats),
}

/// Merged statistics for one polling tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Unix time in milliseconds
    pub timestamp_ms: u64,
    pub candidate_pair: CandidatePairStats,
    pub local_candidates: Vec<CandidateStats>,
    pub remote_candidates: Vec<CandidateStats>,
    pub inbound_audio: Option<InboundRtpStats>,
    pub inbound_video: Option<InboundRtpStats>,
    pub outbound_video: Option<OutboundRtpStats>,
    /// Kilobits per second since the previous snapshot
    pub inbound_video_bitrate_kbps: Option<f64>,
    /// Kilobits per second since the previous snapshot
    pub inbound_audio_bitrate_kbps: Option<f64>,
    /// Latest average QP reported over the side channel
    pub encoder_avg_qp: Option<u32>,
    /// Time since video playback started
    pub session_duration: Option<Duration>,
    pub input_control_owned: bool,
}
