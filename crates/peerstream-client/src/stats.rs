//! Statistics aggregation
//!
//! Merges the raw records of one poll into a [`StatsSnapshot`] and derives the
//! fields that need history: session duration and inbound bitrates.

use peerstream_core::stats::{CandidatePairStats, InboundRtpStats};
use peerstream_core::{MediaKind, RawStat, StatsSnapshot};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Session facts the peer session does not report itself
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionFacts {
    pub video_start: Option<Instant>,
    pub input_control_owned: bool,
    pub encoder_avg_qp: Option<u32>,
}

#[derive(Debug, Default)]
pub struct StatsAggregator {
    latest: Option<Arc<StatsSnapshot>>,
    latest_at: Option<Instant>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one poll into a snapshot and remember it as the latest
    pub fn aggregate(&mut self, raw: Vec<RawStat>, facts: &SessionFacts, now: Instant) -> Arc<StatsSnapshot> {
        let mut pairs = Vec::new();
        let mut local_candidates = Vec::new();
        let mut remote_candidates = Vec::new();
        let mut inbound_audio = None;
        let mut inbound_video = None;
        let mut outbound_video = None;

        for stat in raw {
            match stat {
                RawStat::CandidatePair(pair) => pairs.push(pair),
                RawStat::LocalCandidate(candidate) => local_candidates.push(candidate),
                RawStat::RemoteCandidate(candidate) => remote_candidates.push(candidate),
                RawStat::InboundRtp(rtp) => match rtp.kind {
                    MediaKind::Audio => inbound_audio = Some(rtp),
                    MediaKind::Video => inbound_video = Some(rtp),
                },
                RawStat::OutboundRtp(rtp) if rtp.kind == MediaKind::Video => {
                    outbound_video = Some(rtp)
                }
                RawStat::OutboundRtp(_) => {}
            }
        }

        let elapsed = self
            .latest_at
            .map(|at| now.saturating_duration_since(at).as_secs_f64());
        let previous = self.latest.as_deref();

        let snapshot = Arc::new(StatsSnapshot {
            timestamp_ms: unix_time_ms(),
            candidate_pair: select_pair(pairs),
            local_candidates,
            remote_candidates,
            inbound_video_bitrate_kbps: bitrate_kbps(
                inbound_video.as_ref(),
                previous.and_then(|p| p.inbound_video.as_ref()),
                elapsed,
            ),
            inbound_audio_bitrate_kbps: bitrate_kbps(
                inbound_audio.as_ref(),
                previous.and_then(|p| p.inbound_audio.as_ref()),
                elapsed,
            ),
            inbound_audio,
            inbound_video,
            outbound_video,
            encoder_avg_qp: facts.encoder_avg_qp,
            session_duration: facts
                .video_start
                .map(|start| now.saturating_duration_since(start)),
            input_control_owned: facts.input_control_owned,
        });

        self.latest = Some(snapshot.clone());
        self.latest_at = Some(now);
        snapshot
    }

    pub fn latest(&self) -> Option<Arc<StatsSnapshot>> {
        self.latest.clone()
    }

    /// Forget history, e.g. when a session ends
    pub fn reset(&mut self) {
        self.latest = None;
        self.latest_at = None;
    }
}

/// Nominated pair, else the first reported, else an empty record
fn select_pair(pairs: Vec<CandidatePairStats>) -> CandidatePairStats {
    let nominated = pairs.iter().position(|p| p.nominated);
    let mut pairs = pairs;
    match nominated {
        Some(index) => pairs.swap_remove(index),
        None => pairs.into_iter().next().unwrap_or_default(),
    }
}

fn bitrate_kbps(
    current: Option<&InboundRtpStats>,
    previous: Option<&InboundRtpStats>,
    elapsed_secs: Option<f64>,
) -> Option<f64> {
    let (current, previous, elapsed) = (current?, previous?, elapsed_secs?);
    if elapsed <= 0.0 || current.ssrc != previous.ssrc {
        return None;
    }
    let delta = current.bytes_received.checked_sub(previous.bytes_received)?;
    Some(delta as f64 * 8.0 / elapsed / 1000.0)
}

pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
