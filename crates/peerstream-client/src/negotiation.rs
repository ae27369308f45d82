//! Offer/answer sequencing and candidate buffering
//!
//! Only one offer is processed at a time; offers arriving while one is in flight
//! queue behind it. Remote candidates are held back until the remote description
//! they belong to has been applied and no newer offer is in flight, then flushed
//! in arrival order.

use peerstream_core::IceCandidate;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct NegotiationContext {
    remote_description: Option<String>,
    pending_candidates: Vec<IceCandidate>,
    in_flight: bool,
    deferred_offers: VecDeque<String>,
}

/// What to do once an offer has been answered
#[derive(Debug, Default)]
pub struct Completion {
    /// Buffered candidates to apply now, in arrival order
    pub flush: Vec<IceCandidate>,
    /// Next queued offer to start, if any
    pub next_offer: Option<String>,
}

impl NegotiationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an incoming offer; returns it back when it may start immediately
    pub fn begin_offer(&mut self, sdp: String) -> Option<String> {
        if self.in_flight {
            self.deferred_offers.push_back(sdp);
            return None;
        }
        self.in_flight = true;
        Some(sdp)
    }

    /// Register a remote candidate; returns it back when it may be applied immediately
    pub fn on_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description.is_some() && !self.in_flight {
            return Some(candidate);
        }
        self.pending_candidates.push(candidate);
        None
    }

    /// The in-flight offer was applied and answered
    pub fn complete(&mut self, offer: String) -> Completion {
        self.remote_description = Some(offer);
        self.in_flight = false;

        match self.deferred_offers.pop_front() {
            // Candidates received after a newer offer stay buffered for it
            Some(next) => {
                self.in_flight = true;
                Completion {
                    flush: Vec::new(),
                    next_offer: Some(next),
                }
            }
            None => Completion {
                flush: std::mem::take(&mut self.pending_candidates),
                next_offer: None,
            },
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
