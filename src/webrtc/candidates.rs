//! Remote candidate buffering
//!
//! Candidates that arrive before the remote description is set cannot be
//! applied yet. They are held in arrival order and released all at once
//! when the description lands; from then on candidates pass straight
//! through.

use std::collections::VecDeque;

use super::signaling::IceCandidate;

/// What to do with an incoming remote candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Held until the remote description is set
    Buffered,
    /// Apply to the transport now
    ApplyNow(IceCandidate),
}

/// Pending remote candidates of one negotiation
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    remote_set: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, candidate: IceCandidate) -> CandidateDisposition {
        if self.remote_set {
            CandidateDisposition::ApplyNow(candidate)
        } else {
            self.pending.push_back(candidate);
            CandidateDisposition::Buffered
        }
    }

    /// Record that the remote description is set
    ///
    /// Returns the buffered candidates in arrival order. Later calls return
    /// nothing.
    pub fn mark_remote_set(&mut self) -> Vec<IceCandidate> {
        self.remote_set = true;
        self.pending.drain(..).collect()
    }

    /// Forget the remote description, e.g. when a negotiation is replaced
    pub fn reset(&mut self) {
        self.remote_set = false;
        self.pending.clear();
    }

    pub fn is_remote_set(&self) -> bool {
        self.remote_set
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
