//! End-of-utterance commit debounce.
//!
//! One timer slot, two delays. Scheduling always replaces the pending timer,
//! so only the most recently scheduled commit can fire. Firing sends a commit
//! only when audio was transmitted since the previous one (or when forced).

use crate::config::CommitConfig;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Which debounce delay to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitTier {
    /// Speech just ended
    Fast,
    /// Follow-up to the latest transmitted frame
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommit {
    pub tier: CommitTier,
    pub deadline: Instant,
}

#[derive(Debug)]
pub struct CommitScheduler {
    fast: Duration,
    normal: Duration,
    pending: Option<PendingCommit>,
    has_uncommitted_audio: bool,
}

impl CommitScheduler {
    pub fn new(config: &CommitConfig) -> Self {
        Self {
            fast: Duration::from_millis(config.fast_ms),
            normal: Duration::from_millis(config.normal_ms),
            pending: None,
            has_uncommitted_audio: false,
        }
    }

    /// Replace any pending timer with one for `tier`.
    pub fn schedule(&mut self, tier: CommitTier, now: Instant) {
        let delay = match tier {
            CommitTier::Fast => self.fast,
            CommitTier::Normal => self.normal,
        };
        trace!("commit rescheduled ({:?}, {:?})", tier, delay);
        self.pending = Some(PendingCommit {
            tier,
            deadline: now + delay,
        });
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn pending(&self) -> Option<PendingCommit> {
        self.pending
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|p| p.deadline)
    }

    /// True once the pending timer is due; the slot is cleared.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.pending {
            Some(pending) if pending.deadline <= now => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// A frame went out since the last commit.
    pub fn mark_transmitted(&mut self) {
        self.has_uncommitted_audio = true;
    }

    pub fn has_uncommitted_audio(&self) -> bool {
        self.has_uncommitted_audio
    }

    /// Whether a commit message is due; clears the uncommitted flag.
    pub fn take_commit(&mut self, force: bool) -> bool {
        let send = self.has_uncommitted_audio || force;
        self.has_uncommitted_audio = false;
        send
    }

    /// Forget pending timer and flag (teardown).
    pub fn reset(&mut self) {
        self.pending = None;
        self.has_uncommitted_audio = false;
    }
}
