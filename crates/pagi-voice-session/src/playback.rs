//! Gap-free playback scheduling and interruption.
//!
//! Agent audio chunks are placed back-to-back on the output's audio clock. The
//! cursor snaps forward to "now" whenever it has fallen behind, so a late chunk
//! never plays in the past and consecutive chunks never overlap.

use crate::audio::PlaybackOutput;
use crate::error::VoiceResult;
use std::collections::HashMap;
use tracing::{debug, info};

/// Identifier of one scheduled chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

/// One scheduled chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSource {
    pub id: SourceId,
    /// Start time on the audio clock (seconds)
    pub start_at: f64,
    /// Length of the chunk (seconds)
    pub duration: f64,
}

impl PlaybackSource {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Tracks the playback cursor and every source not yet finished or stopped
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    next_playback_time: f64,
    active: HashMap<SourceId, PlaybackSource>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a decoded chunk right after the previous one (or now, if the cursor lags).
    pub fn schedule(
        &mut self,
        output: &mut dyn PlaybackOutput,
        samples: Vec<f32>,
        sample_rate: u32,
    ) -> VoiceResult<PlaybackSource> {
        let now = output.current_time();
        let start_at = self.next_playback_time.max(now);
        let duration = samples.len() as f64 / sample_rate.max(1) as f64;

        let id = SourceId(self.next_id);
        self.next_id += 1;

        output.start_source(id, samples, sample_rate, start_at)?;

        let source = PlaybackSource {
            id,
            start_at,
            duration,
        };
        self.next_playback_time = source.end_at();
        self.active.insert(id, source);

        debug!(
            "Scheduled chunk {:?} at {:.3}s for {:.3}s ({} active)",
            id,
            start_at,
            duration,
            self.active.len()
        );
        Ok(source)
    }

    /// A source finished naturally. Returns true when nothing is left playing.
    pub fn on_source_ended(&mut self, id: SourceId) -> bool {
        self.active.remove(&id);
        self.active.is_empty()
    }

    /// Stop every active source and reset the cursor to now. Returns how many were stopped.
    pub fn interrupt(&mut self, output: &mut dyn PlaybackOutput) -> usize {
        let stopped = self.active.len();
        for (id, _) in self.active.drain() {
            output.stop_source(id);
        }
        self.next_playback_time = output.current_time();
        if stopped > 0 {
            info!("⏹️ Stopped {} playback source(s)", stopped);
        }
        stopped
    }

    /// Forget all sources without touching an output (the output is already gone).
    pub fn clear(&mut self) {
        self.active.clear();
        self.next_playback_time = 0.0;
    }

    pub fn is_playing(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_sources(&self) -> impl Iterator<Item = &PlaybackSource> {
        self.active.values()
    }

    pub fn next_playback_time(&self) -> f64 {
        self.next_playback_time
    }
}
