//! RMS threshold detector: zero-dependency, frame-local, lowest latency.

use super::{VadMode, VadStrategy};
use crate::audio::AudioFrame;
use crate::error::VoiceResult;
use crate::events::EventSink;
use tracing::trace;

/// Classifies a frame as speech when its RMS energy reaches `threshold`
#[derive(Debug, Clone)]
pub struct ThresholdVad {
    threshold: f32,
    active: bool,
}

impl ThresholdVad {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            active: false,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn is_speech(&self, frame: &AudioFrame) -> bool {
        let energy = frame.rms();
        trace!("frame rms {:.4} (threshold {:.4})", energy, self.threshold);
        energy >= self.threshold
    }
}

impl VadStrategy for ThresholdVad {
    fn mode(&self) -> VadMode {
        VadMode::Threshold
    }

    fn start(&mut self, _sink: EventSink) -> VoiceResult<()> {
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn local_decision(&mut self, frame: &AudioFrame) -> Option<bool> {
        if !self.active {
            return None;
        }
        Some(self.is_speech(frame))
    }

    fn observe(&mut self, _frame: &AudioFrame) {}
}
