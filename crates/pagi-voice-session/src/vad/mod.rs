//! Voice Activity Detection strategies
//!
//! Three interchangeable detectors behind [`VadStrategy`]:
//!
//! - [`ThresholdVad`]: synchronous frame-local RMS comparison
//! - [`NeuralVad`]: model-backed, runs on its own worker and emits boundaries asynchronously
//! - [`HybridVad`]: RMS gating for transmission, model boundaries for start/end
//!
//! A session runs at most one strategy at a time through [`VadController`].
//! Every enable builds a fresh detector; nothing is reused across cycles.

pub mod model;
pub mod neural;
pub mod segmenter;
pub mod threshold;

pub use model::{ModelLoader, SpeechModel, WebRtcModel, WebRtcModelLoader};
pub use neural::{HybridVad, NeuralVad};
pub use segmenter::{SegmenterConfig, SpeechSegmenter};
pub use threshold::ThresholdVad;

use crate::audio::AudioFrame;
use crate::config::VadSettings;
use crate::error::VoiceResult;
use crate::events::EventSink;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Which detector a session uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadMode {
    Threshold,
    Ml,
    Hybrid,
}

impl VadMode {
    /// Whether the mode depends on a loaded model.
    pub fn uses_model(self) -> bool {
        matches!(self, VadMode::Ml | VadMode::Hybrid)
    }
}

/// Kind of speech boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechBoundary {
    Start,
    End,
    /// A segment opened but was too short to be speech
    Misfire,
}

/// A speech boundary emitted by a model-backed strategy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDecision {
    pub kind: SpeechBoundary,
    pub confidence: f32,
}

/// Shared contract of every detector
pub trait VadStrategy {
    fn mode(&self) -> VadMode;

    /// Construct/load the detector. Asynchronous output goes to `sink`.
    fn start(&mut self, sink: EventSink) -> VoiceResult<()>;

    /// Destroy the detector and release model resources.
    fn stop(&mut self);

    fn is_active(&self) -> bool;

    /// Synchronous speech signal for this frame, or `None` when the decision is
    /// left to asynchronous boundary events.
    fn local_decision(&mut self, frame: &AudioFrame) -> Option<bool>;

    /// Hand the frame to any asynchronous detector.
    fn observe(&mut self, frame: &AudioFrame);
}

/// Builds fresh strategies from settings
#[derive(Clone)]
pub struct VadFactory {
    settings: VadSettings,
    loader: Arc<dyn ModelLoader>,
}

impl VadFactory {
    /// Factory using the built-in WebRTC model for model-backed modes.
    pub fn new(settings: VadSettings, sample_rate: u32) -> Self {
        let loader = Arc::new(WebRtcModelLoader::new(sample_rate, settings.aggressiveness));
        Self { settings, loader }
    }

    /// Swap in another model (e.g. an ONNX neural VAD).
    pub fn with_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn settings(&self) -> &VadSettings {
        &self.settings
    }

    pub fn build(&self, mode: VadMode) -> Box<dyn VadStrategy> {
        let segmenter = SegmenterConfig::from(&self.settings);
        match mode {
            VadMode::Threshold => Box::new(ThresholdVad::new(self.settings.rms_threshold)),
            VadMode::Ml => Box::new(NeuralVad::new(Arc::clone(&self.loader), segmenter)),
            VadMode::Hybrid => Box::new(HybridVad::new(
                self.settings.rms_threshold,
                Arc::clone(&self.loader),
                segmenter,
            )),
        }
    }
}

/// Owns the single active strategy of a session
pub struct VadController {
    factory: VadFactory,
    active: Option<Box<dyn VadStrategy>>,
}

impl VadController {
    pub fn new(factory: VadFactory) -> Self {
        Self {
            factory,
            active: None,
        }
    }

    /// Disable whatever is running, then construct and start `mode` from scratch.
    pub fn enable(&mut self, mode: VadMode, sink: EventSink) -> VoiceResult<()> {
        self.disable();

        let mut strategy = self.factory.build(mode);
        if let Err(e) = strategy.start(sink) {
            strategy.stop();
            return Err(e);
        }
        info!("🎙️ VAD strategy enabled: {:?}", mode);
        self.active = Some(strategy);
        Ok(())
    }

    pub fn disable(&mut self) {
        if let Some(mut strategy) = self.active.take() {
            strategy.stop();
            info!("VAD strategy disabled: {:?}", strategy.mode());
        }
    }

    pub fn active_mode(&self) -> Option<VadMode> {
        self.active.as_ref().map(|s| s.mode())
    }

    pub fn local_decision(&mut self, frame: &AudioFrame) -> Option<bool> {
        self.active.as_mut().and_then(|s| s.local_decision(frame))
    }

    pub fn observe(&mut self, frame: &AudioFrame) {
        if let Some(strategy) = self.active.as_mut() {
            strategy.observe(frame);
        }
    }
}

impl Drop for VadController {
    fn drop(&mut self) {
        self.disable();
    }
}
