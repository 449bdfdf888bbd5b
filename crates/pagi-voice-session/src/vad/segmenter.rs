//! Turns per-window speech probabilities into speech boundaries.
//!
//! A segment opens on the first window at or above `positive_threshold`. It
//! closes after `redemption_frames` windows below `negative_threshold`; windows
//! between the two thresholds neither extend nor shorten the countdown. A closed
//! segment with fewer than `min_speech_frames` positive windows is a misfire.

use super::{SpeechBoundary, VadDecision};
use crate::config::VadSettings;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmenterConfig {
    pub positive_threshold: f32,
    pub negative_threshold: f32,
    pub redemption_frames: u32,
    pub min_speech_frames: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self::from(&VadSettings::default())
    }
}

impl From<&VadSettings> for SegmenterConfig {
    fn from(settings: &VadSettings) -> Self {
        Self {
            positive_threshold: settings.positive_threshold,
            negative_threshold: settings.negative_threshold,
            redemption_frames: settings.redemption_frames.max(1),
            min_speech_frames: settings.min_speech_frames,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpeechSegmenter {
    config: SegmenterConfig,
    speaking: bool,
    speech_frames: u32,
    redemption: u32,
    peak: f32,
}

impl SpeechSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            speaking: false,
            speech_frames: 0,
            redemption: 0,
            peak: 0.0,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed one window probability; returns a boundary when one is crossed.
    pub fn process(&mut self, probability: f32) -> Option<VadDecision> {
        if probability >= self.config.positive_threshold {
            self.redemption = 0;
            self.peak = self.peak.max(probability);
            if !self.speaking {
                self.speaking = true;
                self.speech_frames = 1;
                self.peak = probability;
                return Some(VadDecision {
                    kind: SpeechBoundary::Start,
                    confidence: probability,
                });
            }
            self.speech_frames += 1;
            return None;
        }

        if self.speaking && probability < self.config.negative_threshold {
            self.redemption += 1;
            if self.redemption >= self.config.redemption_frames {
                let kind = if self.speech_frames < self.config.min_speech_frames {
                    SpeechBoundary::Misfire
                } else {
                    SpeechBoundary::End
                };
                let decision = VadDecision {
                    kind,
                    confidence: self.peak,
                };
                self.reset();
                return Some(decision);
            }
        }
        None
    }

    pub fn reset(&mut self) {
        self.speaking = false;
        self.speech_frames = 0;
        self.redemption = 0;
        self.peak = 0.0;
    }
}
