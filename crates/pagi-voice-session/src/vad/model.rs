//! Speech probability models for the ML and hybrid strategies.
//!
//! A [`ModelLoader`] is handed to the VAD worker thread and builds the model
//! there, so models that are not `Send` (WebRTC VAD holds a raw handle) never
//! cross threads. The built-in model wraps WebRTC VAD; an ONNX neural model can
//! be plugged in by implementing the two traits.

use crate::error::{VoiceError, VoiceResult};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Scores fixed-size windows of audio
pub trait SpeechModel {
    /// Window length in samples the model expects
    fn window_size(&self) -> usize;

    /// Probability (0.0-1.0) that the window contains speech
    fn speech_probability(&mut self, window: &[f32]) -> VoiceResult<f32>;
}

/// Builds a model on the thread that will run it
pub trait ModelLoader: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self) -> VoiceResult<Box<dyn SpeechModel>>;
}

/// Voice activity model using WebRTC VAD
pub struct WebRtcModel {
    vad: Vad,
    sample_rate: u32,
    window_size: usize,
}

impl WebRtcModel {
    /// Create a model for `sample_rate` with aggressiveness 0-3 (3 is most aggressive).
    pub fn new(sample_rate: u32, aggressiveness: u8) -> VoiceResult<Self> {
        info!(
            "🎙️ Initializing WebRTC VAD (sample_rate: {}Hz, aggressiveness: {})",
            sample_rate, aggressiveness
        );

        let rate = match sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            _ => {
                return Err(VoiceError::VadInit(format!(
                    "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                    sample_rate
                )))
            }
        };

        let mode = match aggressiveness {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            _ => {
                return Err(VoiceError::VadInit(format!(
                    "VAD aggressiveness must be 0-3, got {}",
                    aggressiveness
                )))
            }
        };

        // WebRTC VAD accepts 10, 20 or 30ms windows; 30ms gives the steadiest scores
        let window_size = (sample_rate as usize * 30) / 1000;

        let mut vad = Vad::new();
        vad.set_mode(mode);
        vad.set_sample_rate(rate);

        info!("✅ VAD model ready (window: {} samples)", window_size);

        Ok(Self {
            vad,
            sample_rate,
            window_size,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl SpeechModel for WebRtcModel {
    fn window_size(&self) -> usize {
        self.window_size
    }

    /// WebRTC VAD is binary, so the probability is 0.0 or 1.0.
    fn speech_probability(&mut self, window: &[f32]) -> VoiceResult<f32> {
        if window.len() != self.window_size {
            return Err(VoiceError::VadProcessing(format!(
                "Expected {} samples, got {}",
                self.window_size,
                window.len()
            )));
        }

        let pcm: Vec<i16> = window
            .iter()
            .map(|&sample| (sample.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();

        let is_speech = self
            .vad
            .is_voice_segment(&pcm)
            .map_err(|e| VoiceError::VadProcessing(format!("VAD processing failed: {:?}", e)))?;

        debug!("VAD window: {}", if is_speech { "SPEECH" } else { "SILENCE" });

        Ok(if is_speech { 1.0 } else { 0.0 })
    }
}

/// Loader for [`WebRtcModel`]
#[derive(Debug, Clone)]
pub struct WebRtcModelLoader {
    sample_rate: u32,
    aggressiveness: u8,
}

impl WebRtcModelLoader {
    pub fn new(sample_rate: u32, aggressiveness: u8) -> Self {
        Self {
            sample_rate,
            aggressiveness,
        }
    }
}

impl ModelLoader for WebRtcModelLoader {
    fn name(&self) -> &str {
        "webrtc-vad"
    }

    fn load(&self) -> VoiceResult<Box<dyn SpeechModel>> {
        Ok(Box::new(WebRtcModel::new(self.sample_rate, self.aggressiveness)?))
    }
}
