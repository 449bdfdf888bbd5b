//! Session configuration.
//!
//! Layered the same way as the gateway config: built-in defaults, then an
//! optional TOML file (`PAGI_VOICE_CONFIG`, default `config/voice_session.toml`),
//! then `PAGI_VOICE__*` environment overrides (e.g. `PAGI_VOICE__VAD__MODE=hybrid`).

use crate::error::{VoiceError, VoiceResult};
use crate::vad::VadMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Default location of the TOML config when `PAGI_VOICE_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "config/voice_session.toml";

/// Audio configuration shared by capture and playback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Capture frame size in samples (default: 480 for 30ms at 16kHz)
    pub frame_size: usize,

    /// Sample rate of audio chunks sent by the agent (default: same as capture)
    pub playback_sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_size: 480, // 30ms at 16kHz
            playback_sample_rate: 16000,
        }
    }
}

impl AudioConfig {
    /// Duration of one capture frame.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_size as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Voice activity detection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadSettings {
    /// Which strategy runs for the session
    pub mode: VadMode,

    /// Drop non-speech frames instead of transmitting them
    pub gating_enabled: bool,

    /// RMS energy at or above which a frame counts as speech (threshold and hybrid modes)
    pub rms_threshold: f32,

    /// Model probability that opens a speech segment
    pub positive_threshold: f32,

    /// Model probability below which a window counts toward ending the segment
    pub negative_threshold: f32,

    /// Low-probability windows tolerated before the segment ends
    pub redemption_frames: u32,

    /// Segments shorter than this (in windows) are reported as misfires
    pub min_speech_frames: u32,

    /// Dropped frames kept and sent ahead of an ML speech start
    pub pre_roll_frames: usize,

    /// WebRTC VAD aggressiveness (0-3, where 3 is most aggressive)
    pub aggressiveness: u8,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            mode: VadMode::Threshold,
            gating_enabled: true,
            rms_threshold: 0.01,
            positive_threshold: 0.5,
            negative_threshold: 0.35,
            redemption_frames: 8,
            min_speech_frames: 3,
            pre_roll_frames: 3,
            aggressiveness: 2,
        }
    }
}

/// Commit debounce delays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Delay after a speech-end boundary (default: 120ms)
    pub fast_ms: u64,

    /// Delay after the last transmitted frame (default: 300ms)
    pub normal_ms: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            fast_ms: 120,
            normal_ms: 300,
        }
    }
}

/// Heartbeat and call-duration timers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Ping interval while connected (default: 5s)
    pub interval_ms: u64,

    /// How often the session duration is refreshed (default: 1s)
    pub duration_tick_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            duration_tick_ms: 1000,
        }
    }
}

/// Top-level configuration for one voice session client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket endpoint of the conversational agent
    pub server_url: String,
    pub audio: AudioConfig,
    pub vad: VadSettings,
    pub commit: CommitConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8001/voice".to_string(),
            audio: AudioConfig::default(),
            vad: VadSettings::default(),
            commit: CommitConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load: `.env` → defaults → TOML file → `PAGI_VOICE__*` environment.
    pub fn load() -> VoiceResult<Self> {
        let _ = dotenvy::dotenv();
        let config_path =
            std::env::var("PAGI_VOICE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load with an explicit TOML path (missing file is not an error).
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            info!("Loading voice session config from {}", path.display());
            builder.add_source(config::File::from(path))
        } else {
            debug!("No config file at {}, using defaults", path.display());
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("PAGI_VOICE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: SessionConfig = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document directly (no environment layer).
    pub fn from_toml_str(source: &str) -> VoiceResult<Self> {
        let built = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?;
        let config: SessionConfig = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        if self.server_url.trim().is_empty() {
            return Err(VoiceError::Config("server_url must not be empty".to_string()));
        }
        if self.audio.sample_rate == 0 || self.audio.frame_size == 0 {
            return Err(VoiceError::Config(format!(
                "sample_rate and frame_size must be positive, got {} / {}",
                self.audio.sample_rate, self.audio.frame_size
            )));
        }
        if self.audio.channels == 0 || self.audio.playback_sample_rate == 0 {
            return Err(VoiceError::Config(
                "channels and playback_sample_rate must be positive".to_string(),
            ));
        }
        if self.vad.negative_threshold > self.vad.positive_threshold {
            return Err(VoiceError::Config(format!(
                "negative_threshold ({}) must not exceed positive_threshold ({})",
                self.vad.negative_threshold, self.vad.positive_threshold
            )));
        }
        if self.vad.aggressiveness > 3 {
            return Err(VoiceError::Config(format!(
                "VAD aggressiveness must be 0-3, got {}",
                self.vad.aggressiveness
            )));
        }
        if self.commit.fast_ms > self.commit.normal_ms {
            return Err(VoiceError::Config(format!(
                "fast commit ({}ms) must not be slower than normal commit ({}ms)",
                self.commit.fast_ms, self.commit.normal_ms
            )));
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.duration_tick_ms == 0 {
            return Err(VoiceError::Config("timer intervals must be positive".to_string()));
        }
        Ok(())
    }
}
