//! Duplex message protocol spoken with the conversational agent.
//!
//! One JSON object per WebSocket text frame, discriminated by `type`.
//! Audio travels as base64 of little-endian 16-bit PCM.

use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Messages sent to the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// One captured speech frame
    Audio { audio: String },

    /// Everything sent since the previous commit is one utterance
    Commit,

    /// Stop the current agent utterance (barge-in)
    Interrupt,

    /// Graceful termination
    EndSession,

    /// Heartbeat carrying the client clock in epoch milliseconds
    Ping { timestamp: i64 },
}

impl ClientMessage {
    pub fn audio_frame(samples: &[f32]) -> Self {
        ClientMessage::Audio {
            audio: encode_pcm(samples),
        }
    }

    pub fn to_json(&self) -> VoiceResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Audio { .. } => "audio",
            ClientMessage::Commit => "commit",
            ClientMessage::Interrupt => "interrupt",
            ClientMessage::EndSession => "end_session",
            ClientMessage::Ping { .. } => "ping",
        }
    }
}

/// Who produced a transcript line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
    System,
}

/// Messages received from the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Synthesized speech chunk to schedule for playback
    Audio { audio: String },

    Transcript { speaker: Speaker, text: String },

    /// Heartbeat reply echoing the client timestamp
    Pong {
        client_timestamp: i64,
        #[serde(default)]
        server_timestamp: Option<i64>,
    },

    Error { message: String },
}

impl ServerMessage {
    /// Parse one inbound frame. Anything that isn't a known message is a protocol error.
    pub fn parse(text: &str) -> VoiceResult<Self> {
        serde_json::from_str(text).map_err(|e| {
            VoiceError::Protocol(format!("unrecognized message ({}): {}", e, truncate(text, 80)))
        })
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Convert normalized f32 samples to 16-bit PCM and base64-encode them.
pub fn encode_pcm(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    STANDARD.encode(bytes)
}

/// Decode base64 16-bit PCM into normalized f32 samples.
pub fn decode_pcm(encoded: &str) -> VoiceResult<Vec<f32>> {
    let bytes = STANDARD.decode(encoded.trim())?;
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Protocol(format!(
            "PCM payload has odd byte length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}
