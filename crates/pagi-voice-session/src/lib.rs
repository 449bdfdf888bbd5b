//! # PAGI Voice Session - Real-Time Voice Client
//!
//! Captures microphone audio, decides when the user is speaking, streams speech
//! frames to a remote conversational agent over a duplex channel, and plays the
//! agent's synthesized replies back gaplessly. The user can barge in at any time.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     Session (one event loop)                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │  Capture In  │→ │ VAD Strategy │→ │   Commit     │──┐     │
//! │  │    (cpal)    │  │ RMS/ML/Hybrid│  │  Debounce    │  │     │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  ↓     │
//! │                           │ barge-in          ┌──────────────┐ │
//! │  ┌──────────────┐         ↓                   │ Duplex (WS)  │ │
//! │  │ Playback Out │←── Scheduler ←──────────────│ tungstenite  │ │
//! │  │   (rodio)    │    (gapless)                └──────────────┘ │
//! │  └──────────────┘                    Heartbeat → Diagnostics   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Host callbacks (capture frames, socket events, VAD worker output) arrive as
//! epoch-tagged [`events::Envelope`]s and are handled one at a time by
//! [`Session::handle_event`]. [`SessionDriver`] runs that loop with timers.

pub mod audio;
pub mod commit;
pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod events;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod vad;

pub use audio::{AudioFrame, AudioHost, Microphone, PlaybackOutput, SystemAudioHost};
pub use commit::{CommitScheduler, CommitTier};
pub use config::{AudioConfig, CommitConfig, HeartbeatConfig, SessionConfig, VadSettings};
pub use diagnostics::{Diagnostics, WallClock};
pub use driver::{SessionCommand, SessionDriver, SessionHandle};
pub use error::{ErrorKind, VoiceError, VoiceResult};
pub use events::{Envelope, EventSink, SessionEvent, VadEvent};
pub use playback::{PlaybackScheduler, PlaybackSource, SourceId};
pub use protocol::{ClientMessage, ServerMessage, Speaker};
pub use session::{Session, SessionSnapshot, SessionState, TranscriptEntry};
pub use transport::{Connector, DuplexChannel, WsConnector};
pub use vad::{ModelLoader, SpeechBoundary, SpeechModel, VadDecision, VadMode, VadStrategy};
