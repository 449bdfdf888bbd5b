//! Voice session state machine.
//!
//! `Idle → Connecting → Connected → Listening`, with `Error` reachable from
//! any non-idle state. One [`Session`] owns every piece of mutable call state
//! (speaking flags, commit debounce, playback cursor, timers, handles); host
//! callbacks reach it only as [`Envelope`]s processed one at a time.
//!
//! Teardown order is fixed: cancel timers, detach callbacks (epoch bump), then
//! release handles. Each handle lives in an `Option` and is released on `take`,
//! so a second teardown finds nothing to release.

use crate::audio::{AudioFrame, AudioHost, Microphone, PlaybackOutput};
use crate::commit::{CommitScheduler, CommitTier};
use crate::config::SessionConfig;
use crate::diagnostics::{round_trip_ms, Diagnostics, IntervalTimer, WallClock};
use crate::error::{VoiceError, VoiceResult};
use crate::events::{self, Envelope, EventSink, SessionEvent, VadEvent};
use crate::playback::PlaybackScheduler;
use crate::protocol::{decode_pcm, ClientMessage, ServerMessage, Speaker};
use crate::transport::{Connector, DuplexChannel, CLOSE_NORMAL};
use crate::vad::{
    ModelLoader, SpeechBoundary, VadController, VadDecision, VadFactory, VadMode,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Connection lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Listening,
    Error,
}

impl SessionState {
    /// A new session may only begin from `Idle` or `Error`.
    pub fn can_start(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Error)
    }

    /// Holding (or acquiring) call resources
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Connected | SessionState::Listening
        )
    }
}

/// Speaking flags, owned by the session and reset with it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SessionFlags {
    user_speaking: bool,
    remote_speaking: bool,
    model_ready: bool,
}

/// One line of the call transcript
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Read-only view for UI consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: Option<Uuid>,
    pub state: SessionState,
    pub duration: Duration,
    pub user_speaking: bool,
    pub remote_speaking: bool,
    pub has_uncommitted_audio: bool,
    pub active_sources: usize,
    pub vad_mode: VadMode,
    pub diagnostics: Diagnostics,
    pub transcript_len: usize,
}

pub struct Session {
    config: SessionConfig,
    state: SessionState,
    id: Option<Uuid>,
    started_at: Option<Instant>,
    duration: Duration,

    // Callback plumbing
    epoch: u64,
    events_tx: mpsc::UnboundedSender<Envelope>,

    // Collaborators and acquired handles
    host: Box<dyn AudioHost>,
    connector: Box<dyn Connector>,
    microphone: Option<Box<dyn Microphone>>,
    speaker: Option<Box<dyn PlaybackOutput>>,
    channel: Option<Box<dyn DuplexChannel>>,
    vad: VadController,

    flags: SessionFlags,
    pre_roll: VecDeque<AudioFrame>,
    playback: PlaybackScheduler,
    commits: CommitScheduler,
    heartbeat: IntervalTimer,
    duration_timer: IntervalTimer,
    clock: WallClock,
    diagnostics: Diagnostics,
    transcript: Vec<TranscriptEntry>,
}

impl Session {
    /// Create an idle session. The receiver must be drained into [`Session::handle_event`].
    pub fn new(
        config: SessionConfig,
        host: Box<dyn AudioHost>,
        connector: Box<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (events_tx, events_rx) = events::channel();
        let factory = VadFactory::new(config.vad.clone(), config.audio.sample_rate);

        let session = Self {
            state: SessionState::Idle,
            id: None,
            started_at: None,
            duration: Duration::ZERO,
            epoch: 0,
            events_tx,
            host,
            connector,
            microphone: None,
            speaker: None,
            channel: None,
            vad: VadController::new(factory),
            flags: SessionFlags::default(),
            pre_roll: VecDeque::with_capacity(config.vad.pre_roll_frames),
            playback: PlaybackScheduler::new(),
            commits: CommitScheduler::new(&config.commit),
            heartbeat: IntervalTimer::new(Duration::from_millis(config.heartbeat.interval_ms)),
            duration_timer: IntervalTimer::new(Duration::from_millis(
                config.heartbeat.duration_tick_ms,
            )),
            clock: WallClock::new(),
            diagnostics: Diagnostics::default(),
            transcript: Vec::new(),
            config,
        };

        (session, events_rx)
    }

    /// Use another speech model for the ML and hybrid strategies.
    pub fn with_model_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        let factory = VadFactory::new(self.config.vad.clone(), self.config.audio.sample_rate)
            .with_loader(loader);
        self.vad = VadController::new(factory);
        self
    }

    /// Override the wall-clock anchor used for ping timestamps and diagnostics.
    pub fn with_wall_clock(mut self, clock: WallClock) -> Self {
        self.clock = clock;
        self
    }

    // ------------------------------------------------------------------
    // Caller operations
    // ------------------------------------------------------------------

    /// Acquire audio devices and open the channel. No-op while a call is in progress.
    pub fn start(&mut self, now: Instant) -> VoiceResult<()> {
        if !self.state.can_start() {
            debug!("start() ignored in state {:?}", self.state);
            return Ok(());
        }

        let after_error = self.state == SessionState::Error;
        self.diagnostics = Diagnostics::for_new_session(&self.diagnostics, after_error);
        if after_error {
            info!(
                "🔁 Restarting after error (attempt {})",
                self.diagnostics.reconnect_attempts()
            );
        }

        self.id = Some(Uuid::new_v4());
        self.started_at = None;
        self.duration = Duration::ZERO;
        self.transcript.clear();
        self.flags = SessionFlags::default();
        self.pre_roll.clear();
        self.commits.reset();
        self.playback.clear();

        self.transition(SessionState::Connecting);

        match self.acquire_resources() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&e, now);
                Err(e)
            }
        }
    }

    fn acquire_resources(&mut self) -> VoiceResult<()> {
        self.microphone = Some(self.host.acquire_microphone(&self.config.audio)?);
        self.speaker = Some(self.host.acquire_speaker(&self.config.audio)?);
        let sink = self.event_sink();
        self.channel = Some(self.connector.open(&self.config.server_url, sink)?);
        Ok(())
    }

    /// Flush pending audio, say goodbye, close the channel and release everything.
    pub fn end(&mut self, now: Instant) {
        if !self.state.is_active() {
            debug!("end() ignored in state {:?}", self.state);
            return;
        }
        info!("👋 Ending session {:?}", self.id);

        self.commits.cancel();
        self.flush_commit(false);

        if let Some(channel) = self.channel.as_mut() {
            if channel.is_open() {
                if let Err(e) = channel.send(&ClientMessage::EndSession) {
                    warn!("Failed to send end_session: {}", e);
                }
            }
            channel.close(CLOSE_NORMAL, "session ended");
        }

        self.finish_duration(now);
        self.release_resources();
        self.transition(SessionState::Idle);
    }

    /// Barge-in requested by the caller. Counted in diagnostics while a call is active.
    pub fn interrupt(&mut self) {
        if !self.state.is_active() {
            debug!("interrupt() ignored in state {:?}", self.state);
            return;
        }
        self.interrupt_playback(false);
    }

    /// Send a commit now instead of waiting for the debounce. Without `force`,
    /// nothing is sent unless audio went out since the last commit.
    pub fn commit_now(&mut self, force: bool) {
        self.commits.cancel();
        self.flush_commit(force);
    }

    /// The VAD strategy is chosen per call; changing it mid-call is refused.
    pub fn set_vad_mode(&mut self, mode: VadMode) -> VoiceResult<()> {
        if self.state.is_active() {
            return Err(VoiceError::InvalidState(format!(
                "VAD mode cannot change while {:?}",
                self.state
            )));
        }
        self.config.vad.mode = mode;
        Ok(())
    }

    /// Release every resource without a goodbye. An active call lands in `Idle`;
    /// `Error` is kept so the next start counts as a reconnect. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        self.release_resources();
        if self.state.is_active() {
            self.transition(SessionState::Idle);
        }
    }

    fn release_resources(&mut self) {
        // 1. Timers
        self.commits.cancel();
        self.heartbeat.disarm();
        self.duration_timer.disarm();

        // 2. Callbacks: anything already queued or still in flight is now stale
        self.epoch += 1;

        // 3. Handles
        if let Some(mut microphone) = self.microphone.take() {
            microphone.release();
        }
        self.interrupt_playback(true);
        if let Some(mut speaker) = self.speaker.take() {
            speaker.release();
        }
        self.vad.disable();
        if let Some(mut channel) = self.channel.take() {
            channel.close(CLOSE_NORMAL, "session teardown");
        }

        self.commits.reset();
        self.playback.clear();
        self.pre_roll.clear();
        self.flags = SessionFlags::default();
    }

    // ------------------------------------------------------------------
    // Event loop entry points
    // ------------------------------------------------------------------

    /// Dispatch one callback. Envelopes from detached sources are dropped.
    pub fn handle_event(&mut self, envelope: Envelope, now: Instant) {
        if envelope.epoch != self.epoch {
            trace!(
                "Dropping stale event from epoch {} (current {})",
                envelope.epoch,
                self.epoch
            );
            return;
        }
        match envelope.event {
            SessionEvent::CaptureFrame(frame) => self.on_capture_frame(frame, now),
            SessionEvent::CaptureError(message) => self.on_capture_error(message, now),
            SessionEvent::SocketOpened => self.on_socket_open(now),
            SessionEvent::SocketMessage(text) => self.on_socket_message(&text, now),
            SessionEvent::SocketClosed { code, reason } => self.on_socket_close(code, &reason, now),
            SessionEvent::SocketError(message) => self.on_socket_error(&message, now),
            SessionEvent::Vad(event) => self.on_vad_event(event, now),
        }
    }

    /// Fire whichever timers are due.
    pub fn on_timers(&mut self, now: Instant) {
        if self.commits.poll(now) {
            self.flush_commit(false);
        }
        if self.heartbeat.poll(now) {
            self.send_ping(now);
        }
        if self.duration_timer.poll(now) {
            if let Some(started) = self.started_at {
                self.duration = now.saturating_duration_since(started);
            }
        }
    }

    /// Earliest armed timer (commit, heartbeat or duration).
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.commits.deadline(),
            self.heartbeat.deadline(),
            self.duration_timer.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Reap playback sources that finished naturally.
    pub fn poll_playback(&mut self) {
        let Some(speaker) = self.speaker.as_mut() else {
            return;
        };
        for id in speaker.poll_finished() {
            if self.playback.on_source_ended(id) && self.flags.remote_speaking {
                debug!("🔈 Agent finished speaking");
                self.flags.remote_speaking = false;
            }
        }
    }

    // ------------------------------------------------------------------
    // Socket callbacks
    // ------------------------------------------------------------------

    pub fn on_socket_open(&mut self, now: Instant) {
        if self.state != SessionState::Connecting {
            debug!("Socket open ignored in state {:?}", self.state);
            return;
        }
        self.transition(SessionState::Connected);

        self.started_at = Some(now);
        self.heartbeat.arm(now);
        self.duration_timer.arm(now);
        if let Some(speaker) = self.speaker.as_mut() {
            speaker.resume();
        }

        let sink = self.event_sink();
        if let Err(e) = self.vad.enable(self.config.vad.mode, sink.clone()) {
            self.fail(&e, now);
            return;
        }
        let started = match self.microphone.as_mut() {
            Some(microphone) => microphone.start(sink),
            None => Err(VoiceError::AudioDevice("microphone not acquired".to_string())),
        };
        if let Err(e) = started {
            self.fail(&e, now);
            return;
        }

        self.transition(SessionState::Listening);
    }

    pub fn on_socket_close(&mut self, code: u16, reason: &str, now: Instant) {
        if self.state == SessionState::Idle {
            return;
        }
        if code == CLOSE_NORMAL {
            info!("Socket closed normally");
            self.finish_duration(now);
            self.release_resources();
            self.transition(SessionState::Idle);
        } else {
            let err = VoiceError::Transport(format!(
                "socket closed abnormally ({}): {}",
                code, reason
            ));
            self.fail(&err, now);
        }
    }

    pub fn on_socket_error(&mut self, message: &str, now: Instant) {
        if !self.state.is_active() {
            return;
        }
        let err = VoiceError::Transport(message.to_string());
        self.fail(&err, now);
    }

    pub fn on_socket_message(&mut self, text: &str, now: Instant) {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping inbound message: {}", e);
                return;
            }
        };

        match message {
            ServerMessage::Audio { audio } => self.on_audio_chunk(&audio),
            ServerMessage::Transcript { speaker, text } => {
                debug!("📝 {:?}: {}", speaker, text);
                self.transcript.push(TranscriptEntry {
                    speaker,
                    text,
                    received_at: self.clock.datetime_at(now),
                });
            }
            ServerMessage::Pong {
                client_timestamp, ..
            } => {
                if let Some(latency) = round_trip_ms(client_timestamp, self.clock.millis_at(now)) {
                    debug!("💓 Heartbeat latency {}ms", latency);
                    self.diagnostics
                        .record_pong(latency, self.clock.datetime_at(now));
                }
            }
            ServerMessage::Error { message } => {
                warn!("Agent reported error: {}", message);
                let at = self.clock.datetime_at(now);
                self.diagnostics.record_error(message.clone(), at);
                self.transcript.push(TranscriptEntry {
                    speaker: Speaker::System,
                    text: message,
                    received_at: at,
                });
            }
        }
    }

    fn on_audio_chunk(&mut self, audio: &str) {
        let samples = match decode_pcm(audio) {
            Ok(samples) if !samples.is_empty() => samples,
            Ok(_) => return,
            Err(e) => {
                warn!("Dropping audio chunk: {}", e);
                return;
            }
        };
        let Some(speaker) = self.speaker.as_mut() else {
            debug!("Audio chunk received without a speaker, dropped");
            return;
        };
        match self
            .playback
            .schedule(speaker.as_mut(), samples, self.config.audio.playback_sample_rate)
        {
            Ok(_) => self.flags.remote_speaking = true,
            Err(e) => warn!("Failed to schedule playback: {}", e),
        }
    }

    // ------------------------------------------------------------------
    // Capture pipeline
    // ------------------------------------------------------------------

    pub fn on_capture_frame(&mut self, frame: AudioFrame, now: Instant) {
        if self.state != SessionState::Listening {
            return;
        }

        let local = self.vad.local_decision(&frame);
        self.vad.observe(&frame);

        let transmit = match self.config.vad.mode {
            VadMode::Threshold => {
                let speaking = local.unwrap_or(false);
                self.apply_local_boundary(speaking, now);
                speaking
            }
            VadMode::Ml => self.flags.user_speaking,
            VadMode::Hybrid => {
                let speaking = local.unwrap_or(false);
                // Until the model is live (or after it failed) RMS also marks boundaries
                if !self.flags.model_ready {
                    self.apply_local_boundary(speaking, now);
                }
                speaking
            }
        };

        if self.config.vad.gating_enabled && !transmit {
            if self.config.vad.mode == VadMode::Ml {
                self.remember_pre_roll(frame);
            }
            trace!("Frame gated (not speaking)");
            return;
        }

        self.transmit(&frame, now);
    }

    fn apply_local_boundary(&mut self, speaking: bool, now: Instant) {
        let was_speaking = self.flags.user_speaking;
        self.flags.user_speaking = speaking;

        if was_speaking && !speaking {
            debug!("🤫 Speech ended (local)");
            self.commits.schedule(CommitTier::Fast, now);
        } else if !was_speaking && speaking {
            debug!("🎤 Speech started (local)");
            if self.flags.remote_speaking {
                info!("⚡ Barge-in: user started speaking over the agent");
                self.interrupt_playback(false);
            }
        }
    }

    fn remember_pre_roll(&mut self, frame: AudioFrame) {
        let capacity = self.config.vad.pre_roll_frames;
        if capacity == 0 {
            return;
        }
        while self.pre_roll.len() >= capacity {
            self.pre_roll.pop_front();
        }
        self.pre_roll.push_back(frame);
    }

    fn transmit(&mut self, frame: &AudioFrame, now: Instant) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        match channel.send(&ClientMessage::audio_frame(&frame.samples)) {
            Ok(()) => {
                self.commits.mark_transmitted();
                self.commits.schedule(CommitTier::Normal, now);
            }
            Err(e) => warn!("Failed to transmit frame: {}", e),
        }
    }

    fn on_capture_error(&mut self, message: String, now: Instant) {
        warn!("Capture stream error: {}", message);
        self.diagnostics
            .record_error(format!("capture: {}", message), self.clock.datetime_at(now));
    }

    // ------------------------------------------------------------------
    // Asynchronous VAD
    // ------------------------------------------------------------------

    fn on_vad_event(&mut self, event: VadEvent, now: Instant) {
        if !self.config.vad.mode.uses_model() || !self.state.is_active() {
            return;
        }
        match event {
            VadEvent::ModelReady => {
                info!("🧠 VAD model ready");
                self.flags.model_ready = true;
                // The model never saw an utterance RMS opened during the load
                if self.config.vad.mode == VadMode::Hybrid && self.flags.user_speaking {
                    debug!("🤫 Speech ended (handing boundaries to the model)");
                    self.flags.user_speaking = false;
                    self.commits.schedule(CommitTier::Fast, now);
                }
            }
            VadEvent::ModelFailed(message) => self.on_model_failed(message, now),
            VadEvent::Decision(decision) => self.on_vad_decision(decision, now),
        }
    }

    fn on_model_failed(&mut self, message: String, now: Instant) {
        self.flags.model_ready = false;
        match self.config.vad.mode {
            VadMode::Hybrid => {
                warn!(
                    "VAD model failed to load ({}); hybrid mode continues on RMS only",
                    message
                );
                self.diagnostics.set_vad_fallback();
                self.diagnostics.record_error(
                    format!("vad model: {}", message),
                    self.clock.datetime_at(now),
                );
            }
            _ => {
                let err = VoiceError::VadInit(message);
                self.fail(&err, now);
            }
        }
    }

    fn on_vad_decision(&mut self, decision: VadDecision, now: Instant) {
        if self.state != SessionState::Listening {
            return;
        }
        match decision.kind {
            SpeechBoundary::Start => {
                let was_speaking = self.flags.user_speaking;
                self.flags.user_speaking = true;
                debug!("🎤 Speech started (model, {:.2})", decision.confidence);
                if !was_speaking && self.flags.remote_speaking {
                    info!("⚡ Barge-in: user started speaking over the agent");
                    self.interrupt_playback(false);
                }
                if self.config.vad.mode == VadMode::Ml {
                    let frames: Vec<AudioFrame> = self.pre_roll.drain(..).collect();
                    for frame in &frames {
                        self.transmit(frame, now);
                    }
                }
            }
            SpeechBoundary::End => {
                debug!("🤫 Speech ended (model, {:.2})", decision.confidence);
                self.flags.user_speaking = false;
                self.commits.schedule(CommitTier::Fast, now);
            }
            SpeechBoundary::Misfire => {
                debug!("VAD misfire ({:.2})", decision.confidence);
                self.flags.user_speaking = false;
                self.pre_roll.clear();
                self.diagnostics.record_misfire();
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn interrupt_playback(&mut self, silent: bool) {
        match self.speaker.as_mut() {
            Some(speaker) => {
                self.playback.interrupt(speaker.as_mut());
            }
            None => self.playback.clear(),
        }
        self.flags.remote_speaking = false;

        if let Some(channel) = self.channel.as_mut() {
            if channel.is_open() {
                if let Err(e) = channel.send(&ClientMessage::Interrupt) {
                    warn!("Failed to send interrupt: {}", e);
                }
            }
        }
        if !silent {
            self.diagnostics.record_interruption();
        }
    }

    fn flush_commit(&mut self, force: bool) {
        if !self.commits.take_commit(force) {
            trace!("Commit skipped, nothing new transmitted");
            return;
        }
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        match channel.send(&ClientMessage::Commit) {
            Ok(()) => debug!("✅ Utterance committed"),
            Err(e) => warn!("Failed to send commit: {}", e),
        }
    }

    fn send_ping(&mut self, now: Instant) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        let timestamp = self.clock.millis_at(now);
        match channel.send(&ClientMessage::Ping { timestamp }) {
            Ok(()) => self.diagnostics.record_ping(),
            Err(e) => warn!("Failed to send ping: {}", e),
        }
    }

    fn fail(&mut self, err: &VoiceError, now: Instant) {
        error!("❌ Session error ({:?}): {}", err.kind(), err);
        self.diagnostics
            .record_error(err.to_string(), self.clock.datetime_at(now));
        self.finish_duration(now);
        self.release_resources();
        self.transition(SessionState::Error);
    }

    fn finish_duration(&mut self, now: Instant) {
        if let Some(started) = self.started_at {
            self.duration = now.saturating_duration_since(started);
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!("Session state: {:?} → {:?}", self.state, next);
            self.state = next;
        }
    }

    // ------------------------------------------------------------------
    // Read-only state
    // ------------------------------------------------------------------

    /// Sink stamped with the current epoch, for injecting host events.
    pub fn event_sink(&self) -> EventSink {
        EventSink::new(self.epoch, self.events_tx.clone())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn id(&self) -> Option<Uuid> {
        self.id
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn last_error(&self) -> Option<&str> {
        self.diagnostics.last_error()
    }

    pub fn is_user_speaking(&self) -> bool {
        self.flags.user_speaking
    }

    pub fn is_remote_speaking(&self) -> bool {
        self.flags.remote_speaking
    }

    pub fn has_uncommitted_audio(&self) -> bool {
        self.commits.has_uncommitted_audio()
    }

    pub fn active_sources(&self) -> usize {
        self.playback.active_count()
    }

    pub fn next_playback_time(&self) -> f64 {
        self.playback.next_playback_time()
    }

    pub fn active_vad_mode(&self) -> Option<VadMode> {
        self.vad.active_mode()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            state: self.state,
            duration: self.duration,
            user_speaking: self.flags.user_speaking,
            remote_speaking: self.flags.remote_speaking,
            has_uncommitted_audio: self.commits.has_uncommitted_audio(),
            active_sources: self.playback.active_count(),
            vad_mode: self.config.vad.mode,
            diagnostics: self.diagnostics.clone(),
            transcript_len: self.transcript.len(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release_resources();
    }
}
