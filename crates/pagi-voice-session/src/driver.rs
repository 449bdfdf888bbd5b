//! Async driver: runs one [`Session`] on the current task.
//!
//! The loop multiplexes host events, caller commands, the earliest session
//! deadline and a short playback tick. Audio handles are not `Send`, so the
//! driver future must be awaited in place (or on a `LocalSet`), never spawned
//! onto a multi-threaded runtime.

use crate::error::{VoiceError, VoiceResult};
use crate::events::Envelope;
use crate::session::{Session, SessionSnapshot, SessionState};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How often finished playback sources are reaped
pub const PLAYBACK_TICK: Duration = Duration::from_millis(20);

/// Requests from the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Start,
    End,
    Interrupt,
    /// Commit now, even without new audio
    ForceCommit,
    /// End the call (if any) and stop the loop
    Shutdown,
}

/// Cloneable control handle for a running driver
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub fn start(&self) -> VoiceResult<()> {
        self.send(SessionCommand::Start)
    }

    pub fn end(&self) -> VoiceResult<()> {
        self.send(SessionCommand::End)
    }

    pub fn interrupt(&self) -> VoiceResult<()> {
        self.send(SessionCommand::Interrupt)
    }

    pub fn force_commit(&self) -> VoiceResult<()> {
        self.send(SessionCommand::ForceCommit)
    }

    pub fn shutdown(&self) -> VoiceResult<()> {
        self.send(SessionCommand::Shutdown)
    }

    fn send(&self, command: SessionCommand) -> VoiceResult<()> {
        self.commands
            .send(command)
            .map_err(|e| VoiceError::ChannelSend(format!("driver stopped: {}", e)))
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the session reaches `state`.
    pub async fn wait_for_state(&self, state: SessionState) -> VoiceResult<SessionSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| s.state == state)
            .await
            .map_err(|e| VoiceError::ChannelSend(format!("driver stopped: {}", e)))?;
        Ok(snapshot.clone())
    }
}

pub struct SessionDriver {
    session: Session,
    events: mpsc::UnboundedReceiver<Envelope>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    snapshot: watch::Sender<SessionSnapshot>,
    playback_tick: Duration,
}

impl SessionDriver {
    pub fn new(session: Session, events: mpsc::UnboundedReceiver<Envelope>) -> (Self, SessionHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());

        let driver = Self {
            session,
            events,
            commands: commands_rx,
            snapshot: snapshot_tx,
            playback_tick: PLAYBACK_TICK,
        };
        let handle = SessionHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        };
        (driver, handle)
    }

    pub fn with_playback_tick(mut self, tick: Duration) -> Self {
        self.playback_tick = tick;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run until [`SessionCommand::Shutdown`] or every handle is dropped.
    /// Returns the session for inspection.
    pub async fn run(mut self) -> Session {
        info!("🎙️ Voice session driver running");
        let mut playback = time::interval(self.playback_tick);
        playback.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = self.session.next_deadline();

            tokio::select! {
                Some(envelope) = self.events.recv() => {
                    self.session.handle_event(envelope, Instant::now());
                }
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.apply(command),
                },
                _ = sleep_until(deadline) => {
                    self.session.on_timers(Instant::now());
                }
                _ = playback.tick() => {
                    self.session.poll_playback();
                }
            }

            self.publish();
        }

        self.session.end(Instant::now());
        self.session.teardown();
        self.publish();
        info!("⏹️ Voice session driver stopped");
        self.session
    }

    fn apply(&mut self, command: SessionCommand) {
        debug!("Command: {:?}", command);
        let now = Instant::now();
        match command {
            SessionCommand::Start => {
                if let Err(e) = self.session.start(now) {
                    warn!("Session failed to start: {}", e);
                }
            }
            SessionCommand::End => self.session.end(now),
            SessionCommand::Interrupt => self.session.interrupt(),
            SessionCommand::ForceCommit => self.session.commit_now(true),
            SessionCommand::Shutdown => {}
        }
    }

    fn publish(&self) {
        let next = self.session.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
