//! Event plumbing between host callbacks and the session loop.
//!
//! Every callback source (capture stream, socket tasks, VAD worker) holds an
//! [`EventSink`] stamped with the session epoch it was attached under. The
//! session bumps its epoch on teardown, so envelopes from a detached source are
//! recognised as stale and ignored.

use crate::audio::AudioFrame;
use crate::vad::VadDecision;
use tokio::sync::mpsc;

/// Notifications delivered to the session loop
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// One fixed-size frame from the microphone
    CaptureFrame(AudioFrame),
    /// The capture stream reported an error
    CaptureError(String),
    /// The duplex channel finished its handshake
    SocketOpened,
    /// One inbound text frame
    SocketMessage(String),
    /// The channel closed (1000 is graceful)
    SocketClosed { code: u16, reason: String },
    /// The channel failed
    SocketError(String),
    /// Output from an asynchronous VAD strategy
    Vad(VadEvent),
}

/// Events produced by model-backed VAD strategies
#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    ModelReady,
    ModelFailed(String),
    Decision(VadDecision),
}

/// An event tagged with the epoch of the source that produced it
#[derive(Debug, Clone)]
pub struct Envelope {
    pub epoch: u64,
    pub event: SessionEvent,
}

/// Sending half handed to callback sources
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns false once the session loop has gone away.
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.tx
            .send(Envelope {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// Create the event channel for one session loop.
pub fn channel() -> (
    mpsc::UnboundedSender<Envelope>,
    mpsc::UnboundedReceiver<Envelope>,
) {
    mpsc::unbounded_channel()
}
