//! Session health: heartbeat latency, reconnects, interruptions, errors.
//!
//! [`Diagnostics`] is mutated only by the session; consumers get `&Diagnostics`
//! or a cloned snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Health snapshot of the current session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    latency_ms: Option<u64>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    pings_sent: u32,
    reconnect_attempts: u32,
    interruptions: u32,
    misfires: u32,
    last_error_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    vad_fallback: bool,
}

impl Diagnostics {
    /// Round-trip time of the latest pong
    pub fn latency_ms(&self) -> Option<u64> {
        self.latency_ms
    }

    pub fn last_heartbeat_at(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat_at
    }

    pub fn pings_sent(&self) -> u32 {
        self.pings_sent
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn interruptions(&self) -> u32 {
        self.interruptions
    }

    pub fn misfires(&self) -> u32 {
        self.misfires
    }

    pub fn last_error_at(&self) -> Option<DateTime<Utc>> {
        self.last_error_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Hybrid mode lost its model and runs on RMS alone
    pub fn vad_fallback(&self) -> bool {
        self.vad_fallback
    }

    /// Fresh diagnostics for a new session. Reconnect attempts carry over only
    /// when the previous session ended in error.
    pub(crate) fn for_new_session(previous: &Diagnostics, after_error: bool) -> Self {
        Self {
            reconnect_attempts: if after_error {
                previous.reconnect_attempts + 1
            } else {
                0
            },
            ..Self::default()
        }
    }

    pub(crate) fn record_ping(&mut self) {
        self.pings_sent += 1;
    }

    pub(crate) fn record_pong(&mut self, latency_ms: u64, at: DateTime<Utc>) {
        self.latency_ms = Some(latency_ms);
        self.last_heartbeat_at = Some(at);
    }

    pub(crate) fn record_interruption(&mut self) {
        self.interruptions += 1;
    }

    pub(crate) fn record_misfire(&mut self) {
        self.misfires += 1;
    }

    pub(crate) fn record_error(&mut self, message: impl Into<String>, at: DateTime<Utc>) {
        self.last_error = Some(message.into());
        self.last_error_at = Some(at);
    }

    pub(crate) fn set_vad_fallback(&mut self) {
        self.vad_fallback = true;
    }
}

/// Maps monotonic instants to wall-clock time from one fixed origin, so
/// timestamps in pings and diagnostics are consistent with the session timers.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    origin: Instant,
    origin_ms: i64,
}

impl WallClock {
    pub fn new() -> Self {
        Self::anchored(Instant::now(), Utc::now())
    }

    pub fn anchored(origin: Instant, at: DateTime<Utc>) -> Self {
        Self {
            origin,
            origin_ms: at.timestamp_millis(),
        }
    }

    /// Epoch milliseconds at `now`.
    pub fn millis_at(&self, now: Instant) -> i64 {
        let elapsed = now.saturating_duration_since(self.origin).as_millis() as i64;
        self.origin_ms + elapsed
    }

    pub fn datetime_at(&self, now: Instant) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.millis_at(now)).unwrap_or_else(Utc::now)
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A repeating timer represented by its next deadline
#[derive(Debug, Clone)]
pub struct IntervalTimer {
    period: Duration,
    next: Option<Instant>,
}

impl IntervalTimer {
    pub fn new(period: Duration) -> Self {
        Self { period, next: None }
    }

    /// First tick one period after `now`.
    pub fn arm(&mut self, now: Instant) {
        self.next = Some(now + self.period);
    }

    pub fn disarm(&mut self) {
        self.next = None;
    }

    pub fn is_armed(&self) -> bool {
        self.next.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.next
    }

    /// True when a tick is due. Missed ticks collapse into one.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next {
            Some(deadline) if deadline <= now => {
                let mut next = deadline + self.period;
                if next <= now {
                    next = now + self.period;
                }
                self.next = Some(next);
                true
            }
            _ => false,
        }
    }
}

/// Latency from a pong echoing `client_timestamp`, received at `now_ms`.
pub fn round_trip_ms(client_timestamp: i64, now_ms: i64) -> Option<u64> {
    let latency = now_ms - client_timestamp;
    if latency < 0 {
        debug!(
            "Pong timestamp {} is ahead of the local clock ({})",
            client_timestamp, now_ms
        );
        return None;
    }
    Some(latency as u64)
}
