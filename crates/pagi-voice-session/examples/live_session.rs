//! Live voice session against a running agent.
//!
//! Reads `config/voice_session.toml` (or `PAGI_VOICE_CONFIG`) plus `PAGI_VOICE__*`
//! overrides, captures from the default microphone and plays replies on the
//! default output. Press Ctrl+C to end the call.

use anyhow::Context;
use pagi_voice_session::{
    SessionConfig, Session, SessionDriver, SessionState, SystemAudioHost, WsConnector,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SessionConfig::load().context("loading voice session config")?;
    info!("🎙️ PAGI Voice Session → {}", config.server_url);
    info!("VAD mode: {:?}, gating: {}", config.vad.mode, config.vad.gating_enabled);
    info!("Press Ctrl+C to end the call.\n");

    let (session, events) = Session::new(
        config,
        Box::new(SystemAudioHost),
        Box::new(WsConnector::new()),
    );
    let (driver, handle) = SessionDriver::new(session, events);

    let control = async {
        handle.start()?;
        let mut updates = handle.subscribe();
        let mut last_state = SessionState::Idle;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl+C received, ending call");
                    break;
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = updates.borrow_and_update().clone();
                    if snapshot.state != last_state {
                        info!("State: {:?}", snapshot.state);
                        last_state = snapshot.state;
                    }
                    if snapshot.state == SessionState::Error {
                        warn!(
                            "Session error: {}",
                            snapshot.diagnostics.last_error().unwrap_or("unknown")
                        );
                        break;
                    }
                }
            }
        }

        handle.shutdown()?;
        Ok::<_, anyhow::Error>(())
    };

    let (session, result) = tokio::join!(driver.run(), control);
    result?;

    let diagnostics = session.diagnostics();
    info!(
        "⏹️ Call finished after {:.1}s ({} interruptions, latency {:?}ms)",
        session.duration().as_secs_f32(),
        diagnostics.interruptions(),
        diagnostics.latency_ms()
    );
    for entry in session.transcript() {
        info!("{:?}: {}", entry.speaker, entry.text);
    }
    Ok(())
}
