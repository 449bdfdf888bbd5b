//! Session behaviour against in-memory audio and channel mocks.

mod common;

use common::{agent_audio, GatedLoader, Harness, ScriptedLoader};
use pagi_voice_session::events::{SessionEvent, VadEvent};
use pagi_voice_session::{
    ClientMessage, SessionConfig, SessionState, SourceId, SpeechBoundary, Speaker, VadDecision,
    VadMode,
};
use std::time::{Duration, Instant as StdInstant};

fn config_with(mode: VadMode) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.vad.mode = mode;
    config
}

// ----------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------

#[test]
fn test_start_connects_and_listens() {
    let mut h = Harness::new(SessionConfig::default());
    assert_eq!(h.session.state(), SessionState::Idle);

    h.connect(0);

    assert_eq!(h.session.state(), SessionState::Listening);
    assert!(h.session.id().is_some());
    assert_eq!(h.session.active_vad_mode(), Some(VadMode::Threshold));
    let recorder = h.recorder.borrow();
    assert_eq!(recorder.microphones_started, 1);
    assert_eq!(recorder.speakers_resumed, 1);
    assert_eq!(recorder.connects, 1);
}

#[test]
fn test_connecting_until_handshake() {
    let mut h = Harness::new(SessionConfig::default());
    h.recorder.borrow_mut().auto_open = false;

    h.session.start(h.at(0)).unwrap();
    h.pump(0);
    assert_eq!(h.session.state(), SessionState::Connecting);
    assert_eq!(h.recorder.borrow().microphones_started, 0);

    h.recorder.borrow_mut().channel_open = true;
    let sink = h.recorder.borrow().socket_sink.clone().unwrap();
    sink.emit(SessionEvent::SocketOpened);
    h.pump(50);
    assert_eq!(h.session.state(), SessionState::Listening);
}

#[test]
fn test_double_start_is_noop() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);
    let id = h.session.id();

    h.session.start(h.at(10)).unwrap();

    assert_eq!(h.session.id(), id);
    let recorder = h.recorder.borrow();
    assert_eq!(recorder.connects, 1);
    assert_eq!(recorder.microphones_acquired, 1);
    assert_eq!(recorder.speakers_acquired, 1);
}

#[test]
fn test_missing_microphone_fails_start() {
    let mut h = Harness::new(SessionConfig::default());
    h.recorder.borrow_mut().fail_microphone = true;

    let result = h.session.start(h.at(0));

    assert!(result.is_err());
    assert_eq!(h.session.state(), SessionState::Error);
    assert!(h.session.last_error().unwrap().contains("permission denied"));
    assert!(h.session.diagnostics().last_error_at().is_some());
    let recorder = h.recorder.borrow();
    assert_eq!(recorder.speakers_acquired, 0);
    assert_eq!(recorder.connects, 0);
}

#[test]
fn test_partial_acquisition_is_released() {
    let mut h = Harness::new(SessionConfig::default());
    h.recorder.borrow_mut().fail_connect = true;

    assert!(h.session.start(h.at(0)).is_err());

    let recorder = h.recorder.borrow();
    assert_eq!(recorder.microphones_released, 1);
    assert_eq!(recorder.speakers_released, 1);
    assert_eq!(h.session.state(), SessionState::Error);
}

#[test]
fn test_speaker_failure_releases_microphone() {
    let mut h = Harness::new(SessionConfig::default());
    h.recorder.borrow_mut().fail_speaker = true;

    assert!(h.session.start(h.at(0)).is_err());
    assert_eq!(h.recorder.borrow().microphones_released, 1);
}

#[test]
fn test_normal_close_returns_to_idle() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);

    h.close_socket(1000, 2_000);

    assert_eq!(h.session.state(), SessionState::Idle);
    assert!(h.session.last_error().is_none());
    assert_eq!(h.session.duration(), Duration::from_secs(2));
    let recorder = h.recorder.borrow();
    assert_eq!(recorder.microphones_released, 1);
    assert_eq!(recorder.speakers_released, 1);
}

#[test]
fn test_abnormal_close_enters_error() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);

    h.close_socket(1006, 500);

    assert_eq!(h.session.state(), SessionState::Error);
    assert!(h.session.last_error().unwrap().contains("1006"));
    assert!(h.session.diagnostics().last_error_at().is_some());
    let recorder = h.recorder.borrow();
    assert_eq!(recorder.microphones_released, 1);
    assert_eq!(recorder.speakers_released, 1);
    assert_eq!(recorder.closes.len(), 1);
}

#[test]
fn test_socket_error_enters_error() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);

    let sink = h.recorder.borrow().socket_sink.clone().unwrap();
    sink.emit(SessionEvent::SocketError("connection reset".into()));
    h.pump(100);

    assert_eq!(h.session.state(), SessionState::Error);
    assert!(h.session.last_error().unwrap().contains("connection reset"));
}

#[test]
fn test_restart_after_error_counts_reconnects() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);
    h.close_socket(1006, 100);

    h.connect(200);
    assert_eq!(h.session.state(), SessionState::Listening);
    assert_eq!(h.session.diagnostics().reconnect_attempts(), 1);
    assert!(h.session.last_error().is_none());
    assert_eq!(h.recorder.borrow().microphones_acquired, 2);

    h.session.end(h.at(300));
    h.connect(400);
    assert_eq!(h.session.diagnostics().reconnect_attempts(), 0);
}

#[test]
fn test_end_flushes_commit_and_says_goodbye() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);
    h.speech(10);

    h.session.end(h.at(20));

    assert_eq!(h.sent_kinds(), vec!["audio", "commit", "end_session"]);
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.session.duration(), Duration::from_millis(20));
    let recorder = h.recorder.borrow();
    assert_eq!(recorder.closes.len(), 1);
    assert_eq!(recorder.closes[0].0, 1000);
}

#[test]
fn test_teardown_releases_exactly_once() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);

    h.session.end(h.at(100));
    h.session.teardown();
    h.session.teardown();

    let common::Harness { session, recorder, .. } = h;
    drop(session);

    let recorder = recorder.borrow();
    assert_eq!(recorder.microphones_released, 1);
    assert_eq!(recorder.speakers_released, 1);
    assert_eq!(recorder.closes.len(), 1);
}

#[test]
fn test_teardown_returns_to_idle_and_allows_restart() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);

    h.session.teardown();
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.recorder.borrow().microphones_released, 1);
    assert_eq!(h.recorder.borrow().speakers_released, 1);

    h.connect(100);
    assert_eq!(h.session.state(), SessionState::Listening);
    assert_eq!(h.recorder.borrow().connects, 2);
    assert_eq!(h.session.diagnostics().reconnect_attempts(), 0);
}

#[test]
fn test_teardown_keeps_error_state() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);
    h.close_socket(1006, 50);

    h.session.teardown();

    assert_eq!(h.session.state(), SessionState::Error);
    h.connect(100);
    assert_eq!(h.session.diagnostics().reconnect_attempts(), 1);
}

#[test]
fn test_stale_callbacks_are_ignored_after_teardown() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);
    let old_mic = h.recorder.borrow().mic_sink.clone().unwrap();
    let old_socket = h.recorder.borrow().socket_sink.clone().unwrap();

    h.session.end(h.at(100));
    let sent_before = h.sent_kinds().len();

    old_mic.emit(SessionEvent::CaptureFrame(pagi_voice_session::AudioFrame::new(
        common::speech_frame(),
    )));
    old_socket.emit(SessionEvent::SocketMessage(agent_audio(0.2)));
    old_socket.emit(SessionEvent::SocketClosed {
        code: 1006,
        reason: "late".into(),
    });
    h.pump(200);

    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.sent_kinds().len(), sent_before);
    assert!(h.recorder.borrow().started_sources.is_empty());
    assert!(h.session.last_error().is_none());
}

#[test]
fn test_vad_mode_is_fixed_during_a_call() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);
    assert!(h.session.set_vad_mode(VadMode::Hybrid).is_err());

    h.session.end(h.at(10));
    assert!(h.session.set_vad_mode(VadMode::Hybrid).is_ok());
    assert_eq!(h.session.config().vad.mode, VadMode::Hybrid);
}

// ----------------------------------------------------------------------
// Capture and commit
// ----------------------------------------------------------------------

#[test]
fn test_silence_is_gated() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);

    h.silence(10);
    h.silence(40);
    h.speech(70);

    assert_eq!(h.sent_kinds(), vec!["audio"]);
    assert!(h.session.is_user_speaking());
    assert!(h.session.has_uncommitted_audio());
}

#[test]
fn test_gating_disabled_transmits_everything() {
    let mut config = SessionConfig::default();
    config.vad.gating_enabled = false;
    let mut h = Harness::new(config);
    h.connect(0);

    h.silence(10);
    h.silence(40);

    assert_eq!(h.count_sent("audio"), 2);
}

#[test]
fn test_debounce_fires_a_single_commit() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);

    for ms in [0u64, 30, 60, 90, 120] {
        h.speech(ms);
    }
    assert_eq!(h.session.next_deadline(), Some(h.at(420)));

    h.timers(419);
    assert_eq!(h.count_sent("commit"), 0);
    h.timers(420);
    h.timers(900);

    assert_eq!(h.count_sent("audio"), 5);
    assert_eq!(h.count_sent("commit"), 1);
    assert!(!h.session.has_uncommitted_audio());
}

#[test]
fn test_speech_end_uses_fast_commit() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);

    h.speech(0);
    h.speech(30);
    h.silence(60);
    assert!(!h.session.is_user_speaking());

    h.timers(179);
    assert_eq!(h.count_sent("commit"), 0);
    h.timers(180);
    assert_eq!(h.count_sent("commit"), 1);

    // The superseded normal timer never fires
    h.timers(400);
    assert_eq!(h.count_sent("commit"), 1);
}

#[test]
fn test_no_commit_without_new_audio() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);

    h.speech(0);
    h.session.commit_now(false);
    assert_eq!(h.count_sent("commit"), 1);

    // Speech end schedules a fast commit, but nothing new went out
    h.silence(20);
    h.timers(140);
    assert_eq!(h.count_sent("commit"), 1);

    h.session.commit_now(false);
    assert_eq!(h.count_sent("commit"), 1);
    h.session.commit_now(true);
    assert_eq!(h.count_sent("commit"), 2);
}

// ----------------------------------------------------------------------
// Playback and interruption
// ----------------------------------------------------------------------

#[test]
fn test_agent_audio_plays_back_to_back() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);
    h.recorder.borrow_mut().clock = 1.0;

    h.server(&agent_audio(0.5), 10);
    h.server(&agent_audio(0.25), 20);

    let recorder = h.recorder.borrow();
    assert_eq!(
        recorder.started_sources,
        vec![(SourceId(0), 1.0), (SourceId(1), 1.5)]
    );
    assert!(h.session.is_remote_speaking());
    assert_eq!(h.session.next_playback_time(), 1.75);
}

#[test]
fn test_remote_speaking_clears_when_playback_drains() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);
    h.server(&agent_audio(0.5), 10);
    h.server(&agent_audio(0.5), 20);

    h.recorder.borrow_mut().finished = vec![SourceId(0)];
    h.session.poll_playback();
    assert!(h.session.is_remote_speaking());

    h.recorder.borrow_mut().finished = vec![SourceId(1)];
    h.session.poll_playback();
    assert!(!h.session.is_remote_speaking());
    assert_eq!(h.session.active_sources(), 0);
}

#[test]
fn test_barge_in_stops_every_scheduled_chunk() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);

    for ms in [10, 11, 12] {
        h.server(&agent_audio(0.5), ms);
    }
    assert_eq!(h.session.active_sources(), 3);

    // User starts talking in the middle of chunk two
    h.recorder.borrow_mut().clock = 0.7;
    h.speech(700);

    let recorder = h.recorder.borrow();
    let mut stopped = recorder.stopped_sources.clone();
    stopped.sort_by_key(|id| id.0);
    assert_eq!(stopped, vec![SourceId(0), SourceId(1), SourceId(2)]);
    // Chunk three was scheduled for 1.0s and is gone before it started
    assert_eq!(recorder.started_sources[2], (SourceId(2), 1.0));
    drop(recorder);

    assert_eq!(h.session.active_sources(), 0);
    assert!(!h.session.is_remote_speaking());
    assert_eq!(h.session.next_playback_time(), 0.7);
    assert_eq!(h.session.diagnostics().interruptions(), 1);
    assert_eq!(h.sent_kinds(), vec!["interrupt", "audio"]);
}

#[test]
fn test_audio_after_interrupt_starts_at_now() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);
    h.server(&agent_audio(2.0), 10);

    h.recorder.borrow_mut().clock = 0.3;
    h.session.interrupt();
    h.server(&agent_audio(0.5), 310);

    let recorder = h.recorder.borrow();
    assert_eq!(recorder.started_sources.last(), Some(&(SourceId(1), 0.3)));
}

#[test]
fn test_manual_interrupt_counts_even_when_silent() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);

    h.session.interrupt();

    assert_eq!(h.session.diagnostics().interruptions(), 1);
    assert_eq!(h.sent_kinds(), vec!["interrupt"]);
}

#[test]
fn test_interrupt_outside_a_call_does_nothing() {
    let mut h = Harness::new(SessionConfig::default());
    h.session.interrupt();

    h.connect(0);
    h.close_socket(1006, 50);
    h.session.interrupt();

    assert_eq!(h.session.diagnostics().interruptions(), 0);
    assert_eq!(h.count_sent("interrupt"), 0);
}

#[test]
fn test_teardown_interrupt_is_not_counted() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);
    h.server(&agent_audio(1.0), 10);

    h.close_socket(1006, 100);

    assert_eq!(h.session.diagnostics().interruptions(), 0);
    assert_eq!(h.recorder.borrow().stopped_sources, vec![SourceId(0)]);
}

// ----------------------------------------------------------------------
// Inbound messages and diagnostics
// ----------------------------------------------------------------------

#[test]
fn test_heartbeat_measures_latency() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);

    h.timers(5_000);
    let sent = h.recorder.borrow().sent.clone();
    assert_eq!(
        sent,
        vec![ClientMessage::Ping {
            timestamp: 1_700_000_005_000
        }]
    );
    assert_eq!(h.session.diagnostics().pings_sent(), 1);
    assert_eq!(h.session.duration(), Duration::from_secs(5));

    h.server(
        r#"{"type":"pong","client_timestamp":1700000005000,"server_timestamp":1700000005040}"#,
        5_080,
    );

    let diagnostics = h.session.diagnostics();
    assert_eq!(diagnostics.latency_ms(), Some(80));
    assert_eq!(
        diagnostics.last_heartbeat_at().map(|t| t.timestamp_millis()),
        Some(1_700_000_005_080)
    );
}

#[test]
fn test_malformed_messages_are_dropped() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);

    h.server("not json", 10);
    h.server(r#"{"type":"bogus"}"#, 20);
    h.server(r#"{"type":"audio","audio":"%%%"}"#, 30);

    assert_eq!(h.session.state(), SessionState::Listening);
    assert!(h.session.last_error().is_none());
    assert!(h.recorder.borrow().started_sources.is_empty());
}

#[test]
fn test_remote_error_is_recorded_and_session_continues() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);

    h.server(r#"{"type":"error","message":"quota exceeded"}"#, 10);

    assert_eq!(h.session.state(), SessionState::Listening);
    assert_eq!(h.session.last_error(), Some("quota exceeded"));
    let entry = h.session.transcript().last().unwrap();
    assert_eq!(entry.speaker, Speaker::System);
}

#[test]
fn test_transcript_lines_accumulate() {
    let mut h = Harness::new(SessionConfig::default());
    h.connect(0);

    h.server(r#"{"type":"transcript","speaker":"user","text":"hello"}"#, 10);
    h.server(r#"{"type":"transcript","speaker":"agent","text":"hi there"}"#, 20);

    let transcript = h.session.transcript();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[1].speaker, Speaker::Agent);
    assert_eq!(transcript[1].text, "hi there");
    assert_eq!(h.session.snapshot().transcript_len, 2);
}

// ----------------------------------------------------------------------
// Model-backed VAD
// ----------------------------------------------------------------------

fn decide(h: &mut Harness, kind: SpeechBoundary, ms: u64) {
    h.session
        .event_sink()
        .emit(SessionEvent::Vad(VadEvent::Decision(VadDecision {
            kind,
            confidence: 0.9,
        })));
    h.pump(ms);
}

#[test]
fn test_ml_mode_sends_pre_roll_on_speech_start() {
    let mut h = Harness::with_loader(config_with(VadMode::Ml), ScriptedLoader::silent());
    h.connect(0);
    assert_eq!(h.session.active_vad_mode(), Some(VadMode::Ml));

    for ms in [10, 40, 70, 100] {
        h.speech(ms);
    }
    assert_eq!(h.count_sent("audio"), 0);

    decide(&mut h, SpeechBoundary::Start, 110);
    assert!(h.session.is_user_speaking());
    assert_eq!(h.count_sent("audio"), 3);

    h.speech(130);
    assert_eq!(h.count_sent("audio"), 4);

    decide(&mut h, SpeechBoundary::End, 140);
    assert!(!h.session.is_user_speaking());
    h.timers(260);
    assert_eq!(h.count_sent("commit"), 1);
}

#[test]
fn test_ml_misfire_is_counted() {
    let mut h = Harness::with_loader(config_with(VadMode::Ml), ScriptedLoader::silent());
    h.connect(0);

    decide(&mut h, SpeechBoundary::Start, 10);
    decide(&mut h, SpeechBoundary::Misfire, 40);

    assert!(!h.session.is_user_speaking());
    assert_eq!(h.session.diagnostics().misfires(), 1);
    h.speech(70);
    assert_eq!(h.count_sent("audio"), 0);
}

#[test]
fn test_ml_speech_start_barges_in() {
    let mut h = Harness::with_loader(config_with(VadMode::Ml), ScriptedLoader::silent());
    h.connect(0);
    h.server(&agent_audio(1.0), 10);

    decide(&mut h, SpeechBoundary::Start, 200);

    assert_eq!(h.session.active_sources(), 0);
    assert_eq!(h.session.diagnostics().interruptions(), 1);
}

#[test]
fn test_ml_model_failure_is_fatal() {
    let mut h = Harness::with_loader(config_with(VadMode::Ml), ScriptedLoader::broken());
    h.connect(0);

    let event = h.wait_for_vad(50);

    assert!(matches!(event, VadEvent::ModelFailed(_)));
    assert_eq!(h.session.state(), SessionState::Error);
    assert!(h.session.last_error().unwrap().contains("model file missing"));
    assert_eq!(h.recorder.borrow().microphones_released, 1);
}

#[test]
fn test_hybrid_model_failure_falls_back_to_threshold() {
    let mut h = Harness::with_loader(config_with(VadMode::Hybrid), ScriptedLoader::broken());
    h.connect(0);

    h.wait_for_vad(5);

    assert_eq!(h.session.state(), SessionState::Listening);
    assert!(h.session.diagnostics().vad_fallback());

    // RMS now drives boundaries on its own
    h.speech(10);
    h.silence(40);
    h.timers(160);
    assert_eq!(h.count_sent("audio"), 1);
    assert_eq!(h.count_sent("commit"), 1);
}

#[test]
fn test_hybrid_boundaries_come_from_the_model() {
    let mut h = Harness::with_loader(config_with(VadMode::Hybrid), ScriptedLoader::silent());
    h.connect(0);
    assert!(matches!(h.wait_for_vad(5), VadEvent::ModelReady));

    // RMS gates transmission...
    h.speech(10);
    h.silence(40);
    assert_eq!(h.count_sent("audio"), 1);

    // ...but does not end the utterance, so only the normal debounce fires
    assert!(!h.session.is_user_speaking());
    h.timers(160);
    assert_eq!(h.count_sent("commit"), 0);
    h.timers(310);
    assert_eq!(h.count_sent("commit"), 1);

    decide(&mut h, SpeechBoundary::Start, 320);
    assert!(h.session.is_user_speaking());
}

#[test]
fn test_hybrid_model_ready_mid_utterance_closes_it() {
    let (loader, gate) = GatedLoader::new();
    let mut h = Harness::with_loader(config_with(VadMode::Hybrid), loader);
    h.connect(0);

    // RMS opens the utterance while the model is still loading
    h.speech(10);
    assert!(h.session.is_user_speaking());
    assert_eq!(h.count_sent("audio"), 1);

    gate.send(()).unwrap();
    assert!(matches!(h.wait_for_vad(20), VadEvent::ModelReady));
    assert!(!h.session.is_user_speaking());

    h.silence(30);
    h.timers(140);
    assert_eq!(h.count_sent("commit"), 1);

    // The next model start is a fresh utterance and barges in
    h.server(&agent_audio(1.0), 150);
    assert!(h.session.is_remote_speaking());
    decide(&mut h, SpeechBoundary::Start, 200);

    assert!(h.session.is_user_speaking());
    assert_eq!(h.session.active_sources(), 0);
    assert_eq!(h.session.diagnostics().interruptions(), 1);
    assert_eq!(h.count_sent("interrupt"), 1);
}

#[test]
fn test_close_during_model_load_does_not_block() {
    let (loader, gate) = GatedLoader::new();
    let mut h = Harness::with_loader(config_with(VadMode::Ml), loader);
    h.connect(0);
    assert_eq!(h.session.active_vad_mode(), Some(VadMode::Ml));

    let started = StdInstant::now();
    h.close_socket(1006, 10);
    assert!(started.elapsed() < Duration::from_millis(500));

    assert_eq!(h.session.state(), SessionState::Error);
    assert_eq!(h.session.active_vad_mode(), None);
    drop(gate);
}
