//! In-memory audio host and channel for driving a session without hardware.
#![allow(dead_code)]

use pagi_voice_session::config::SessionConfig;
use pagi_voice_session::events::{Envelope, EventSink, SessionEvent, VadEvent};
use pagi_voice_session::vad::{ModelLoader, SpeechModel};
use pagi_voice_session::{
    AudioConfig, AudioFrame, AudioHost, ClientMessage, Connector, DuplexChannel, Microphone,
    PlaybackOutput, Session, SourceId, VoiceError, VoiceResult, WallClock,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Everything the mocks observed, shared with the test body
#[derive(Debug)]
pub struct Recorder {
    pub fail_microphone: bool,
    pub fail_speaker: bool,
    pub fail_connect: bool,
    /// Report the handshake as soon as the channel is opened
    pub auto_open: bool,

    pub microphones_acquired: u32,
    pub microphones_started: u32,
    pub microphones_released: u32,
    pub mic_sink: Option<EventSink>,

    pub speakers_acquired: u32,
    pub speakers_resumed: u32,
    pub speakers_released: u32,
    /// Audio clock reported by the speaker, in seconds
    pub clock: f64,
    pub started_sources: Vec<(SourceId, f64)>,
    pub stopped_sources: Vec<SourceId>,
    /// Returned by the next `poll_finished`
    pub finished: Vec<SourceId>,

    pub connects: u32,
    pub socket_sink: Option<EventSink>,
    pub channel_open: bool,
    pub sent: Vec<ClientMessage>,
    pub closes: Vec<(u16, String)>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self {
            fail_microphone: false,
            fail_speaker: false,
            fail_connect: false,
            auto_open: true,
            microphones_acquired: 0,
            microphones_started: 0,
            microphones_released: 0,
            mic_sink: None,
            speakers_acquired: 0,
            speakers_resumed: 0,
            speakers_released: 0,
            clock: 0.0,
            started_sources: Vec::new(),
            stopped_sources: Vec::new(),
            finished: Vec::new(),
            connects: 0,
            socket_sink: None,
            channel_open: false,
            sent: Vec::new(),
            closes: Vec::new(),
        }
    }
}

pub type SharedRecorder = Rc<RefCell<Recorder>>;

pub struct MockHost(pub SharedRecorder);

impl AudioHost for MockHost {
    fn acquire_microphone(&mut self, _config: &AudioConfig) -> VoiceResult<Box<dyn Microphone>> {
        let mut recorder = self.0.borrow_mut();
        if recorder.fail_microphone {
            return Err(VoiceError::AudioDevice("permission denied".into()));
        }
        recorder.microphones_acquired += 1;
        Ok(Box::new(MockMicrophone(Rc::clone(&self.0))))
    }

    fn acquire_speaker(&mut self, _config: &AudioConfig) -> VoiceResult<Box<dyn PlaybackOutput>> {
        let mut recorder = self.0.borrow_mut();
        if recorder.fail_speaker {
            return Err(VoiceError::Playback("no output device".into()));
        }
        recorder.speakers_acquired += 1;
        Ok(Box::new(MockSpeaker(Rc::clone(&self.0))))
    }
}

pub struct MockMicrophone(SharedRecorder);

impl Microphone for MockMicrophone {
    fn start(&mut self, sink: EventSink) -> VoiceResult<()> {
        let mut recorder = self.0.borrow_mut();
        recorder.microphones_started += 1;
        recorder.mic_sink = Some(sink);
        Ok(())
    }

    fn release(&mut self) {
        self.0.borrow_mut().microphones_released += 1;
    }
}

pub struct MockSpeaker(SharedRecorder);

impl PlaybackOutput for MockSpeaker {
    fn current_time(&self) -> f64 {
        self.0.borrow().clock
    }

    fn resume(&mut self) {
        self.0.borrow_mut().speakers_resumed += 1;
    }

    fn start_source(
        &mut self,
        id: SourceId,
        _samples: Vec<f32>,
        _sample_rate: u32,
        start_at: f64,
    ) -> VoiceResult<()> {
        self.0.borrow_mut().started_sources.push((id, start_at));
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) {
        self.0.borrow_mut().stopped_sources.push(id);
    }

    fn poll_finished(&mut self) -> Vec<SourceId> {
        std::mem::take(&mut self.0.borrow_mut().finished)
    }

    fn release(&mut self) {
        self.0.borrow_mut().speakers_released += 1;
    }
}

pub struct MockConnector(pub SharedRecorder);

impl Connector for MockConnector {
    fn open(&mut self, _url: &str, sink: EventSink) -> VoiceResult<Box<dyn DuplexChannel>> {
        let mut recorder = self.0.borrow_mut();
        if recorder.fail_connect {
            return Err(VoiceError::Transport("connection refused".into()));
        }
        recorder.connects += 1;
        if recorder.auto_open {
            recorder.channel_open = true;
            sink.emit(SessionEvent::SocketOpened);
        }
        recorder.socket_sink = Some(sink);
        Ok(Box::new(MockChannel(Rc::clone(&self.0))))
    }
}

pub struct MockChannel(SharedRecorder);

impl DuplexChannel for MockChannel {
    fn send(&mut self, message: &ClientMessage) -> VoiceResult<()> {
        let mut recorder = self.0.borrow_mut();
        if !recorder.channel_open {
            return Err(VoiceError::Transport("channel not open".into()));
        }
        recorder.sent.push(message.clone());
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) {
        let mut recorder = self.0.borrow_mut();
        recorder.channel_open = false;
        recorder.closes.push((code, reason.to_string()));
    }

    fn is_open(&self) -> bool {
        self.0.borrow().channel_open
    }
}

/// Model reporting a fixed probability, or failing to load
pub struct ScriptedLoader {
    pub fail: bool,
    pub probability: f32,
}

impl ScriptedLoader {
    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            probability: 0.0,
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            probability: 0.0,
        })
    }
}

struct FixedModel(f32);

impl SpeechModel for FixedModel {
    fn window_size(&self) -> usize {
        480
    }

    fn speech_probability(&mut self, _window: &[f32]) -> VoiceResult<f32> {
        Ok(self.0)
    }
}

impl ModelLoader for ScriptedLoader {
    fn name(&self) -> &str {
        "scripted"
    }

    fn load(&self) -> VoiceResult<Box<dyn SpeechModel>> {
        if self.fail {
            return Err(VoiceError::VadInit("model file missing".into()));
        }
        Ok(Box::new(FixedModel(self.probability)))
    }
}

/// Model whose load blocks until the test opens the gate (or drops it)
pub struct GatedLoader {
    gate: Mutex<std_mpsc::Receiver<()>>,
}

impl GatedLoader {
    pub fn new() -> (Arc<Self>, std_mpsc::Sender<()>) {
        let (open, gate) = std_mpsc::channel();
        (
            Arc::new(Self {
                gate: Mutex::new(gate),
            }),
            open,
        )
    }
}

impl ModelLoader for GatedLoader {
    fn name(&self) -> &str {
        "gated"
    }

    fn load(&self) -> VoiceResult<Box<dyn SpeechModel>> {
        if let Ok(gate) = self.gate.lock() {
            let _ = gate.recv();
        }
        Ok(Box::new(FixedModel(0.0)))
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A session wired to the mocks, driven by hand with explicit instants
pub struct Harness {
    pub session: Session,
    pub events: mpsc::UnboundedReceiver<Envelope>,
    pub recorder: SharedRecorder,
    pub t0: Instant,
    /// Last model lifecycle event delivered and not yet waited for
    vad_seen: Option<VadEvent>,
}

impl Harness {
    pub fn new(config: SessionConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_loader(config: SessionConfig, loader: Arc<dyn ModelLoader>) -> Self {
        Self::build(config, Some(loader))
    }

    fn build(config: SessionConfig, loader: Option<Arc<dyn ModelLoader>>) -> Self {
        init_tracing();
        let recorder: SharedRecorder = Rc::new(RefCell::new(Recorder::default()));
        let t0 = Instant::now();
        let (session, events) = Session::new(
            config,
            Box::new(MockHost(Rc::clone(&recorder))),
            Box::new(MockConnector(Rc::clone(&recorder))),
        );
        let mut session = session.with_wall_clock(WallClock::anchored(
            t0,
            chrono::DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        ));
        if let Some(loader) = loader {
            session = session.with_model_loader(loader);
        }
        Self {
            session,
            events,
            recorder,
            t0,
            vad_seen: None,
        }
    }

    pub fn at(&self, ms: u64) -> Instant {
        self.t0 + Duration::from_millis(ms)
    }

    /// Deliver every queued envelope at `ms`.
    pub fn pump(&mut self, ms: u64) {
        let now = self.at(ms);
        while let Ok(envelope) = self.events.try_recv() {
            self.deliver(envelope, now);
        }
    }

    fn deliver(&mut self, envelope: Envelope, now: Instant) {
        if let SessionEvent::Vad(event @ (VadEvent::ModelReady | VadEvent::ModelFailed(_))) =
            &envelope.event
        {
            self.vad_seen = Some(event.clone());
        }
        self.session.handle_event(envelope, now);
    }

    /// Start and complete the handshake at `ms`.
    pub fn connect(&mut self, ms: u64) {
        self.session.start(self.at(ms)).unwrap();
        self.pump(ms);
    }

    /// Block until the VAD worker reports, handling everything on the way.
    pub fn wait_for_vad(&mut self, ms: u64) -> VadEvent {
        let now = self.at(ms);
        loop {
            if let Some(event) = self.vad_seen.take() {
                return event;
            }
            let envelope = self.events.blocking_recv().unwrap();
            self.deliver(envelope, now);
        }
    }

    /// Push a frame through the microphone's sink, as the capture callback would.
    pub fn capture(&mut self, samples: Vec<f32>, ms: u64) {
        let sink = self.recorder.borrow().mic_sink.clone().unwrap();
        sink.emit(SessionEvent::CaptureFrame(AudioFrame::new(samples)));
        self.pump(ms);
    }

    pub fn speech(&mut self, ms: u64) {
        self.capture(speech_frame(), ms);
    }

    pub fn silence(&mut self, ms: u64) {
        self.capture(silence_frame(), ms);
    }

    /// Inbound text frame from the agent, via the socket's sink.
    pub fn server(&mut self, json: &str, ms: u64) {
        let sink = self.recorder.borrow().socket_sink.clone().unwrap();
        sink.emit(SessionEvent::SocketMessage(json.to_string()));
        self.pump(ms);
    }

    pub fn close_socket(&mut self, code: u16, ms: u64) {
        let sink = self.recorder.borrow().socket_sink.clone().unwrap();
        sink.emit(SessionEvent::SocketClosed {
            code,
            reason: "test".into(),
        });
        self.pump(ms);
    }

    pub fn timers(&mut self, ms: u64) {
        self.session.on_timers(self.at(ms));
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.recorder.borrow().sent.iter().map(|m| m.kind()).collect()
    }

    pub fn count_sent(&self, kind: &str) -> usize {
        self.sent_kinds().into_iter().filter(|k| *k == kind).count()
    }
}

pub fn speech_frame() -> Vec<f32> {
    vec![0.2; 480]
}

pub fn silence_frame() -> Vec<f32> {
    vec![0.0; 480]
}

/// `seconds` of agent audio as an inbound JSON message.
pub fn agent_audio(seconds: f64) -> String {
    let samples = vec![0.1f32; (16_000.0 * seconds) as usize];
    let audio = pagi_voice_session::protocol::encode_pcm(&samples);
    format!(r#"{{"type":"audio","audio":"{}"}}"#, audio)
}
