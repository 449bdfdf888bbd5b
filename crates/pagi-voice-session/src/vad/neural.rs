//! Model-backed strategies.
//!
//! [`NeuralVad`] runs the model on a dedicated worker thread (models need not
//! be `Send`), re-chunks captured frames into model windows, and reports
//! boundaries through the session's event sink. Stopping never waits for the
//! worker: it is cancelled and detached, and drops its model on the way out. [`HybridVad`] pairs it with the
//! RMS detector: the cheap local signal gates transmission, the model decides
//! where utterances start and end.

use super::model::ModelLoader;
use super::segmenter::{SegmenterConfig, SpeechSegmenter};
use super::threshold::ThresholdVad;
use super::{VadMode, VadStrategy};
use crate::audio::AudioFrame;
use crate::error::{VoiceError, VoiceResult};
use crate::events::{EventSink, SessionEvent, VadEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// ML strategy: model scoring on a worker thread
pub struct NeuralVad {
    loader: Arc<dyn ModelLoader>,
    segmenter: SegmenterConfig,
    frames_tx: Option<mpsc::UnboundedSender<Vec<f32>>>,
    worker: Option<thread::JoinHandle<()>>,
    cancelled: Arc<AtomicBool>,
}

impl NeuralVad {
    pub fn new(loader: Arc<dyn ModelLoader>, segmenter: SegmenterConfig) -> Self {
        Self {
            loader,
            segmenter,
            frames_tx: None,
            worker: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl VadStrategy for NeuralVad {
    fn mode(&self) -> VadMode {
        VadMode::Ml
    }

    fn start(&mut self, sink: EventSink) -> VoiceResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let loader = Arc::clone(&self.loader);
        let segmenter = self.segmenter;
        let cancelled = Arc::new(AtomicBool::new(false));
        self.cancelled = Arc::clone(&cancelled);

        let worker = thread::Builder::new()
            .name("pagi-vad-worker".to_string())
            .spawn(move || run_worker(loader, segmenter, frames_rx, sink, cancelled))
            .map_err(|e| VoiceError::VadInit(format!("failed to spawn VAD worker: {}", e)))?;

        self.frames_tx = Some(frames_tx);
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        // The worker may still be inside `load()`; it sees the flag afterwards
        self.cancelled.store(true, Ordering::SeqCst);
        self.frames_tx = None;
        if self.worker.take().is_some() {
            debug!("VAD worker detached");
        }
    }

    fn is_active(&self) -> bool {
        self.worker.is_some()
    }

    fn local_decision(&mut self, _frame: &AudioFrame) -> Option<bool> {
        None
    }

    fn observe(&mut self, frame: &AudioFrame) {
        if let Some(tx) = &self.frames_tx {
            if tx.send(frame.samples.clone()).is_err() {
                debug!("VAD worker gone, frame not scored");
            }
        }
    }
}

impl Drop for NeuralVad {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    loader: Arc<dyn ModelLoader>,
    segmenter: SegmenterConfig,
    mut frames_rx: mpsc::UnboundedReceiver<Vec<f32>>,
    sink: EventSink,
    cancelled: Arc<AtomicBool>,
) {
    let started = Instant::now();
    let loaded = loader.load();
    if cancelled.load(Ordering::SeqCst) {
        debug!("VAD worker cancelled during model load");
        return;
    }
    let mut model = match loaded {
        Ok(model) => model,
        Err(e) => {
            warn!("VAD model '{}' failed to load: {}", loader.name(), e);
            sink.emit(SessionEvent::Vad(VadEvent::ModelFailed(e.to_string())));
            return;
        }
    };
    info!(
        "✅ VAD model '{}' loaded in {:?}",
        loader.name(),
        started.elapsed()
    );

    // Frames captured while the model loaded are stale
    let mut skipped = 0usize;
    while frames_rx.try_recv().is_ok() {
        skipped += 1;
    }
    if skipped > 0 {
        debug!("Skipped {} frames queued during model load", skipped);
    }

    if !sink.emit(SessionEvent::Vad(VadEvent::ModelReady)) {
        return;
    }

    let window = model.window_size().max(1);
    let mut pending: Vec<f32> = Vec::with_capacity(window * 2);
    let mut segmenter = SpeechSegmenter::new(segmenter);

    while let Some(samples) = frames_rx.blocking_recv() {
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        pending.extend_from_slice(&samples);
        while pending.len() >= window {
            let chunk: Vec<f32> = pending.drain(..window).collect();
            let probability = match model.speech_probability(&chunk) {
                Ok(p) => p,
                Err(e) => {
                    debug!("VAD scoring error: {}", e);
                    continue;
                }
            };
            if let Some(decision) = segmenter.process(probability) {
                debug!("VAD boundary {:?} ({:.2})", decision.kind, decision.confidence);
                if !sink.emit(SessionEvent::Vad(VadEvent::Decision(decision))) {
                    return;
                }
            }
        }
    }
    debug!("VAD worker exiting");
}

/// Hybrid strategy: RMS pre-filter plus model confirmation
pub struct HybridVad {
    prefilter: ThresholdVad,
    confirm: NeuralVad,
}

impl HybridVad {
    pub fn new(
        rms_threshold: f32,
        loader: Arc<dyn ModelLoader>,
        segmenter: SegmenterConfig,
    ) -> Self {
        Self {
            prefilter: ThresholdVad::new(rms_threshold),
            confirm: NeuralVad::new(loader, segmenter),
        }
    }
}

impl VadStrategy for HybridVad {
    fn mode(&self) -> VadMode {
        VadMode::Hybrid
    }

    fn start(&mut self, sink: EventSink) -> VoiceResult<()> {
        self.prefilter.start(sink.clone())?;
        self.confirm.start(sink)
    }

    fn stop(&mut self) {
        self.confirm.stop();
        self.prefilter.stop();
    }

    fn is_active(&self) -> bool {
        self.prefilter.is_active()
    }

    fn local_decision(&mut self, frame: &AudioFrame) -> Option<bool> {
        self.prefilter.local_decision(frame)
    }

    fn observe(&mut self, frame: &AudioFrame) {
        self.confirm.observe(frame);
    }
}
