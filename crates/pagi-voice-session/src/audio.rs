//! Host audio boundary: microphone capture via CPAL, scheduled playback via Rodio.
//!
//! The session only talks to the [`AudioHost`], [`Microphone`] and
//! [`PlaybackOutput`] traits; [`SystemAudioHost`] is the bare-metal implementation.

use crate::config::AudioConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::events::{EventSink, SessionEvent};
use crate::playback::SourceId;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One fixed-size chunk of captured PCM
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// When the frame was captured
    pub timestamp: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            timestamp: Instant::now(),
        }
    }

    /// Root-mean-square energy of the frame.
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }
}

/// Root-mean-square energy; 0.0 for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// An acquired microphone. Capture begins on `start` and ends on `release`.
pub trait Microphone {
    /// Begin delivering [`SessionEvent::CaptureFrame`]s to `sink`.
    fn start(&mut self, sink: EventSink) -> VoiceResult<()>;

    /// Stop capture and give the device back.
    fn release(&mut self);
}

/// An acquired speaker with its own audio clock.
pub trait PlaybackOutput {
    /// Audio clock in seconds. Does not advance before `resume`.
    fn current_time(&self) -> f64;

    /// Start the audio clock.
    fn resume(&mut self);

    /// Schedule `samples` to begin at `start_at` on the audio clock.
    fn start_source(
        &mut self,
        id: SourceId,
        samples: Vec<f32>,
        sample_rate: u32,
        start_at: f64,
    ) -> VoiceResult<()>;

    /// Stop one source immediately, whether or not it has started.
    fn stop_source(&mut self, id: SourceId);

    /// Sources that finished naturally since the last poll.
    fn poll_finished(&mut self) -> Vec<SourceId>;

    /// Stop everything and give the device back.
    fn release(&mut self);
}

/// Provider of microphone and speaker handles
pub trait AudioHost {
    fn acquire_microphone(&mut self, config: &AudioConfig) -> VoiceResult<Box<dyn Microphone>>;
    fn acquire_speaker(&mut self, config: &AudioConfig) -> VoiceResult<Box<dyn PlaybackOutput>>;
}

/// Default input/output devices of the machine
#[derive(Debug, Default)]
pub struct SystemAudioHost;

impl AudioHost for SystemAudioHost {
    fn acquire_microphone(&mut self, config: &AudioConfig) -> VoiceResult<Box<dyn Microphone>> {
        Ok(Box::new(CpalMicrophone::new(config.clone())?))
    }

    fn acquire_speaker(&mut self, _config: &AudioConfig) -> VoiceResult<Box<dyn PlaybackOutput>> {
        Ok(Box::new(RodioPlayback::new()?))
    }
}

/// Microphone capture using CPAL
pub struct CpalMicrophone {
    config: AudioConfig,
    device: Device,
    stream_config: StreamConfig,
    stream: Option<Stream>,
}

impl CpalMicrophone {
    /// Acquire the default input device.
    pub fn new(config: AudioConfig) -> VoiceResult<Self> {
        info!(
            "🎤 Acquiring microphone ({}Hz, {} channels, {} sample frames)",
            config.sample_rate, config.channels, config.frame_size
        );

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;

        info!(
            "📱 Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        // Fails fast when the device is present but unusable
        let default_config = device.default_input_config()?;
        debug!("Default input config: {:?}", default_config);

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(config.frame_size as u32),
        };

        Ok(Self {
            config,
            device,
            stream_config,
            stream: None,
        })
    }
}

impl Microphone for CpalMicrophone {
    fn start(&mut self, sink: EventSink) -> VoiceResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        info!("▶️ Starting audio capture stream");

        let frame_size = self.config.frame_size;
        let channels = self.config.channels.max(1) as usize;
        let mut frame_buffer = Vec::with_capacity(frame_size);
        let frame_sink = sink.clone();

        let stream = self.device.build_input_stream(
            &self.stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Downmix interleaved channels, then cut into fixed frames
                for chunk in data.chunks(channels) {
                    let sample = chunk.iter().sum::<f32>() / chunk.len() as f32;
                    frame_buffer.push(sample);

                    if frame_buffer.len() >= frame_size {
                        let frame = AudioFrame::new(std::mem::replace(
                            &mut frame_buffer,
                            Vec::with_capacity(frame_size),
                        ));
                        if !frame_sink.emit(SessionEvent::CaptureFrame(frame)) {
                            debug!("Session loop gone, dropping captured frame");
                        }
                    }
                }
            },
            move |err| {
                warn!("Audio stream error: {}", err);
                sink.emit(SessionEvent::CaptureError(err.to_string()));
            },
            None,
        )?;

        stream.play()?;
        self.stream = Some(stream);

        info!("✅ Audio capture started");
        Ok(())
    }

    fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!("Pausing capture stream failed: {}", e);
            }
        }
        info!("⏹️ Microphone released");
    }
}

/// List available input devices
pub fn list_input_devices() -> VoiceResult<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.input_devices()?;

    let mut device_names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            device_names.push(name);
        }
    }

    Ok(device_names)
}

/// Scheduled playback using Rodio: one `Sink` per source, delayed to its start time.
pub struct RodioPlayback {
    _stream: OutputStream,
    handle: OutputStreamHandle,
    clock_origin: Option<std::time::Instant>,
    sinks: HashMap<SourceId, Sink>,
}

impl RodioPlayback {
    /// Open the default output device.
    pub fn new() -> VoiceResult<Self> {
        info!("🔊 Acquiring speaker");

        let (stream, handle) =
            OutputStream::try_default().map_err(|e| VoiceError::Playback(e.to_string()))?;

        info!("✅ Speaker ready");

        Ok(Self {
            _stream: stream,
            handle,
            clock_origin: None,
            sinks: HashMap::new(),
        })
    }
}

impl PlaybackOutput for RodioPlayback {
    fn current_time(&self) -> f64 {
        self.clock_origin
            .map(|origin| origin.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn resume(&mut self) {
        if self.clock_origin.is_none() {
            self.clock_origin = Some(std::time::Instant::now());
        }
    }

    fn start_source(
        &mut self,
        id: SourceId,
        samples: Vec<f32>,
        sample_rate: u32,
        start_at: f64,
    ) -> VoiceResult<()> {
        let delay = (start_at - self.current_time()).max(0.0);
        let sink = Sink::try_new(&self.handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        let source = rodio::buffer::SamplesBuffer::new(1, sample_rate, samples)
            .delay(Duration::from_secs_f64(delay));
        sink.append(source);
        self.sinks.insert(id, sink);
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) {
        if let Some(sink) = self.sinks.remove(&id) {
            sink.stop();
        }
    }

    fn poll_finished(&mut self) -> Vec<SourceId> {
        let finished: Vec<SourceId> = self
            .sinks
            .iter()
            .filter(|(_, sink)| sink.empty())
            .map(|(id, _)| *id)
            .collect();
        for id in &finished {
            self.sinks.remove(id);
        }
        finished
    }

    fn release(&mut self) {
        for (_, sink) in self.sinks.drain() {
            sink.stop();
        }
        info!("⏹️ Speaker released");
    }
}
