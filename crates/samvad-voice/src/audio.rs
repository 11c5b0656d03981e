//! Audio capture and playback using CPAL and Rodio.
//!
//! Capture runs on a dedicated thread (cpal streams are not `Send` on every
//! platform) and hands fixed-size PCM frames to the analyzer over a channel
//! while accumulating the full take. Stopping the handle releases the device
//! and encodes the accumulated PCM into a [`RecordingClip`] (16-bit WAV).
//!
//! Both ends are behind traits so the conversation loop can be driven by
//! scripted doubles in tests.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use rodio::{OutputStream, Sink, Source};
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Audio capture configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Frame size in samples handed to the analyzer (default: 1600, i.e.
    /// 100ms at 16kHz).
    pub chunk_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            chunk_size: 1600,
        }
    }
}

/// One PCM frame from the live stream.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,
}

/// A completed recording: encoded bytes plus their MIME type.
#[derive(Debug, Clone)]
pub struct RecordingClip {
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl RecordingClip {
    pub fn wav(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime: "audio/wav".to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Source of microphone audio. Production impl is [`CpalInput`].
pub trait AudioInput: Send + Sync {
    /// Acquire the device and start capturing. Fails with
    /// [`VoiceError::PermissionDenied`] when access is refused or no device
    /// exists; the caller reports that and performs no state transition.
    fn open(&self) -> VoiceResult<Box<dyn CaptureHandle>>;
}

/// A live capture span. Dropping or stopping it releases the device.
pub trait CaptureHandle: Send {
    /// Take the live PCM frame receiver (available exactly once).
    fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<AudioChunk>>;

    /// Stop capturing, release the device, and yield the completed clip.
    fn stop(self: Box<Self>) -> VoiceResult<RecordingClip>;
}

/// Microphone capture via the default CPAL input device.
pub struct CpalInput {
    config: AudioConfig,
}

impl CpalInput {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }
}

impl AudioInput for CpalInput {
    fn open(&self) -> VoiceResult<Box<dyn CaptureHandle>> {
        let config = self.config.clone();
        let samples: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<VoiceResult<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let shared = Arc::clone(&samples);
        let thread = thread::spawn(move || {
            let device = match cpal::default_host().default_input_device() {
                Some(d) => d,
                None => {
                    let _ = ready_tx.send(Err(VoiceError::PermissionDenied(
                        "no input device available".to_string(),
                    )));
                    return;
                }
            };
            info!(
                "capture: using input device {}",
                device.name().unwrap_or_else(|_| "unknown".to_string())
            );

            let stream_config = StreamConfig {
                channels: config.channels,
                sample_rate: cpal::SampleRate(config.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let chunk_size = config.chunk_size;
            let mut frame = Vec::with_capacity(chunk_size);
            let stream = device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    shared
                        .lock()
                        .expect("capture buffer lock poisoned")
                        .extend_from_slice(data);
                    for &sample in data {
                        frame.push(sample);
                        if frame.len() >= chunk_size {
                            let _ = frame_tx.send(AudioChunk {
                                samples: std::mem::take(&mut frame),
                            });
                        }
                    }
                },
                |err| warn!("capture: stream error: {}", err),
                None,
            );

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::PermissionDenied(e.to_string())));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(VoiceError::PermissionDenied(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Hold the stream alive until the handle stops or drops.
            let _ = stop_rx.recv();
            drop(stream);
            debug!("capture: device released");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(VoiceError::Capture(
                    "capture thread exited before reporting readiness".to_string(),
                ))
            }
        }

        Ok(Box::new(CpalCaptureHandle {
            frames: Some(frame_rx),
            samples,
            sample_rate: self.config.sample_rate,
            stop_tx,
            thread: Some(thread),
        }))
    }
}

struct CpalCaptureHandle {
    frames: Option<mpsc::UnboundedReceiver<AudioChunk>>,
    samples: Arc<Mutex<Vec<f32>>>,
    sample_rate: u32,
    stop_tx: std::sync::mpsc::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureHandle for CpalCaptureHandle {
    fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<AudioChunk>> {
        self.frames.take()
    }

    fn stop(mut self: Box<Self>) -> VoiceResult<RecordingClip> {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let pcm = std::mem::take(
            &mut *self
                .samples
                .lock()
                .map_err(|_| VoiceError::Capture("capture buffer lock poisoned".to_string()))?,
        );
        debug!("capture: stopped with {} samples", pcm.len());
        Ok(RecordingClip::wav(pcm_f32_to_wav(&pcm, self.sample_rate)))
    }
}

impl Drop for CpalCaptureHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

/// Encode f32 PCM (mono) to 16-bit WAV bytes for API upload.
pub fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let num_samples = samples.len();
    let data_len = num_samples * 2; // 16-bit = 2 bytes per sample
    let header_len = 44u32;
    let file_len = header_len + data_len as u32;

    let mut buf = Vec::with_capacity(44 + data_len);
    // RIFF header
    buf.write_all(b"RIFF").unwrap();
    buf.write_all(&(file_len - 8).to_le_bytes()).unwrap();
    buf.write_all(b"WAVE").unwrap();
    // fmt subchunk
    buf.write_all(b"fmt ").unwrap();
    buf.write_all(&16u32.to_le_bytes()).unwrap(); // subchunk1 size
    buf.write_all(&1u16.to_le_bytes()).unwrap(); // PCM
    buf.write_all(&1u16.to_le_bytes()).unwrap(); // mono
    buf.write_all(&sample_rate.to_le_bytes()).unwrap();
    buf.write_all(&(sample_rate * 2).to_le_bytes()).unwrap(); // byte rate
    buf.write_all(&2u16.to_le_bytes()).unwrap(); // block align
    buf.write_all(&16u16.to_le_bytes()).unwrap(); // bits per sample
    // data subchunk
    buf.write_all(b"data").unwrap();
    buf.write_all(&(data_len as u32).to_le_bytes()).unwrap();
    for &s in samples {
        let clamped = s.clamp(-1.0, 1.0);
        let i = (clamped * 32767.0).round() as i16;
        buf.write_all(&i.to_le_bytes()).unwrap();
    }
    buf
}

/// Plays synthesized replies. `stop()` is the interruption kill-switch: it
/// clears the queue immediately and unblocks any waiter.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Queue encoded audio bytes for playback. Empty payloads are a no-op.
    fn play(&self, bytes: Vec<u8>) -> VoiceResult<()>;

    /// Stop playback immediately and clear the queue.
    fn stop(&self);

    /// Whether the sink currently has queued samples.
    fn is_playing(&self) -> bool;

    /// Resolve once all queued audio has drained (naturally or via `stop`).
    async fn wait_until_done(&self);
}

/// Playback over the default Rodio output device.
///
/// The `OutputStream` lives on its own thread (it is not `Send`); the `Sink`
/// is shared and safe to drive from async code.
pub struct RodioPlayback {
    sink: Arc<Sink>,
    _keepalive: std::sync::mpsc::Sender<()>,
}

impl RodioPlayback {
    pub fn new() -> VoiceResult<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<VoiceResult<Arc<Sink>>>();
        let (keepalive, park) = std::sync::mpsc::channel::<()>();

        thread::spawn(move || {
            let (stream, handle) = match OutputStream::try_default() {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                    return;
                }
            };
            let sink = match Sink::try_new(&handle) {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(Arc::clone(&sink)));
            // Keep the output stream alive until the playback handle drops.
            let _ = park.recv();
            drop(stream);
        });

        let sink = ready_rx
            .recv()
            .map_err(|_| VoiceError::Playback("output thread exited".to_string()))??;
        info!("playback: sink ready");
        Ok(Self {
            sink,
            _keepalive: keepalive,
        })
    }
}

#[async_trait]
impl PlaybackSink for RodioPlayback {
    fn play(&self, bytes: Vec<u8>) -> VoiceResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let source = rodio::Decoder::new(Cursor::new(bytes))
            .map_err(|e| VoiceError::Playback(format!("decode failed: {}", e)))?;
        self.sink.append(source.convert_samples::<f32>());
        Ok(())
    }

    fn stop(&self) {
        self.sink.stop();
        debug!("playback: stopped");
    }

    fn is_playing(&self) -> bool {
        !self.sink.empty()
    }

    async fn wait_until_done(&self) {
        let sink = Arc::clone(&self.sink);
        let _ = tokio::task::spawn_blocking(move || sink.sleep_until_end()).await;
    }
}
