//! Audio capture via cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! This module satisfies that contract by writing directly into an SPSC ring
//! buffer producer whose `push_slice` is lock-free and allocation-free. A
//! chunker loop on the capture thread slices the ring into fixed-duration
//! chunks and feeds a bounded queue; when the queue is full the oldest chunk
//! is dropped before the new one is enqueued (newest-wins backpressure).
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). The stream is therefore created and dropped on the dedicated
//! capture thread; [`CaptureHandle`] only holds `Send` parts (flags, the
//! chunk receiver, the join handle) and can be moved freely.

pub mod device;
pub mod envelope;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use ringbuf::{
    traits::{Consumer as _, Producer as _, Split},
    HeapRb,
};
use tracing::{error, info, warn};

use crate::error::{OpenCueError, Result};

/// A contiguous block of mono PCM samples at the device's native rate.
///
/// Allocated on the chunker thread, never in the RT callback.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 44100, 48000).
    pub sample_rate: u32,
}

impl AudioChunk {
    /// Duration of this chunk in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.samples.len() as i64 * 1000) / self.sample_rate as i64
    }
}

/// Sample ring capacity: 2^21 f32 samples ≈ 43.7 s at 48 kHz. Enough to
/// ride out a stalled chunker without dropping callback frames.
const SAMPLE_RING_CAPACITY: usize = 1 << 21;

/// Which audio source the capture should open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// System output tap: virtual cable if present, else a loopback device.
    SystemLoopback,
    /// Plain microphone input.
    Microphone,
    /// Try system loopback first, fall back to microphone.
    Auto,
}

impl CaptureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureMode::SystemLoopback => "system_loopback",
            CaptureMode::Microphone => "microphone",
            CaptureMode::Auto => "auto",
        }
    }
}

/// Capture configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Target sample rate downstream consumers want (Hz). Capture itself runs
    /// at the device's native rate; sealed buffers are resampled later.
    pub sample_rate: u32,
    /// Channel count delivered downstream. Always mixed down to 1.
    pub channels: u16,
    /// Chunk duration in seconds.
    pub chunk_duration: f32,
    /// Source selection.
    pub mode: CaptureMode,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            chunk_duration: 0.5,
            mode: CaptureMode::Auto,
        }
    }
}

/// Bounded chunk queue depth. At 0.5 s chunks this is ~50 s of audio.
pub const CHUNK_QUEUE_CAPACITY: usize = 100;

/// Handle to an active capture.
///
/// Dropping the handle stops the capture and releases the device.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    chunks: Receiver<AudioChunk>,
    /// Actual capture sample rate reported by the device (Hz).
    native_rate: u32,
    /// The backend that was actually opened (relevant for `Auto`).
    active_mode: CaptureMode,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl CaptureHandle {
    /// Open a capture per `config`, blocking until the device is confirmed
    /// open (or fails).
    ///
    /// # Errors
    /// Returns `OpenCueError::CaptureUnavailable` when no suitable device can
    /// be opened. Failure here never affects other captures or sessions.
    #[cfg(feature = "audio-cpal")]
    pub fn start(config: CaptureConfig) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (chunk_tx, chunk_rx) = bounded::<AudioChunk>(CHUNK_QUEUE_CAPACITY);
        // The worker keeps a receiver clone so it can evict the oldest chunk
        // when the queue is full (newest-wins).
        let drain_rx = chunk_rx.clone();

        // Sync channel: worker reports open success/failure plus the native
        // rate and resolved mode back to start().
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<(u32, CaptureMode)>>();

        let worker_running = Arc::clone(&running);
        let worker = std::thread::Builder::new()
            .name("opencue-capture".into())
            .spawn(move || capture_worker(config, worker_running, chunk_tx, drain_rx, open_tx))
            .map_err(|e| OpenCueError::CaptureUnavailable(format!("spawn capture thread: {e}")))?;

        match open_rx.recv() {
            Ok(Ok((native_rate, active_mode))) => Ok(Self {
                running,
                chunks: chunk_rx,
                native_rate,
                active_mode,
                worker: Some(worker),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(OpenCueError::CaptureUnavailable(
                    "capture thread died before opening a device".into(),
                ))
            }
        }
    }

    #[cfg(not(feature = "audio-cpal"))]
    pub fn start(_config: CaptureConfig) -> Result<Self> {
        Err(OpenCueError::CaptureUnavailable(
            "compiled without audio-cpal feature".into(),
        ))
    }

    /// Pop the next chunk, waiting up to `timeout`. Returns `None` on timeout
    /// or once the capture has stopped and the queue is drained.
    pub fn next_chunk(&self, timeout: Duration) -> Option<AudioChunk> {
        self.chunks.recv_timeout(timeout).ok()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The device's native capture rate in Hz.
    pub fn native_rate(&self) -> u32 {
        self.native_rate
    }

    /// The backend that was actually opened.
    pub fn active_mode(&self) -> CaptureMode {
        self.active_mode
    }

    /// Stop the capture, release the device, and drain pending chunks.
    ///
    /// Idempotent; subsequent `next_chunk` calls return `None`.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        while self.chunks.try_recv().is_ok() {}
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Enqueue with newest-wins semantics: when the queue is at capacity, evict
/// the oldest entry before pushing the new one.
fn push_newest_wins(tx: &Sender<AudioChunk>, drain: &Receiver<AudioChunk>, chunk: AudioChunk) {
    match tx.try_send(chunk) {
        Ok(()) => {}
        Err(TrySendError::Full(chunk)) => {
            let _ = drain.try_recv();
            if tx.try_send(chunk).is_err() {
                warn!("chunk queue still full after evicting oldest — dropping chunk");
            }
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

#[cfg(feature = "audio-cpal")]
fn capture_worker(
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    chunk_tx: Sender<AudioChunk>,
    drain_rx: Receiver<AudioChunk>,
    open_tx: std::sync::mpsc::Sender<Result<(u32, CaptureMode)>>,
) {
    // SPSC ring between the RT callback (producer) and the chunker below
    // (consumer). Heap-allocated once per capture.
    let (producer, consumer) = HeapRb::<f32>::new(SAMPLE_RING_CAPACITY).split();

    let (stream, native_rate, active_mode) =
        match open_stream(&config, producer, Arc::clone(&running)) {
            Ok(parts) => parts,
            Err(e) => {
                let _ = open_tx.send(Err(e));
                running.store(false, Ordering::Release);
                return;
            }
        };

    if let Err(e) = stream.play() {
        let _ = open_tx.send(Err(OpenCueError::CaptureUnavailable(format!(
            "stream start: {e}"
        ))));
        running.store(false, Ordering::Release);
        return;
    }

    let _ = open_tx.send(Ok((native_rate, active_mode)));
    info!(
        native_rate,
        mode = active_mode.as_str(),
        "audio capture started"
    );

    chunker_loop(
        consumer,
        native_rate,
        config.chunk_duration,
        &running,
        &chunk_tx,
        &drain_rx,
    );

    // Stream drops here, releasing the audio device on this thread.
    drop(stream);
    info!("audio capture stopped");
}

/// Drain the sample ring into fixed-duration chunks until `running` clears.
fn chunker_loop(
    mut consumer: ringbuf::HeapCons<f32>,
    native_rate: u32,
    chunk_duration: f32,
    running: &AtomicBool,
    chunk_tx: &Sender<AudioChunk>,
    drain_rx: &Receiver<AudioChunk>,
) {
    let chunk_samples = ((native_rate as f32 * chunk_duration) as usize).max(1);
    let mut scratch = vec![0f32; chunk_samples];
    let mut accum: Vec<f32> = Vec::with_capacity(chunk_samples * 2);

    while running.load(Ordering::Acquire) {
        let n = consumer.pop_slice(&mut scratch);
        if n == 0 {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }
        accum.extend_from_slice(&scratch[..n]);

        while accum.len() >= chunk_samples {
            let rest = accum.split_off(chunk_samples);
            let chunk = AudioChunk {
                samples: std::mem::replace(&mut accum, rest),
                sample_rate: native_rate,
            };
            push_newest_wins(chunk_tx, drain_rx, chunk);
        }
    }

    // Flush the partial tail so short captures lose nothing.
    if !accum.is_empty() {
        push_newest_wins(
            chunk_tx,
            drain_rx,
            AudioChunk {
                samples: accum,
                sample_rate: native_rate,
            },
        );
    }
}

#[cfg(feature = "audio-cpal")]
fn open_stream(
    config: &CaptureConfig,
    mut producer: ringbuf::HeapProd<f32>,
    running: Arc<AtomicBool>,
) -> Result<(cpal::Stream, u32, CaptureMode)> {
    use cpal::traits::HostTrait;

    let host = cpal::default_host();
    let mut devices: Vec<(String, cpal::Device)> = host
        .input_devices()
        .map_err(|e| OpenCueError::CaptureUnavailable(e.to_string()))?
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
            (name, device)
        })
        .collect();
    if devices.is_empty() {
        return Err(OpenCueError::CaptureUnavailable(
            "no audio input devices".into(),
        ));
    }

    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let cable_idx = devices
        .iter()
        .position(|(name, _)| device::is_virtual_cable_name(name));
    let loopback_idx = devices
        .iter()
        .position(|(name, _)| device::is_loopback_like_name(name));
    let mic_idx = default_name
        .as_deref()
        .and_then(|name| devices.iter().position(|(n, _)| n.as_str() == name))
        .or_else(|| {
            devices
                .iter()
                .position(|(name, _)| !device::is_loopback_like_name(name))
        })
        .or(Some(0));

    let (selected_idx, active_mode) = match config.mode {
        CaptureMode::SystemLoopback => match cable_idx.or(loopback_idx) {
            Some(idx) => (idx, CaptureMode::SystemLoopback),
            None => {
                return Err(OpenCueError::CaptureUnavailable(
                    "no virtual cable or loopback device found".into(),
                ))
            }
        },
        CaptureMode::Microphone => match mic_idx {
            Some(idx) => (idx, CaptureMode::Microphone),
            None => {
                return Err(OpenCueError::CaptureUnavailable(
                    "no microphone input found".into(),
                ))
            }
        },
        CaptureMode::Auto => {
            if let Some(idx) = cable_idx.or(loopback_idx) {
                (idx, CaptureMode::SystemLoopback)
            } else if let Some(idx) = mic_idx {
                warn!("no system loopback source, falling back to microphone");
                (idx, CaptureMode::Microphone)
            } else {
                return Err(OpenCueError::CaptureUnavailable(
                    "no usable capture device".into(),
                ));
            }
        }
    };

    let (selected_name, device) = devices.swap_remove(selected_idx);
    info!(device = selected_name.as_str(), "opening capture device");

    let supported = device
        .default_input_config()
        .map_err(|e| OpenCueError::CaptureUnavailable(e.to_string()))?;

    let native_rate = supported.sample_rate().0;
    let channels = supported.channels();
    info!(native_rate, channels, "capture config selected");

    let stream_config = StreamConfig {
        channels,
        sample_rate: SampleRate(native_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    // A mid-stream read error stops the capture; the chunker loop then exits.
    let err_running = Arc::clone(&running);
    let on_error = move |err: cpal::StreamError| {
        error!("audio stream error: {err}");
        err_running.store(false, Ordering::Release);
    };

    let ch = channels as usize;
    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            let mut mix_buf: Vec<f32> = Vec::new();
            device.build_input_stream(
                &stream_config,
                move |data: &[f32], _info| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    if ch == 1 {
                        let written = producer.push_slice(data);
                        if written < data.len() {
                            warn!("sample ring full: dropped {} frames", data.len() - written);
                        }
                        return;
                    }
                    let frames = data.len() / ch;
                    mix_buf.resize(frames, 0.0);
                    for f in 0..frames {
                        let base = f * ch;
                        let mut sum = 0f32;
                        for c in 0..ch {
                            sum += data[base + c];
                        }
                        mix_buf[f] = sum / ch as f32;
                    }
                    let written = producer.push_slice(&mix_buf);
                    if written < mix_buf.len() {
                        warn!("sample ring full: dropped {} frames", mix_buf.len() - written);
                    }
                },
                on_error,
                None,
            )
        }
        SampleFormat::I16 => {
            let mut mix_buf: Vec<f32> = Vec::new();
            device.build_input_stream(
                &stream_config,
                move |data: &[i16], _info| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    let frames = data.len() / ch;
                    mix_buf.resize(frames, 0.0);
                    for f in 0..frames {
                        let base = f * ch;
                        let mut sum = 0f32;
                        for c in 0..ch {
                            sum += data[base + c] as f32 / 32768.0;
                        }
                        mix_buf[f] = sum / ch as f32;
                    }
                    let written = producer.push_slice(&mix_buf);
                    if written < mix_buf.len() {
                        warn!("sample ring full: dropped {} frames", mix_buf.len() - written);
                    }
                },
                on_error,
                None,
            )
        }
        SampleFormat::U16 => {
            let mut mix_buf: Vec<f32> = Vec::new();
            device.build_input_stream(
                &stream_config,
                move |data: &[u16], _info| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    let frames = data.len() / ch;
                    mix_buf.resize(frames, 0.0);
                    for f in 0..frames {
                        let base = f * ch;
                        let mut sum = 0f32;
                        for c in 0..ch {
                            sum += (data[base + c] as f32 - 32768.0) / 32768.0;
                        }
                        mix_buf[f] = sum / ch as f32;
                    }
                    let written = producer.push_slice(&mix_buf);
                    if written < mix_buf.len() {
                        warn!("sample ring full: dropped {} frames", mix_buf.len() - written);
                    }
                },
                on_error,
                None,
            )
        }
        fmt => {
            return Err(OpenCueError::CaptureUnavailable(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| OpenCueError::CaptureUnavailable(e.to_string()))?;

    Ok((stream, native_rate, active_mode))
}
