//! Per-application volume envelope capture.
//!
//! The envelope is a low-rate time series of loudness peaks read from an
//! OS-level per-application meter. No audio leaves the meter — only peak
//! values — which makes the envelope safe to persist alongside a cue file
//! and cheap to correlate against during playback for sync verification.
//!
//! The meter itself is an external collaborator behind [`LoudnessMeter`];
//! the sampler thread polls it at a fixed rate and timestamps samples from
//! a caller-supplied monotonic base.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A recorded volume envelope (loudness over time).
///
/// `samples` and `timestamps_ms` are parallel arrays of equal length.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeEnvelope {
    pub samples: Vec<f32>,
    pub timestamps_ms: Vec<i64>,
    pub sample_rate_hz: f32,
    pub start_time_ms: i64,
}

impl VolumeEnvelope {
    pub fn new(sample_rate_hz: f32, start_time_ms: i64) -> Self {
        Self {
            samples: Vec::new(),
            timestamps_ms: Vec::new(),
            sample_rate_hz,
            start_time_ms,
        }
    }

    pub fn push(&mut self, peak: f32, timestamp_ms: i64) {
        self.samples.push(peak);
        self.timestamps_ms.push(timestamp_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A per-application loudness meter.
///
/// Implementations wrap whatever the platform exposes (WASAPI session
/// meters, PulseAudio sink inputs). The sampler tolerates the meter being
/// absent and re-acquires after read errors.
pub trait LoudnessMeter: Send + 'static {
    /// Attach to the target application's audio session. Returns `false`
    /// when no matching session exists yet.
    fn acquire(&mut self) -> bool;

    /// Read the current peak in [0, 1]. `None` signals a read error; the
    /// sampler will drop the handle and re-acquire.
    fn peak(&mut self) -> Option<f32>;
}

/// Default sampling rate for recordings (Hz).
pub const DEFAULT_ENVELOPE_RATE_HZ: f32 = 50.0;

/// Background sampler appending `(timestamp, peak)` pairs at a fixed rate.
pub struct EnvelopeSampler {
    running: Arc<AtomicBool>,
    envelope: Arc<Mutex<VolumeEnvelope>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl EnvelopeSampler {
    /// Start sampling. `start_time_ms` anchors timestamps to content time
    /// (the video position when the recording began).
    pub fn start(
        mut meter: Box<dyn LoudnessMeter>,
        sample_rate_hz: f32,
        start_time_ms: i64,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let envelope = Arc::new(Mutex::new(VolumeEnvelope::new(
            sample_rate_hz,
            start_time_ms,
        )));

        let worker_running = Arc::clone(&running);
        let worker_envelope = Arc::clone(&envelope);
        let interval = Duration::from_secs_f32(1.0 / sample_rate_hz.max(1.0));

        let worker = std::thread::Builder::new()
            .name("opencue-envelope".into())
            .spawn(move || {
                let base = Instant::now();
                let mut acquired = meter.acquire();
                if !acquired {
                    // Meter not found: sampling idles until the session appears.
                    debug!("loudness meter not found — envelope sampler idling");
                }

                while worker_running.load(Ordering::Acquire) {
                    if !acquired {
                        acquired = meter.acquire();
                    }
                    if acquired {
                        let timestamp_ms = start_time_ms + base.elapsed().as_millis() as i64;
                        match meter.peak() {
                            Some(peak) => {
                                worker_envelope.lock().push(peak.clamp(0.0, 1.0), timestamp_ms)
                            }
                            None => {
                                warn!("loudness meter read failed — re-acquiring");
                                acquired = false;
                            }
                        }
                    }
                    std::thread::sleep(interval);
                }
            })
            .expect("spawn envelope sampler thread");

        info!(sample_rate_hz, start_time_ms, "envelope sampler started");
        Self {
            running,
            envelope,
            worker: Some(worker),
        }
    }

    /// Stop sampling and return the captured envelope.
    pub fn stop(mut self) -> VolumeEnvelope {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let envelope = std::mem::take(&mut *self.envelope.lock());
        info!(samples = envelope.len(), "envelope sampler stopped");
        envelope
    }
}

impl Drop for EnvelopeSampler {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Matches a live peak window against a stored envelope.
pub struct EnvelopeMatcher {
    reference: VolumeEnvelope,
    ref_norm: Vec<f32>,
}

impl EnvelopeMatcher {
    pub fn new(reference: VolumeEnvelope) -> Self {
        let ref_norm = normalize(&reference.samples).unwrap_or_default();
        Self {
            reference,
            ref_norm,
        }
    }

    /// Find the reference position best matching `live` peaks.
    ///
    /// Returns `(position_ms, confidence)`; confidence 0 means no usable
    /// signal on either side.
    pub fn find_position(&self, live: &[f32]) -> (i64, f32) {
        if live.len() < 10 || self.ref_norm.len() < live.len() {
            return (0, 0.0);
        }
        let Some(live_norm) = normalize(live) else {
            return (0, 0.0);
        };
        if self.ref_norm.is_empty() {
            return (0, 0.0);
        }

        // Valid-mode cross-correlation.
        let mut best_idx = 0usize;
        let mut best_corr = f32::MIN;
        for start in 0..=(self.ref_norm.len() - live_norm.len()) {
            let corr: f32 = self.ref_norm[start..start + live_norm.len()]
                .iter()
                .zip(&live_norm)
                .map(|(a, b)| a * b)
                .sum();
            if corr > best_corr {
                best_corr = corr;
                best_idx = start;
            }
        }

        let confidence = (best_corr / live_norm.len() as f32).clamp(0.0, 1.0);
        let position_ms = self
            .reference
            .timestamps_ms
            .get(best_idx)
            .copied()
            .unwrap_or_else(|| {
                (best_idx as f64 * 1000.0 / self.reference.sample_rate_hz as f64) as i64
            });

        (position_ms, confidence)
    }
}

fn normalize(samples: &[f32]) -> Option<Vec<f32>> {
    let n = samples.len() as f32;
    if n == 0.0 {
        return None;
    }
    let mean = samples.iter().sum::<f32>() / n;
    let var = samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f32>() / n;
    let std = var.sqrt();
    if std <= 1e-3 {
        return None; // No meaningful signal
    }
    Some(samples.iter().map(|s| (s - mean) / std).collect())
}
