//! Live-capture fingerprint sync.
//!
//! A cancellable background task that owns an audio capture and a
//! [`ContentMatcher`], feeding offset updates into the session over a
//! channel. Dropping the task stops the capture and releases the device —
//! the session never touches audio directly.
//!
//! When the cue file carries microsignature sequences, the task
//! periodically extracts microsignatures from the live window and checks
//! the established offset for drift.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::{CaptureConfig, CaptureHandle, CaptureMode};
use crate::error::Result;
use crate::fingerprint::matcher::{ContentMatcher, MatchOutcome};
use crate::fingerprint::Fingerprinter;
use crate::microsig::extract::MicrosigExtractor;
use crate::microsig::matcher::MicrosigMatcher;
use crate::microsig::MicrosignatureSequence;
use crate::cues::FingerprintBlock;

/// Chunk poll timeout inside the worker.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Drift verification cadence, in matcher windows.
const VERIFY_EVERY_CHUNKS: usize = 20;

/// Drift tolerance for microsignature verification (ms).
const DRIFT_TOLERANCE_MS: i64 = 200;

/// Updates pushed to the owning session.
#[derive(Debug, Clone, PartialEq)]
pub enum FingerprintSyncUpdate {
    Synced { offset_ms: i64, confidence: f32 },
    Lost,
}

enum SyncCmd {
    Seek,
}

/// Handle to the running sync task.
pub struct FingerprintSyncTask {
    running: Arc<AtomicBool>,
    cmd_tx: Sender<SyncCmd>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl FingerprintSyncTask {
    /// Open a live capture and start matching against `block`'s markers.
    ///
    /// Updates arrive on `update_tx`. Fails fast when no capture device is
    /// available; the session then falls back to timestamp-only mode.
    pub fn start(
        block: &FingerprintBlock,
        microsig_reference: Option<Vec<MicrosignatureSequence>>,
        update_tx: mpsc::UnboundedSender<FingerprintSyncUpdate>,
    ) -> Result<Self> {
        let capture = CaptureHandle::start(CaptureConfig {
            sample_rate: block.sample_rate,
            channels: 1,
            chunk_duration: 0.5,
            mode: CaptureMode::Auto,
        })?;

        let native_rate = capture.native_rate();
        let matcher = ContentMatcher::new(
            block.markers.clone(),
            Fingerprinter::resolve(native_rate),
        );

        let running = Arc::new(AtomicBool::new(true));
        let (cmd_tx, cmd_rx) = unbounded::<SyncCmd>();

        let worker_running = Arc::clone(&running);
        let worker = std::thread::Builder::new()
            .name("opencue-fp-sync".into())
            .spawn(move || {
                run_sync_loop(
                    capture,
                    matcher,
                    microsig_reference,
                    native_rate,
                    worker_running,
                    cmd_rx,
                    update_tx,
                );
            })
            .map_err(|e| {
                crate::error::OpenCueError::CaptureUnavailable(format!(
                    "spawn sync worker: {e}"
                ))
            })?;

        info!(native_rate, "fingerprint sync task started");
        Ok(Self {
            running,
            cmd_tx,
            worker: Some(worker),
        })
    }

    /// A seek invalidates the accumulated match state.
    pub fn seek(&self) {
        let _ = self.cmd_tx.send(SyncCmd::Seek);
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for FingerprintSyncTask {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_sync_loop(
    mut capture: CaptureHandle,
    mut matcher: ContentMatcher,
    microsig_reference: Option<Vec<MicrosignatureSequence>>,
    native_rate: u32,
    running: Arc<AtomicBool>,
    cmd_rx: crossbeam_channel::Receiver<SyncCmd>,
    update_tx: mpsc::UnboundedSender<FingerprintSyncUpdate>,
) {
    let base = Instant::now();
    let extractor = MicrosigExtractor::new(native_rate);
    let microsig_matcher = MicrosigMatcher::new();
    let mut verify_window: Vec<f32> = Vec::new();
    let mut chunks_since_verify = 0usize;

    while running.load(Ordering::Acquire) {
        while let Ok(SyncCmd::Seek) = cmd_rx.try_recv() {
            debug!("seek — resetting fingerprint matcher");
            matcher.reset();
            verify_window.clear();
        }

        let Some(chunk) = capture.next_chunk(POLL_TIMEOUT) else {
            if !capture.is_running() {
                warn!("capture ended — fingerprint sync stopping");
                break;
            }
            continue;
        };

        let wall_time_ms = base.elapsed().as_millis() as i64;
        match matcher.add_audio(&chunk.samples, wall_time_ms) {
            MatchOutcome::Synced {
                offset_ms,
                confidence,
                ..
            } => {
                let _ = update_tx.send(FingerprintSyncUpdate::Synced {
                    offset_ms,
                    confidence,
                });
            }
            MatchOutcome::Lost { since_ms } => {
                warn!(since_ms, "fingerprint sync lost");
                let _ = update_tx.send(FingerprintSyncUpdate::Lost);
            }
            MatchOutcome::Buffering | MatchOutcome::Searching => {}
        }

        // Optional drift verification against microsignature references.
        if let Some(reference) = &microsig_reference {
            verify_window.extend_from_slice(&chunk.samples);
            let max_window = native_rate as usize * 10;
            if verify_window.len() > max_window {
                let drop = verify_window.len() - max_window;
                verify_window.drain(..drop);
            }

            chunks_since_verify += 1;
            if chunks_since_verify >= VERIFY_EVERY_CHUNKS {
                chunks_since_verify = 0;
                if let Some(offset_ms) = matcher.offset_ms() {
                    verify_drift(
                        &microsig_matcher,
                        &extractor,
                        reference,
                        &verify_window,
                        wall_time_ms,
                        offset_ms,
                    );
                }
            }
        }
    }

    capture.stop();
    debug!("fingerprint sync loop exited");
}

/// Check the live window against reference sequences; drift is logged, not
/// acted on — fingerprints stay authoritative for the offset.
fn verify_drift(
    microsig_matcher: &MicrosigMatcher,
    extractor: &MicrosigExtractor,
    reference: &[MicrosignatureSequence],
    window: &[f32],
    wall_time_ms: i64,
    offset_ms: i64,
) {
    let window_ms = (window.len() as i64 * 1000) / extractor.sample_rate as i64;
    let live = extractor.extract(window, wall_time_ms - window_ms);
    if live.is_empty() {
        return;
    }

    let content_start = wall_time_ms - window_ms - offset_ms;
    let Some(nearest) = reference.iter().min_by_key(|seq| {
        (seq.start_ms - content_start).abs()
    }) else {
        return;
    };

    let (still_valid, measured) =
        microsig_matcher.verify_sync(nearest, &live, offset_ms, DRIFT_TOLERANCE_MS);
    if still_valid {
        debug!(offset_ms = measured, "microsignature drift check passed");
    } else {
        warn!(
            expected_ms = offset_ms,
            measured_ms = measured,
            "microsignature drift detected"
        );
    }
}
