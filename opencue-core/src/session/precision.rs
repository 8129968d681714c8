//! Precision recording: capture + transcription → word-accurate cue files.
//!
//! The recorder is a process-lifetime service shared by all sessions. One
//! recording may be active at a time; it owns a capture handle (drained by
//! a collector thread), an optional envelope sampler, and — once stopped —
//! runs the seal pipeline: concatenate, resample the *full* buffer to the
//! transcriber rate, normalise, optionally persist a WAV, transcribe, build
//! cues, attach sync metadata, and hand the file to the catalogue.
//!
//! `stop` and `transcribe` are blocking; sessions call them through
//! `spawn_blocking` so the cooperative scheduler never stalls.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{info, warn};

use crate::audio::device::list_input_devices;
use crate::audio::envelope::{EnvelopeSampler, LoudnessMeter, DEFAULT_ENVELOPE_RATE_HZ};
use crate::audio::resample::{normalize_peak, resample_sealed};
use crate::audio::{CaptureConfig, CaptureHandle, CaptureMode};
use crate::cues::catalog::CatalogManager;
use crate::cues::{sanitize_title, CueFile, FingerprintBlock};
use crate::error::{OpenCueError, Result};
use crate::fingerprint::{FingerprintMarker, Fingerprinter};
use crate::lexicon::Lexicon;
use crate::proto::messages::{
    PrecisionAbortedPayload, PrecisionRequirementsPayload, PrecisionStartedPayload,
    PrecisionStatusPayload, PrecisionStoppedPayload,
};
use crate::transcribe::{cues_from_transcription, CuePads, TranscriberHandle};

/// Fingerprint marker spacing over the sealed buffer (ms).
const FINGERPRINT_WINDOW_MS: i64 = 5000;

/// Peak normalisation target and gain cap for sealed buffers.
const NORMALIZE_TARGET: f32 = 0.9;
const NORMALIZE_MAX_GAIN: f32 = 10.0;

/// Configuration for one precision recording.
#[derive(Debug, Clone)]
pub struct PrecisionConfig {
    /// Prefer the virtual-cable tap (silent recording).
    pub use_virtual_cable: bool,
    /// Transcriber model name, forwarded as-is.
    pub whisper_model: String,
    /// Playback speed the title is being watched at.
    pub playback_speed: f32,
    /// Rate the transcriber wants (sealed buffer is resampled to this).
    pub sample_rate: u32,
    /// Capture chunk duration in seconds.
    pub chunk_duration: f32,
    /// Persist the captured audio as WAV next to the cue file.
    pub save_audio: bool,
    /// Video position when the recording started; added to every cue time.
    pub video_start_position_ms: i64,
    /// Sample the per-application loudness meter alongside the capture.
    pub capture_volume_envelope: bool,
    /// Generate fingerprint markers from the sealed buffer.
    pub capture_fingerprints: bool,
    /// Transcription language hint.
    pub language: String,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        Self {
            use_virtual_cable: true,
            whisper_model: "base".into(),
            playback_speed: 1.0,
            sample_rate: 16_000,
            chunk_duration: 0.5,
            save_audio: true,
            video_start_position_ms: 0,
            capture_volume_envelope: true,
            capture_fingerprints: true,
            language: "en".into(),
        }
    }
}

/// Factory producing a fresh loudness meter per recording.
pub type MeterFactory = Box<dyn Fn() -> Box<dyn LoudnessMeter> + Send + Sync>;

struct ActiveRecording {
    id: String,
    title: String,
    content_id: String,
    config: PrecisionConfig,
    started_at: chrono::DateTime<Utc>,
    native_rate: u32,
    stop_flag: Arc<AtomicBool>,
    chunks: Arc<Mutex<Vec<Vec<f32>>>>,
    collector: std::thread::JoinHandle<()>,
    envelope: Option<EnvelopeSampler>,
}

#[derive(Debug, Clone)]
struct RecordingRecord {
    title: String,
    status: &'static str,
    duration_ms: i64,
    chunks_captured: usize,
    error: Option<String>,
}

/// Process-wide precision recording service.
pub struct PrecisionRecorder {
    catalog: Arc<CatalogManager>,
    lexicon: Arc<Lexicon>,
    transcriber: Option<TranscriberHandle>,
    meter_factory: Option<MeterFactory>,
    active: Mutex<Option<ActiveRecording>>,
    history: Mutex<HashMap<String, RecordingRecord>>,
}

impl PrecisionRecorder {
    pub fn new(
        catalog: Arc<CatalogManager>,
        lexicon: Arc<Lexicon>,
        transcriber: Option<TranscriberHandle>,
        meter_factory: Option<MeterFactory>,
    ) -> Self {
        Self {
            catalog,
            lexicon,
            transcriber,
            meter_factory,
            active: Mutex::new(None),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Report whether a recording could start, with setup instructions for
    /// anything missing.
    pub fn check_requirements(&self) -> PrecisionRequirementsPayload {
        let devices = list_input_devices();
        let virtual_cable = devices.iter().any(|d| d.is_virtual_cable);
        let loopback = devices.iter().any(|d| d.is_loopback_like);
        let capture_available = !devices.is_empty();
        let transcriber_available = self.transcriber.is_some();

        let mut instructions = Vec::new();
        if !capture_available {
            instructions.push("No audio input devices found — check OS audio settings".into());
        } else if !virtual_cable && !loopback {
            instructions.push(
                "Install a virtual audio cable (or enable a loopback device) for silent system-audio capture"
                    .into(),
            );
        }
        if !transcriber_available {
            instructions.push("Configure a speech transcriber to enable cue generation".into());
        }

        PrecisionRequirementsPayload {
            ready: capture_available && transcriber_available,
            capture_available,
            virtual_cable,
            loopback,
            transcriber_available,
            instructions,
        }
    }

    /// Start a recording. Capture failure is surfaced to the caller as a
    /// structured failure; no state changes.
    pub fn start(
        &self,
        title: &str,
        content_id: &str,
        config: PrecisionConfig,
    ) -> Result<PrecisionStartedPayload> {
        {
            let active = self.active.lock();
            if let Some(rec) = active.as_ref() {
                return Err(OpenCueError::InvalidState(format!(
                    "recording {} already in progress",
                    rec.id
                )));
            }
        }

        if self.transcriber.is_none() {
            let requirements = self.check_requirements();
            return Ok(PrecisionStartedPayload {
                success: false,
                recording_id: None,
                title: None,
                whisper_model: None,
                error: Some("transcriber not configured".into()),
                instructions: requirements.instructions,
            });
        }

        let mode = if config.use_virtual_cable {
            CaptureMode::SystemLoopback
        } else {
            CaptureMode::Auto
        };
        let capture = CaptureHandle::start(CaptureConfig {
            sample_rate: config.sample_rate,
            channels: 1,
            chunk_duration: config.chunk_duration,
            mode,
        })?;
        let native_rate = capture.native_rate();

        let id = format!("rec_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let chunks: Arc<Mutex<Vec<Vec<f32>>>> = Arc::new(Mutex::new(Vec::new()));

        let collector = {
            let stop_flag = Arc::clone(&stop_flag);
            let chunks = Arc::clone(&chunks);
            std::thread::Builder::new()
                .name("opencue-collector".into())
                .spawn(move || {
                    let mut capture = capture;
                    while !stop_flag.load(Ordering::Acquire) && capture.is_running() {
                        if let Some(chunk) = capture.next_chunk(Duration::from_secs(1)) {
                            chunks.lock().push(chunk.samples);
                        }
                    }
                    capture.stop();
                })
                .map_err(|e| OpenCueError::CaptureUnavailable(format!("spawn collector: {e}")))?
        };

        let envelope = if config.capture_volume_envelope {
            self.meter_factory.as_ref().map(|factory| {
                EnvelopeSampler::start(
                    factory(),
                    DEFAULT_ENVELOPE_RATE_HZ,
                    config.video_start_position_ms,
                )
            })
        } else {
            None
        };

        info!(
            id = id.as_str(),
            title,
            native_rate,
            playback_speed = config.playback_speed,
            video_offset_ms = config.video_start_position_ms,
            "precision recording started"
        );

        let payload = PrecisionStartedPayload {
            success: true,
            recording_id: Some(id.clone()),
            title: Some(title.to_string()),
            whisper_model: Some(config.whisper_model.clone()),
            error: None,
            instructions: Vec::new(),
        };

        *self.active.lock() = Some(ActiveRecording {
            id,
            title: title.to_string(),
            content_id: content_id.to_string(),
            config,
            started_at: Utc::now(),
            native_rate,
            stop_flag,
            chunks,
            collector,
            envelope,
        });

        Ok(payload)
    }

    /// Stop and seal. Blocking — run under `spawn_blocking`.
    pub fn stop(&self, recording_id: Option<&str>) -> Result<PrecisionStoppedPayload> {
        let rec = self.take_active(recording_id)?;
        let id = rec.id.clone();
        let title = rec.title.clone();

        let envelope = rec.envelope.map(|sampler| sampler.stop());
        rec.stop_flag.store(true, Ordering::Release);
        let _ = rec.collector.join();

        let chunk_list = std::mem::take(&mut *rec.chunks.lock());
        info!(
            id = id.as_str(),
            chunks = chunk_list.len(),
            "precision recording stopped — processing"
        );

        if chunk_list.is_empty() {
            self.record_history(&id, &title, "failed", 0, 0, Some("No audio captured".into()));
            return Ok(PrecisionStoppedPayload {
                success: false,
                recording_id: Some(id),
                cue_file: None,
                cue_count: None,
                word_count: None,
                duration_ms: None,
                audio_path: None,
                error: Some("No audio captured".into()),
            });
        }

        let chunks_captured = chunk_list.len();
        let mut audio: Vec<f32> = chunk_list.into_iter().flatten().collect();

        // Resample the whole sealed buffer, never per-chunk.
        if rec.native_rate != rec.config.sample_rate {
            audio = resample_sealed(&audio, rec.native_rate, rec.config.sample_rate)?;
        }
        normalize_peak(&mut audio, NORMALIZE_TARGET, NORMALIZE_MAX_GAIN);

        let audio_ms = (audio.len() as i64 * 1000) / rec.config.sample_rate as i64;
        let scaled_ms = (audio_ms as f32 * rec.config.playback_speed) as i64;

        let audio_path = if rec.config.save_audio {
            match self.save_wav(&rec.title, &audio, rec.config.sample_rate) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("could not save recording audio: {e}");
                    None
                }
            }
        } else {
            None
        };

        let transcriber = self
            .transcriber
            .clone()
            .ok_or(OpenCueError::TranscriberUnavailable)?;
        let transcription = {
            let mut engine = transcriber.0.lock();
            engine.transcribe(
                &audio,
                rec.config.sample_rate,
                &rec.config.language,
                rec.config.playback_speed,
            )
        };
        let transcription = match transcription {
            Ok(t) => t,
            Err(e) => {
                // Captured audio (if persisted) survives a transcription failure.
                self.record_history(
                    &id,
                    &title,
                    "failed",
                    scaled_ms,
                    chunks_captured,
                    Some(e.to_string()),
                );
                return Ok(PrecisionStoppedPayload {
                    success: false,
                    recording_id: Some(id),
                    cue_file: None,
                    cue_count: None,
                    word_count: None,
                    duration_ms: None,
                    audio_path,
                    error: Some(format!("Transcription failed: {e}")),
                });
            }
        };

        let video_offset = rec.config.video_start_position_ms;
        let cues = cues_from_transcription(
            &transcription,
            &self.lexicon,
            video_offset,
            CuePads::default(),
        );
        info!(
            words = transcription.words.len(),
            cues = cues.len(),
            "transcription processed"
        );

        let mut file = CueFile::new(rec.title.clone());
        file.content.content_id = Some(rec.content_id.clone());
        let max_cue_end = cues.iter().map(|c| c.end_ms).max().unwrap_or(0);
        file.content.duration_ms = (video_offset + scaled_ms).max(max_cue_end);
        file.cues = cues;

        if rec.config.capture_fingerprints {
            file.fingerprints =
                build_fingerprints(&audio, rec.config.sample_rate, video_offset);
        }
        if let Some(env) = envelope.filter(|e| !e.is_empty()) {
            file.volume_envelope = Some(env);
        }

        file.metadata.insert("created".into(), json!(Utc::now().to_rfc3339()));
        file.metadata
            .insert("recorded_at".into(), json!(rec.started_at.to_rfc3339()));
        file.metadata
            .insert("creator".into(), json!("precision recorder"));
        file.metadata
            .insert("source".into(), json!("whisper_transcription"));
        file.metadata
            .insert("whisper_model".into(), json!(rec.config.whisper_model));
        file.metadata
            .insert("playback_speed".into(), json!(rec.config.playback_speed));
        file.metadata
            .insert("word_count".into(), json!(transcription.words.len()));
        file.metadata.insert(
            "video_start_position_ms".into(),
            json!(video_offset),
        );
        let mut excerpt = transcription.text.clone();
        if excerpt.len() > 1000 {
            excerpt.truncate(1000);
            excerpt.push_str("...");
        }
        file.metadata.insert(
            "transcription".into(),
            json!({ "full_text": excerpt, "language": transcription.language }),
        );

        let cue_count = file.cues.len();
        let path = self.catalog.add(&file, &sanitize_title(&rec.title))?;

        self.record_history(&id, &title, "complete", scaled_ms, chunks_captured, None);
        Ok(PrecisionStoppedPayload {
            success: true,
            recording_id: Some(id),
            cue_file: Some(path.display().to_string()),
            cue_count: Some(cue_count),
            word_count: Some(transcription.words.len()),
            duration_ms: Some(scaled_ms),
            audio_path,
            error: None,
        })
    }

    /// Abort without processing; captured state is discarded.
    pub fn abort(&self, recording_id: Option<&str>) -> PrecisionAbortedPayload {
        match self.take_active(recording_id) {
            Ok(rec) => {
                if let Some(sampler) = rec.envelope {
                    drop(sampler);
                }
                rec.stop_flag.store(true, Ordering::Release);
                let _ = rec.collector.join();
                let chunks = rec.chunks.lock().len();
                self.record_history(&rec.id, &rec.title, "aborted", 0, chunks, None);
                info!(id = rec.id.as_str(), "precision recording aborted");
                PrecisionAbortedPayload {
                    success: true,
                    recording_id: Some(rec.id),
                    error: None,
                }
            }
            Err(e) => PrecisionAbortedPayload {
                success: false,
                recording_id: recording_id.map(String::from),
                error: Some(e.to_string()),
            },
        }
    }

    pub fn status(&self, recording_id: Option<&str>) -> PrecisionStatusPayload {
        let active = self.active.lock();
        if let Some(rec) = active.as_ref() {
            if recording_id.map(|id| id == rec.id).unwrap_or(true) {
                let chunks = rec.chunks.lock().len();
                let duration_ms = (chunks as f32 * rec.config.chunk_duration * 1000.0) as i64;
                return PrecisionStatusPayload {
                    active: true,
                    recording_id: Some(rec.id.clone()),
                    title: Some(rec.title.clone()),
                    status: Some("recording".into()),
                    duration_ms: Some(duration_ms),
                    chunks_captured: Some(chunks),
                    error: None,
                };
            }
        }
        drop(active);

        if let Some(id) = recording_id {
            if let Some(record) = self.history.lock().get(id) {
                return PrecisionStatusPayload {
                    active: false,
                    recording_id: Some(id.to_string()),
                    title: Some(record.title.clone()),
                    status: Some(record.status.into()),
                    duration_ms: Some(record.duration_ms),
                    chunks_captured: Some(record.chunks_captured),
                    error: record.error.clone(),
                };
            }
        }

        PrecisionStatusPayload {
            active: false,
            recording_id: None,
            title: None,
            status: None,
            duration_ms: None,
            chunks_captured: None,
            error: None,
        }
    }

    /// The id of the active recording, if any.
    pub fn active_id(&self) -> Option<String> {
        self.active.lock().as_ref().map(|rec| rec.id.clone())
    }

    fn take_active(&self, recording_id: Option<&str>) -> Result<ActiveRecording> {
        let mut active = self.active.lock();
        let id_matches = match active.as_ref() {
            None => return Err(OpenCueError::InvalidState("no active recording".into())),
            Some(rec) => recording_id.map(|id| id == rec.id).unwrap_or(true),
        };
        if !id_matches {
            return Err(OpenCueError::InvalidState(format!(
                "recording {} is not active",
                recording_id.unwrap_or_default()
            )));
        }
        Ok(active.take().expect("checked above"))
    }

    fn record_history(
        &self,
        id: &str,
        title: &str,
        status: &'static str,
        duration_ms: i64,
        chunks_captured: usize,
        error: Option<String>,
    ) {
        self.history.lock().insert(
            id.to_string(),
            RecordingRecord {
                title: title.to_string(),
                status,
                duration_ms,
                chunks_captured,
                error,
            },
        );
    }

    fn save_wav(&self, title: &str, audio: &[f32], sample_rate: u32) -> Result<String> {
        let path = self
            .catalog
            .dir()
            .join(format!("{}.wav", sanitize_title(title)));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec)
            .map_err(|e| OpenCueError::PersistIo(std::io::Error::new(
                std::io::ErrorKind::Other,
                e,
            )))?;
        for s in audio {
            writer
                .write_sample((s.clamp(-1.0, 1.0) * 32767.0) as i16)
                .map_err(|e| {
                    OpenCueError::PersistIo(std::io::Error::new(std::io::ErrorKind::Other, e))
                })?;
        }
        writer.finalize().map_err(|e| {
            OpenCueError::PersistIo(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        info!(path = %path.display(), "recording audio saved");
        Ok(path.display().to_string())
    }
}

/// One fingerprint marker per 5 s window of the sealed buffer.
fn build_fingerprints(
    audio: &[f32],
    sample_rate: u32,
    video_offset_ms: i64,
) -> Option<FingerprintBlock> {
    let fingerprinter = Fingerprinter::resolve(sample_rate);
    let window_samples = (sample_rate as i64 * FINGERPRINT_WINDOW_MS / 1000) as usize;
    if window_samples == 0 || audio.len() < window_samples {
        return None;
    }

    let mut markers = Vec::new();
    for (idx, window) in audio.chunks(window_samples).enumerate() {
        if window.len() < window_samples / 2 {
            break;
        }
        if let Some(hash) = fingerprinter.fingerprint(window) {
            markers.push(FingerprintMarker {
                time_ms: video_offset_ms + idx as i64 * FINGERPRINT_WINDOW_MS,
                hash,
            });
        }
    }

    if markers.is_empty() {
        None
    } else {
        Some(FingerprintBlock {
            algorithm: fingerprinter.algorithm().into(),
            sample_rate,
            markers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcribe::stub::ScriptedTranscriber;
    use crate::transcribe::{TranscriptionResult, WordTiming};
    use tempfile::TempDir;

    fn recorder_without_audio(
        dir: &TempDir,
        transcriber: Option<TranscriberHandle>,
    ) -> PrecisionRecorder {
        let catalog = Arc::new(CatalogManager::new(dir.path().to_path_buf()).unwrap());
        PrecisionRecorder::new(catalog, Arc::new(Lexicon::builtin()), transcriber, None)
    }

    #[test]
    fn requirements_name_missing_transcriber() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder_without_audio(&dir, None);
        let req = recorder.check_requirements();
        assert!(!req.transcriber_available);
        assert!(!req.ready);
        assert!(req
            .instructions
            .iter()
            .any(|line| line.contains("transcriber")));
    }

    #[test]
    fn stop_without_active_recording_is_invalid_state() {
        let dir = TempDir::new().unwrap();
        let transcriber = TranscriberHandle::new(ScriptedTranscriber::silent());
        let recorder = recorder_without_audio(&dir, Some(transcriber));
        assert!(matches!(
            recorder.stop(None),
            Err(OpenCueError::InvalidState(_))
        ));
    }

    #[test]
    fn abort_without_active_recording_reports_failure() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder_without_audio(&dir, None);
        let payload = recorder.abort(None);
        assert!(!payload.success);
        assert!(payload.error.is_some());
    }

    #[test]
    fn status_with_no_recording_is_inactive() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder_without_audio(&dir, None);
        let status = recorder.status(None);
        assert!(!status.active);
        assert!(status.recording_id.is_none());
    }

    #[test]
    fn fingerprint_blocks_cover_sealed_buffer() {
        // 12 s of sweep at 16 kHz → two full 5 s windows + remainder.
        let audio: Vec<f32> = (0..16_000 * 12)
            .map(|i| {
                let t = i as f32 / 16_000.0;
                (2.0 * std::f32::consts::PI * (300.0 + 80.0 * t) * t).sin()
            })
            .collect();
        let block = build_fingerprints(&audio, 16_000, 60_000).unwrap();
        assert_eq!(block.algorithm, "spectral32");
        assert!(block.markers.len() >= 2);
        assert_eq!(block.markers[0].time_ms, 60_000);
        assert_eq!(block.markers[1].time_ms, 65_000);
        assert!(block
            .markers
            .windows(2)
            .all(|w| w[0].time_ms < w[1].time_ms));
    }

    #[test]
    fn short_buffer_produces_no_fingerprints() {
        assert!(build_fingerprints(&[0.0; 1000], 16_000, 0).is_none());
    }

    // The full start→stop path needs an audio device; the seal pipeline
    // below it (resample, normalise, transcribe, cue build, persist) is
    // covered by the integration tests via scripted collaborators.
    #[test]
    fn scripted_transcription_builds_expected_cue_times() {
        let transcription = TranscriptionResult {
            text: "that was shit".into(),
            words: vec![WordTiming {
                word: "shit".into(),
                start_ms: 2500,
                end_ms: 2700,
                confidence: 0.9,
            }],
            language: "en".into(),
            duration_ms: 5000,
        };
        let cues = cues_from_transcription(
            &transcription,
            &Lexicon::builtin(),
            120_000,
            CuePads::default(),
        );
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].start_ms, 122_450);
        assert_eq!(cues[0].end_ms, 122_750);
        assert_eq!(cues[0].source.as_deref(), Some("whisper"));
    }
}
