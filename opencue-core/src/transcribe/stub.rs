//! `ScriptedTranscriber` — placeholder backend that replays a fixed result.
//!
//! Used by tests and by hosts running without a speech engine, so the full
//! precision-recording path can be exercised end-to-end.

use tracing::debug;

use crate::error::{OpenCueError, Result};
use crate::transcribe::{TranscriptionResult, Transcriber};

/// Replays a pre-baked transcription regardless of input.
pub struct ScriptedTranscriber {
    result: TranscriptionResult,
    pub calls: usize,
}

impl ScriptedTranscriber {
    pub fn new(result: TranscriptionResult) -> Self {
        Self { result, calls: 0 }
    }

    /// An empty transcription (no speech found).
    pub fn silent() -> Self {
        Self::new(TranscriptionResult::default())
    }
}

impl Transcriber for ScriptedTranscriber {
    fn warm_up(&mut self) -> Result<()> {
        debug!("ScriptedTranscriber::warm_up — no-op");
        Ok(())
    }

    fn transcribe(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        _language: &str,
        playback_speed: f32,
    ) -> Result<TranscriptionResult> {
        self.calls += 1;
        debug!(
            samples = samples.len(),
            sample_rate, playback_speed, "scripted transcription"
        );

        let mut result = self.result.clone();
        if playback_speed != 1.0 {
            for word in &mut result.words {
                word.start_ms = (word.start_ms as f32 * playback_speed) as i64;
                word.end_ms = (word.end_ms as f32 * playback_speed) as i64;
            }
            result.duration_ms = (result.duration_ms as f32 * playback_speed) as i64;
        }
        Ok(result)
    }
}

/// Always-failing backend for hosts without a configured engine.
pub struct UnavailableTranscriber;

impl Transcriber for UnavailableTranscriber {
    fn warm_up(&mut self) -> Result<()> {
        Err(OpenCueError::TranscriberUnavailable)
    }

    fn transcribe(
        &mut self,
        _samples: &[f32],
        _sample_rate: u32,
        _language: &str,
        _playback_speed: f32,
    ) -> Result<TranscriptionResult> {
        Err(OpenCueError::TranscriberUnavailable)
    }
}
