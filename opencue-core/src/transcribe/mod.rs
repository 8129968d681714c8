//! Speech transcription abstraction and cue emission.
//!
//! The recognition engine is an external collaborator: the core only
//! depends on the [`Transcriber`] trait, which yields ordered word timings.
//! `&mut self` on `transcribe` intentionally expresses that engines are
//! stateful (decoder caches, loaded models); all mutation is serialised
//! through [`TranscriberHandle`]'s `parking_lot::Mutex`.

pub mod stub;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cues::{Cue, CueAction};
use crate::error::Result;
use crate::lexicon::Lexicon;

/// A single recognised word with precise timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start_ms: i64,
    pub end_ms: i64,
    /// Engine probability in [0, 1].
    pub confidence: f32,
}

impl WordTiming {
    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

/// Full transcription with word-level timing.
///
/// Timing contract: `word.start_ms < word.end_ms`, and successive words
/// have non-decreasing start times. Times are already scaled by the
/// playback speed the audio was captured at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub words: Vec<WordTiming>,
    pub language: String,
    pub duration_ms: i64,
}

/// Contract for speech recognition backends.
pub trait Transcriber: Send + 'static {
    /// One-time warm-up: load weights, run a dummy inference. Called once
    /// before the first real transcription.
    fn warm_up(&mut self) -> Result<()>;

    /// Transcribe mono f32 samples with word-level timestamps.
    ///
    /// `playback_speed` scales output timestamps (audio captured at 2×
    /// playback maps back to content time by doubling).
    fn transcribe(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        language: &str,
        playback_speed: f32,
    ) -> Result<TranscriptionResult>;
}

/// Thread-safe reference-counted handle to any `Transcriber` implementor.
#[derive(Clone)]
pub struct TranscriberHandle(pub Arc<Mutex<dyn Transcriber>>);

impl TranscriberHandle {
    pub fn new<T: Transcriber>(transcriber: T) -> Self {
        Self(Arc::new(Mutex::new(transcriber)))
    }
}

impl std::fmt::Debug for TranscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriberHandle").finish_non_exhaustive()
    }
}

/// Padding applied to transcription-derived cues.
#[derive(Debug, Clone, Copy)]
pub struct CuePads {
    pub before_ms: i64,
    pub after_ms: i64,
}

impl Default for CuePads {
    fn default() -> Self {
        Self {
            before_ms: 50,
            after_ms: 50,
        }
    }
}

/// Minimum spacing between cues for the same word (ms). Streaming engines
/// occasionally emit the same word twice at nearly the same timestamp.
const WORD_DEDUP_WINDOW_MS: i64 = 100;

/// Build mute cues from a transcription using the lexicon's flat word set.
///
/// Each transcribed token is lowercased and stripped of non-alphanumerics
/// before lookup. `video_offset_ms` shifts recording-relative timestamps to
/// content-absolute times for recordings started mid-title.
pub fn cues_from_transcription(
    transcription: &TranscriptionResult,
    lexicon: &Lexicon,
    video_offset_ms: i64,
    pads: CuePads,
) -> Vec<Cue> {
    let mut cues: Vec<Cue> = Vec::new();

    for word in &transcription.words {
        let cleaned: String = word
            .word
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect();
        if cleaned.is_empty() {
            continue;
        }
        let Some(entry) = lexicon.lookup_word(&cleaned) else {
            continue;
        };

        let start_ms = (word.start_ms - pads.before_ms + video_offset_ms).max(0);
        let end_ms = word.end_ms + pads.after_ms + video_offset_ms;

        // Two hits on the same word inside the dedup window are one event.
        let duplicate = cues.iter().any(|c| {
            c.word.as_deref() == Some(cleaned.as_str())
                && (c.start_ms - start_ms).abs() <= WORD_DEDUP_WINDOW_MS
        });
        if duplicate {
            continue;
        }

        debug!(
            word = cleaned.as_str(),
            start_ms, end_ms, "profanity hit in transcription"
        );

        cues.push(Cue {
            id: format!("cue_{:04}", cues.len() + 1),
            start_ms,
            end_ms,
            action: CueAction::Mute,
            category: entry.category.clone(),
            word: Some(cleaned),
            region: None,
            confidence: word.confidence,
            source: Some("whisper".into()),
        });
    }

    cues
}
