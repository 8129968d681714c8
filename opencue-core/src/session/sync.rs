//! Subtitle-text sync engine.
//!
//! Subtitle text is identical across streaming platforms even when timing
//! is not. Matching live caption text against the cue file's subtitle
//! markers therefore gives an exact content position without touching
//! audio:
//!
//! 1. The reported timestamp bounds the search (±120 s unsynced, ±10 s
//!    around the extrapolated position once synced).
//! 2. Word-set similarity against markers in the window picks a candidate;
//!    cue words act as a weaker backup signal.
//! 3. An offset history confirms the candidate before sync is declared.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::debug;

use crate::cues::{CueFile, SubtitleMarker};

/// Tuning knobs for the sync engine.
#[derive(Debug, Clone)]
pub struct SubtitleSyncConfig {
    /// Search window around the reported time while unsynced (±ms).
    pub search_window_ms: i64,
    /// Narrow window around the extrapolated position once synced (±ms).
    pub synced_window_ms: i64,
    /// Raw subtitle length below which a caption is ignored.
    pub min_subtitle_len: usize,
    /// How many consecutive consistent offsets declare sync.
    pub required_matches: usize,
}

impl Default for SubtitleSyncConfig {
    fn default() -> Self {
        Self {
            search_window_ms: 120_000,
            synced_window_ms: 10_000,
            min_subtitle_len: 8,
            required_matches: 1,
        }
    }
}

/// Word-set similarity threshold for accepting a marker match.
const SIMILARITY_THRESHOLD: f64 = 0.6;

/// Score assigned to a cue-word substring backup match.
const CUE_WORD_SCORE: f64 = 0.7;

/// Offsets within this of each other count as mutually consistent (ms).
const CONSISTENCY_WINDOW_MS: i64 = 2000;

/// Offset history depth.
const HISTORY_LEN: usize = 10;

/// Seconds without a match before confidence starts decaying.
const MATCH_STALE_SECS: u64 = 30;

/// How the engine arrived at the current result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMethod {
    /// Caption too short or empty after normalisation; history untouched.
    Skipped,
    /// Marker matched and the offset history is consistent.
    SubtitleMatch,
    /// Marker matched but more confirmations are required.
    PendingConfirmation,
    /// Nothing matched in the window.
    NoMatch,
}

/// Result of processing one caption.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub synced: bool,
    /// Add to the reported video time to get content time.
    pub offset_ms: i64,
    pub confidence: f32,
    pub matched: Option<String>,
    pub method: SyncMethod,
}

/// Text-matching sync engine over one cue file.
pub struct SubtitleSyncEngine {
    subtitles: Vec<SubtitleMarker>,
    /// `(start_ms, word)` pairs from the file's cues, backup signal.
    cue_words: Vec<(i64, String)>,
    config: SubtitleSyncConfig,

    synced: bool,
    offset_ms: i64,
    confidence: f32,
    last_match: Option<Instant>,
    history: VecDeque<i64>,
}

impl SubtitleSyncEngine {
    pub fn new(file: &CueFile, config: SubtitleSyncConfig) -> Self {
        let cue_words = file
            .cues
            .iter()
            .filter_map(|c| {
                c.word
                    .as_ref()
                    .map(|w| (c.start_ms, w.to_lowercase()))
            })
            .collect();
        debug!(
            markers = file.subtitles.len(),
            cues = file.cues.len(),
            "subtitle sync engine initialised"
        );
        Self {
            subtitles: file.subtitles.clone(),
            cue_words,
            config,
            synced: false,
            offset_ms: 0,
            confidence: 0.0,
            last_match: None,
            history: VecDeque::new(),
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    /// Process one live caption at the reported video time.
    pub fn process_subtitle(&mut self, text: &str, video_time_ms: i64) -> SyncOutcome {
        self.process_at(text, video_time_ms, Instant::now())
    }

    fn process_at(&mut self, text: &str, video_time_ms: i64, now: Instant) -> SyncOutcome {
        let normalized = normalize_text(text);
        if text.len() < self.config.min_subtitle_len || normalized.is_empty() {
            return self.outcome(SyncMethod::Skipped, None);
        }

        if let Some((marker_time, matched_text, score)) =
            self.find_match(&normalized, video_time_ms)
        {
            let new_offset = marker_time - video_time_ms;
            self.history.push_back(new_offset);
            if self.history.len() > HISTORY_LEN {
                self.history.pop_front();
            }

            if self.offsets_consistent() {
                self.synced = true;
                self.offset_ms = self.stable_offset();
                self.confidence = (0.5 + 0.1 * self.history.len() as f32).min(0.95);
                self.last_match = Some(now);
                debug!(
                    offset_ms = self.offset_ms,
                    confidence = self.confidence,
                    score,
                    "subtitle sync confirmed"
                );
                return self.outcome(SyncMethod::SubtitleMatch, Some(matched_text));
            }

            return SyncOutcome {
                synced: false,
                offset_ms: new_offset,
                confidence: 0.3,
                matched: Some(matched_text),
                method: SyncMethod::PendingConfirmation,
            };
        }

        // Long droughts decay confidence without dropping sync outright.
        if self.synced {
            if let Some(last) = self.last_match {
                if now.duration_since(last).as_secs() > MATCH_STALE_SECS {
                    self.confidence = (self.confidence - 0.1).max(0.3);
                }
            }
        }

        self.outcome(SyncMethod::NoMatch, None)
    }

    fn outcome(&self, method: SyncMethod, matched: Option<String>) -> SyncOutcome {
        SyncOutcome {
            synced: self.synced,
            offset_ms: self.offset_ms,
            confidence: self.confidence,
            matched,
            method,
        }
    }

    /// Best marker (or cue-word backup) for `normalized` near `video_time_ms`.
    fn find_match(&self, normalized: &str, video_time_ms: i64) -> Option<(i64, String, f64)> {
        let (window_start, window_end) = if self.synced {
            let estimated = video_time_ms + self.offset_ms;
            (
                estimated - self.config.synced_window_ms,
                estimated + self.config.synced_window_ms,
            )
        } else {
            (
                (video_time_ms - self.config.search_window_ms).max(0),
                video_time_ms + self.config.search_window_ms,
            )
        };

        let mut best: Option<(i64, String, f64)> = None;
        let mut best_score = 0.0f64;

        for marker in &self.subtitles {
            if marker.time_ms < window_start || marker.time_ms > window_end {
                continue;
            }
            let marker_norm = normalize_text(&marker.text);
            let score = word_set_similarity(normalized, &marker_norm);
            if score >= SIMILARITY_THRESHOLD && score > best_score {
                best_score = score;
                best = Some((marker.time_ms, marker.text.clone(), score));
            }
        }

        if best.is_none() {
            for (cue_time, word) in &self.cue_words {
                if *cue_time < window_start || *cue_time > window_end {
                    continue;
                }
                if normalized.contains(word.as_str()) && CUE_WORD_SCORE > best_score {
                    best_score = CUE_WORD_SCORE;
                    best = Some((*cue_time, word.clone(), CUE_WORD_SCORE));
                }
            }
        }

        best
    }

    /// The last `required_matches` offsets must sit within 2 s of their mean.
    fn offsets_consistent(&self) -> bool {
        let required = self.config.required_matches;
        if self.history.len() < required {
            return false;
        }
        let recent: Vec<i64> = self.history.iter().rev().take(required).copied().collect();
        let avg = recent.iter().sum::<i64>() / recent.len() as i64;
        recent
            .iter()
            .all(|offset| (offset - avg).abs() <= CONSISTENCY_WINDOW_MS)
    }

    /// Median of the last five offsets.
    fn stable_offset(&self) -> i64 {
        let mut recent: Vec<i64> = self.history.iter().rev().take(5).copied().collect();
        if recent.is_empty() {
            return 0;
        }
        recent.sort_unstable();
        recent[recent.len() / 2]
    }

    /// Clear all sync state.
    pub fn reset(&mut self) {
        self.synced = false;
        self.offset_ms = 0;
        self.confidence = 0.0;
        self.last_match = None;
        self.history.clear();
    }
}

/// Lowercase, keep word characters and apostrophes, collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    let filtered: String = text
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' || c == '_' {
                c
            } else {
                ' '
            }
        })
        .collect();
    filtered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Jaccard similarity of the two texts' word sets.
fn word_set_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let set_a: std::collections::HashSet<&str> = a.split_whitespace().collect();
    let set_b: std::collections::HashSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cues::{Cue, CueAction, CueFile};

    fn file_with_markers(markers: &[(i64, &str)]) -> CueFile {
        let mut file = CueFile::new("Sync Test");
        file.content.duration_ms = 600_000;
        file.subtitles = markers
            .iter()
            .map(|(t, text)| SubtitleMarker {
                time_ms: *t,
                text: (*text).into(),
            })
            .collect();
        file
    }

    fn engine(markers: &[(i64, &str)]) -> SubtitleSyncEngine {
        SubtitleSyncEngine::new(&file_with_markers(markers), SubtitleSyncConfig::default())
    }

    #[test]
    fn normalization_strips_punctuation_and_case() {
        assert_eq!(
            normalize_text("HELLO, world. How ARE you!"),
            "hello world how are you"
        );
        assert_eq!(normalize_text("don't   stop"), "don't stop");
        assert_eq!(normalize_text("!!!"), "");
    }

    #[test]
    fn perfect_match_syncs_with_single_required_match() {
        let mut engine = engine(&[(60_000, "hello world how are you")]);
        let outcome = engine.process_subtitle("HELLO, world. How ARE you!", 57_000);

        assert!(outcome.synced);
        assert_eq!(outcome.offset_ms, 3000);
        assert!((outcome.confidence - 0.6).abs() < 1e-6);
        assert_eq!(outcome.method, SyncMethod::SubtitleMatch);
        assert_eq!(engine.offset_ms(), 3000);
    }

    #[test]
    fn short_subtitle_does_not_advance_history() {
        let mut engine = engine(&[(60_000, "hello world how are you")]);
        let outcome = engine.process_subtitle("hi", 57_000);
        assert_eq!(outcome.method, SyncMethod::Skipped);
        assert!(!outcome.synced);
        assert!(engine.history.is_empty());
    }

    #[test]
    fn punctuation_only_subtitle_is_skipped() {
        let mut engine = engine(&[(60_000, "hello world how are you")]);
        let outcome = engine.process_subtitle("........!!", 57_000);
        assert_eq!(outcome.method, SyncMethod::Skipped);
        assert!(engine.history.is_empty());
    }

    #[test]
    fn dissimilar_text_does_not_match() {
        let mut engine = engine(&[(60_000, "hello world how are you")]);
        let outcome = engine.process_subtitle("completely different words entirely", 57_000);
        assert_eq!(outcome.method, SyncMethod::NoMatch);
        assert!(!outcome.synced);
    }

    #[test]
    fn markers_outside_window_are_ignored() {
        // Marker 10 minutes away from the reported time, window is ±120 s.
        let mut engine = engine(&[(700_000, "hello world how are you")]);
        let outcome = engine.process_subtitle("hello world how are you", 57_000);
        assert_eq!(outcome.method, SyncMethod::NoMatch);
    }

    #[test]
    fn requires_consistent_offsets_when_configured() {
        let file = file_with_markers(&[
            (60_000, "first caption of the scene"),
            (90_000, "second caption of the scene"),
        ]);
        let mut config = SubtitleSyncConfig::default();
        config.required_matches = 2;
        let mut engine = SubtitleSyncEngine::new(&file, config);

        let first = engine.process_subtitle("first caption of the scene", 57_000);
        assert_eq!(first.method, SyncMethod::PendingConfirmation);
        assert!(!first.synced);

        let second = engine.process_subtitle("second caption of the scene", 87_000);
        assert_eq!(second.method, SyncMethod::SubtitleMatch);
        assert!(second.synced);
        assert_eq!(second.offset_ms, 3000);
    }

    #[test]
    fn cue_word_substring_acts_as_backup() {
        let mut file = file_with_markers(&[]);
        file.cues.push(Cue {
            id: "cue_0001".into(),
            start_ms: 61_000,
            end_ms: 61_500,
            action: CueAction::Mute,
            category: "language.profanity.severe".into(),
            word: Some("fuck".into()),
            region: None,
            confidence: 0.9,
            source: None,
        });
        let mut engine = SubtitleSyncEngine::new(&file, SubtitleSyncConfig::default());

        let outcome = engine.process_subtitle("what the fuck was that", 58_000);
        assert!(outcome.synced);
        assert_eq!(outcome.offset_ms, 3000);
        assert_eq!(outcome.matched.as_deref(), Some("fuck"));
    }

    #[test]
    fn synced_engine_narrows_search_window() {
        let mut engine = engine(&[
            (60_000, "hello world how are you"),
            (300_000, "hello world how are you"),
        ]);
        engine.process_subtitle("hello world how are you", 57_000);
        assert!(engine.is_synced());
        assert_eq!(engine.offset_ms(), 3000);

        // 300 s marker is far outside the ±10 s synced window at this time.
        let outcome = engine.process_subtitle("hello world how are you", 58_000);
        assert_eq!(outcome.method, SyncMethod::SubtitleMatch);
        assert_eq!(outcome.offset_ms, 3000);
    }

    #[test]
    fn stable_offset_is_median_of_recent() {
        let mut engine = engine(&[
            (10_000, "aa bb cc dd"),
            (20_000, "ee ff gg hh"),
            (30_000, "ii jj kk ll"),
        ]);
        engine.process_subtitle("aa bb cc dd", 7_100); // offset 2900
        engine.process_subtitle("ee ff gg hh", 16_900); // offset 3100
        engine.process_subtitle("ii jj kk ll", 27_000); // offset 3000
        assert!(engine.is_synced());
        assert_eq!(engine.offset_ms(), 3000);
    }

    #[test]
    fn reset_clears_sync() {
        let mut engine = engine(&[(60_000, "hello world how are you")]);
        engine.process_subtitle("hello world how are you", 57_000);
        assert!(engine.is_synced());
        engine.reset();
        assert!(!engine.is_synced());
        assert_eq!(engine.offset_ms(), 0);
    }
}
