//! Subtitle-driven recording.
//!
//! While a session records, every dispatched overlay command and every
//! accepted caption is appended to an in-memory recording. Progress is
//! persisted to a dot-prefixed temp file after each cue append so a crash
//! loses nothing; the temp file is removed when the recording seals or
//! aborts. Sealing produces a version 2.0 cue file ready for the catalogue.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use crate::cues::{sanitize_title, Cue, CueFile, SubtitleMarker, CUE_FILE_VERSION};

/// Two overlay commands for the same word within this window are one cue.
const CUE_DEDUP_WINDOW_MS: i64 = 100;

/// Captions shorter than this are not worth a sync marker.
const MIN_SUBTITLE_CHARS: usize = 10;

/// Near-duplicate caption window (ms), checked against the last few markers.
const SUBTITLE_DEDUP_WINDOW_MS: i64 = 1000;

/// How many trailing markers the near-duplicate check looks at.
const SUBTITLE_DEDUP_LOOKBACK: usize = 5;

/// How many trailing subtitles the incremental save keeps.
const TEMP_SUBTITLE_TAIL: usize = 50;

/// In-progress subtitle recording owned by one session.
pub struct RecordingState {
    pub title: String,
    pub content_id: String,
    pub started_at: chrono::DateTime<Utc>,
    pub start_position_ms: i64,
    pub cues: Vec<Cue>,
    pub subtitles: Vec<SubtitleMarker>,
    pub paused: bool,
    temp_path: PathBuf,
}

impl RecordingState {
    pub fn begin(
        title: &str,
        content_id: &str,
        start_position_ms: i64,
        catalog_dir: &Path,
    ) -> Self {
        let title = if title.trim().is_empty() {
            "Recording".to_string()
        } else {
            title.trim().to_string()
        };
        let temp_path =
            catalog_dir.join(format!(".{}_recording.tmp", sanitize_title(&title)));
        Self {
            title,
            content_id: content_id.to_string(),
            started_at: Utc::now(),
            start_position_ms,
            cues: Vec::new(),
            subtitles: Vec::new(),
            paused: false,
            temp_path,
        }
    }

    /// Re-anchor the start position, used by resume when nothing was
    /// captured before the pause.
    pub fn reanchor(&mut self, position_ms: i64) {
        self.started_at = Utc::now();
        self.start_position_ms = position_ms;
    }

    /// Append a dispatched cue. Returns false for paused recordings and
    /// near-duplicate hits.
    pub fn add_cue(&mut self, cue: Cue) -> bool {
        if self.paused {
            return false;
        }
        let duplicate = self.cues.iter().any(|existing| {
            existing.word == cue.word
                && (existing.start_ms - cue.start_ms).abs() <= CUE_DEDUP_WINDOW_MS
        });
        if duplicate {
            return false;
        }

        let mut cue = cue;
        cue.id = format!("cue_{:04}", self.cues.len() + 1);
        debug!(
            id = cue.id.as_str(),
            start_ms = cue.start_ms,
            word = cue.word.as_deref().unwrap_or(""),
            total = self.cues.len() + 1,
            "cue recorded"
        );
        self.cues.push(cue);
        self.incremental_save();
        true
    }

    /// Append a caption marker for three-step sync. Returns false when the
    /// recording is paused, the caption is too short, or it near-duplicates
    /// a recent marker.
    pub fn add_subtitle(&mut self, text: &str, time_ms: i64) -> bool {
        if self.paused || text.trim().len() < MIN_SUBTITLE_CHARS {
            return false;
        }
        let duplicate = self
            .subtitles
            .iter()
            .rev()
            .take(SUBTITLE_DEDUP_LOOKBACK)
            .any(|existing| {
                existing.text == text
                    && (existing.time_ms - time_ms).abs() < SUBTITLE_DEDUP_WINDOW_MS
            });
        if duplicate {
            return false;
        }
        self.subtitles.push(SubtitleMarker {
            time_ms,
            text: text.to_string(),
        });
        true
    }

    /// Seal into a cue file. Cues are sorted by start time and the duration
    /// covers the last cue even when padding pushed it past the final
    /// reported position.
    pub fn seal(&mut self, last_position_ms: i64) -> CueFile {
        self.cues.sort_by_key(|c| c.start_ms);

        let elapsed = last_position_ms - self.start_position_ms;
        let mut duration_ms = if elapsed > 0 { elapsed } else { last_position_ms };
        if let Some(max_end) = self.cues.iter().map(|c| c.end_ms).max() {
            duration_ms = duration_ms.max(max_end);
        }

        let mut file = CueFile::new(self.title.clone());
        file.content.content_id = Some(self.content_id.clone());
        file.content.duration_ms = duration_ms;
        file.cues = std::mem::take(&mut self.cues);
        file.subtitles = std::mem::take(&mut self.subtitles);
        file.metadata.insert(
            "created".into(),
            json!(Utc::now().to_rfc3339()),
        );
        file.metadata.insert(
            "recorded_at".into(),
            json!(self.started_at.to_rfc3339()),
        );
        file.metadata
            .insert("creator".into(), json!("subtitle recording"));
        file.metadata
            .insert("source".into(), json!("subtitle_recording"));
        file.metadata
            .insert("subtitle_count".into(), json!(file.subtitles.len()));
        file
    }

    /// Filename stem for the sealed file.
    pub fn filename(&self) -> String {
        sanitize_title(&self.title)
    }

    /// Remove the incremental temp file (after seal or abort).
    pub fn cleanup_temp(&self) {
        if self.temp_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.temp_path) {
                warn!(path = %self.temp_path.display(), "could not remove temp file: {e}");
            }
        }
    }

    /// Persist progress so a crash mid-recording loses nothing.
    fn incremental_save(&self) {
        let tail_start = self.subtitles.len().saturating_sub(TEMP_SUBTITLE_TAIL);
        let partial = json!({
            "version": CUE_FILE_VERSION,
            "content": {
                "title": self.title,
                "content_id": self.content_id,
                "recording_in_progress": true,
                "recorded_at": self.started_at.to_rfc3339(),
            },
            "cues": self.cues,
            "subtitles": &self.subtitles[tail_start..],
            "metadata": {
                "cue_count": self.cues.len(),
                "subtitle_count": self.subtitles.len(),
                "last_update": Utc::now().to_rfc3339(),
            },
        });

        match serde_json::to_string_pretty(&partial) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&self.temp_path, body) {
                    warn!(path = %self.temp_path.display(), "incremental save failed: {e}");
                }
            }
            Err(e) => warn!("incremental save serialisation failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cues::CueAction;
    use tempfile::TempDir;

    fn overlay_cue(word: &str, start_ms: i64, end_ms: i64) -> Cue {
        Cue {
            id: String::new(),
            start_ms,
            end_ms,
            action: CueAction::Mute,
            category: "language.profanity.severe".into(),
            word: Some(word.into()),
            region: None,
            confidence: 0.95,
            source: Some("subtitle".into()),
        }
    }

    #[test]
    fn cues_get_sequential_ids_and_temp_saves() {
        let dir = TempDir::new().unwrap();
        let mut rec = RecordingState::begin("My Show", "x:1", 10_000, dir.path());

        assert!(rec.add_cue(overlay_cue("fuck", 12_000, 12_900)));
        assert!(rec.add_cue(overlay_cue("shit", 15_000, 15_800)));
        assert_eq!(rec.cues[0].id, "cue_0001");
        assert_eq!(rec.cues[1].id, "cue_0002");

        let temp = dir.path().join(".My Show_recording.tmp");
        assert!(temp.exists());
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(temp).unwrap()).unwrap();
        assert_eq!(saved["metadata"]["cue_count"], 2);
        assert_eq!(saved["content"]["recording_in_progress"], true);
    }

    #[test]
    fn same_word_within_window_is_deduplicated() {
        let dir = TempDir::new().unwrap();
        let mut rec = RecordingState::begin("Show", "x", 0, dir.path());

        assert!(rec.add_cue(overlay_cue("fuck", 12_000, 12_900)));
        assert!(!rec.add_cue(overlay_cue("fuck", 12_050, 12_950)));
        assert!(rec.add_cue(overlay_cue("fuck", 12_200, 13_000)));
        assert_eq!(rec.cues.len(), 2);
    }

    #[test]
    fn short_and_duplicate_subtitles_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mut rec = RecordingState::begin("Show", "x", 0, dir.path());

        assert!(!rec.add_subtitle("too short", 1000));
        assert!(rec.add_subtitle("a caption long enough to keep", 1000));
        assert!(!rec.add_subtitle("a caption long enough to keep", 1500));
        assert!(rec.add_subtitle("a caption long enough to keep", 3000));
        assert_eq!(rec.subtitles.len(), 2);
    }

    #[test]
    fn paused_recording_rejects_appends() {
        let dir = TempDir::new().unwrap();
        let mut rec = RecordingState::begin("Show", "x", 0, dir.path());
        rec.paused = true;
        assert!(!rec.add_cue(overlay_cue("fuck", 12_000, 12_900)));
        assert!(!rec.add_subtitle("a caption long enough to keep", 1000));
    }

    #[test]
    fn seal_sorts_cues_and_covers_padding() {
        let dir = TempDir::new().unwrap();
        let mut rec = RecordingState::begin("Show", "x:9", 10_000, dir.path());
        rec.add_cue(overlay_cue("shit", 50_000, 62_000));
        rec.add_cue(overlay_cue("fuck", 20_000, 20_900));

        let file = rec.seal(60_000);
        assert_eq!(file.version, CUE_FILE_VERSION);
        assert_eq!(file.content.content_id.as_deref(), Some("x:9"));
        // Sorted by start, ids preserved from append order.
        assert_eq!(file.cues[0].word.as_deref(), Some("fuck"));
        // Duration covers the cue that ends past the final position.
        assert_eq!(file.content.duration_ms, 62_000);
        file.validate().unwrap();
    }

    #[test]
    fn cleanup_removes_temp_file() {
        let dir = TempDir::new().unwrap();
        let mut rec = RecordingState::begin("Show", "x", 0, dir.path());
        rec.add_cue(overlay_cue("fuck", 12_000, 12_900));
        let temp = dir.path().join(".Show_recording.tmp");
        assert!(temp.exists());
        rec.cleanup_temp();
        assert!(!temp.exists());
    }

    #[test]
    fn reanchor_moves_start_position() {
        let dir = TempDir::new().unwrap();
        let mut rec = RecordingState::begin("Show", "x", 5_000, dir.path());
        rec.reanchor(42_000);
        assert_eq!(rec.start_position_ms, 42_000);
    }
}
