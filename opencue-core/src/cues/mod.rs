//! The `.opencue` cue-file data model.
//!
//! A cue file bundles the timed cues for one title with the optional sync
//! metadata (fingerprints, microsignatures, subtitle markers, volume
//! envelope) needed to locate a live player inside it. The persistent form
//! is UTF-8 JSON; [`CueFile::validate`] enforces the documented invariants
//! before a file is admitted to the catalogue.

pub mod catalog;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::audio::envelope::VolumeEnvelope;
use crate::error::{OpenCueError, Result};
use crate::fingerprint::FingerprintMarker;
use crate::microsig::MicrosignatureSequence;

/// Current cue-file format version.
pub const CUE_FILE_VERSION: &str = "2.0";

/// File extension for cue files.
pub const CUE_FILE_EXT: &str = "opencue";

/// What the player should do while a cue is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CueAction {
    Mute,
    Blur,
    Skip,
}

impl CueAction {
    pub fn as_str(self) -> &'static str {
        match self {
            CueAction::Mute => "mute",
            CueAction::Blur => "blur",
            CueAction::Skip => "skip",
        }
    }
}

/// Screen rectangle for visual cues, in fractional coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CueRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A timed intervention instruction.
///
/// The `[start_ms, end_ms)` interval is closed-open on content time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cue {
    pub id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub action: CueAction,
    /// Dotted taxonomy string, e.g. `language.profanity.severe`.
    pub category: String,
    /// Detected token, when the cue came from detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<CueRegion>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// Producer tag, e.g. `whisper` or `subtitle`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

fn default_confidence() -> f32 {
    1.0
}

/// Title-level identification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CueContent {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imdb_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Fingerprint block: one algorithm, time-ordered markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintBlock {
    pub algorithm: String,
    pub sample_rate: u32,
    pub markers: Vec<FingerprintMarker>,
}

/// Microsignature block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MicrosignatureBlock {
    pub sequences: Vec<MicrosignatureSequence>,
}

/// A subtitle snapshot used for text-based sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleMarker {
    pub time_ms: i64,
    pub text: String,
}

/// The persistent cue-file document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CueFile {
    pub version: String,
    pub content: CueContent,
    #[serde(default)]
    pub cues: Vec<Cue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprints: Option<FingerprintBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub microsignatures: Option<MicrosignatureBlock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtitles: Vec<SubtitleMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_envelope: Option<VolumeEnvelope>,
    #[serde(default)]
    pub metadata: Map<String, serde_json::Value>,
}

impl CueFile {
    /// An empty document for `title` with the current format version.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            version: CUE_FILE_VERSION.into(),
            content: CueContent {
                title: title.into(),
                ..CueContent::default()
            },
            cues: Vec::new(),
            fingerprints: None,
            microsignatures: None,
            subtitles: Vec::new(),
            volume_envelope: None,
            metadata: Map::new(),
        }
    }

    /// Check every documented invariant, returning `CueFileCorrupt` on the
    /// first violation.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut max_end = 0i64;

        for cue in &self.cues {
            if cue.start_ms < 0 || cue.end_ms < 0 {
                return Err(corrupt(format!("cue {} has negative time", cue.id)));
            }
            if cue.start_ms > cue.end_ms {
                return Err(corrupt(format!("cue {} has start > end", cue.id)));
            }
            if !ids.insert(cue.id.as_str()) {
                return Err(corrupt(format!("duplicate cue id {}", cue.id)));
            }
            if !(0.0..=1.0).contains(&cue.confidence) {
                return Err(corrupt(format!("cue {} confidence out of range", cue.id)));
            }
            max_end = max_end.max(cue.end_ms);
        }

        if self.content.duration_ms < max_end {
            return Err(corrupt(format!(
                "duration_ms {} < last cue end {max_end}",
                self.content.duration_ms
            )));
        }

        if !self.cues.windows(2).all(|w| w[0].start_ms <= w[1].start_ms) {
            return Err(corrupt("cues are not ordered by start_ms".into()));
        }

        if let Some(fp) = &self.fingerprints {
            if !fp.markers.windows(2).all(|w| w[0].time_ms < w[1].time_ms) {
                return Err(corrupt(
                    "fingerprint marker times are not strictly increasing".into(),
                ));
            }
        }

        if !self.subtitles.windows(2).all(|w| w[0].time_ms <= w[1].time_ms) {
            return Err(corrupt("subtitle markers are not time-sorted".into()));
        }

        if let Some(env) = &self.volume_envelope {
            if env.samples.len() != env.timestamps_ms.len() {
                return Err(corrupt(
                    "volume envelope parallel arrays differ in length".into(),
                ));
            }
        }

        if let Some(ms) = &self.microsignatures {
            for seq in &ms.sequences {
                if !seq
                    .signatures
                    .windows(2)
                    .all(|w| w[0].time_ms <= w[1].time_ms)
                {
                    return Err(corrupt("microsignature sequence not time-sorted".into()));
                }
            }
        }

        Ok(())
    }

    pub fn has_fingerprints(&self) -> bool {
        self.fingerprints
            .as_ref()
            .map(|fp| !fp.markers.is_empty())
            .unwrap_or(false)
    }

    pub fn has_subtitles(&self) -> bool {
        !self.subtitles.is_empty()
    }
}

fn corrupt(reason: String) -> OpenCueError {
    OpenCueError::CueFileCorrupt(reason)
}

/// Reduce a title to a filesystem-safe stem (alphanumerics, space, `-`, `_`;
/// at most 50 chars; `recording` when nothing survives).
pub fn sanitize_title(title: &str) -> String {
    let safe: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let safe = safe.trim().chars().take(50).collect::<String>();
    let safe = safe.trim().to_string();
    if safe.is_empty() {
        "recording".into()
    } else {
        safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::pack_words;

    fn sample_cue(id: &str, start_ms: i64, end_ms: i64) -> Cue {
        Cue {
            id: id.into(),
            start_ms,
            end_ms,
            action: CueAction::Mute,
            category: "language.profanity.severe".into(),
            word: Some("fuck".into()),
            region: None,
            confidence: 0.9,
            source: Some("whisper".into()),
        }
    }

    fn sample_file() -> CueFile {
        let mut file = CueFile::new("Test Movie");
        file.content.content_id = Some("netflix:81234567".into());
        file.content.duration_ms = 60_000;
        file.cues = vec![sample_cue("cue_0001", 1000, 2000), sample_cue("cue_0002", 5000, 5500)];
        file.subtitles = vec![
            SubtitleMarker {
                time_ms: 900,
                text: "what was that".into(),
            },
            SubtitleMarker {
                time_ms: 4800,
                text: "hello world how are you".into(),
            },
        ];
        file.fingerprints = Some(FingerprintBlock {
            algorithm: "spectral32".into(),
            sample_rate: 22_050,
            markers: vec![
                FingerprintMarker {
                    time_ms: 0,
                    hash: pack_words(&[1, 2, 3]),
                },
                FingerprintMarker {
                    time_ms: 5000,
                    hash: pack_words(&[4, 5, 6]),
                },
            ],
        });
        file.metadata
            .insert("creator".into(), "test".into());
        file
    }

    #[test]
    fn valid_file_passes_validation() {
        sample_file().validate().unwrap();
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut file = sample_file();
        file.cues[1].id = "cue_0001".into();
        assert!(matches!(
            file.validate(),
            Err(OpenCueError::CueFileCorrupt(_))
        ));
    }

    #[test]
    fn start_after_end_is_rejected() {
        let mut file = sample_file();
        file.cues[0].start_ms = 3000;
        file.cues[0].end_ms = 2000;
        assert!(file.validate().is_err());
    }

    #[test]
    fn duration_shorter_than_cues_is_rejected() {
        let mut file = sample_file();
        file.content.duration_ms = 4000;
        assert!(file.validate().is_err());
    }

    #[test]
    fn non_increasing_markers_are_rejected() {
        let mut file = sample_file();
        file.fingerprints.as_mut().unwrap().markers[1].time_ms = 0;
        assert!(file.validate().is_err());
    }

    #[test]
    fn mismatched_envelope_arrays_are_rejected() {
        let mut file = sample_file();
        file.volume_envelope = Some(VolumeEnvelope {
            samples: vec![0.1, 0.2],
            timestamps_ms: vec![0],
            sample_rate_hz: 50.0,
            start_time_ms: 0,
        });
        assert!(file.validate().is_err());
    }

    #[test]
    fn write_read_round_trip_preserves_fields_and_order() {
        let file = sample_file();
        let json = serde_json::to_string_pretty(&file).unwrap();
        let back: CueFile = serde_json::from_str(&json).unwrap();

        assert_eq!(back.version, CUE_FILE_VERSION);
        assert_eq!(back.content.title, "Test Movie");
        assert_eq!(back.content.content_id.as_deref(), Some("netflix:81234567"));
        assert_eq!(back.cues.len(), 2);
        assert_eq!(back.cues[0].id, "cue_0001");
        assert_eq!(back.cues[1].id, "cue_0002");
        assert_eq!(back.cues[0].action, CueAction::Mute);
        assert_eq!(back.cues[0].word.as_deref(), Some("fuck"));
        assert_eq!(back.subtitles.len(), 2);
        assert_eq!(back.subtitles[1].text, "hello world how are you");
        back.validate().unwrap();
        let fp = back.fingerprints.unwrap();
        assert_eq!(fp.algorithm, "spectral32");
        assert_eq!(fp.markers[1].time_ms, 5000);
        assert_eq!(back.metadata.get("creator").unwrap(), "test");
    }

    #[test]
    fn action_serialises_lowercase() {
        let json = serde_json::to_string(&CueAction::Blur).unwrap();
        assert_eq!(json, "\"blur\"");
    }

    #[test]
    fn sanitize_title_strips_and_truncates() {
        assert_eq!(sanitize_title("The Movie: Part 2!"), "The Movie Part 2");
        assert_eq!(sanitize_title("///"), "recording");
        assert!(sanitize_title(&"x".repeat(200)).len() <= 50);
    }
}
