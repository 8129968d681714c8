//! Stateful content matching with sync tracking.
//!
//! `ContentMatcher` buffers live audio until enough has accumulated for a
//! fingerprint, matches it against the cue file's markers, and maintains a
//! smoothed wall-clock→content-time offset. Half the buffer is retained
//! between attempts so matches can land across window boundaries.

use tracing::debug;

use super::{match_markers, FingerprintMarker, Fingerprinter, DEFAULT_MATCH_THRESHOLD};

/// How much audio to accumulate before each match attempt (ms).
const TARGET_BUFFER_MS: i64 = 5000;

/// Declared out of sync after this long without a successful match (ms).
const LOSS_OF_SYNC_MS: i64 = 30_000;

/// Rolling confidence window length.
const CONFIDENCE_WINDOW: usize = 10;

/// Outcome of feeding one chunk into the matcher.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Not enough audio buffered yet.
    Buffering,
    /// A marker matched; offset updated.
    Synced {
        content_time_ms: i64,
        offset_ms: i64,
        confidence: f32,
        avg_confidence: f32,
    },
    /// Still searching (no match but sync not yet lost).
    Searching,
    /// No match for over 30 s after having been synced.
    Lost { since_ms: i64 },
}

/// High-level content matcher with sync tracking.
pub struct ContentMatcher {
    markers: Vec<FingerprintMarker>,
    fingerprinter: Fingerprinter,
    threshold: f32,

    synced: bool,
    offset_ms: Option<i64>,
    last_match_wall_ms: Option<i64>,
    confidence_history: Vec<f32>,

    buffer: Vec<Vec<f32>>,
    buffer_ms: i64,
}

impl ContentMatcher {
    pub fn new(mut markers: Vec<FingerprintMarker>, fingerprinter: Fingerprinter) -> Self {
        markers.sort_by_key(|m| m.time_ms);
        Self {
            markers,
            fingerprinter,
            threshold: DEFAULT_MATCH_THRESHOLD,
            synced: false,
            offset_ms: None,
            last_match_wall_ms: None,
            confidence_history: Vec::new(),
            buffer: Vec::new(),
            buffer_ms: 0,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn offset_ms(&self) -> Option<i64> {
        self.offset_ms
    }

    /// Estimated content time for a given wall-clock time, once synced.
    pub fn content_time(&self, wall_time_ms: i64) -> Option<i64> {
        self.offset_ms.map(|offset| wall_time_ms - offset)
    }

    /// Feed a chunk of live audio captured at `wall_time_ms`.
    pub fn add_audio(&mut self, chunk: &[f32], wall_time_ms: i64) -> MatchOutcome {
        let chunk_ms = (chunk.len() as i64 * 1000) / self.fingerprinter.sample_rate as i64;
        self.buffer.push(chunk.to_vec());
        self.buffer_ms += chunk_ms;

        if self.buffer_ms < TARGET_BUFFER_MS {
            return MatchOutcome::Buffering;
        }

        let combined: Vec<f32> = self.buffer.iter().flatten().copied().collect();

        // Keep the newer half of the buffer as overlap for the next attempt.
        let keep_from = self.buffer.len() / 2;
        self.buffer.drain(..keep_from);
        self.buffer_ms = self
            .buffer
            .iter()
            .map(|c| (c.len() as i64 * 1000) / self.fingerprinter.sample_rate as i64)
            .sum();

        let Some(live_fp) = self.fingerprinter.fingerprint(&combined) else {
            return self.no_match(wall_time_ms);
        };

        match match_markers(&live_fp, &self.markers, self.threshold) {
            Some((matched_time_ms, confidence)) => {
                let new_offset = wall_time_ms - matched_time_ms;
                let offset = match self.offset_ms {
                    // Exponential smoothing toward the new estimate.
                    Some(old) => (0.7 * old as f64 + 0.3 * new_offset as f64) as i64,
                    None => new_offset,
                };
                self.offset_ms = Some(offset);
                self.synced = true;
                self.last_match_wall_ms = Some(wall_time_ms);
                self.confidence_history.push(confidence);
                if self.confidence_history.len() > CONFIDENCE_WINDOW {
                    self.confidence_history.remove(0);
                }
                let avg_confidence = self.confidence_history.iter().sum::<f32>()
                    / self.confidence_history.len() as f32;

                debug!(matched_time_ms, offset, confidence, "fingerprint match");
                MatchOutcome::Synced {
                    content_time_ms: matched_time_ms,
                    offset_ms: offset,
                    confidence,
                    avg_confidence,
                }
            }
            None => self.no_match(wall_time_ms),
        }
    }

    fn no_match(&mut self, wall_time_ms: i64) -> MatchOutcome {
        if self.synced {
            if let Some(last) = self.last_match_wall_ms {
                let since = wall_time_ms - last;
                if since > LOSS_OF_SYNC_MS {
                    self.synced = false;
                    return MatchOutcome::Lost { since_ms: since };
                }
            }
        }
        MatchOutcome::Searching
    }

    /// Clear all sync and buffer state.
    pub fn reset(&mut self) {
        self.synced = false;
        self.offset_ms = None;
        self.last_match_wall_ms = None;
        self.confidence_history.clear();
        self.buffer.clear();
        self.buffer_ms = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{pack_words, FingerprintBackend, Fingerprinter};

    const MATCH_WORD: u32 = 0xAAAA_AAAA;
    const MISMATCH_WORD: u32 = 0x5555_5555;

    /// Backend keyed on the loudest sample so tests can steer matches:
    /// quiet chunks hash to `MATCH_WORD`, loud ones to its complement.
    struct KeyedBackend;

    impl FingerprintBackend for KeyedBackend {
        fn name(&self) -> &'static str {
            "keyed-test"
        }

        fn fingerprint(&self, samples: &[f32], _sample_rate: u32) -> Option<Vec<u8>> {
            let key = samples.iter().fold(0f32, |m, s| m.max(*s));
            let word = if key < 50.0 { MATCH_WORD } else { MISMATCH_WORD };
            Some(pack_words(&[word, word]))
        }
    }

    fn matcher_with_marker(time_ms: i64) -> ContentMatcher {
        let markers = vec![FingerprintMarker {
            time_ms,
            hash: pack_words(&[MATCH_WORD, MATCH_WORD]),
        }];
        ContentMatcher::new(
            markers,
            Fingerprinter::with_backend(Box::new(KeyedBackend), 1000),
        )
    }

    /// One second of "audio" at the 1 kHz test rate.
    fn matching_chunk() -> Vec<f32> {
        let mut c = vec![0.0f32; 1000];
        c[0] = 3.0;
        c
    }

    fn mismatching_chunk() -> Vec<f32> {
        let mut c = vec![0.0f32; 1000];
        c[0] = 99.0;
        c
    }

    #[test]
    fn buffers_until_target_duration() {
        let mut m = matcher_with_marker(60_000);
        for i in 0..4 {
            assert_eq!(
                m.add_audio(&matching_chunk(), i * 1000),
                MatchOutcome::Buffering,
                "chunk {i} should still buffer"
            );
        }
        // Fifth second crosses the 5000 ms target.
        let outcome = m.add_audio(&matching_chunk(), 4000);
        assert!(matches!(outcome, MatchOutcome::Synced { .. }));
    }

    #[test]
    fn offset_is_wall_minus_matched_time() {
        let mut m = matcher_with_marker(60_000);
        let mut outcome = MatchOutcome::Buffering;
        for i in 0..5 {
            outcome = m.add_audio(&matching_chunk(), 70_000 + i * 1000);
        }
        match outcome {
            MatchOutcome::Synced {
                content_time_ms,
                offset_ms,
                ..
            } => {
                assert_eq!(content_time_ms, 60_000);
                assert_eq!(offset_ms, 74_000 - 60_000);
            }
            other => panic!("expected Synced, got {other:?}"),
        }
        assert_eq!(m.content_time(80_000), Some(66_000));
    }

    #[test]
    fn offset_updates_are_smoothed() {
        let mut m = matcher_with_marker(0);
        for i in 0..5 {
            m.add_audio(&matching_chunk(), 10_000 + i * 1000);
        }
        // Match fired on the fifth chunk at wall 14 000.
        assert_eq!(m.offset_ms().unwrap(), 14_000);

        // Three chunks of overlap were retained, so the next match fires on
        // the second new chunk, at wall 25 000 — smoothed 0.7 old + 0.3 new.
        for i in 0..2 {
            m.add_audio(&matching_chunk(), 24_000 + i * 1000);
        }
        assert_eq!(
            m.offset_ms().unwrap(),
            (0.7 * 14_000.0 + 0.3 * 25_000.0) as i64
        );
    }

    #[test]
    fn sync_declared_lost_after_thirty_seconds() {
        let mut m = matcher_with_marker(0);
        for i in 0..5 {
            m.add_audio(&matching_chunk(), i * 1000);
        }
        assert!(m.is_synced());

        // Feed non-matching audio far in the future until loss is declared.
        let mut outcomes = Vec::new();
        for i in 0..5 {
            outcomes.push(m.add_audio(&mismatching_chunk(), 40_000 + i * 1000));
        }
        assert!(
            outcomes.iter().any(|o| matches!(o, MatchOutcome::Lost { .. })),
            "expected a Lost outcome, got {outcomes:?}"
        );
        assert!(!m.is_synced());
    }

    #[test]
    fn reset_clears_all_state() {
        let mut m = matcher_with_marker(0);
        for i in 0..5 {
            m.add_audio(&matching_chunk(), i * 1000);
        }
        m.reset();
        assert!(!m.is_synced());
        assert_eq!(m.offset_ms(), None);
        assert_eq!(m.add_audio(&matching_chunk(), 0), MatchOutcome::Buffering);
    }
}
