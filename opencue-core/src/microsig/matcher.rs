//! Microsignature sequence alignment.
//!
//! Candidate offsets are seeded from cross-pairs of onset events (first 10
//! of each side) and same-type silence transitions, plus zero. Each
//! candidate is scored by greedily pairing reference events with the first
//! unmatched live event of the same type inside the match window; closer
//! and stronger pairs score higher, weighted by event type.

use std::collections::BTreeSet;

use super::{MicrosignatureSequence, SigType};

/// Max time difference for pairing two events (ms).
const MATCH_WINDOW_MS: i64 = 100;

/// Minimum alignment score for a usable offset.
const MIN_MATCH_SCORE: f32 = 3.0;

/// Default search range for candidate offsets (±ms).
pub const DEFAULT_SEARCH_RANGE_MS: i64 = 5000;

/// Events considered per type when seeding candidate offsets.
const SEED_LIMIT: usize = 10;

fn type_weight(sig_type: SigType) -> f32 {
    match sig_type {
        SigType::Onset => 2.0,
        SigType::SilenceEnd | SigType::SilenceStart => 1.5,
        SigType::EnergyPeak => 1.0,
        SigType::SpectralFlux => 0.8,
    }
}

/// Matches microsignature sequences for sync verification.
pub struct MicrosigMatcher {
    match_window_ms: i64,
    min_score: f32,
}

impl Default for MicrosigMatcher {
    fn default() -> Self {
        Self {
            match_window_ms: MATCH_WINDOW_MS,
            min_score: MIN_MATCH_SCORE,
        }
    }
}

impl MicrosigMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the best offset aligning `live` to `reference`.
    ///
    /// Returns `(offset_ms, confidence)`; adding `offset_ms` to a live time
    /// yields the reference time. `None` when no candidate reaches the
    /// minimum score.
    pub fn find_offset(
        &self,
        reference: &MicrosignatureSequence,
        live: &MicrosignatureSequence,
        search_range_ms: i64,
    ) -> Option<(i64, f32)> {
        if reference.signatures.is_empty() || live.signatures.is_empty() {
            return None;
        }

        let mut candidates: BTreeSet<i64> = BTreeSet::new();
        candidates.insert(0);

        // Onset cross-pairs seed the most precise candidates.
        let ref_onsets = reference
            .signatures
            .iter()
            .filter(|s| s.sig_type == SigType::Onset)
            .take(SEED_LIMIT);
        for ref_sig in ref_onsets {
            let live_onsets = live
                .signatures
                .iter()
                .filter(|s| s.sig_type == SigType::Onset)
                .take(SEED_LIMIT);
            for live_sig in live_onsets {
                let offset = ref_sig.time_ms - live_sig.time_ms;
                if offset.abs() <= search_range_ms {
                    candidates.insert(offset);
                }
            }
        }

        // Same-type silence transition pairs.
        let is_silence = |t: SigType| matches!(t, SigType::SilenceStart | SigType::SilenceEnd);
        let ref_silence = reference
            .signatures
            .iter()
            .filter(|s| is_silence(s.sig_type))
            .take(SEED_LIMIT);
        for ref_sig in ref_silence {
            let live_silence = live
                .signatures
                .iter()
                .filter(|s| is_silence(s.sig_type))
                .take(SEED_LIMIT);
            for live_sig in live_silence {
                if ref_sig.sig_type != live_sig.sig_type {
                    continue;
                }
                let offset = ref_sig.time_ms - live_sig.time_ms;
                if offset.abs() <= search_range_ms {
                    candidates.insert(offset);
                }
            }
        }

        let mut best_offset = 0i64;
        let mut best_score = 0f32;
        for offset in candidates {
            let score = self.score_alignment(reference, live, offset);
            if score > best_score {
                best_score = score;
                best_offset = offset;
            }
        }

        if best_score < self.min_score {
            return None;
        }

        let max_possible = reference.signatures.len().min(live.signatures.len()) as f32;
        let confidence = (best_score / (max_possible * 0.5).max(1.0)).min(1.0);
        Some((best_offset, confidence))
    }

    /// Score how well the sequences align at `offset_ms`.
    ///
    /// Monotone in the match set: adding a pair can only raise the score.
    fn score_alignment(
        &self,
        reference: &MicrosignatureSequence,
        live: &MicrosignatureSequence,
        offset_ms: i64,
    ) -> f32 {
        let mut score = 0f32;
        let mut matched = vec![false; live.signatures.len()];

        for ref_sig in &reference.signatures {
            let adjusted = ref_sig.time_ms - offset_ms;

            for (i, live_sig) in live.signatures.iter().enumerate() {
                if matched[i] || live_sig.sig_type != ref_sig.sig_type {
                    continue;
                }
                let dt = (live_sig.time_ms - adjusted).abs();
                if dt <= self.match_window_ms {
                    let precision = 1.0 - dt as f32 / self.match_window_ms as f32;
                    let strength = (ref_sig.strength + live_sig.strength) / 2.0;
                    score += type_weight(ref_sig.sig_type) * precision * strength;
                    matched[i] = true;
                    break;
                }
            }
        }
        score
    }

    /// Verify that an existing sync offset is still accurate.
    ///
    /// Returns `(still_valid, best_offset)`. Weak evidence keeps the current
    /// offset rather than destabilising an established sync.
    pub fn verify_sync(
        &self,
        reference: &MicrosignatureSequence,
        live: &MicrosignatureSequence,
        expected_offset_ms: i64,
        tolerance_ms: i64,
    ) -> (bool, i64) {
        let Some((actual_offset, confidence)) =
            self.find_offset(reference, live, tolerance_ms * 2)
        else {
            return (true, expected_offset_ms); // No data, assume still valid
        };

        let drift = (actual_offset - expected_offset_ms).abs();
        if drift <= tolerance_ms && confidence > 0.5 {
            (true, actual_offset)
        } else if confidence < 0.3 {
            (true, expected_offset_ms)
        } else {
            (false, actual_offset)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::microsig::Microsignature;

    fn seq(events: &[(i64, SigType, f32)]) -> MicrosignatureSequence {
        let start = events.first().map(|e| e.0).unwrap_or(0);
        let end = events.last().map(|e| e.0).unwrap_or(0);
        MicrosignatureSequence {
            start_ms: start,
            end_ms: end,
            signatures: events
                .iter()
                .map(|(t, ty, s)| Microsignature {
                    time_ms: *t,
                    sig_type: *ty,
                    strength: *s,
                })
                .collect(),
        }
    }

    fn dense_reference(base: i64) -> MicrosignatureSequence {
        seq(&[
            (base, SigType::Onset, 0.9),
            (base + 300, SigType::SilenceEnd, 0.8),
            (base + 700, SigType::Onset, 0.9),
            (base + 1100, SigType::EnergyPeak, 0.7),
            (base + 1500, SigType::Onset, 1.0),
            (base + 1900, SigType::SilenceStart, 1.0),
        ])
    }

    #[test]
    fn empty_sequences_never_match() {
        let matcher = MicrosigMatcher::new();
        let reference = dense_reference(0);
        let empty = MicrosignatureSequence::new(0, 0);
        assert!(matcher
            .find_offset(&reference, &empty, DEFAULT_SEARCH_RANGE_MS)
            .is_none());
        assert!(matcher
            .find_offset(&empty, &reference, DEFAULT_SEARCH_RANGE_MS)
            .is_none());
    }

    #[test]
    fn recovers_known_offset() {
        let matcher = MicrosigMatcher::new();
        let reference = dense_reference(10_000);
        let live = dense_reference(7_000); // reference is 3 s ahead of live

        let (offset, confidence) = matcher
            .find_offset(&reference, &live, DEFAULT_SEARCH_RANGE_MS)
            .expect("expected a match");
        assert_eq!(offset, 3000);
        assert!(confidence > 0.5, "confidence={confidence}");
    }

    #[test]
    fn offset_outside_search_range_is_rejected() {
        let matcher = MicrosigMatcher::new();
        let reference = dense_reference(60_000);
        let live = dense_reference(0); // true offset 60 s, range ±5 s

        assert!(matcher
            .find_offset(&reference, &live, DEFAULT_SEARCH_RANGE_MS)
            .is_none());
    }

    #[test]
    fn scoring_is_monotone_in_match_set() {
        // A strict subset of matching events cannot outscore the superset
        // at the same offset.
        let matcher = MicrosigMatcher::new();
        let reference = dense_reference(0);
        let live_full = dense_reference(0);
        let live_subset = seq(&[
            (0, SigType::Onset, 0.9),
            (700, SigType::Onset, 0.9),
        ]);

        let full = matcher.score_alignment(&reference, &live_full, 0);
        let subset = matcher.score_alignment(&reference, &live_subset, 0);
        assert!(full > subset, "full={full} subset={subset}");
    }

    #[test]
    fn weak_matches_stay_below_threshold() {
        let matcher = MicrosigMatcher::new();
        let reference = seq(&[(0, SigType::SpectralFlux, 0.2)]);
        let live = seq(&[(50, SigType::SpectralFlux, 0.2)]);
        // One weak flux pair scores well under the minimum of 3.0.
        assert!(matcher
            .find_offset(&reference, &live, DEFAULT_SEARCH_RANGE_MS)
            .is_none());
    }

    #[test]
    fn verify_sync_accepts_small_drift() {
        let matcher = MicrosigMatcher::new();
        let reference = dense_reference(5_000);
        let live = dense_reference(4_950); // 50 ms drift from expected 0

        let (valid, offset) = matcher.verify_sync(&reference, &live, 0, 200);
        assert!(valid);
        assert_eq!(offset, 50);
    }

    #[test]
    fn verify_sync_flags_large_confident_drift() {
        let matcher = MicrosigMatcher::new();
        let reference = dense_reference(5_000);
        let live = dense_reference(4_700); // 300 ms drift, tolerance 200

        let (valid, offset) = matcher.verify_sync(&reference, &live, 0, 200);
        assert!(!valid);
        assert_eq!(offset, 300);
    }
}
