//! Audio microsignatures — lightweight event markers for fine alignment.
//!
//! Unlike fingerprints, microsignatures only need to be unique within a
//! small time window. They mark *events*: sound onsets, energy peaks,
//! silence transitions, and spectral-flux spikes. Matching two sequences of
//! events gives sub-100 ms alignment at a fraction of the fingerprint cost.

pub mod extract;
pub mod matcher;

use serde::{Deserialize, Serialize};

/// The kind of audio event a microsignature marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigType {
    /// Sound start (consonant, impact) — highest timing precision.
    #[serde(rename = "onset")]
    Onset,
    /// Local volume spike.
    #[serde(rename = "peak")]
    EnergyPeak,
    /// Sudden tonal change.
    #[serde(rename = "flux")]
    SpectralFlux,
    /// Transition into quiet.
    #[serde(rename = "silence")]
    SilenceStart,
    /// Transition out of quiet.
    #[serde(rename = "voice")]
    SilenceEnd,
}

/// A single microsignature event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Microsignature {
    pub time_ms: i64,
    #[serde(rename = "type")]
    pub sig_type: SigType,
    /// How prominent the event is, in [0, 1].
    pub strength: f32,
}

/// A time-sorted run of microsignatures over one audio range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MicrosignatureSequence {
    pub start_ms: i64,
    pub end_ms: i64,
    pub signatures: Vec<Microsignature>,
}

impl MicrosignatureSequence {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self {
            start_ms,
            end_ms,
            signatures: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
