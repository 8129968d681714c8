//! Acoustic fingerprints for coarse content alignment.
//!
//! A fingerprint is an opaque byte string interpreted as an array of 32-bit
//! words. Similarity is bitwise: two fingerprints are compared by Hamming
//! distance over their common-length prefix. Fingerprints only need to rank
//! candidate positions within one title — global uniqueness across a corpus
//! is explicitly not a goal.
//!
//! Two interchangeable backends exist behind [`FingerprintBackend`]:
//!
//! - [`SpectralBackend`] — in-process, FFT band-energy hashing.
//! - [`FpcalcBackend`] — shells out to the `fpcalc` tool when installed.
//!
//! [`Fingerprinter::resolve`] picks the in-process backend; hosts that want
//! tool-compatible fingerprints construct the fpcalc backend explicitly.

pub mod matcher;

use std::path::PathBuf;

use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A fingerprint marker at a specific content time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintMarker {
    pub time_ms: i64,
    /// Packed u32 words, base64 on the wire.
    #[serde(with = "b64_bytes")]
    pub hash: Vec<u8>,
}

mod b64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Pack u32 words into little-endian bytes.
pub fn pack_words(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

/// Unpack little-endian bytes into u32 words. Trailing partial words are
/// ignored.
pub fn unpack_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Bit similarity of two fingerprints in [0, 1].
///
/// Truncates to the common length; similarity is
/// `1 − hamming_bits / (len × 32)`.
pub fn compare(a: &[u8], b: &[u8]) -> f32 {
    let wa = unpack_words(a);
    let wb = unpack_words(b);
    let len = wa.len().min(wb.len());
    if len == 0 {
        return 0.0;
    }

    let diff_bits: u32 = wa[..len]
        .iter()
        .zip(&wb[..len])
        .map(|(x, y)| (x ^ y).count_ones())
        .sum();
    let total_bits = (len * 32) as f32;

    1.0 - diff_bits as f32 / total_bits
}

/// Match a live fingerprint against known markers.
///
/// Returns the best-scoring marker whose similarity strictly exceeds
/// `threshold`; ties break to the earlier `time_ms`. Empty marker lists
/// never match.
pub fn match_markers(
    live: &[u8],
    markers: &[FingerprintMarker],
    threshold: f32,
) -> Option<(i64, f32)> {
    let mut best: Option<(i64, f32)> = None;

    for marker in markers {
        let score = compare(live, &marker.hash);
        if score <= threshold {
            continue;
        }
        // Strictly-greater replacement keeps the earliest marker on ties
        // because markers are iterated in time order.
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((marker.time_ms, score)),
        }
    }

    best
}

/// Default match threshold.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

/// A fingerprint computation backend.
pub trait FingerprintBackend: Send + Sync {
    /// Algorithm tag stored in cue files. All markers in one file share it.
    fn name(&self) -> &'static str;

    /// Compute a packed-u32 fingerprint of mono f32 samples.
    /// `None` means the backend could not produce one (too short, tool
    /// failure); callers skip the window.
    fn fingerprint(&self, samples: &[f32], sample_rate: u32) -> Option<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// In-process spectral backend
// ---------------------------------------------------------------------------

const SPECTRAL_FRAME: usize = 4096;
const SPECTRAL_HOP: usize = 2048;
const SPECTRAL_BANDS: usize = 17; // 16 comparisons → 16 bits × 2 frames = 32

/// FFT band-energy hashing.
///
/// Per frame, energies in 17 log-spaced bands are reduced to a 32-bit word
/// by sign-comparing band/time energy differences against the previous
/// frame — robust to level changes, cheap to compute.
pub struct SpectralBackend;

impl SpectralBackend {
    fn band_energies(spectrum: &[Complex<f32>]) -> [f32; SPECTRAL_BANDS] {
        let mut bands = [0f32; SPECTRAL_BANDS];
        let bins = spectrum.len();
        if bins < SPECTRAL_BANDS + 1 {
            return bands;
        }
        // Log-spaced band edges over the positive spectrum.
        for (b, band) in bands.iter_mut().enumerate() {
            let lo = (bins as f32).powf(b as f32 / SPECTRAL_BANDS as f32) as usize;
            let hi = ((bins as f32).powf((b + 1) as f32 / SPECTRAL_BANDS as f32) as usize)
                .clamp(lo + 1, bins);
            let mut sum = 0f32;
            for bin in &spectrum[lo..hi] {
                sum += bin.norm_sqr();
            }
            *band = sum / (hi - lo) as f32;
        }
        bands
    }
}

impl FingerprintBackend for SpectralBackend {
    fn name(&self) -> &'static str {
        "spectral32"
    }

    fn fingerprint(&self, samples: &[f32], _sample_rate: u32) -> Option<Vec<u8>> {
        if samples.len() < SPECTRAL_FRAME * 2 {
            return None;
        }

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(SPECTRAL_FRAME);
        let hann: Vec<f32> = (0..SPECTRAL_FRAME)
            .map(|i| {
                let x = std::f32::consts::PI * i as f32 / (SPECTRAL_FRAME - 1) as f32;
                x.sin() * x.sin()
            })
            .collect();

        let n_frames = (samples.len() - SPECTRAL_FRAME) / SPECTRAL_HOP + 1;
        let mut frames: Vec<[f32; SPECTRAL_BANDS]> = Vec::with_capacity(n_frames);
        let mut buf = vec![Complex::new(0f32, 0f32); SPECTRAL_FRAME];

        for f in 0..n_frames {
            let start = f * SPECTRAL_HOP;
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = Complex::new(samples[start + i] * hann[i], 0.0);
            }
            fft.process(&mut buf);
            frames.push(Self::band_energies(&buf[..SPECTRAL_FRAME / 2]));
        }

        if frames.len() < 2 {
            return None;
        }

        // One 32-bit word per frame pair: bit b set when the band-energy
        // gradient is positive in both band and time.
        let mut words = Vec::with_capacity(frames.len() - 1);
        for pair in frames.windows(2) {
            let (prev, cur) = (&pair[0], &pair[1]);
            let mut word = 0u32;
            for b in 0..SPECTRAL_BANDS - 1 {
                let grad = (cur[b] - cur[b + 1]) - (prev[b] - prev[b + 1]);
                if grad > 0.0 {
                    word |= 1 << b;
                }
                // Second bit plane in the upper half.
                let level = cur[b] - prev[b];
                if level > 0.0 {
                    word |= 1 << (b + 16).min(31);
                }
            }
            words.push(word);
        }

        Some(pack_words(&words))
    }
}

// ---------------------------------------------------------------------------
// External tool backend
// ---------------------------------------------------------------------------

/// `fpcalc -raw -json` subprocess backend.
pub struct FpcalcBackend {
    path: PathBuf,
}

impl FpcalcBackend {
    /// Look for `fpcalc` on PATH. Returns `None` when not installed.
    pub fn discover() -> Option<Self> {
        let path_var = std::env::var_os("PATH")?;
        for dir in std::env::split_paths(&path_var) {
            for name in ["fpcalc", "fpcalc.exe"] {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    debug!(path = %candidate.display(), "found fpcalc");
                    return Some(Self { path: candidate });
                }
            }
        }
        None
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    fn write_temp_wav(samples: &[f32], sample_rate: u32) -> std::io::Result<PathBuf> {
        let path = std::env::temp_dir().join(format!(
            "opencue-fp-{}-{:08x}.wav",
            std::process::id(),
            rand::random::<u32>()
        ));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        for s in samples {
            writer
                .write_sample((s.clamp(-1.0, 1.0) * 32767.0) as i16)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        }
        writer
            .finalize()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(path)
    }
}

#[derive(Deserialize)]
struct FpcalcOutput {
    #[serde(default)]
    fingerprint: Vec<u32>,
}

impl FingerprintBackend for FpcalcBackend {
    fn name(&self) -> &'static str {
        "chromaprint"
    }

    fn fingerprint(&self, samples: &[f32], sample_rate: u32) -> Option<Vec<u8>> {
        let wav_path = match Self::write_temp_wav(samples, sample_rate) {
            Ok(p) => p,
            Err(e) => {
                warn!("fpcalc temp wav failed: {e}");
                return None;
            }
        };

        let output = std::process::Command::new(&self.path)
            .arg("-raw")
            .arg("-json")
            .arg(&wav_path)
            .output();
        let _ = std::fs::remove_file(&wav_path);

        let output = match output {
            Ok(o) if o.status.success() => o,
            Ok(o) => {
                warn!(
                    "fpcalc exited with {}: {}",
                    o.status,
                    String::from_utf8_lossy(&o.stderr)
                );
                return None;
            }
            Err(e) => {
                warn!("fpcalc spawn failed: {e}");
                return None;
            }
        };

        let parsed: FpcalcOutput = match serde_json::from_slice(&output.stdout) {
            Ok(p) => p,
            Err(e) => {
                warn!("fpcalc output parse failed: {e}");
                return None;
            }
        };
        if parsed.fingerprint.is_empty() {
            return None;
        }
        Some(pack_words(&parsed.fingerprint))
    }
}

// ---------------------------------------------------------------------------
// Front door
// ---------------------------------------------------------------------------

/// Fingerprint computation with a resolved backend.
pub struct Fingerprinter {
    backend: Box<dyn FingerprintBackend>,
    pub sample_rate: u32,
}

impl Fingerprinter {
    /// Pick a backend: the in-process spectral backend is always available.
    pub fn resolve(sample_rate: u32) -> Self {
        Self {
            backend: Box::new(SpectralBackend),
            sample_rate,
        }
    }

    /// Use an explicit backend (e.g. fpcalc for tool-compatible markers).
    pub fn with_backend(backend: Box<dyn FingerprintBackend>, sample_rate: u32) -> Self {
        Self {
            backend,
            sample_rate,
        }
    }

    pub fn algorithm(&self) -> &'static str {
        self.backend.name()
    }

    pub fn fingerprint(&self, samples: &[f32]) -> Option<Vec<u8>> {
        self.backend.fingerprint(samples, self.sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn pack_unpack_round_trip_preserves_words() {
        let words = vec![0u32, 1, 0xDEAD_BEEF, u32::MAX, 42];
        let packed = pack_words(&words);
        assert_eq!(unpack_words(&packed), words);
    }

    #[test]
    fn identical_fingerprints_compare_to_one() {
        let fp = pack_words(&[0x1234_5678, 0x9ABC_DEF0]);
        assert_abs_diff_eq!(compare(&fp, &fp), 1.0);
    }

    #[test]
    fn complementary_fingerprints_compare_to_zero() {
        let a = pack_words(&[0u32, 0]);
        let b = pack_words(&[u32::MAX, u32::MAX]);
        assert_abs_diff_eq!(compare(&a, &b), 0.0);
    }

    #[test]
    fn compare_truncates_to_common_length() {
        let a = pack_words(&[0xFFFF_FFFF]);
        let b = pack_words(&[0xFFFF_FFFF, 0]);
        assert_abs_diff_eq!(compare(&a, &b), 1.0);
    }

    #[test]
    fn match_with_empty_markers_returns_none() {
        let live = pack_words(&[1, 2, 3]);
        assert!(match_markers(&live, &[], DEFAULT_MATCH_THRESHOLD).is_none());
    }

    #[test]
    fn match_requires_strictly_above_threshold() {
        let live = pack_words(&[0u32]);
        // Exactly 50% of bits differ: score == 0.5, not > 0.5.
        let markers = vec![FingerprintMarker {
            time_ms: 1000,
            hash: pack_words(&[0x0000_FFFF]),
        }];
        assert!(match_markers(&live, &markers, 0.5).is_none());
    }

    #[test]
    fn match_ties_break_to_earlier_marker() {
        let live = pack_words(&[0xAAAA_AAAA]);
        let markers = vec![
            FingerprintMarker {
                time_ms: 5000,
                hash: pack_words(&[0xAAAA_AAAA]),
            },
            FingerprintMarker {
                time_ms: 9000,
                hash: pack_words(&[0xAAAA_AAAA]),
            },
        ];
        let (time_ms, score) = match_markers(&live, &markers, 0.5).unwrap();
        assert_eq!(time_ms, 5000);
        assert_abs_diff_eq!(score, 1.0);
    }

    #[test]
    fn marker_serde_round_trips_hash_bytes() {
        let marker = FingerprintMarker {
            time_ms: 7500,
            hash: pack_words(&[0xCAFE_BABE, 7]),
        };
        let json = serde_json::to_string(&marker).unwrap();
        let back: FingerprintMarker = serde_json::from_str(&json).unwrap();
        assert_eq!(back.time_ms, 7500);
        assert_eq!(unpack_words(&back.hash), vec![0xCAFE_BABE, 7]);
    }

    #[test]
    fn spectral_backend_is_deterministic_and_discriminative() {
        let backend = SpectralBackend;
        let tone: Vec<f32> = (0..32_768)
            .map(|i| (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / 22_050.0).sin())
            .collect();
        let sweep: Vec<f32> = (0..32_768)
            .map(|i| {
                let t = i as f32 / 22_050.0;
                (2.0 * std::f32::consts::PI * (200.0 + 300.0 * t) * t).sin()
            })
            .collect();

        let fp_tone = backend.fingerprint(&tone, 22_050).unwrap();
        let fp_tone2 = backend.fingerprint(&tone, 22_050).unwrap();
        let fp_sweep = backend.fingerprint(&sweep, 22_050).unwrap();

        assert_eq!(fp_tone, fp_tone2);
        assert!(compare(&fp_tone, &fp_tone) > compare(&fp_tone, &fp_sweep));
    }

    #[test]
    fn spectral_backend_rejects_short_input() {
        assert!(SpectralBackend.fingerprint(&[0.0; 100], 22_050).is_none());
    }
}
