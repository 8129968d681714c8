//! Microsignature extraction.
//!
//! ## Algorithm
//!
//! The audio is peak-normalised, then framed (512 samples, 256 hop). Per
//! frame the RMS energy drives four detectors:
//!
//! 1. **Onset** — energy rise above 0.15 landing above the silence floor.
//! 2. **Energy peak** — strict local maximum above 0.3 that stands at least
//!    0.1 proud of its ±3-frame neighbourhood.
//! 3. **Silence transitions** — crossings of the 0.02 silence floor.
//! 4. **Spectral flux** — Hann-windowed magnitude-spectrum positive
//!    difference sum ≥ 0.1 between consecutive frames.

use rustfft::{num_complex::Complex, FftPlanner};

use super::{Microsignature, MicrosignatureSequence, SigType};

/// Extracts microsignatures from mono f32 audio.
pub struct MicrosigExtractor {
    pub sample_rate: u32,
    frame_size: usize,
    hop_size: usize,
    onset_threshold: f32,
    peak_threshold: f32,
    silence_threshold: f32,
}

impl MicrosigExtractor {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frame_size: 512,
            hop_size: 256,
            onset_threshold: 0.15,
            peak_threshold: 0.3,
            silence_threshold: 0.02,
        }
    }

    /// Extract all signature types from `audio`, timestamped relative to
    /// `base_time_ms`.
    pub fn extract(&self, audio: &[f32], base_time_ms: i64) -> MicrosignatureSequence {
        if audio.len() < self.frame_size {
            return MicrosignatureSequence::new(base_time_ms, base_time_ms);
        }

        // Normalise so thresholds behave the same at any capture level.
        let peak = audio.iter().fold(0f32, |m, s| m.max(s.abs()));
        let normalized: Vec<f32> = if peak > 0.0 {
            audio.iter().map(|s| s / peak).collect()
        } else {
            audio.to_vec()
        };

        let energies = self.frame_energies(&normalized);
        let duration_ms = (audio.len() as i64 * 1000) / self.sample_rate as i64;

        let mut signatures = Vec::new();
        signatures.extend(self.detect_onsets(&energies, base_time_ms));
        signatures.extend(self.detect_energy_peaks(&energies, base_time_ms));
        signatures.extend(self.detect_silence_transitions(&energies, base_time_ms));
        signatures.extend(self.detect_spectral_flux(&normalized, base_time_ms));

        signatures.sort_by_key(|s| s.time_ms);

        MicrosignatureSequence {
            start_ms: base_time_ms,
            end_ms: base_time_ms + duration_ms,
            signatures,
        }
    }

    fn frame_count(&self, len: usize) -> usize {
        if len < self.frame_size {
            0
        } else {
            (len - self.frame_size) / self.hop_size + 1
        }
    }

    fn frame_time_ms(&self, frame: usize, base_time_ms: i64) -> i64 {
        base_time_ms + (frame * self.hop_size) as i64 * 1000 / self.sample_rate as i64
    }

    fn frame_energies(&self, audio: &[f32]) -> Vec<f32> {
        (0..self.frame_count(audio.len()))
            .map(|i| {
                let start = i * self.hop_size;
                let frame = &audio[start..start + self.frame_size];
                (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt()
            })
            .collect()
    }

    fn detect_onsets(&self, energies: &[f32], base_time_ms: i64) -> Vec<Microsignature> {
        let mut out = Vec::new();
        for i in 1..energies.len() {
            let diff = energies[i] - energies[i - 1];
            if diff > self.onset_threshold && energies[i] > self.silence_threshold {
                out.push(Microsignature {
                    time_ms: self.frame_time_ms(i, base_time_ms),
                    sig_type: SigType::Onset,
                    strength: (diff / 0.5).min(1.0),
                });
            }
        }
        out
    }

    fn detect_energy_peaks(&self, energies: &[f32], base_time_ms: i64) -> Vec<Microsignature> {
        let mut out = Vec::new();
        if energies.len() < 3 {
            return out;
        }
        for i in 1..energies.len() - 1 {
            if energies[i] <= energies[i - 1]
                || energies[i] <= energies[i + 1]
                || energies[i] <= self.peak_threshold
            {
                continue;
            }

            // Prominence: must clear the quietest point on each side of the
            // ±3-frame neighbourhood by 0.1.
            let left_min = energies[i.saturating_sub(3)..i]
                .iter()
                .copied()
                .fold(f32::MAX, f32::min);
            let right_min = energies[i + 1..(i + 4).min(energies.len())]
                .iter()
                .copied()
                .fold(f32::MAX, f32::min);
            let prominence = energies[i] - left_min.max(right_min);

            if prominence > 0.1 {
                out.push(Microsignature {
                    time_ms: self.frame_time_ms(i, base_time_ms),
                    sig_type: SigType::EnergyPeak,
                    strength: energies[i].min(1.0),
                });
            }
        }
        out
    }

    fn detect_silence_transitions(
        &self,
        energies: &[f32],
        base_time_ms: i64,
    ) -> Vec<Microsignature> {
        let mut out = Vec::new();
        if energies.len() < 2 {
            return out;
        }

        let mut in_silence = energies[0] < self.silence_threshold;
        for i in 1..energies.len() {
            let now_silent = energies[i] < self.silence_threshold;
            if in_silence && !now_silent {
                out.push(Microsignature {
                    time_ms: self.frame_time_ms(i, base_time_ms),
                    sig_type: SigType::SilenceEnd,
                    strength: (energies[i] / 0.3).min(1.0),
                });
            } else if !in_silence && now_silent {
                out.push(Microsignature {
                    time_ms: self.frame_time_ms(i, base_time_ms),
                    sig_type: SigType::SilenceStart,
                    strength: 1.0,
                });
            }
            in_silence = now_silent;
        }
        out
    }

    fn detect_spectral_flux(&self, audio: &[f32], base_time_ms: i64) -> Vec<Microsignature> {
        let n_frames = self.frame_count(audio.len());
        let mut out = Vec::new();
        if n_frames < 2 {
            return out;
        }

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(self.frame_size);
        let hann: Vec<f32> = (0..self.frame_size)
            .map(|i| {
                let x = std::f32::consts::PI * i as f32 / (self.frame_size - 1) as f32;
                x.sin() * x.sin()
            })
            .collect();

        let spectrum_len = self.frame_size / 2 + 1;
        let mut buf = vec![Complex::new(0f32, 0f32); self.frame_size];
        let mut prev_spectrum: Option<Vec<f32>> = None;

        for i in 0..n_frames {
            let start = i * self.hop_size;
            for (j, slot) in buf.iter_mut().enumerate() {
                *slot = Complex::new(audio[start + j] * hann[j], 0.0);
            }
            fft.process(&mut buf);
            let spectrum: Vec<f32> = buf[..spectrum_len].iter().map(|c| c.norm()).collect();

            if let Some(prev) = &prev_spectrum {
                let flux: f32 = spectrum
                    .iter()
                    .zip(prev)
                    .map(|(cur, old)| (cur - old).max(0.0))
                    .sum::<f32>()
                    / spectrum_len as f32;

                if flux >= 0.1 {
                    out.push(Microsignature {
                        time_ms: self.frame_time_ms(i, base_time_ms),
                        sig_type: SigType::SpectralFlux,
                        strength: (flux / 0.3).min(1.0),
                    });
                }
            }
            prev_spectrum = Some(spectrum);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 22_050;

    fn silence(ms: usize) -> Vec<f32> {
        vec![0.0; RATE as usize * ms / 1000]
    }

    fn tone(ms: usize, amplitude: f32) -> Vec<f32> {
        let n = RATE as usize * ms / 1000;
        (0..n)
            .map(|i| amplitude * (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / RATE as f32).sin())
            .collect()
    }

    #[test]
    fn short_input_yields_empty_sequence() {
        let extractor = MicrosigExtractor::new(RATE);
        let seq = extractor.extract(&[0.1; 100], 5000);
        assert!(seq.is_empty());
        assert_eq!(seq.start_ms, 5000);
        assert_eq!(seq.end_ms, 5000);
    }

    #[test]
    fn burst_after_silence_produces_onset_and_voice_events() {
        let extractor = MicrosigExtractor::new(RATE);
        let mut audio = silence(500);
        audio.extend(tone(300, 0.9));
        audio.extend(silence(500));

        let seq = extractor.extract(&audio, 0);
        let types: Vec<SigType> = seq.signatures.iter().map(|s| s.sig_type).collect();

        assert!(types.contains(&SigType::Onset), "missing onset in {types:?}");
        assert!(
            types.contains(&SigType::SilenceEnd),
            "missing silence-end in {types:?}"
        );
        assert!(
            types.contains(&SigType::SilenceStart),
            "missing silence-start in {types:?}"
        );

        // The onset should land near the 500 ms burst boundary.
        let onset = seq
            .signatures
            .iter()
            .find(|s| s.sig_type == SigType::Onset)
            .unwrap();
        assert!(
            (onset.time_ms - 500).abs() < 60,
            "onset at {} ms",
            onset.time_ms
        );
    }

    #[test]
    fn signatures_are_time_sorted() {
        let extractor = MicrosigExtractor::new(RATE);
        let mut audio = silence(200);
        audio.extend(tone(200, 0.8));
        audio.extend(silence(200));
        audio.extend(tone(200, 0.6));

        let seq = extractor.extract(&audio, 10_000);
        assert!(seq
            .signatures
            .windows(2)
            .all(|w| w[0].time_ms <= w[1].time_ms));
        assert!(seq.signatures.iter().all(|s| s.time_ms >= 10_000));
    }

    #[test]
    fn strengths_are_clamped_to_unit_range() {
        let extractor = MicrosigExtractor::new(RATE);
        let mut audio = silence(300);
        audio.extend(tone(300, 1.0));
        let seq = extractor.extract(&audio, 0);
        assert!(!seq.is_empty());
        assert!(seq
            .signatures
            .iter()
            .all(|s| (0.0..=1.0).contains(&s.strength)));
    }

    #[test]
    fn base_time_offsets_all_events() {
        let extractor = MicrosigExtractor::new(RATE);
        let mut audio = silence(300);
        audio.extend(tone(300, 0.9));

        let at_zero = extractor.extract(&audio, 0);
        let at_minute = extractor.extract(&audio, 60_000);

        assert_eq!(at_zero.signatures.len(), at_minute.signatures.len());
        for (a, b) in at_zero.signatures.iter().zip(&at_minute.signatures) {
            assert_eq!(b.time_ms - a.time_ms, 60_000);
        }
    }
}
