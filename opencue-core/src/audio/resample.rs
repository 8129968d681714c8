//! Sealed-buffer sample-rate conversion and normalisation.
//!
//! Capture runs at the device's native rate (44.1 or 48 kHz are common)
//! while the transcriber wants its own rate. Conversion happens exactly
//! once per recording, on the concatenated sealed buffer — never per chunk,
//! so waveform continuity is preserved across chunk boundaries and rubato's
//! fixed-size input blocks are fed from one contiguous slice.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, warn};

use crate::error::{OpenCueError, Result};

/// Input frames fed to rubato per block.
const BLOCK: usize = 1024;

/// Resample a complete sealed buffer from `from_rate` to `to_rate` Hz.
///
/// Equal rates return the input unchanged. The final partial block is
/// zero-padded through the resampler and the output trimmed back to the
/// exact length implied by the rate ratio.
///
/// # Errors
/// Returns `OpenCueError::Resample` when rubato fails to initialise or
/// process.
pub fn resample_sealed(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = FastFixedIn::<f32>::new(
        ratio,
        1.0, // fixed ratio — no dynamic adjustment
        PolynomialDegree::Cubic,
        BLOCK,
        1, // mono
    )
    .map_err(|e| OpenCueError::Resample(format!("resampler init: {e}")))?;

    let expected = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut out: Vec<f32> = Vec::with_capacity(expected + BLOCK);
    let mut output_block = vec![vec![0f32; resampler.output_frames_max()]; 1];
    let mut padded = vec![0f32; BLOCK];

    for block in samples.chunks(BLOCK) {
        let input: &[f32] = if block.len() == BLOCK {
            block
        } else {
            padded[..block.len()].copy_from_slice(block);
            padded[block.len()..].fill(0.0);
            &padded[..]
        };

        let (_consumed, produced) = resampler
            .process_into_buffer(&[input], &mut output_block, None)
            .map_err(|e| OpenCueError::Resample(format!("resampler process: {e}")))?;
        out.extend_from_slice(&output_block[0][..produced]);
    }

    // Drop the zero-padding tail.
    out.truncate(expected);

    debug!(
        from_rate,
        to_rate,
        in_samples = samples.len(),
        out_samples = out.len(),
        "sealed buffer resampled"
    );
    Ok(out)
}

/// Scale the buffer in place so its peak equals `target_peak`, capped at
/// `max_gain`. Silent buffers pass through unchanged.
pub fn normalize_peak(samples: &mut [f32], target_peak: f32, max_gain: f32) {
    let peak = samples.iter().fold(0f32, |m, s| m.max(s.abs()));
    if peak == 0.0 {
        warn!("buffer is completely silent — skipping normalisation");
        return;
    }

    let mut gain = target_peak / peak;
    if gain > max_gain {
        warn!(gain, max_gain, "very quiet capture — limiting gain");
        gain = max_gain;
    }

    for s in samples.iter_mut() {
        *s *= gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn same_rate_is_identity() {
        let samples: Vec<f32> = (0..1000).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = resample_sealed(&samples, 16_000, 16_000).unwrap();
        assert_eq!(out, samples);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(resample_sealed(&[], 48_000, 16_000).unwrap().is_empty());
    }

    #[test]
    fn downsample_hits_exact_expected_length() {
        // 2 s at 44.1 kHz -> 2 s at 16 kHz.
        let samples = vec![0.1f32; 88_200];
        let out = resample_sealed(&samples, 44_100, 16_000).unwrap();
        assert_eq!(out.len(), 32_000);
    }

    #[test]
    fn upsample_hits_exact_expected_length() {
        let samples = vec![0.1f32; 16_000];
        let out = resample_sealed(&samples, 16_000, 48_000).unwrap();
        assert_eq!(out.len(), 48_000);
    }

    #[test]
    fn constant_signal_survives_conversion() {
        let samples = vec![0.5f32; 48_000];
        let out = resample_sealed(&samples, 48_000, 16_000).unwrap();
        // Away from the edges the interpolated constant stays constant.
        let mid = &out[1000..out.len() - 1000];
        assert!(mid.iter().all(|s| (s - 0.5).abs() < 1e-3));
    }

    #[test]
    fn partial_final_block_is_flushed() {
        // 1.3 blocks of input: the tail past the last full block must still
        // contribute output rather than being dropped.
        let samples = vec![0.2f32; BLOCK + 300];
        let out = resample_sealed(&samples, 48_000, 16_000).unwrap();
        let expected = ((BLOCK + 300) as u64 * 16_000 / 48_000) as usize;
        assert_eq!(out.len(), expected);
    }

    #[test]
    fn normalize_scales_peak_to_target() {
        let mut samples = vec![0.0, 0.3, -0.45, 0.1];
        normalize_peak(&mut samples, 0.9, 10.0);
        assert_abs_diff_eq!(samples[2], -0.9, epsilon = 1e-6);
        assert_abs_diff_eq!(samples[1], 0.6, epsilon = 1e-6);
    }

    #[test]
    fn normalize_caps_gain() {
        let mut samples = vec![0.001f32, -0.001];
        normalize_peak(&mut samples, 0.9, 10.0);
        assert_abs_diff_eq!(samples[0], 0.01, epsilon = 1e-6);
    }

    #[test]
    fn normalize_leaves_silence_alone() {
        let mut samples = vec![0.0f32; 16];
        normalize_peak(&mut samples, 0.9, 10.0);
        assert!(samples.iter().all(|s| *s == 0.0));
    }
}
