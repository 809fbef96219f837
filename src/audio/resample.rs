//! # Sample-Rate Conversion
//!
//! Integer-ratio resampling between the narrowband telephony rate and the
//! wideband rates used by the generative-audio peer.
//!
//! ## Supported Conversions:
//! - **8 kHz → 16 kHz / 24 kHz**: upsampling by 2 or 3
//! - **16 kHz / 24 kHz → 8 kHz**: downsampling by 2 or 3
//!
//! ## Fidelity Trade-offs:
//! Plain decimation keeps every n-th sample and applies no low-pass filter, so
//! energy above the new Nyquist frequency aliases back into the band. The
//! optional averaging mode is a cheap box filter that removes most of it.
//! Chunks are resampled independently; the last sample of a chunk is
//! interpolated against itself rather than against the next chunk.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A sample rate in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleRate(pub u32);

impl SampleRate {
    /// Telephony media stream rate.
    pub const NARROWBAND: SampleRate = SampleRate(8_000);
    /// Rate the audio peer expects for realtime input.
    pub const WIDEBAND_INPUT: SampleRate = SampleRate(16_000);
    /// Rate the audio peer produces.
    pub const WIDEBAND_OUTPUT: SampleRate = SampleRate(24_000);

    pub fn as_hz(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz", self.0)
    }
}

/// How intermediate samples are produced when raising the rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpsampleMode {
    /// Rounded linear interpolation between neighbouring samples.
    #[default]
    Linear,
    /// Repeat each sample (cheapest, audibly harsher).
    Hold,
}

/// How samples are dropped when lowering the rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DownsampleMode {
    /// Keep every n-th sample, no filtering.
    #[default]
    Decimate,
    /// Average each group of n samples.
    Average,
}

/// Resampling behaviour chosen in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResampleSettings {
    pub upsample: UpsampleMode,
    pub downsample: DownsampleMode,
}

/// Convert `samples` from `from` to `to`.
///
/// ## Returns:
/// - **Ok(samples)**: resampled audio (a copy when the rates match)
/// - **Err(UnsupportedRate)**: the rates are not related by an integer factor
pub fn resample(
    samples: &[i16],
    from: SampleRate,
    to: SampleRate,
    settings: &ResampleSettings,
) -> Result<Vec<i16>, RelayError> {
    if from == to {
        return Ok(samples.to_vec());
    }

    if from.0 == 0 || to.0 == 0 {
        return Err(RelayError::UnsupportedRate { from: from.0, to: to.0 });
    }

    if to.0 > from.0 && to.0 % from.0 == 0 {
        let factor = (to.0 / from.0) as usize;
        return Ok(match settings.upsample {
            UpsampleMode::Linear => upsample_linear(samples, factor),
            UpsampleMode::Hold => upsample_hold(samples, factor),
        });
    }

    if from.0 > to.0 && from.0 % to.0 == 0 {
        let factor = (from.0 / to.0) as usize;
        return Ok(match settings.downsample {
            DownsampleMode::Decimate => decimate(samples, factor),
            DownsampleMode::Average => average_down(samples, factor),
        });
    }

    Err(RelayError::UnsupportedRate { from: from.0, to: to.0 })
}

/// Check that a rate pair can be bridged by [`resample`].
pub fn is_integer_ratio(from: SampleRate, to: SampleRate) -> bool {
    if from.0 == 0 || to.0 == 0 {
        return false;
    }
    from.0 % to.0 == 0 || to.0 % from.0 == 0
}

/// Keep every `factor`-th sample. Output length is `floor(len / factor)`.
pub fn decimate(samples: &[i16], factor: usize) -> Vec<i16> {
    if factor <= 1 {
        return samples.to_vec();
    }
    samples.chunks_exact(factor).map(|group| group[0]).collect()
}

/// Replace each complete group of `factor` samples by its mean.
pub fn average_down(samples: &[i16], factor: usize) -> Vec<i16> {
    if factor <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(factor)
        .map(|group| {
            let sum: i32 = group.iter().map(|&s| s as i32).sum();
            div_round(sum, factor as i32) as i16
        })
        .collect()
}

/// Raise the rate by `factor` using rounded linear interpolation.
///
/// `out[factor * i] == samples[i]`; the points in between move linearly towards
/// `samples[i + 1]`. The final sample has no successor and is held.
pub fn upsample_linear(samples: &[i16], factor: usize) -> Vec<i16> {
    if factor <= 1 {
        return samples.to_vec();
    }

    let mut out = Vec::with_capacity(samples.len() * factor);
    let k = factor as i32;

    for (i, &current) in samples.iter().enumerate() {
        let next = samples.get(i + 1).copied().unwrap_or(current);
        let (a, b) = (current as i32, next as i32);

        out.push(current);
        for j in 1..k {
            out.push(div_round(a * (k - j) + b * j, k) as i16);
        }
    }

    out
}

/// Raise the rate by `factor` by repeating every sample.
pub fn upsample_hold(samples: &[i16], factor: usize) -> Vec<i16> {
    if factor <= 1 {
        return samples.to_vec();
    }
    samples
        .iter()
        .flat_map(|&s| std::iter::repeat(s).take(factor))
        .collect()
}

/// Integer division rounding half away from zero.
fn div_round(numerator: i32, denominator: i32) -> i32 {
    if numerator >= 0 {
        (numerator + denominator / 2) / denominator
    } else {
        (numerator - denominator / 2) / denominator
    }
}
