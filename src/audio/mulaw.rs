//! # G.711 μ-law Codec
//!
//! Converts between 16-bit linear PCM samples and the 8-bit logarithmically
//! companded bytes carried on the telephony media stream.
//!
//! ## Encoding Layout:
//! Each byte packs `sign (1 bit) | exponent (3 bits) | mantissa (4 bits)` and is
//! transmitted bit-inverted, so silence (`0`) goes out as `0xFF`.
//!
//! ## Key Properties:
//! - **Stateless**: every sample/byte is converted independently
//! - **Lossy**: the reconstruction error grows with the magnitude of the sample
//! - **Stable on the wire**: re-encoding a decoded byte yields the same byte
//!   (the negative-zero code `0x7F` is the one exception, it canonicalises to `0xFF`)

/// Added to the magnitude before segment lookup so every segment starts on a power of two.
pub const BIAS: i32 = 0x84;

/// Largest magnitude that survives biasing without leaving 15 bits.
pub const CLIP: i32 = 32635;

const SIGN_BIT: u8 = 0x80;

/// Encode one linear sample into a μ-law byte.
///
/// ## Algorithm:
/// 1. Split into sign and magnitude (computed in `i32`, so `i16::MIN` is safe)
/// 2. Clamp the magnitude to [`CLIP`] and add [`BIAS`]
/// 3. The highest set bit of `magnitude >> 7` gives the 3-bit exponent
/// 4. The four bits directly below that bit are the mantissa
/// 5. Pack the fields and invert
pub fn encode(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        SIGN_BIT
    } else {
        0
    };

    let biased = magnitude.min(CLIP) + BIAS;
    let exponent = segment_of(biased);
    let mantissa = ((biased >> (exponent + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

/// Decode one μ-law byte back into a linear sample.
pub fn decode(byte: u8) -> i16 {
    let byte = !byte;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = (byte & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;

    if byte & SIGN_BIT != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode a run of samples, one output byte per sample.
pub fn encode_samples(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&sample| encode(sample)).collect()
}

/// Decode a run of μ-law bytes, one output sample per byte.
pub fn decode_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&byte| decode(byte)).collect()
}

/// Width of the companding interval that contains `sample`.
///
/// Decoding returns the midpoint of the interval, so `decode(encode(x))` never
/// strays further than this from `x` (clipped magnitudes included).
pub fn quantization_step(sample: i16) -> i32 {
    let magnitude = (sample as i32).abs().min(CLIP) + BIAS;
    1 << (segment_of(magnitude) + 3)
}

/// Exponent (0-7) of a biased magnitude in `BIAS..=CLIP + BIAS`.
fn segment_of(biased: i32) -> u8 {
    // biased >> 7 is in 1..=255, so the cast keeps every set bit
    let top = (biased >> 7) as u8;
    7 - top.leading_zeros() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_and_extremes() {
        assert_eq!(encode(0), 0xFF);
        assert_eq!(decode(0xFF), 0);

        // Full-scale values clamp instead of wrapping into a small segment
        assert_eq!(encode(i16::MAX), 0x80);
        assert_eq!(encode(i16::MIN), 0x00);
        assert_eq!(decode(0x80), 32124);
        assert_eq!(decode(0x00), -32124);
    }

    #[test]
    fn test_round_trip_within_quantization_step() {
        for x in i16::MIN..=i16::MAX {
            let restored = decode(encode(x)) as i32;
            let error = (restored - x as i32).abs();
            assert!(
                error <= quantization_step(x),
                "sample {} decoded to {} (error {}, step {})",
                x, restored, error, quantization_step(x)
            );
        }
    }

    #[test]
    fn test_wire_bytes_are_stable() {
        for b in 0..=255u8 {
            let expected = if b == 0x7F { 0xFF } else { b };
            assert_eq!(encode(decode(b)), expected, "byte {:#04x}", b);
        }
    }

    #[test]
    fn test_encoding_is_monotonic_in_magnitude() {
        let mut last = decode(encode(0));
        for x in (0..=i16::MAX).step_by(7) {
            let current = decode(encode(x));
            assert!(current >= last, "{} decoded below its predecessor", x);
            last = current;
        }
    }

    #[test]
    fn test_slice_helpers_match_scalar_functions() {
        let samples = [0i16, 100, -100, 5000, -5000, i16::MAX];
        let encoded = encode_samples(&samples);
        assert_eq!(encoded.len(), samples.len());
        assert_eq!(encoded[3], encode(5000));

        let decoded = decode_bytes(&encoded);
        assert_eq!(decoded[4], decode(encode(-5000)));
    }
}
