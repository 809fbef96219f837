//! # Transcoding Pipeline
//!
//! Composes the μ-law codec and the resampler into the two directions of the relay.
//!
//! ## Directions:
//! - **Uplink**: telephony μ-law @ 8 kHz → little-endian 16-bit PCM @ peer input rate
//! - **Downlink**: little-endian 16-bit PCM @ peer output rate → μ-law @ 8 kHz
//!
//! Both directions are pure functions of the chunk they are given.

use crate::audio::mulaw;
use crate::audio::resample::{self, ResampleSettings, SampleRate};
use crate::error::RelayError;
use byteorder::{ByteOrder, LittleEndian};

/// Bytes per linear PCM sample.
pub const SAMPLE_WIDTH: usize = 2;

/// Per-call transcoder holding the negotiated rates.
#[derive(Debug, Clone)]
pub struct Transcoder {
    /// Rate the audio peer expects for realtime input
    peer_input_rate: SampleRate,
    /// Resampling modes for both directions
    settings: ResampleSettings,
}

impl Transcoder {
    pub fn new(peer_input_rate: SampleRate, settings: ResampleSettings) -> Self {
        Self {
            peer_input_rate,
            settings,
        }
    }

    pub fn peer_input_rate(&self) -> SampleRate {
        self.peer_input_rate
    }

    /// Convert one telephony chunk into linear PCM bytes for the audio peer.
    ///
    /// ## Example:
    /// 160 μ-law bytes (20ms @ 8kHz) become 640 bytes at 16kHz:
    /// 160 samples × 2 (upsampling) × 2 bytes per sample.
    pub fn uplink(&self, companded: &[u8]) -> Result<Vec<u8>, RelayError> {
        let narrowband = mulaw::decode_bytes(companded);
        let wideband = resample::resample(
            &narrowband,
            SampleRate::NARROWBAND,
            self.peer_input_rate,
            &self.settings,
        )?;
        Ok(samples_to_bytes(&wideband))
    }

    /// Convert one chunk of peer audio at `source_rate` into telephony μ-law bytes.
    ///
    /// ## Errors:
    /// - **MisalignedChunk**: the byte length is not a whole number of samples;
    ///   the chunk is rejected as a whole since every later sample would be shifted
    /// - **UnsupportedRate**: `source_rate` is not an integer multiple of 8kHz
    pub fn downlink(&self, linear: &[u8], source_rate: SampleRate) -> Result<Vec<u8>, RelayError> {
        let samples = bytes_to_samples(linear)?;
        let narrowband = resample::resample(
            &samples,
            source_rate,
            SampleRate::NARROWBAND,
            &self.settings,
        )?;
        Ok(mulaw::encode_samples(&narrowband))
    }
}

/// Reinterpret little-endian bytes as 16-bit samples.
pub fn bytes_to_samples(data: &[u8]) -> Result<Vec<i16>, RelayError> {
    if data.len() % SAMPLE_WIDTH != 0 {
        return Err(RelayError::MisalignedChunk { len: data.len() });
    }

    let mut samples = vec![0i16; data.len() / SAMPLE_WIDTH];
    LittleEndian::read_i16_into(data, &mut samples);
    Ok(samples)
}

/// Serialise 16-bit samples as little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut data = vec![0u8; samples.len() * SAMPLE_WIDTH];
    LittleEndian::write_i16_into(samples, &mut data);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::resample::DownsampleMode;

    fn transcoder() -> Transcoder {
        Transcoder::new(SampleRate::WIDEBAND_INPUT, ResampleSettings::default())
    }

    /// 20ms of a 440Hz tone at 8kHz, μ-law encoded.
    fn tone_chunk() -> Vec<u8> {
        let samples: Vec<i16> = (0..160)
            .map(|i| {
                let t = i as f32 / 8000.0;
                ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 12000.0) as i16
            })
            .collect();
        mulaw::encode_samples(&samples)
    }

    #[test]
    fn test_uplink_chunk_size() {
        let chunk = tone_chunk();
        let linear = transcoder().uplink(&chunk).unwrap();
        assert_eq!(linear.len(), 640);

        // Even output samples are the decoded input samples
        let samples = bytes_to_samples(&linear).unwrap();
        assert_eq!(samples[0], mulaw::decode(chunk[0]));
        assert_eq!(samples[10], mulaw::decode(chunk[5]));
    }

    #[test]
    fn test_downlink_from_output_rate() {
        let samples = vec![1000i16; 480]; // 20ms @ 24kHz
        let bytes = samples_to_bytes(&samples);
        let companded = transcoder().downlink(&bytes, SampleRate::WIDEBAND_OUTPUT).unwrap();
        assert_eq!(companded.len(), 160);
        assert!(companded.iter().all(|&b| b == mulaw::encode(1000)));
    }

    #[test]
    fn test_downlink_rejects_odd_length() {
        let result = transcoder().downlink(&[0u8; 961], SampleRate::WIDEBAND_OUTPUT);
        assert!(matches!(result, Err(RelayError::MisalignedChunk { len: 961 })));
    }

    #[test]
    fn test_downlink_after_uplink_recovers_signal() {
        let chunk = tone_chunk();
        let t = transcoder();

        let wideband = t.uplink(&chunk).unwrap();
        let restored = t.downlink(&wideband, SampleRate::WIDEBAND_INPUT).unwrap();
        assert_eq!(restored.len(), chunk.len());

        for (original, roundtrip) in chunk.iter().zip(restored.iter()) {
            let a = mulaw::decode(*original) as i32;
            let b = mulaw::decode(*roundtrip) as i32;
            assert!(
                (a - b).abs() <= mulaw::quantization_step(a as i16),
                "{} drifted to {}",
                a, b
            );
        }
    }

    #[test]
    fn test_averaging_downlink_stays_bounded() {
        let chunk = tone_chunk();
        let t = Transcoder::new(
            SampleRate::WIDEBAND_INPUT,
            ResampleSettings {
                downsample: DownsampleMode::Average,
                ..ResampleSettings::default()
            },
        );

        let wideband = t.uplink(&chunk).unwrap();
        let restored = t.downlink(&wideband, SampleRate::WIDEBAND_INPUT).unwrap();

        // Averaging smears neighbouring samples, so only a coarse bound holds
        for (original, roundtrip) in chunk.iter().zip(restored.iter()) {
            let a = mulaw::decode(*original) as i32;
            let b = mulaw::decode(*roundtrip) as i32;
            assert!((a - b).abs() <= 4000, "{} drifted to {}", a, b);
        }
    }

    #[test]
    fn test_sample_byte_conversion() {
        let samples = [0i16, 1, -1, i16::MAX, i16::MIN];
        let bytes = samples_to_bytes(&samples);
        assert_eq!(&bytes[2..4], &[1, 0]);
        assert_eq!(&bytes[4..6], &[0xFF, 0xFF]);
        assert_eq!(bytes_to_samples(&bytes).unwrap(), samples.to_vec());
    }
}
