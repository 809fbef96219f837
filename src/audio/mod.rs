//! # Audio Transcoding Module
//!
//! Everything needed to move audio between the telephony media stream and the
//! generative-audio peer.
//!
//! ## Key Components:
//! - **mulaw**: G.711 μ-law companding (8-bit ↔ 16-bit)
//! - **resample**: integer-ratio rate conversion (8kHz ↔ 16kHz / 24kHz)
//! - **pipeline**: uplink and downlink transcoders built from the two above
//! - **buffer**: bounded queue for uplink audio captured before the peer is ready
//!
//! ## Audio Formats:
//! - **Telephony side**: μ-law, 8kHz, mono, base64 in JSON frames
//! - **Peer side**: signed 16-bit little-endian PCM, mono, base64 in JSON frames

pub mod buffer;       // Pre-ready uplink queue
pub mod mulaw;        // G.711 μ-law codec
pub mod pipeline;     // Uplink/downlink transcoder
pub mod resample;     // Sample-rate conversion
