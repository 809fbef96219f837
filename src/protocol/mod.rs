//! # Wire Protocols
//!
//! Typed frames for the two WebSocket connections of a call:
//! - `telephony`: the provider's media-stream events (μ-law, 8kHz)
//! - `audio_peer`: the generative-audio streaming API (linear PCM)

pub mod audio_peer;
pub mod telephony;
