//! # Telephony Media-Stream Protocol
//!
//! JSON frames exchanged with the telephony provider over the `/media-stream`
//! WebSocket. Every frame carries an `event` discriminator.
//!
//! ## Inbound Events:
//! - `connected`: transport handshake, carries no call data
//! - `start`: binds the `streamSid` of the call
//! - `media`: ~20ms of base64 μ-law audio at 8kHz
//! - `mark`, `dtmf`: playback markers and key presses (logged only)
//! - `stop`: the call is over
//!
//! ## Outbound Events:
//! - `media`: base64 μ-law audio for the caller, tagged with the `streamSid`
//! - `clear`: discard whatever audio the provider still has queued

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A frame received from the telephony provider.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundTelephonyEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        start: StreamStart,
    },
    Media {
        media: MediaPayload,
    },
    Mark {
        #[serde(default)]
        mark: Option<MarkPayload>,
    },
    Dtmf {
        #[serde(default)]
        dtmf: Option<DtmfPayload>,
    },
    Stop,
    /// Any event name this relay does not know about
    #[serde(other)]
    Unrecognized,
}

/// Body of a `start` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub stream_sid: String,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

/// Declared encoding of the inbound audio.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u8,
}

/// Body of a `media` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MediaPayload {
    /// Base64 μ-law bytes
    pub payload: String,
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DtmfPayload {
    pub digit: String,
}

impl InboundTelephonyEvent {
    /// Parse one text frame.
    ///
    /// Unknown event names decode to [`InboundTelephonyEvent::Unrecognized`];
    /// invalid JSON or a known event missing its required fields is an error.
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::MalformedFrame(format!("telephony frame: {}", e)))
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundTelephonyEvent::Connected { .. } => "connected",
            InboundTelephonyEvent::Start { .. } => "start",
            InboundTelephonyEvent::Media { .. } => "media",
            InboundTelephonyEvent::Mark { .. } => "mark",
            InboundTelephonyEvent::Dtmf { .. } => "dtmf",
            InboundTelephonyEvent::Stop => "stop",
            InboundTelephonyEvent::Unrecognized => "unrecognized",
        }
    }
}

/// A frame sent to the telephony provider.
///
/// Both variants require the `streamSid`, so the session can only build them
/// once a `start` event has been seen.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundTelephonyEvent {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMedia {
    /// Base64 μ-law bytes
    pub payload: String,
}

impl OutboundTelephonyEvent {
    pub fn encode(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }
}
