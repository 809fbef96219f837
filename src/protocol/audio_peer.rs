//! # Generative-Audio Peer Protocol
//!
//! JSON frames exchanged with the bidirectional streaming API of the
//! generative-audio peer.
//!
//! ## Wire Schemas:
//! Depending on the API version, field names are either `lowerCamelCase`
//! (`serverContent`, `inlineData`) or `snake_case` (`server_content`,
//! `inline_data`). Both schemas are generated from one set of wire structs by
//! the `wire_schema!` macro; the rest of the relay only ever sees
//! [`AudioPeerCommand`] and [`AudioPeerEvent`].
//!
//! ## Outbound Frames:
//! - `setup`: model, response modality AUDIO, optional voice and system instruction
//! - `clientContent`: a synthetic user turn with literal text (greeting)
//! - `realtimeInput`: base64 PCM chunks tagged `audio/pcm;rate=16000`
//!
//! ## Inbound Frames:
//! - `setupComplete`: the peer accepts audio from now on
//! - `serverContent`: model output parts, `interrupted`, `turnComplete`
//! - `goAway`: the peer will disconnect soon

use crate::audio::resample::SampleRate;
use crate::error::RelayError;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

/// Field naming convention used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WireSchema {
    #[default]
    CamelCase,
    SnakeCase,
}

/// Something the relay wants to tell the audio peer.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioPeerCommand {
    /// Opening message declaring model and output modality
    Setup {
        model: String,
        voice: Option<String>,
        system_instruction: Option<String>,
    },
    /// Complete user turn with literal text, used to make the peer speak first
    Greeting { text: String },
    /// One chunk of caller audio as little-endian 16-bit PCM
    RealtimeAudio { pcm: Vec<u8>, rate: SampleRate },
}

impl AudioPeerCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            AudioPeerCommand::Setup { .. } => "setup",
            AudioPeerCommand::Greeting { .. } => "greeting",
            AudioPeerCommand::RealtimeAudio { .. } => "realtime_audio",
        }
    }
}

/// One audio part of model output, already base64-decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPart {
    /// Little-endian 16-bit PCM
    pub pcm: Vec<u8>,
    /// Rate parsed from the MIME type, if it declared one
    pub rate: Option<SampleRate>,
}

/// Contents of a `serverContent` frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerContent {
    pub audio: Vec<AudioPart>,
    pub text: Vec<String>,
    pub interrupted: bool,
    pub turn_complete: bool,
}

/// Something the audio peer told the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioPeerEvent {
    SetupComplete,
    ServerContent(ServerContent),
    GoAway,
    /// Valid JSON that carries none of the envelopes above (usage metadata, tool calls, ...)
    Unrecognized,
}

impl AudioPeerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AudioPeerEvent::SetupComplete => "setup_complete",
            AudioPeerEvent::ServerContent(_) => "server_content",
            AudioPeerEvent::GoAway => "go_away",
            AudioPeerEvent::Unrecognized => "unrecognized",
        }
    }
}

impl WireSchema {
    /// Serialise a command as one text frame.
    pub fn encode(self, command: &AudioPeerCommand) -> Result<String, RelayError> {
        match self {
            WireSchema::CamelCase => camel::encode(command),
            WireSchema::SnakeCase => snake::encode(command),
        }
    }

    /// Parse one text frame.
    ///
    /// ## Returns:
    /// - **Ok(event)**: a typed event, possibly `Unrecognized`
    /// - **Err(MalformedFrame)**: not JSON, or a known envelope with the wrong shape
    /// - **Err(InvalidPayload)**: an audio part whose data is not base64
    pub fn decode(self, text: &str) -> Result<AudioPeerEvent, RelayError> {
        match self {
            WireSchema::CamelCase => camel::decode(text),
            WireSchema::SnakeCase => snake::decode(text),
        }
    }
}

/// MIME type announced for realtime audio at `rate`.
pub fn pcm_mime_type(rate: SampleRate) -> String {
    format!("audio/pcm;rate={}", rate.as_hz())
}

/// Parse `audio/pcm;rate=24000` style MIME types.
///
/// ## Returns:
/// - **None**: not a PCM audio type
/// - **Some(None)**: PCM without a rate parameter
/// - **Some(Some(rate))**: PCM at the declared rate
fn parse_pcm_mime(mime_type: &str) -> Option<Option<SampleRate>> {
    let mut parts = mime_type.split(';').map(str::trim);
    let essence = parts.next()?.to_ascii_lowercase();
    if essence != "audio/pcm" && essence != "audio/l16" {
        return None;
    }

    let rate = parts
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse::<u32>().ok())
        .map(SampleRate);

    Some(rate)
}

macro_rules! wire_schema {
    ($module:ident, $case:tt) => {
        mod $module {
            use super::*;

            #[derive(Serialize)]
            #[serde(rename_all = $case)]
            struct ClientFrame<'a> {
                #[serde(skip_serializing_if = "Option::is_none")]
                setup: Option<Setup<'a>>,
                #[serde(skip_serializing_if = "Option::is_none")]
                client_content: Option<ClientContent<'a>>,
                #[serde(skip_serializing_if = "Option::is_none")]
                realtime_input: Option<RealtimeInput>,
            }

            #[derive(Serialize)]
            #[serde(rename_all = $case)]
            struct Setup<'a> {
                model: &'a str,
                generation_config: GenerationConfig<'a>,
                #[serde(skip_serializing_if = "Option::is_none")]
                system_instruction: Option<Content<'a>>,
            }

            #[derive(Serialize)]
            #[serde(rename_all = $case)]
            struct GenerationConfig<'a> {
                response_modalities: [&'static str; 1],
                #[serde(skip_serializing_if = "Option::is_none")]
                speech_config: Option<SpeechConfig<'a>>,
            }

            #[derive(Serialize)]
            #[serde(rename_all = $case)]
            struct SpeechConfig<'a> {
                voice_config: VoiceConfig<'a>,
            }

            #[derive(Serialize)]
            #[serde(rename_all = $case)]
            struct VoiceConfig<'a> {
                prebuilt_voice_config: PrebuiltVoiceConfig<'a>,
            }

            #[derive(Serialize)]
            #[serde(rename_all = $case)]
            struct PrebuiltVoiceConfig<'a> {
                voice_name: &'a str,
            }

            #[derive(Serialize)]
            #[serde(rename_all = $case)]
            struct ClientContent<'a> {
                turns: Vec<Content<'a>>,
                turn_complete: bool,
            }

            #[derive(Serialize)]
            #[serde(rename_all = $case)]
            struct Content<'a> {
                #[serde(skip_serializing_if = "Option::is_none")]
                role: Option<&'static str>,
                parts: Vec<TextPart<'a>>,
            }

            #[derive(Serialize)]
            struct TextPart<'a> {
                text: &'a str,
            }

            #[derive(Serialize)]
            #[serde(rename_all = $case)]
            struct RealtimeInput {
                media_chunks: Vec<MediaChunk>,
            }

            #[derive(Serialize)]
            #[serde(rename_all = $case)]
            struct MediaChunk {
                mime_type: String,
                data: String,
            }

            #[derive(Deserialize)]
            #[serde(rename_all = $case)]
            struct ServerFrame {
                #[serde(default)]
                setup_complete: Option<serde_json::Value>,
                #[serde(default)]
                server_content: Option<WireServerContent>,
                #[serde(default)]
                go_away: Option<serde_json::Value>,
            }

            #[derive(Deserialize)]
            #[serde(rename_all = $case)]
            struct WireServerContent {
                #[serde(default)]
                model_turn: Option<ModelTurn>,
                #[serde(default)]
                interrupted: bool,
                #[serde(default)]
                turn_complete: bool,
            }

            #[derive(Deserialize)]
            struct ModelTurn {
                #[serde(default)]
                parts: Vec<Part>,
            }

            #[derive(Deserialize)]
            #[serde(rename_all = $case)]
            struct Part {
                #[serde(default)]
                text: Option<String>,
                #[serde(default)]
                inline_data: Option<InlineData>,
            }

            #[derive(Deserialize)]
            #[serde(rename_all = $case)]
            struct InlineData {
                mime_type: String,
                data: String,
            }

            pub(super) fn encode(command: &AudioPeerCommand) -> Result<String, RelayError> {
                let frame = match command {
                    AudioPeerCommand::Setup { model, voice, system_instruction } => ClientFrame {
                        setup: Some(Setup {
                            model,
                            generation_config: GenerationConfig {
                                response_modalities: ["AUDIO"],
                                speech_config: voice.as_deref().map(|voice_name| SpeechConfig {
                                    voice_config: VoiceConfig {
                                        prebuilt_voice_config: PrebuiltVoiceConfig { voice_name },
                                    },
                                }),
                            },
                            system_instruction: system_instruction.as_deref().map(|text| Content {
                                role: None,
                                parts: vec![TextPart { text }],
                            }),
                        }),
                        client_content: None,
                        realtime_input: None,
                    },
                    AudioPeerCommand::Greeting { text } => ClientFrame {
                        setup: None,
                        client_content: Some(ClientContent {
                            turns: vec![Content {
                                role: Some("user"),
                                parts: vec![TextPart { text }],
                            }],
                            turn_complete: true,
                        }),
                        realtime_input: None,
                    },
                    AudioPeerCommand::RealtimeAudio { pcm, rate } => ClientFrame {
                        setup: None,
                        client_content: None,
                        realtime_input: Some(RealtimeInput {
                            media_chunks: vec![MediaChunk {
                                mime_type: pcm_mime_type(*rate),
                                data: general_purpose::STANDARD.encode(pcm),
                            }],
                        }),
                    },
                };

                Ok(serde_json::to_string(&frame)?)
            }

            pub(super) fn decode(text: &str) -> Result<AudioPeerEvent, RelayError> {
                let frame: ServerFrame = serde_json::from_str(text)
                    .map_err(|e| RelayError::MalformedFrame(format!("audio peer frame: {}", e)))?;

                if frame.setup_complete.is_some() {
                    return Ok(AudioPeerEvent::SetupComplete);
                }

                if let Some(content) = frame.server_content {
                    let mut event = ServerContent {
                        interrupted: content.interrupted,
                        turn_complete: content.turn_complete,
                        ..ServerContent::default()
                    };

                    for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
                        if let Some(text) = part.text {
                            event.text.push(text);
                        }
                        if let Some(inline) = part.inline_data {
                            // Non-audio inline data (images, documents) is not relayed
                            if let Some(rate) = parse_pcm_mime(&inline.mime_type) {
                                let pcm = general_purpose::STANDARD.decode(inline.data.as_bytes())?;
                                event.audio.push(AudioPart { pcm, rate });
                            }
                        }
                    }

                    return Ok(AudioPeerEvent::ServerContent(event));
                }

                if frame.go_away.is_some() {
                    return Ok(AudioPeerEvent::GoAway);
                }

                Ok(AudioPeerEvent::Unrecognized)
            }
        }
    };
}

wire_schema!(camel, "camelCase");
wire_schema!(snake, "snake_case");
