//! # Configuration Management
//!
//! Loads the relay configuration from multiple sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP_` prefix, `__` between nested keys
//!   (e.g. `APP_AUDIO_PEER__API_KEY`, `APP_RELAY__PRE_READY_POLICY=drop`)
//! - `HOST` / `PORT`, as set by most deployment platforms
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT`
//! 2. `APP_*` environment variables
//! 3. `config.toml`
//! 4. Defaults
//!
//! Runtime updates through `PUT /api/v1/config` only affect calls that start
//! after the update; a running call keeps the settings it was created with.

use crate::audio::resample::{self, DownsampleMode, ResampleSettings, SampleRate, UpsampleMode};
use crate::protocol::audio_peer::WireSchema;
use crate::relay::session::PreReadyAudioPolicy;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio_peer: AudioPeerConfig,
    pub relay: RelayConfig,
    pub performance: PerformanceConfig,
}

/// HTTP / WebSocket server settings.
///
/// ## Fields:
/// - `host`, `port`: listen address
/// - `public_host`: host name the telephony provider should dial back for the
///   media stream; empty means "use the Host header of the webhook request"
/// - `heartbeat_interval_secs`: WebSocket ping interval towards the telephony side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub public_host: String,
    pub heartbeat_interval_secs: u64,
}

/// Generative-audio peer connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioPeerConfig {
    /// WebSocket endpoint of the bidirectional streaming API
    pub endpoint: String,
    /// Appended as the `key` query parameter when non-empty
    pub api_key: String,
    /// Model identifier sent in the setup message
    pub model: String,
    /// Prebuilt voice name; empty leaves the peer's default
    pub voice: String,
    /// System instruction sent with the setup message; empty sends none
    pub system_instruction: String,
    /// Text injected as the first user turn once the peer is ready; empty disables it
    pub greeting: String,
    /// Field naming convention of the peer's protocol version
    pub wire_schema: WireSchema,
    /// Rate of the realtime audio we send
    pub input_sample_rate: SampleRate,
    /// Rate assumed for peer audio parts that do not declare one
    pub output_sample_rate: SampleRate,
    /// How long to wait for the setup acknowledgement
    pub handshake_timeout_ms: u64,
}

/// Relay policy switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// What to do with caller audio that arrives before the peer is ready
    pub pre_ready_policy: PreReadyAudioPolicy,
    /// Upper bound on queued pre-ready chunks (20ms each)
    pub max_pending_chunks: usize,
    /// Stop forwarding caller audio while the peer is speaking
    pub echo_suppression_enabled: bool,
    pub upsample_mode: UpsampleMode,
    pub downsample_mode: DownsampleMode,
}

/// Capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                public_host: String::new(),
                heartbeat_interval_secs: 30,
            },
            audio_peer: AudioPeerConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                api_key: String::new(),
                model: "models/gemini-2.0-flash-exp".to_string(),
                voice: String::new(),
                system_instruction: String::new(),
                greeting: "Greet the caller and ask how you can help.".to_string(),
                wire_schema: WireSchema::CamelCase,
                input_sample_rate: SampleRate::WIDEBAND_INPUT,
                output_sample_rate: SampleRate::WIDEBAND_OUTPUT,
                handshake_timeout_ms: 10_000,
            },
            relay: RelayConfig {
                pre_ready_policy: PreReadyAudioPolicy::Queue,
                max_pending_chunks: 50, // one second of 20ms chunks
                echo_suppression_enabled: false,
                upsample_mode: UpsampleMode::Linear,
                downsample_mode: DownsampleMode::Decimate,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from `config.toml` (if it exists)
    /// 3. Override with `APP_*` environment variables
    /// 4. Apply `HOST` and `PORT` last
    ///
    /// ## Rust Concepts:
    /// - **Builder pattern**: each `add_source` returns the builder, so sources chain
    /// - **?**: any failing step returns its error to the caller
    /// - **if let Ok(...)**: only override when the variable is set
    ///
    /// ## Environment Variable Examples:
    /// - `APP_AUDIO_PEER__MODEL=models/gemini-2.0-flash-live-001`
    /// - `APP_RELAY__MAX_PENDING_CHUNKS=100`
    /// - `PORT=3000`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Defaults, serialized from our Default impl
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. config.toml; required(false) means a missing file is fine
            .add_source(config::File::with_name("config").required(false))
            // 3. APP_AUDIO_PEER__API_KEY becomes audio_peer.api_key
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // 4. Deployment platforms set these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // Build the merged sources and deserialize back into AppConfig
        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations that could never bridge a call.
    ///
    /// ## What this checks:
    /// - Port, heartbeat interval, call limit and handshake timeout are non-zero
    /// - The audio peer endpoint is a `ws://` or `wss://` URL
    /// - Both peer sample rates convert to and from 8kHz by an integer factor
    ///
    /// ## Rust Concepts:
    /// - **&self**: read-only borrow of the configuration
    /// - **anyhow::anyhow!**: builds an error from a formatted message
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.audio_peer.handshake_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Handshake timeout must be greater than 0"));
        }

        if !self.audio_peer.endpoint.starts_with("ws://") && !self.audio_peer.endpoint.starts_with("wss://") {
            return Err(anyhow::anyhow!(
                "Audio peer endpoint must be a ws:// or wss:// URL, got '{}'",
                self.audio_peer.endpoint
            ));
        }

        for (name, rate) in [
            ("input_sample_rate", self.audio_peer.input_sample_rate),
            ("output_sample_rate", self.audio_peer.output_sample_rate),
        ] {
            if !resample::is_integer_ratio(rate, SampleRate::NARROWBAND) {
                return Err(anyhow::anyhow!(
                    "audio_peer.{} must be an integer multiple or divisor of {}, got {}",
                    name,
                    SampleRate::NARROWBAND,
                    rate
                ));
            }
        }

        Ok(())
    }

    /// Apply a partial JSON update such as `{"relay": {"pre_ready_policy": "drop"}}`.
    ///
    /// The update is merged key by key into the current configuration, so
    /// omitted fields keep their values. The result must still validate.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let patch: serde_json::Value = serde_json::from_str(json_str)?;
        if !patch.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut current = serde_json::to_value(&*self)?;
        merge_json(&mut current, patch);

        let updated: AppConfig = serde_json::from_value(current)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Copy of the configuration that is safe to expose over HTTP.
    pub fn redacted(&self) -> AppConfig {
        let mut copy = self.clone();
        if !copy.audio_peer.api_key.is_empty() {
            copy.audio_peer.api_key = "********".to_string();
        }
        copy
    }
}

impl AudioPeerConfig {
    /// Full WebSocket URL including the API key, if one is configured.
    pub fn connect_url(&self) -> String {
        if self.api_key.is_empty() {
            self.endpoint.clone()
        } else {
            let separator = if self.endpoint.contains('?') { '&' } else { '?' };
            format!("{}{}key={}", self.endpoint, separator, self.api_key)
        }
    }
}

impl RelayConfig {
    pub fn resample_settings(&self) -> ResampleSettings {
        ResampleSettings {
            upsample: self.upsample_mode,
            downsample: self.downsample_mode,
        }
    }
}

/// Recursively overlay `patch` onto `base`; non-object values replace.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
