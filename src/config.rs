//! # Configuration Management
//!
//! This module handles loading and managing relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP__ prefix)
//! - Provider key variables (GLADIA_API_KEY, VENICE_API_KEY, CARTESIA_API_KEY)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **Nested structs**: Each concern (server, providers, session defaults) gets its own section
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (HOST, PORT, *_API_KEY)
//! 2. Environment variables (APP__SERVER__PORT, APP__DEFAULTS__LLM_MODEL, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Session defaults:
//! Everything under `defaults` is what a session uses when the client's `start`
//! message does not override it. The relay never interprets these values; they
//! are forwarded verbatim to the provider adapters.

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables

/// System prompt used when the client does not send one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly voice assistant in a live phone-style \
conversation. Answer in one to three short spoken sentences, use natural conversational language, \
and never use markdown, lists, or emoji since everything you write is read aloud.";

/// Main relay configuration that contains all settings.
///
/// ## Rust Concepts:
/// - **#[derive(...)]**: Automatically implements common traits:
///   - `Debug`: Allows printing with {:?} for debugging
///   - `Clone`: Allows making copies of the struct (each session takes a copy at start)
///   - `Serialize`: Can convert this struct to JSON, TOML, etc.
///   - `Deserialize`: Can create this struct from JSON, TOML, etc.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, providers, defaults, performance)
/// keeps secrets (provider keys) apart from values clients are allowed to override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub providers: ProvidersConfig,
    pub defaults: SessionDefaults,
    pub interruption: InterruptionConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host`: IP address or hostname to bind the server to (e.g., "127.0.0.1", "0.0.0.0")
/// - `port`: TCP port number to listen on (3000 by default, the port browser clients expect)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Endpoints and credentials for the three streaming providers.
///
/// ## Security:
/// Keys are never returned by the HTTP API (see `handlers::config`) and cannot be
/// changed at runtime; they are read once when the provider clients are built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Live speech-to-text (Gladia live v2)
    pub stt: ProviderEndpoint,
    /// OpenAI-compatible chat completions endpoint (Venice by default)
    pub llm: ProviderEndpoint,
    /// Server-sent-events text-to-speech (Cartesia)
    pub tts: TtsEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub api_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsEndpoint {
    pub api_url: String,
    pub api_key: String,
    /// Value of the `Cartesia-Version` header
    pub version: String,
}

/// Per-session defaults, overridable by the client's `start` message.
///
/// ## Fields:
/// - `stt_*`: model, endpointing threshold (seconds of silence), and the maximum
///   utterance duration before the provider forces an endpoint
/// - `llm_*`: chat model id, token cap, sampling temperature
/// - `tts_*`: synthesis model, voice id, speaking speed
/// - `language`: ISO code shared by transcription and synthesis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDefaults {
    pub system_prompt: String,
    pub language: String,
    pub stt_model: String,
    pub endpointing: f64,
    pub max_duration_without_endpointing: f64,
    pub llm_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub tts_model: String,
    pub voice_id: String,
    pub speed: f32,
}

/// Barge-in behaviour.
///
/// ## Fields:
/// - `partial_transcript_fallback`: also interrupt on a non-empty partial transcript,
///   for transcribers that do not emit dedicated voice-activity events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptionConfig {
    pub partial_transcript_fallback: bool,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: WebSocket sessions served at once; extra upgrades get 503
/// - `stt_audio_queue`: frames buffered toward the transcriber before new ones are dropped
/// - `heartbeat_interval_secs` / `client_timeout_secs`: WebSocket ping cadence and the
///   silence after which a connection is considered dead
/// - `outbound_buffer_capacity`: messages the client keeps while its socket is connecting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub stt_audio_queue: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub outbound_buffer_capacity: usize,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the relay can start with nothing but three API keys in the
/// environment. They also document the provider settings the relay was tuned with.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            providers: ProvidersConfig {
                stt: ProviderEndpoint {
                    api_url: "https://api.gladia.io/v2/live".to_string(),
                    api_key: String::new(),
                },
                llm: ProviderEndpoint {
                    api_url: "https://api.venice.ai/api/v1".to_string(),
                    api_key: String::new(),
                },
                tts: TtsEndpoint {
                    api_url: "https://api.cartesia.ai".to_string(),
                    api_key: String::new(),
                    version: "2024-06-10".to_string(),
                },
            },
            defaults: SessionDefaults {
                system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
                language: "en".to_string(),
                stt_model: "solaria-1".to_string(),
                endpointing: 0.05,                       // Aggressive endpointing keeps turn latency low
                max_duration_without_endpointing: 15.0,
                llm_model: "llama-3.3-70b".to_string(),
                max_tokens: 80,                          // Spoken replies stay short
                temperature: 0.8,
                tts_model: "sonic-3".to_string(),
                voice_id: "b56c6aac-f35f-46f7-9361-e8f078cec72e".to_string(),
                speed: 1.0,
            },
            interruption: InterruptionConfig {
                partial_transcript_fallback: true,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                stt_audio_queue: 64,             // ~16s of 256ms frames
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                outbound_buffer_capacity: 256,
            },
        }
    }
}

/// Implementation block for AppConfig - adds methods to the struct.
impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP__
    /// 4. Handle special cases for HOST, PORT and the provider key variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=8080`: Override server port
    /// - `APP__DEFAULTS__LLM_MODEL=llama-3.2-3b`: Override the default chat model
    /// - `APP__PERFORMANCE__MAX_CONCURRENT_SESSIONS=50`: Raise the session limit
    /// - `GLADIA_API_KEY=...`: Transcriber credentials
    /// - `PORT=3000`: Special case for deployment platforms
    ///
    /// The double-underscore separator keeps snake_case keys such as `llm_model` intact.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // Provider keys keep the names their vendors document
        for (var, key) in [
            ("GLADIA_API_KEY", "providers.stt.api_key"),
            ("VENICE_API_KEY", "providers.llm.api_key"),
            ("CARTESIA_API_KEY", "providers.tts.api_key"),
        ] {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Session limit and queue sizes are greater than 0
    /// - The heartbeat fires more often than the client timeout
    /// - Pass-through numbers are within the ranges every provider accepts
    ///
    /// Missing API keys are not an error here: the relay still starts, and a session's
    /// `start` fails with an initialization error that names the provider.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.stt_audio_queue == 0 {
            return Err(anyhow::anyhow!("STT audio queue must be greater than 0"));
        }

        if self.performance.outbound_buffer_capacity == 0 {
            return Err(anyhow::anyhow!("Outbound buffer capacity must be greater than 0"));
        }

        if self.performance.heartbeat_interval_secs == 0
            || self.performance.heartbeat_interval_secs >= self.performance.client_timeout_secs
        {
            return Err(anyhow::anyhow!(
                "Heartbeat interval must be non-zero and shorter than the client timeout"
            ));
        }

        if !(0.0..=2.0).contains(&self.defaults.temperature) {
            return Err(anyhow::anyhow!("Temperature must be between 0 and 2"));
        }

        if self.defaults.endpointing < 0.0 || self.defaults.max_duration_without_endpointing <= 0.0 {
            return Err(anyhow::anyhow!("Endpointing thresholds must be positive"));
        }

        if self.defaults.max_tokens == 0 {
            return Err(anyhow::anyhow!("Max tokens must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## What can change at runtime:
    /// - `defaults.*`: picked up by sessions that send `start` afterwards
    /// - `interruption.partial_transcript_fallback`
    /// - `performance.max_concurrent_sessions`
    ///
    /// The bind address and provider credentials are fixed for the life of the process,
    /// so `server` and `providers` sections are ignored.
    ///
    /// ## Partial updates:
    /// Send just `{"defaults": {"temperature": 0.5}}` to change only the temperature.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(defaults) = partial_config.get("defaults") {
            let string_fields: [(&str, &mut String); 6] = [
                ("system_prompt", &mut self.defaults.system_prompt),
                ("language", &mut self.defaults.language),
                ("stt_model", &mut self.defaults.stt_model),
                ("llm_model", &mut self.defaults.llm_model),
                ("tts_model", &mut self.defaults.tts_model),
                ("voice_id", &mut self.defaults.voice_id),
            ];
            for (name, field) in string_fields {
                if let Some(value) = defaults.get(name).and_then(|v| v.as_str()) {
                    *field = value.to_string();
                }
            }
            if let Some(value) = defaults.get("endpointing").and_then(|v| v.as_f64()) {
                self.defaults.endpointing = value;
            }
            if let Some(value) = defaults.get("max_duration_without_endpointing").and_then(|v| v.as_f64()) {
                self.defaults.max_duration_without_endpointing = value;
            }
            if let Some(value) = defaults.get("max_tokens").and_then(|v| v.as_u64()) {
                self.defaults.max_tokens = value as u32;
            }
            if let Some(value) = defaults.get("temperature").and_then(|v| v.as_f64()) {
                self.defaults.temperature = value as f32;
            }
            if let Some(value) = defaults.get("speed").and_then(|v| v.as_f64()) {
                self.defaults.speed = value as f32;
            }
        }

        if let Some(fallback) = partial_config
            .get("interruption")
            .and_then(|i| i.get("partial_transcript_fallback"))
            .and_then(|v| v.as_bool())
        {
            self.interruption.partial_transcript_fallback = fallback;
        }

        if let Some(sessions) = partial_config
            .get("performance")
            .and_then(|p| p.get("max_concurrent_sessions"))
            .and_then(|v| v.as_u64())
        {
            self.performance.max_concurrent_sessions = sessions as usize;
        }

        self.validate()?;
        Ok(())
    }
}
