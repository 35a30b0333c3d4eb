//! # Transport Channel Message Protocol
//!
//! One WebSocket per session carries two kinds of frames:
//! - **Text frames**: JSON control messages, discriminated by a `type` field
//! - **Binary frames**: raw audio, PCM16 mono 16kHz little-endian (client to server only)
//!
//! ## Client → Server:
//! | type | fields | effect |
//! |---|---|---|
//! | `start` | `timestamp`, optional `config` | begins session initialization |
//! | `welcome_message` | `text` | assistant speaks first, no user turn |
//!
//! ## Server → Client:
//! | type | fields |
//! |---|---|
//! | `status` | `message` |
//! | `partial_transcript` / `user_transcript` / `ai_transcript` | `text` |
//! | `audio` | `data` (base64 f32le PCM, 24kHz mono) |
//! | `interrupt` / `error` | `message` |
//!
//! Both enums implement `Serialize` and `Deserialize` so the server and the Rust
//! client (`crate::client`) share one definition of the wire format.

use serde::{Deserialize, Serialize};

/// Status text sent once the transcriber is attached.
pub const STATUS_READY: &str = "Ready to listen";
/// Status text sent right after `STATUS_READY` on a successful `start`.
pub const STATUS_SESSION_STARTED: &str = "session_started";
/// Message carried by every `interrupt`.
pub const INTERRUPT_MESSAGE: &str = "User interrupted";

/// Control messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Begin the session. `config` overrides the server defaults field by field.
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<StartConfig>,
    },

    /// Make the assistant speak `text` without a preceding user turn.
    WelcomeMessage { text: String },
}

/// Per-session configuration carried by `start`.
///
/// Field names are camelCase on the wire. Every field is optional; anything missing
/// falls back to `AppConfig::defaults`. The values are checked for type only and
/// forwarded verbatim to the providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartConfig {
    pub system_prompt: Option<String>,
    /// Informational; the client speaks it by sending `welcome_message`
    pub welcome_message: Option<String>,
    pub providers: Option<ProviderSelection>,
    pub llm_settings: Option<LlmOverrides>,
    pub speech_settings: Option<SpeechOverrides>,
    pub realtime_settings: Option<RealtimeOverrides>,
}

/// Display names of the providers the client picked. Only `language` changes behaviour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSelection {
    pub llm: Option<String>,
    pub voice: Option<String>,
    pub transcriber: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmOverrides {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpeechOverrides {
    pub voice_id: Option<String>,
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeOverrides {
    /// Seconds of silence that end an utterance
    pub endpointing: Option<f64>,
    /// Seconds of speech after which the transcriber forces an endpoint
    pub max_duration: Option<f64>,
}

/// Control messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status { message: String },
    PartialTranscript { text: String },
    UserTranscript { text: String },
    AiTranscript { text: String },
    /// One playable chunk, base64 of 32-bit float little-endian PCM at 24kHz
    Audio { data: String },
    Interrupt { message: String },
    Error { message: String },
}

impl ServerMessage {
    pub fn status(message: impl Into<String>) -> Self {
        ServerMessage::Status { message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }

    pub fn interrupt() -> Self {
        ServerMessage::Interrupt {
            message: INTERRUPT_MESSAGE.to_string(),
        }
    }

    /// JSON text for a WebSocket text frame.
    pub fn to_json(&self) -> String {
        // Every variant is a map of strings; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Parse one text frame into a control message.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}
