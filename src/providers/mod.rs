//! # Provider Adapters
//!
//! The relay talks to three external services. The session state machine only ever sees
//! the traits defined here; the concrete clients live in the submodules.
//!
//! ## Adapters:
//! - **SpeechToText** (`gladia`): a long-lived connection per session. Audio frames go in,
//!   transcript and voice-activity events come out.
//! - **LanguageModel** (`chat`): one streaming request per reply; yields text deltas.
//! - **TextToSpeech** (`cartesia`): one streaming request per reply; yields audio chunks.
//!
//! ## Key Rust Concepts:
//!
//! ### Trait Objects (`Arc<dyn Trait>`)
//! - **Purpose**: The session does not care which vendor is behind an adapter
//! - **Why needed**: Tests swap in scripted mock providers without touching the session
//!
//! ### async-trait
//! - **Purpose**: `async fn` in traits that must be object safe
//! - **How it works**: Each method returns a boxed future
//!
//! ### Streams
//! - **Purpose**: LLM tokens and TTS chunks arrive over time
//! - **Cancellation**: Dropping a stream drops the HTTP response, which closes the
//!   provider connection and stops the work on their side

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::{RelayError, RelayResult};
use crate::session::history::Turn;
use crate::session::settings::{LlmSettings, SttSettings, TtsSettings};

pub mod cartesia;   // Text-to-speech over SSE
pub mod chat;       // OpenAI-compatible chat completions
pub mod gladia;     // Live speech-to-text over WebSocket
pub mod sse;        // Server-sent events decoding

/// What a transcript event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptKind {
    /// In-progress recognition of the current utterance; may still change
    Partial,
    /// Committed recognition; ends the current utterance
    Final,
    /// Voice activity detected
    SpeechStart,
}

/// One event produced by the speech-to-text adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub text: Option<String>,
}

impl TranscriptEvent {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            kind: TranscriptKind::Partial,
            text: Some(text.into()),
        }
    }

    pub fn finalized(text: impl Into<String>) -> Self {
        Self {
            kind: TranscriptKind::Final,
            text: Some(text.into()),
        }
    }

    pub fn speech_start() -> Self {
        Self {
            kind: TranscriptKind::SpeechStart,
            text: None,
        }
    }

    /// Trimmed text, empty when the event carries none.
    pub fn text(&self) -> &str {
        self.text.as_deref().map(str::trim).unwrap_or("")
    }
}

/// Everything an attached transcriber can report.
#[derive(Debug)]
pub enum SttEvent {
    Transcript(TranscriptEvent),
    /// The provider connection failed; no more events follow
    Error(RelayError),
    /// The provider closed the session normally; no more events follow
    Ended,
}

/// A live transcriber session.
///
/// ## Ownership:
/// - `audio`: frames in, bounded so a stalled provider cannot grow memory without limit
/// - `events`: transcript events out, in provider emission order
/// - `shutdown`: cancelling it stops both directions and closes the provider session
#[derive(Debug)]
pub struct SttConnection {
    pub audio: mpsc::Sender<Bytes>,
    pub events: mpsc::Receiver<SttEvent>,
    pub shutdown: CancellationToken,
}

/// Text deltas of one LLM reply, in order.
pub type TokenStream = Pin<Box<dyn Stream<Item = RelayResult<String>> + Send>>;

/// One synthesized audio chunk, already base64 encoded f32le PCM at 24kHz.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub base64: String,
}

/// Audio chunks of one TTS reply, in order.
pub type AudioStream = Pin<Box<dyn Stream<Item = RelayResult<AudioChunk>> + Send>>;

#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Name used in logs and peer-facing error messages.
    fn name(&self) -> &'static str;

    /// Open a transcriber session.
    ///
    /// ## Parameters:
    /// - `settings`: model, language and endpointing values, forwarded verbatim
    /// - `audio_queue`: capacity of the audio sender in the returned connection
    ///
    /// ## Returns:
    /// A usable connection as soon as the provider accepted the session. Readiness is
    /// local: the provider may still be warming up when the first frames arrive.
    async fn connect(&self, settings: &SttSettings, audio_queue: usize) -> RelayResult<SttConnection>;
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start one streaming completion over the whole conversation history.
    async fn stream(&self, history: &[Turn], settings: &LlmSettings) -> RelayResult<TokenStream>;
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start synthesizing `text`.
    async fn stream(&self, text: &str, settings: &TtsSettings) -> RelayResult<AudioStream>;
}

/// The three adapters a session drives, shared by every session of the relay.
#[derive(Clone)]
pub struct Providers {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
}

impl fmt::Debug for Providers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Providers")
            .field("stt", &self.stt.name())
            .field("llm", &self.llm.name())
            .field("tts", &self.tts.name())
            .finish()
    }
}

impl Providers {
    /// Build the production clients.
    ///
    /// All three share one HTTP connection pool. Missing API keys are not an error
    /// here; they surface as an initialization error when a session first needs them.
    pub fn from_config(config: &AppConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            stt: Arc::new(gladia::GladiaStt::new(http.clone(), config.providers.stt.clone())),
            llm: Arc::new(chat::ChatCompletions::new(http.clone(), config.providers.llm.clone())),
            tts: Arc::new(cartesia::CartesiaTts::new(http, config.providers.tts.clone())),
        }
    }
}
