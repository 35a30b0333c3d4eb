//! # Cartesia Text-to-Speech
//!
//! `POST {api_url}/tts/sse` synthesizes one utterance and streams it back as SSE events.
//! Audio is requested as raw `pcm_f32le` at 24kHz so each chunk's base64 payload can be
//! forwarded to the client without decoding.
//!
//! ## Event types:
//! - `chunk` → one `AudioChunk`
//! - `done` → end of stream
//! - `error` → `ProviderStream` error
//! - anything else (timestamps, flush markers) → skipped

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{sse, AudioChunk, AudioStream, TextToSpeech};
use crate::audio::pcm::OUTPUT_SAMPLE_RATE;
use crate::config::TtsEndpoint;
use crate::error::{RelayError, RelayResult};
use crate::session::settings::TtsSettings;

pub const NAME: &str = "Cartesia TTS";

pub struct CartesiaTts {
    http: reqwest::Client,
    endpoint: TtsEndpoint,
}

#[derive(Debug, Deserialize)]
struct SseEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Event {
    Chunk(AudioChunk),
    Done,
    Failed(String),
    Skip,
}

pub(crate) fn request_body(text: &str, settings: &TtsSettings) -> Value {
    let mut body = json!({
        "model_id": settings.model,
        "transcript": text,
        "voice": {
            "mode": "id",
            "id": settings.voice_id
        },
        "output_format": {
            "container": "raw",
            "encoding": "pcm_f32le",
            "sample_rate": OUTPUT_SAMPLE_RATE
        },
        "language": settings.language
    });
    // Only sent when it differs from the provider default
    if (settings.speed - 1.0).abs() > f32::EPSILON {
        body["generation_config"] = json!({ "speed": settings.speed });
    }
    body
}

pub(crate) fn parse_event(data: &str) -> Event {
    let Ok(event) = serde_json::from_str::<SseEvent>(data) else {
        return Event::Skip;
    };
    match event.kind.as_str() {
        "chunk" => match event.data {
            Some(base64) if !base64.is_empty() => Event::Chunk(AudioChunk { base64 }),
            _ => Event::Skip,
        },
        "done" => Event::Done,
        "error" => Event::Failed(match event.error {
            Some(Value::String(message)) => message,
            Some(other) => other.to_string(),
            None => "unknown error".to_string(),
        }),
        _ => Event::Skip,
    }
}

/// Turn SSE data payloads into audio chunks, stopping at `done` or the first error.
pub(crate) fn chunk_stream<S>(events: S) -> AudioStream
where
    S: Stream<Item = RelayResult<String>> + Send + 'static,
{
    let state = (Box::pin(events), false);
    Box::pin(stream::unfold(state, |(mut events, finished)| async move {
        if finished {
            return None;
        }
        loop {
            match events.next().await? {
                Err(e) => return Some((Err(e), (events, true))),
                Ok(data) => match parse_event(&data) {
                    Event::Chunk(chunk) => return Some((Ok(chunk), (events, false))),
                    Event::Done => return None,
                    Event::Failed(message) => {
                        return Some((Err(RelayError::stream(NAME, message)), (events, true)))
                    }
                    Event::Skip => continue,
                },
            }
        }
    }))
}

impl CartesiaTts {
    pub fn new(http: reqwest::Client, endpoint: TtsEndpoint) -> Self {
        Self { http, endpoint }
    }
}

#[async_trait]
impl TextToSpeech for CartesiaTts {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn stream(&self, text: &str, settings: &TtsSettings) -> RelayResult<AudioStream> {
        if self.endpoint.api_key.trim().is_empty() {
            return Err(RelayError::stream(NAME, "missing API key"));
        }

        debug!(voice = %settings.voice_id, chars = text.len(), "Requesting speech synthesis");
        let url = format!("{}/tts/sse", self.endpoint.api_url.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .header("X-API-Key", &self.endpoint.api_key)
            .header("Cartesia-Version", &self.endpoint.version)
            .json(&request_body(text, settings))
            .send()
            .await
            .map_err(|e| RelayError::stream(NAME, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::stream(NAME, format!("HTTP {}: {}", status, body)));
        }

        Ok(chunk_stream(sse::data_events(Box::pin(response.bytes_stream()), NAME)))
    }
}
