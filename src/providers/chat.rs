//! # Chat Completions Client
//!
//! Streams replies from any OpenAI-compatible `/chat/completions` endpoint (Venice by
//! default) with `stream: true`. Each SSE `data:` payload carries one delta; `[DONE]`
//! ends the reply.
//!
//! ## Payload handling:
//! - `choices[0].delta.content` → one token
//! - `{"error": ...}` → `ProviderStream` error, stream ends
//! - anything unparseable (keep-alives, role-only deltas) → skipped

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use serde_json::{json, Value};
use tracing::debug;

use super::{sse, LanguageModel, TokenStream};
use crate::config::ProviderEndpoint;
use crate::error::{RelayError, RelayResult};
use crate::session::history::Turn;
use crate::session::settings::LlmSettings;

pub const NAME: &str = "Venice LLM";

pub struct ChatCompletions {
    http: reqwest::Client,
    endpoint: ProviderEndpoint,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Payload {
    Delta(String),
    Done,
    Failed(String),
    Skip,
}

pub(crate) fn request_body(history: &[Turn], settings: &LlmSettings) -> Value {
    let messages: Vec<Value> = history
        .iter()
        .map(|turn| json!({"role": turn.role.as_str(), "content": turn.text}))
        .collect();

    json!({
        "model": settings.model,
        "messages": messages,
        "max_tokens": settings.max_tokens,
        "temperature": settings.temperature,
        "stream": true
    })
}

pub(crate) fn parse_payload(data: &str) -> Payload {
    let data = data.trim();
    if data == "[DONE]" {
        return Payload::Done;
    }
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return Payload::Skip;
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Payload::Failed(message);
    }

    match value.pointer("/choices/0/delta/content").and_then(Value::as_str) {
        Some(token) if !token.is_empty() => Payload::Delta(token.to_string()),
        _ => Payload::Skip,
    }
}

/// Turn SSE data payloads into tokens, stopping at `[DONE]` or the first error.
pub(crate) fn token_stream<S>(events: S) -> TokenStream
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
                Ok(data) => match parse_payload(&data) {
                    Payload::Delta(token) => return Some((Ok(token), (events, false))),
                    Payload::Done => return None,
                    Payload::Failed(message) => {
                        return Some((Err(RelayError::stream(NAME, message)), (events, true)))
                    }
                    Payload::Skip => continue,
                },
            }
        }
    }))
}

impl ChatCompletions {
    pub fn new(http: reqwest::Client, endpoint: ProviderEndpoint) -> Self {
        Self { http, endpoint }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.api_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LanguageModel for ChatCompletions {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn stream(&self, history: &[Turn], settings: &LlmSettings) -> RelayResult<TokenStream> {
        if self.endpoint.api_key.trim().is_empty() {
            return Err(RelayError::stream(NAME, "missing API key"));
        }

        debug!(model = %settings.model, turns = history.len(), "Requesting chat completion");
        let response = self
            .http
            .post(self.url())
            .bearer_auth(&self.endpoint.api_key)
            .json(&request_body(history, settings))
            .send()
            .await
            .map_err(|e| RelayError::stream(NAME, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::stream(NAME, format!("HTTP {}: {}", status, body)));
        }

        Ok(token_stream(sse::data_events(Box::pin(response.bytes_stream()), NAME)))
    }
}
