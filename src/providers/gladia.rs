//! # Gladia Live Transcription
//!
//! Speech-to-text over Gladia's live v2 API.
//!
//! ## Session lifecycle:
//! 1. `POST {api_url}` with the recognition settings; the answer carries a WebSocket URL
//! 2. Connect to that URL; binary PCM16 frames go up, JSON messages come down
//! 3. On shutdown send `{"type":"stop_recording"}` and close the socket
//!
//! The connection is handed to the session as soon as the WebSocket is open. Gladia
//! does not acknowledge readiness separately, and waiting for the first message would
//! add a round trip to every session start.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SpeechToText, SttConnection, SttEvent, TranscriptEvent};
use crate::audio::pcm::INPUT_SAMPLE_RATE;
use crate::config::ProviderEndpoint;
use crate::error::{RelayError, RelayResult};
use crate::session::settings::SttSettings;

pub const NAME: &str = "Gladia STT";

const STOP_RECORDING: &str = r#"{"type":"stop_recording"}"#;
const EVENT_QUEUE: usize = 256;

pub struct GladiaStt {
    http: reqwest::Client,
    endpoint: ProviderEndpoint,
}

#[derive(Debug, Deserialize)]
struct LiveSession {
    id: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TranscriptData {
    #[serde(default)]
    is_final: bool,
    utterance: Utterance,
}

#[derive(Debug, Deserialize)]
struct Utterance {
    #[serde(default)]
    text: String,
}

/// A decoded message from the live socket.
#[derive(Debug, PartialEq)]
pub(crate) enum Incoming {
    Transcript(TranscriptEvent),
    SessionEnded,
    /// Lifecycle and acknowledgment messages the relay does not act on
    Other(String),
}

/// Body of the session-creation request.
pub(crate) fn session_request(settings: &SttSettings) -> Value {
    json!({
        "model": settings.model,
        "encoding": "wav/pcm",
        "sample_rate": INPUT_SAMPLE_RATE,
        "bit_depth": 16,
        "channels": 1,
        "endpointing": settings.endpointing,
        "maximum_duration_without_endpointing": settings.max_duration_without_endpointing,
        "language_config": {
            "languages": [settings.language],
            "code_switching": false
        },
        "messages_config": {
            "receive_partial_transcripts": true
        }
    })
}

pub(crate) fn parse_message(text: &str) -> Result<Incoming, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(text)?;
    match envelope.kind.as_str() {
        "transcript" => {
            let data: TranscriptData = serde_json::from_value(envelope.data.unwrap_or(Value::Null))?;
            let event = if data.is_final {
                TranscriptEvent::finalized(data.utterance.text)
            } else {
                TranscriptEvent::partial(data.utterance.text)
            };
            Ok(Incoming::Transcript(event))
        }
        "speech_start" => Ok(Incoming::Transcript(TranscriptEvent::speech_start())),
        "end_session" => Ok(Incoming::SessionEnded),
        _ => Ok(Incoming::Other(envelope.kind)),
    }
}

impl GladiaStt {
    pub fn new(http: reqwest::Client, endpoint: ProviderEndpoint) -> Self {
        Self { http, endpoint }
    }

    async fn create_session(&self, settings: &SttSettings) -> RelayResult<LiveSession> {
        let response = self
            .http
            .post(&self.endpoint.api_url)
            .header("X-Gladia-Key", &self.endpoint.api_key)
            .json(&session_request(settings))
            .send()
            .await
            .map_err(|e| RelayError::init(NAME, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::init(NAME, format!("HTTP {}: {}", status, body)));
        }

        response.json().await.map_err(|e| RelayError::init(NAME, e))
    }
}

#[async_trait]
impl SpeechToText for GladiaStt {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn connect(&self, settings: &SttSettings, audio_queue: usize) -> RelayResult<SttConnection> {
        if self.endpoint.api_key.trim().is_empty() {
            return Err(RelayError::init(NAME, "missing API key"));
        }

        let live = self.create_session(settings).await?;
        let (socket, _) = connect_async(live.url.as_str())
            .await
            .map_err(|e| RelayError::init(NAME, e))?;
        info!(gladia_session = %live.id, model = %settings.model, "Gladia live session opened");

        let (mut writer, mut reader) = socket.split();
        let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(audio_queue.max(1));
        let (event_tx, event_rx) = mpsc::channel::<SttEvent>(EVENT_QUEUE);
        let shutdown = CancellationToken::new();

        // Audio up
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = token.cancelled() => break,
                    frame = audio_rx.recv() => frame,
                };
                let Some(frame) = frame else { break };
                if let Err(e) = writer.send(Message::Binary(frame.to_vec())).await {
                    warn!("Failed to forward audio to Gladia: {}", e);
                    break;
                }
            }
            // The socket may already be gone; nothing left to report either way
            let _ = writer.send(Message::Text(STOP_RECORDING.to_string())).await;
            let _ = writer.close().await;
            debug!("Gladia writer stopped");
        });

        // Events down
        let token = shutdown.clone();
        tokio::spawn(async move {
            let last = loop {
                let message = tokio::select! {
                    _ = token.cancelled() => return,
                    message = reader.next() => message,
                };
                match message {
                    Some(Ok(Message::Text(text))) => match parse_message(&text) {
                        Ok(Incoming::Transcript(event)) => {
                            if event_tx.send(SttEvent::Transcript(event)).await.is_err() {
                                break None;
                            }
                        }
                        Ok(Incoming::SessionEnded) => break Some(SttEvent::Ended),
                        Ok(Incoming::Other(kind)) => debug!(kind = %kind, "Ignoring Gladia message"),
                        Err(e) => warn!("Unparseable Gladia message: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break Some(match frame {
                            Some(frame) if frame.code != CloseCode::Normal => SttEvent::Error(
                                RelayError::stream(NAME, format!("closed with {}: {}", frame.code, frame.reason)),
                            ),
                            _ => SttEvent::Ended,
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(SttEvent::Error(RelayError::stream(NAME, e))),
                    None => break Some(SttEvent::Ended),
                }
            };

            if let Some(event) = last {
                let _ = event_tx.send(event).await;
            }
            token.cancel();
        });

        Ok(SttConnection {
            audio: audio_tx,
            events: event_rx,
            shutdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::TranscriptKind;

    fn settings() -> SttSettings {
        SttSettings {
            model: "solaria-1".into(),
            language: "de".into(),
            endpointing: 0.3,
            max_duration_without_endpointing: 12.0,
        }
    }

    #[test]
    fn test_session_request_forwards_settings() {
        let body = session_request(&settings());
        assert_eq!(body["model"], "solaria-1");
        assert_eq!(body["encoding"], "wav/pcm");
        assert_eq!(body["sample_rate"], 16000);
        assert_eq!(body["endpointing"], 0.3);
        assert_eq!(body["maximum_duration_without_endpointing"], 12.0);
        assert_eq!(body["language_config"]["languages"][0], "de");
        assert_eq!(body["messages_config"]["receive_partial_transcripts"], true);
    }

    #[test]
    fn test_parse_final_and_partial_transcripts() {
        let final_msg = r#"{"type":"transcript","session_id":"s","data":{"id":"u1","is_final":true,"utterance":{"text":" hello ","start":0.1,"end":0.6}}}"#;
        let Incoming::Transcript(event) = parse_message(final_msg).unwrap() else {
            panic!("expected transcript");
        };
        assert_eq!(event.kind, TranscriptKind::Final);
        assert_eq!(event.text(), "hello");

        let partial_msg = r#"{"type":"transcript","data":{"is_final":false,"utterance":{"text":"hel"}}}"#;
        assert_eq!(
            parse_message(partial_msg).unwrap(),
            Incoming::Transcript(TranscriptEvent::partial("hel"))
        );
    }

    #[test]
    fn test_parse_voice_activity_and_lifecycle() {
        assert_eq!(
            parse_message(r#"{"type":"speech_start","data":{"time":1.2,"channel":0}}"#).unwrap(),
            Incoming::Transcript(TranscriptEvent::speech_start())
        );
        assert_eq!(parse_message(r#"{"type":"end_session"}"#).unwrap(), Incoming::SessionEnded);
        assert_eq!(
            parse_message(r#"{"type":"audio_chunk","acknowledged":true}"#).unwrap(),
            Incoming::Other("audio_chunk".into())
        );
    }

    #[test]
    fn test_parse_rejects_broken_transcript() {
        assert!(parse_message("{").is_err());
        assert!(parse_message(r#"{"type":"transcript","data":{"is_final":true}}"#).is_err());
    }

    #[tokio::test]
    async fn test_missing_key_is_an_init_error() {
        let stt = GladiaStt::new(
            reqwest::Client::new(),
            ProviderEndpoint {
                api_url: "http://127.0.0.1:9/v2/live".into(),
                api_key: String::new(),
            },
        );
        let err = stt.connect(&settings(), 8).await.unwrap_err();
        assert_eq!(err.client_message().as_deref(), Some("Failed to initialize Gladia STT"));
    }
}
