//! Per-session provider settings: the `start` message's overrides merged over
//! the server defaults.
//!
//! Values are only checked for type (by serde, when `start` is parsed) and are
//! forwarded verbatim. A provider that dislikes a value rejects it, and the
//! rejection surfaces as an initialization or stream error.

use serde::Serialize;

use crate::config::{AppConfig, SessionDefaults};
use crate::protocol::StartConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SttSettings {
    pub model: String,
    pub language: String,
    /// Seconds of silence that end an utterance
    pub endpointing: f64,
    /// Seconds of continuous speech before an endpoint is forced
    pub max_duration_without_endpointing: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TtsSettings {
    pub model: String,
    pub voice_id: String,
    pub speed: f32,
    pub language: String,
}

/// Everything a session needs to drive its three providers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSettings {
    pub system_prompt: String,
    pub stt: SttSettings,
    pub llm: LlmSettings,
    pub tts: TtsSettings,
}

impl SessionSettings {
    /// Settings built from server defaults alone.
    pub fn from_defaults(config: &AppConfig) -> Self {
        let d: &SessionDefaults = &config.defaults;
        Self {
            system_prompt: d.system_prompt.clone(),
            stt: SttSettings {
                model: d.stt_model.clone(),
                language: d.language.clone(),
                endpointing: d.endpointing,
                max_duration_without_endpointing: d.max_duration_without_endpointing,
            },
            llm: LlmSettings {
                model: d.llm_model.clone(),
                max_tokens: d.max_tokens,
                temperature: d.temperature,
            },
            tts: TtsSettings {
                model: d.tts_model.clone(),
                voice_id: d.voice_id.clone(),
                speed: d.speed,
                language: d.language.clone(),
            },
        }
    }

    /// Merge caller-supplied overrides over the server defaults, field by field.
    ///
    /// A blank system prompt counts as "not supplied" so a cleared dashboard field
    /// does not leave the model without instructions.
    pub fn merge(config: &AppConfig, overrides: Option<&StartConfig>) -> Self {
        let mut settings = Self::from_defaults(config);
        let Some(start) = overrides else {
            return settings;
        };

        if let Some(prompt) = start.system_prompt.as_ref().filter(|p| !p.trim().is_empty()) {
            settings.system_prompt = prompt.clone();
        }

        if let Some(language) = start.providers.as_ref().and_then(|p| p.language.clone()) {
            settings.stt.language = language.clone();
            settings.tts.language = language;
        }

        if let Some(llm) = &start.llm_settings {
            if let Some(model) = &llm.model {
                settings.llm.model = model.clone();
            }
            if let Some(max_tokens) = llm.max_tokens {
                settings.llm.max_tokens = max_tokens;
            }
            if let Some(temperature) = llm.temperature {
                settings.llm.temperature = temperature;
            }
        }

        if let Some(speech) = &start.speech_settings {
            if let Some(voice_id) = &speech.voice_id {
                settings.tts.voice_id = voice_id.clone();
            }
            if let Some(speed) = speech.speed {
                settings.tts.speed = speed;
            }
        }

        if let Some(realtime) = &start.realtime_settings {
            if let Some(endpointing) = realtime.endpointing {
                settings.stt.endpointing = endpointing;
            }
            if let Some(max_duration) = realtime.max_duration {
                settings.stt.max_duration_without_endpointing = max_duration;
            }
        }

        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LlmOverrides, ProviderSelection, RealtimeOverrides, SpeechOverrides};

    #[test]
    fn test_no_overrides_uses_defaults() {
        let config = AppConfig::default();
        let settings = SessionSettings::merge(&config, None);
        assert_eq!(settings.system_prompt, config.defaults.system_prompt);
        assert_eq!(settings.llm.model, "llama-3.3-70b");
        assert_eq!(settings.stt.endpointing, 0.05);
        assert_eq!(settings.tts.voice_id, config.defaults.voice_id);
    }

    #[test]
    fn test_overrides_win_field_by_field() {
        let config = AppConfig::default();
        let start = StartConfig {
            system_prompt: Some("Speak like a pirate.".into()),
            providers: Some(ProviderSelection {
                language: Some("es".into()),
                ..Default::default()
            }),
            llm_settings: Some(LlmOverrides {
                max_tokens: Some(120),
                ..Default::default()
            }),
            speech_settings: Some(SpeechOverrides {
                voice_id: Some("voice-x".into()),
                speed: None,
            }),
            realtime_settings: Some(RealtimeOverrides {
                endpointing: Some(0.3),
                max_duration: None,
            }),
            ..Default::default()
        };

        let settings = SessionSettings::merge(&config, Some(&start));
        assert_eq!(settings.system_prompt, "Speak like a pirate.");
        assert_eq!(settings.stt.language, "es");
        assert_eq!(settings.tts.language, "es");
        assert_eq!(settings.llm.max_tokens, 120);
        assert_eq!(settings.llm.temperature, 0.8); // untouched
        assert_eq!(settings.tts.voice_id, "voice-x");
        assert_eq!(settings.tts.speed, 1.0);
        assert_eq!(settings.stt.endpointing, 0.3);
        assert_eq!(settings.stt.max_duration_without_endpointing, 15.0);
    }

    #[test]
    fn test_blank_prompt_keeps_default() {
        let config = AppConfig::default();
        let start = StartConfig {
            system_prompt: Some("   ".into()),
            ..Default::default()
        };
        let settings = SessionSettings::merge(&config, Some(&start));
        assert_eq!(settings.system_prompt, config.defaults.system_prompt);
    }
}
