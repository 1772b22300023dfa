//! Text-to-speech over HTTP

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};

use super::Synthesizer;
use crate::config::{TtsConfig, TtsProvider};
use crate::{Error, Result};

/// ElevenLabs model used when none is configured
const ELEVENLABS_DEFAULT_MODEL: &str = "eleven_monolingual_v1";

/// Synthesizes sentences with an OpenAI-compatible server or ElevenLabs
pub struct TextToSpeech {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    voice: String,
    speed: f32,
    model: String,
    format: String,
    provider: TtsProvider,
}

impl TextToSpeech {
    /// Build a synthesizer from configuration
    ///
    /// # Errors
    ///
    /// Returns error if ElevenLabs is selected without an API key, or the
    /// speed is outside 0.25 to 4.0
    pub fn from_config(config: &TtsConfig) -> Result<Self> {
        if config.provider == TtsProvider::ElevenLabs && config.api_key.is_none() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }
        if !(0.25..=4.0).contains(&config.speed) {
            return Err(Error::Config(format!(
                "TTS speed must be between 0.25 and 4.0, got {}",
                config.speed
            )));
        }

        let model = match config.provider {
            TtsProvider::ElevenLabs if config.model == "tts-1" => ELEVENLABS_DEFAULT_MODEL.to_string(),
            _ => config.model.clone(),
        };

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config
                .api_key
                .as_ref()
                .map(|k| SecretString::from(k.expose_secret().to_owned())),
            voice: config.voice.clone(),
            speed: config.speed,
            model,
            format: config.format.clone(),
            provider: config.provider,
        })
    }

    /// Synthesize using an OpenAI-compatible `/v1/audio/speech` endpoint
    async fn synthesize_openai(&self, text: &str) -> Result<Bytes> {
        #[derive(serde::Serialize)]
        struct SpeechRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            response_format: &'a str,
            speed: f32,
        }

        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            response_format: &self.format,
            speed: self.speed,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Synthesis(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("TTS error {status}: {body}")));
        }

        response
            .bytes()
            .await
            .map_err(|e| Error::Synthesis(format!("failed to read audio: {e}")))
    }

    /// Synthesize using ElevenLabs
    async fn synthesize_elevenlabs(&self, text: &str) -> Result<Bytes> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| Error::Config("ElevenLabs API key required for TTS".to_string()))?;

        let response = self
            .client
            .post(format!("{}/{}", self.endpoint, self.voice))
            .header("xi-api-key", key.expose_secret())
            .json(&ElevenLabsRequest {
                text,
                model_id: &self.model,
            })
            .send()
            .await
            .map_err(|e| Error::Synthesis(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("ElevenLabs TTS error {status}: {body}")));
        }

        response
            .bytes()
            .await
            .map_err(|e| Error::Synthesis(format!("failed to read audio: {e}")))
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        if text.trim().is_empty() {
            return Err(Error::Synthesis("nothing to synthesize".to_string()));
        }

        let audio = match self.provider {
            TtsProvider::OpenAi => self.synthesize_openai(text).await?,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text).await?,
        };
        if audio.is_empty() {
            return Err(Error::Synthesis("provider returned no audio".to_string()));
        }

        tracing::debug!(chars = text.len(), audio_bytes = audio.len(), "synthesis complete");
        Ok(audio)
    }

    fn format(&self) -> &str {
        match self.provider {
            TtsProvider::OpenAi => &self.format,
            TtsProvider::ElevenLabs => "mp3",
        }
    }
}
