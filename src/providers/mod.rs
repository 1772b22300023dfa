//! Capability providers consumed by the pipeline
//!
//! Transcription, generation and synthesis are pluggable: the pipeline only
//! sees these traits. HTTP-backed implementations live in the submodules.

mod llm;
mod stt;
mod tts;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use llm::ChatClient;
pub use stt::SpeechToText;
pub use tts::TextToSpeech;

use crate::Result;
use crate::config::Config;

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::User => f.write_str("user"),
            Self::Assistant => f.write_str("assistant"),
        }
    }
}

/// One entry of the conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Lazily produced text fragments of one generation
///
/// Ends when the provider signals completion. An `Err` item ends the stream
/// early; fragments already yielded stay valid.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Turns a finite audio buffer into finalized text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe WAV audio
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Transcription`] if no text could be produced
    async fn transcribe(&self, audio: &[u8]) -> Result<String>;
}

/// Streams a language model's reply token by token
#[async_trait]
pub trait Generator: Send + Sync {
    /// Start generating a reply to `messages`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Generation`] if the stream cannot be opened
    async fn generate(&self, messages: &[Message]) -> Result<TokenStream>;
}

/// Renders one sentence to encoded audio
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Synthesis`] if no audio was produced
    async fn synthesize(&self, text: &str) -> Result<Bytes>;

    /// Container format of the produced audio (e.g. `wav`, `mp3`)
    fn format(&self) -> &str {
        "wav"
    }
}

/// The three providers one conversation needs
#[derive(Clone)]
pub struct Providers {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl fmt::Debug for Providers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Providers")
            .field("synthesizer_format", &self.synthesizer.format())
            .finish_non_exhaustive()
    }
}

impl Providers {
    /// Build the HTTP-backed providers described by `config`
    ///
    /// # Errors
    ///
    /// Returns error if a provider's settings are unusable
    pub fn from_config(config: &Config) -> Result<Self> {
        let transcriber = SpeechToText::from_config(&config.stt)?;
        let generator = ChatClient::from_config(&config.llm)?;
        let synthesizer = TextToSpeech::from_config(&config.tts)?;

        tracing::info!(
            stt = ?config.stt.provider,
            tts = ?config.tts.provider,
            llm = %config.llm.endpoint,
            "providers ready"
        );

        Ok(Self {
            transcriber: Arc::new(transcriber),
            generator: Arc::new(generator),
            synthesizer: Arc::new(synthesizer),
        })
    }
}
