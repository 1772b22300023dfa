//! Error types for the voiceclaw pipeline

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::TurnId;

/// Result type alias for voiceclaw operations
pub type Result<T> = std::result::Result<T, Error>;

/// Provider call that can time out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Finalizing a transcription
    Transcription,
    /// One generation stream
    Generation,
    /// One synthesis call
    Synthesis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transcription => write!(f, "transcription"),
            Self::Generation => write!(f, "generation"),
            Self::Synthesis => write!(f, "synthesis"),
        }
    }
}

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Speech-to-text failed, no text was produced
    #[error("transcription error: {0}")]
    Transcription(String),

    /// The language model failed before or during streaming
    #[error("generation error: {0}")]
    Generation(String),

    /// Text-to-speech failed for one sentence
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// A provider call exceeded its deadline
    #[error("{stage} timed out after {after:?}")]
    Timeout {
        /// Which provider call timed out
        stage: Stage,
        /// Configured deadline
        after: Duration,
    },

    /// A non-terminal turn already exists for this conversation
    #[error("turn {0} is still active")]
    TurnActive(TurnId),

    /// Audio encoding or decoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Provider stage this error belongs to, if any
    ///
    /// Timeouts report the stage of the call that timed out, so a timed-out
    /// synthesis is handled exactly like a failed one.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Transcription(_) => Some(Stage::Transcription),
            Self::Generation(_) => Some(Stage::Generation),
            Self::Synthesis(_) => Some(Stage::Synthesis),
            Self::Timeout { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
