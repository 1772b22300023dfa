//! Configuration management for voiceclaw
//!
//! Every value resolves as environment variable > TOML file > default.

pub mod file;

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use self::file::VoiceclawConfigFile;
use crate::pipeline::DEFAULT_HISTORY_LIMIT;
use crate::{Error, Result};

/// Default "stay silent" reply
pub const DEFAULT_NO_REPLY_SENTINEL: &str = "NO_REPLY";

/// voiceclaw configuration
#[derive(Debug)]
pub struct Config {
    /// WebSocket/HTTP server
    pub server: ServerConfig,

    /// Streaming LLM endpoint
    pub llm: LlmConfig,

    /// Speech synthesis
    pub tts: TtsConfig,

    /// Transcription
    pub stt: SttConfig,

    /// Turn pipeline tuning
    pub pipeline: PipelineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// LLM endpoint configuration
#[derive(Debug)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions URL
    pub endpoint: String,

    /// Bearer token, if the endpoint needs one
    pub api_key: Option<SecretString>,

    /// Model identifier; `None` lets the server choose
    pub model: Option<String>,

    /// Sampling temperature (0.0 to 2.0)
    pub temperature: f32,

    /// Maximum tokens to generate
    pub max_tokens: u32,
}

/// Speech synthesis backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsProvider {
    /// Any `/v1/audio/speech` compatible server
    OpenAi,
    ElevenLabs,
}

impl FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "" => Ok(Self::OpenAi),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Speech synthesis configuration
#[derive(Debug)]
pub struct TtsConfig {
    pub provider: TtsProvider,
    pub endpoint: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    /// Voice identifier (ElevenLabs: voice id)
    pub voice: String,
    /// Response format, also used as the chunk file extension
    pub format: String,
    /// Speed multiplier (0.25 to 4.0)
    pub speed: f32,
}

/// Transcription backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttProvider {
    Whisper,
    Deepgram,
}

impl FromStr for SttProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown STT provider: {other}"))),
        }
    }
}

/// Transcription configuration
#[derive(Debug)]
pub struct SttConfig {
    pub provider: SttProvider,
    pub endpoint: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    /// Sample rate of raw PCM sent by clients
    pub sample_rate: u32,
}

/// Turn pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Simultaneous synthesis calls allowed per turn
    pub max_concurrent_synthesis: usize,

    /// Deadline for finalizing one transcription
    pub transcription_timeout: Duration,

    /// Deadline for one whole generation stream
    pub generation_timeout: Duration,

    /// Deadline for one synthesis call
    pub synthesis_timeout: Duration,

    /// Reply meaning "say nothing"
    pub no_reply_sentinel: String,

    /// Messages kept in the conversation history
    pub history_limit: usize,

    /// Events the conversation queue holds before publishing waits
    pub event_capacity: usize,

    /// System prompt seeding every conversation
    pub system_prompt: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_synthesis: 3,
            transcription_timeout: Duration::from_secs(15),
            generation_timeout: Duration::from_secs(60),
            synthesis_timeout: Duration::from_secs(20),
            no_reply_sentinel: DEFAULT_NO_REPLY_SENTINEL.to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            event_capacity: 256,
            system_prompt: None,
        }
    }
}

impl PipelineConfig {
    /// Reject settings the pipeline cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_synthesis == 0 {
            return Err(Error::Config(
                "max_concurrent_synthesis must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("transcription_timeout", self.transcription_timeout),
            ("generation_timeout", self.generation_timeout),
            ("synthesis_timeout", self.synthesis_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be non-zero")));
            }
        }
        if self.no_reply_sentinel.trim().is_empty() {
            return Err(Error::Config("no_reply_sentinel must not be empty".to_string()));
        }
        if self.history_limit == 0 || self.event_capacity == 0 {
            return Err(Error::Config(
                "history_limit and event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

impl Config {
    /// Load configuration from the environment and the TOML config file
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or fails validation
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or fails validation
    #[allow(clippy::too_many_lines)]
    pub fn from_sources(fc: VoiceclawConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parse_env = |key: &str| -> Result<Option<u64>> {
            env(key)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .map_err(|e| Error::Config(format!("{key}: {e}")))
                })
                .transpose()
        };

        // Server (env > toml > default)
        let server = ServerConfig {
            host: env("WEBSOCKET_HOST")
                .or(fc.server.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: match parse_env("WEBSOCKET_PORT")? {
                Some(port) => u16::try_from(port)
                    .map_err(|_| Error::Config(format!("WEBSOCKET_PORT out of range: {port}")))?,
                None => fc.server.port.unwrap_or(8000),
            },
        };

        // LLM (env > toml > default)
        let model = env("LLM_MODEL")
            .or(fc.llm.model)
            .filter(|m| !m.is_empty() && m != "default");
        let llm = LlmConfig {
            endpoint: env("LLM_API_ENDPOINT")
                .or(fc.llm.endpoint)
                .unwrap_or_else(|| "http://127.0.0.1:1234/v1/chat/completions".to_string()),
            api_key: env("LLM_API_KEY")
                .or(fc.llm.api_key)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            model,
            temperature: fc.llm.temperature.unwrap_or(0.7),
            max_tokens: fc.llm.max_tokens.unwrap_or(2048),
        };
        if !(0.0..=2.0).contains(&llm.temperature) {
            return Err(Error::Config(format!(
                "llm temperature must be between 0.0 and 2.0, got {}",
                llm.temperature
            )));
        }

        // TTS (env > toml > default)
        let tts_provider = env("TTS_PROVIDER")
            .or(fc.tts.provider)
            .map(|p| p.parse())
            .transpose()?
            .unwrap_or(TtsProvider::OpenAi);
        let tts_default_endpoint = match tts_provider {
            TtsProvider::OpenAi => "http://localhost:5005/v1/audio/speech",
            TtsProvider::ElevenLabs => "https://api.elevenlabs.io/v1/text-to-speech",
        };
        let tts = TtsConfig {
            provider: tts_provider,
            endpoint: env("TTS_API_ENDPOINT")
                .or(fc.tts.endpoint)
                .unwrap_or_else(|| tts_default_endpoint.to_string()),
            api_key: env("TTS_API_KEY")
                .or_else(|| match tts_provider {
                    TtsProvider::ElevenLabs => env("ELEVENLABS_API_KEY"),
                    TtsProvider::OpenAi => None,
                })
                .or(fc.tts.api_key)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            model: env("TTS_MODEL")
                .or(fc.tts.model)
                .unwrap_or_else(|| "tts-1".to_string()),
            voice: env("TTS_VOICE")
                .or(fc.tts.voice)
                .unwrap_or_else(|| "tara".to_string()),
            format: env("TTS_FORMAT")
                .or(fc.tts.format)
                .unwrap_or_else(|| "wav".to_string()),
            speed: fc.tts.speed.unwrap_or(1.0),
        };

        // STT (env > toml > default); Deepgram wins when its key is present
        let deepgram_key = env("DEEPGRAM_API_KEY").filter(|k| !k.is_empty());
        let stt_provider = env("STT_PROVIDER")
            .or(fc.stt.provider)
            .map(|p| p.parse())
            .transpose()?
            .unwrap_or(if deepgram_key.is_some() {
                SttProvider::Deepgram
            } else {
                SttProvider::Whisper
            });
        let (stt_endpoint, env_model, default_model, provider_key) = match stt_provider {
            SttProvider::Whisper => (
                "https://api.openai.com/v1/audio/transcriptions",
                env("WHISPER_MODEL"),
                "whisper-1",
                env("OPENAI_API_KEY"),
            ),
            SttProvider::Deepgram => (
                "https://api.deepgram.com/v1/listen",
                env("DEEPGRAM_MODEL"),
                "nova-2",
                deepgram_key,
            ),
        };
        let stt = SttConfig {
            provider: stt_provider,
            endpoint: env("STT_API_ENDPOINT")
                .or(fc.stt.endpoint)
                .unwrap_or_else(|| stt_endpoint.to_string()),
            api_key: env("STT_API_KEY")
                .or(provider_key)
                .or(fc.stt.api_key)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            model: env_model
                .or(fc.stt.model)
                .unwrap_or_else(|| default_model.to_string()),
            sample_rate: match parse_env("AUDIO_SAMPLE_RATE")? {
                Some(rate) => u32::try_from(rate)
                    .map_err(|_| Error::Config(format!("AUDIO_SAMPLE_RATE out of range: {rate}")))?,
                None => fc.stt.sample_rate.unwrap_or(48_000),
            },
        };

        // Pipeline (env > toml > default)
        let defaults = PipelineConfig::default();
        let fp = fc.pipeline;
        let secs = |key: &str, file: Option<u64>, default: Duration| -> Result<Duration> {
            Ok(parse_env(key)?
                .or(file)
                .map_or(default, Duration::from_secs))
        };
        let pipeline = PipelineConfig {
            max_concurrent_synthesis: parse_env("VOICECLAW_MAX_CONCURRENT_SYNTHESIS")?
                .and_then(|v| usize::try_from(v).ok())
                .or(fp.max_concurrent_synthesis)
                .unwrap_or(defaults.max_concurrent_synthesis),
            transcription_timeout: secs(
                "VOICECLAW_TRANSCRIPTION_TIMEOUT",
                fp.transcription_timeout_secs,
                defaults.transcription_timeout,
            )?,
            generation_timeout: secs(
                "VOICECLAW_GENERATION_TIMEOUT",
                fp.generation_timeout_secs,
                defaults.generation_timeout,
            )?,
            synthesis_timeout: secs(
                "VOICECLAW_SYNTHESIS_TIMEOUT",
                fp.synthesis_timeout_secs,
                defaults.synthesis_timeout,
            )?,
            no_reply_sentinel: env("VOICECLAW_NO_REPLY_SENTINEL")
                .or(fp.no_reply_sentinel)
                .unwrap_or(defaults.no_reply_sentinel),
            history_limit: fp.history_limit.unwrap_or(defaults.history_limit),
            event_capacity: fp.event_capacity.unwrap_or(defaults.event_capacity),
            system_prompt: env("VOICECLAW_SYSTEM_PROMPT")
                .or(fc.llm.system_prompt)
                .filter(|p| !p.trim().is_empty()),
        };
        pipeline.validate()?;

        if env("VOICECLAW_DEBUG_CONFIG").is_some_and(|v| parse_bool(&v)) {
            tracing::debug!(?server, ?pipeline, "resolved configuration");
        }

        Ok(Self {
            server,
            llm,
            tts,
            stt,
            pipeline,
        })
    }

    /// Configuration view safe to expose: secrets reduced to presence flags
    #[must_use]
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::json!({
            "server": {
                "host": self.server.host,
                "port": self.server.port,
            },
            "llm": {
                "endpoint": self.llm.endpoint,
                "model": self.llm.model.as_deref().unwrap_or("default"),
                "temperature": self.llm.temperature,
                "max_tokens": self.llm.max_tokens,
                "has_api_key": self.llm.api_key.is_some(),
            },
            "tts": {
                "provider": format!("{:?}", self.tts.provider).to_lowercase(),
                "endpoint": self.tts.endpoint,
                "model": self.tts.model,
                "voice": self.tts.voice,
                "format": self.tts.format,
                "speed": self.tts.speed,
                "has_api_key": self.tts.api_key.is_some(),
            },
            "stt": {
                "provider": format!("{:?}", self.stt.provider).to_lowercase(),
                "endpoint": self.stt.endpoint,
                "model": self.stt.model,
                "sample_rate": self.stt.sample_rate,
                "has_api_key": self.stt.api_key.is_some(),
            },
            "pipeline": {
                "max_concurrent_synthesis": self.pipeline.max_concurrent_synthesis,
                "transcription_timeout_secs": self.pipeline.transcription_timeout.as_secs(),
                "generation_timeout_secs": self.pipeline.generation_timeout.as_secs(),
                "synthesis_timeout_secs": self.pipeline.synthesis_timeout.as_secs(),
                "no_reply_sentinel": self.pipeline.no_reply_sentinel,
                "history_limit": self.pipeline.history_limit,
                "has_system_prompt": self.pipeline.system_prompt.is_some(),
            },
        })
    }
}
