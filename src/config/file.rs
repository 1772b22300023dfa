//! TOML configuration file loading
//!
//! Supports `~/.config/voiceclaw/config.toml` (or `$VOICECLAW_CONFIG`) as a
//! persistent config source. All fields are optional; the file is a partial
//! overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceclawConfigFile {
    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// LLM configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Speech synthesis configuration
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Transcription configuration
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Streaming pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// LLM-related configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// OpenAI-compatible chat completions URL
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    /// Model identifier; "default" lets the server pick
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
}

/// Speech synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// "openai" (any compatible server) or "elevenlabs"
    pub provider: Option<String>,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    /// Response format (e.g. "wav", "mp3")
    pub format: Option<String>,
    pub speed: Option<f32>,
}

/// Transcription configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// "whisper" or "deepgram"
    pub provider: Option<String>,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub sample_rate: Option<u32>,
}

/// Streaming pipeline tuning
#[derive(Debug, Default, Deserialize)]
pub struct PipelineFileConfig {
    pub max_concurrent_synthesis: Option<usize>,
    pub transcription_timeout_secs: Option<u64>,
    pub generation_timeout_secs: Option<u64>,
    pub synthesis_timeout_secs: Option<u64>,
    pub no_reply_sentinel: Option<String>,
    pub history_limit: Option<usize>,
    pub event_capacity: Option<usize>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoiceclawConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoiceclawConfigFile {
    config_file_path().map_or_else(VoiceclawConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> VoiceclawConfigFile {
    if !path.exists() {
        return VoiceclawConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoiceclawConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoiceclawConfigFile::default()
        }
    }
}

/// Return the config file path: `$VOICECLAW_CONFIG` or `~/.config/voiceclaw/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("VOICECLAW_CONFIG") {
        return Some(PathBuf::from(path));
    }
    directories::BaseDirs::new().map(|d| d.config_dir().join("voiceclaw").join("config.toml"))
}
