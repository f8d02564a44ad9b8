//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level Voxloop configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt: Option<SttConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

/// Streaming recognizer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

/// Reply-generation (chat completion) configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Operator-supplied system preamble; always the first message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// Streaming synthesizer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Resolve a secret: literal field first, then named environment variable.
fn resolve_secret_field(literal: &Option<String>, env_name: &Option<String>) -> Option<String> {
    if let Some(value) = literal {
        if !value.is_empty() {
            return Some(value.clone());
        }
    }
    env_name
        .as_ref()
        .and_then(|name| std::env::var(name).ok())
        .filter(|v| !v.is_empty())
}

impl SttConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

fn env_secret(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Substitute `${ENV_VAR}` references with environment variable values.
/// Missing variables become empty strings.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant in a spoken conversation. \
Keep replies concise and natural for spoken dialogue. Always respond in the caller's language.";

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::VoxloopError::Io)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::VoxloopError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file location.
    pub fn config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".voxloop")
            .join("config.json")
    }

    pub fn server_port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(3000)
    }

    pub fn server_bind(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    /// STT key: config literal, then named env var, then the default
    /// `VOXLOOP_STT_API_KEY` variable.
    pub fn stt_api_key(&self) -> Option<String> {
        self.stt
            .as_ref()
            .and_then(|s| s.resolve_api_key())
            .or_else(|| env_secret("VOXLOOP_STT_API_KEY"))
    }

    pub fn llm_api_key(&self) -> Option<String> {
        self.llm
            .as_ref()
            .and_then(|l| l.resolve_api_key())
            .or_else(|| env_secret("VOXLOOP_LLM_API_KEY"))
    }

    pub fn tts_api_key(&self) -> Option<String> {
        self.tts
            .as_ref()
            .and_then(|t| t.resolve_api_key())
            .or_else(|| env_secret("VOXLOOP_TTS_API_KEY"))
    }

    pub fn stt_base_url(&self) -> String {
        self.stt
            .as_ref()
            .and_then(|s| s.base_url.clone())
            .unwrap_or_else(|| "wss://api.cartesia.ai/stt/stream".to_string())
    }

    pub fn stt_model(&self) -> String {
        self.stt
            .as_ref()
            .and_then(|s| s.model.clone())
            .unwrap_or_else(|| "ink-whisper".to_string())
    }

    pub fn stt_language(&self) -> String {
        self.stt
            .as_ref()
            .and_then(|s| s.language.clone())
            .unwrap_or_else(|| "en".to_string())
    }

    pub fn stt_api_version(&self) -> String {
        self.stt
            .as_ref()
            .and_then(|s| s.api_version.clone())
            .unwrap_or_else(|| "2025-04-16".to_string())
    }

    pub fn stt_sample_rate(&self) -> u32 {
        self.stt.as_ref().and_then(|s| s.sample_rate).unwrap_or(16_000)
    }

    pub fn llm_base_url(&self) -> String {
        self.llm
            .as_ref()
            .and_then(|l| l.base_url.clone())
            .unwrap_or_else(|| "https://api.openai.com".to_string())
    }

    pub fn llm_model(&self) -> String {
        self.llm
            .as_ref()
            .and_then(|l| l.model.clone())
            .unwrap_or_else(|| "gpt-4o-mini".to_string())
    }

    pub fn system_prompt(&self) -> String {
        self.llm
            .as_ref()
            .and_then(|l| l.system_prompt.clone())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }

    pub fn llm_max_tokens(&self) -> u32 {
        self.llm.as_ref().and_then(|l| l.max_tokens).unwrap_or(1024)
    }

    pub fn llm_temperature(&self) -> Option<f64> {
        self.llm.as_ref().and_then(|l| l.temperature)
    }

    pub fn tts_base_url(&self) -> String {
        self.tts
            .as_ref()
            .and_then(|t| t.base_url.clone())
            .unwrap_or_else(|| "wss://api.cartesia.ai/tts/websocket".to_string())
    }

    pub fn tts_api_version(&self) -> String {
        self.tts
            .as_ref()
            .and_then(|t| t.api_version.clone())
            .unwrap_or_else(|| "2025-04-16".to_string())
    }

    pub fn tts_model_id(&self) -> String {
        self.tts
            .as_ref()
            .and_then(|t| t.model_id.clone())
            .unwrap_or_else(|| "sonic-multilingual".to_string())
    }

    pub fn tts_voice_id(&self) -> String {
        self.tts
            .as_ref()
            .and_then(|t| t.voice_id.clone())
            .unwrap_or_else(|| "5351f3f8-06be-4963-800d-fce17daab951".to_string())
    }

    pub fn tts_language(&self) -> String {
        self.tts
            .as_ref()
            .and_then(|t| t.language.clone())
            .unwrap_or_else(|| self.stt_language())
    }

    pub fn tts_sample_rate(&self) -> u32 {
        self.tts.as_ref().and_then(|t| t.sample_rate).unwrap_or(16_000)
    }

    pub fn log_level(&self) -> String {
        self.logging
            .as_ref()
            .and_then(|l| l.level.clone())
            .unwrap_or_else(|| "info".to_string())
    }

    /// Copy of the config with secret literals masked, for display.
    pub fn redacted(&self) -> Config {
        let mut config = self.clone();
        let mask = |field: &mut Option<String>| {
            if field.is_some() {
                *field = Some("********".to_string());
            }
        };
        if let Some(stt) = config.stt.as_mut() {
            mask(&mut stt.api_key);
        }
        if let Some(llm) = config.llm.as_mut() {
            mask(&mut llm.api_key);
        }
        if let Some(tts) = config.tts.as_mut() {
            mask(&mut tts.api_key);
        }
        config
    }
}
