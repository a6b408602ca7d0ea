//! Configuration for the residency manager and its engines
//!
//! Settings are read from a YAML, TOML or JSON file (format picked from the
//! extension). `${VAR}` / `$VAR` references in the file are substituted from
//! the process environment before parsing, and `MEDSCRIBE__`-prefixed
//! variables override individual keys afterwards, e.g.
//! `MEDSCRIBE__REASONING__BASE_URL=http://gpu-1:8000`.
//!
//! Engine settings (model id, GPU memory fraction, max sequence length) are
//! passed through to the backends; the manager never interprets them.

use crate::engine::simulated::DEFAULT_DICTATION_CHUNK_WORDS;
use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "MEDSCRIBE";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Connection and launch settings for one vLLM deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Server base URL, e.g. `http://127.0.0.1:8000`
    pub base_url: String,
    /// Model id served by the deployment
    pub model_id: String,
    /// Bearer token, if the server was started with `--api-key`
    pub api_key: Option<String>,
    /// Fraction of GPU memory the server may claim while awake
    pub gpu_memory_utilization: f32,
    /// Maximum sequence length the server was launched with
    pub max_model_len: u32,
    /// vLLM sleep level used for eviction. Level 2 discards weights and KV
    /// cache; level 1 offloads weights to CPU and keeps nothing on the GPU
    /// but the CUDA graph pool.
    pub sleep_level: u8,
    /// Timeout for a single HTTP request
    pub request_timeout_secs: u64,
    /// How long initialization waits for `/health`
    pub startup_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            model_id: String::new(),
            api_key: None,
            gpu_memory_utilization: 0.85,
            max_model_len: 8192,
            sleep_level: 2,
            request_timeout_secs: 300,
            startup_timeout_secs: 600,
        }
    }
}

impl EndpointConfig {
    pub fn new(base_url: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model_id: model_id.into(),
            ..Default::default()
        }
    }

    pub fn with_gpu_memory_utilization(mut self, fraction: f32) -> Self {
        self.gpu_memory_utilization = fraction;
        self
    }

    pub fn with_max_model_len(mut self, len: u32) -> Self {
        self.max_model_len = len;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_secs = timeout.as_secs();
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// `vllm serve` arguments matching this endpoint.
    pub fn launch_args(&self) -> Vec<String> {
        vec![
            "serve".to_string(),
            self.model_id.clone(),
            "--enable-sleep-mode".to_string(),
            "--gpu-memory-utilization".to_string(),
            self.gpu_memory_utilization.to_string(),
            "--max-model-len".to_string(),
            self.max_model_len.to_string(),
        ]
    }

    fn validate(&self, section: &str) -> ConfigResult<()> {
        let invalid = |field: &str, reason: &str| ConfigError::Invalid {
            field: format!("{section}.{field}"),
            reason: reason.to_string(),
        };

        if self.base_url.trim().is_empty() {
            return Err(invalid("base_url", "must not be empty"));
        }
        if self.model_id.trim().is_empty() {
            return Err(invalid("model_id", "must not be empty"));
        }
        if !(self.gpu_memory_utilization > 0.0 && self.gpu_memory_utilization <= 1.0) {
            return Err(invalid("gpu_memory_utilization", "must be in (0.0, 1.0]"));
        }
        if self.max_model_len == 0 {
            return Err(invalid("max_model_len", "must be > 0"));
        }
        if !matches!(self.sleep_level, 1 | 2) {
            return Err(invalid("sleep_level", "must be 1 or 2"));
        }
        Ok(())
    }
}

/// Bootstrap behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Load the routing engine; the keyword router stands in when disabled
    pub load_routing: bool,
    /// Load the speech engine; the simulated engine stands in when disabled
    pub load_speech: bool,
    /// Fail bootstrap when no reasoning backend initializes, instead of
    /// leaving the slot unloaded
    pub require_reasoning: bool,
    /// Script the simulated speech stand-in replays, one chunk per
    /// transcription, before it falls back to placeholder transcripts
    pub dictation: Option<String>,
    /// Words per replayed dictation chunk
    pub dictation_chunk_words: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            load_routing: true,
            load_speech: true,
            require_reasoning: false,
            dictation: None,
            dictation_chunk_words: DEFAULT_DICTATION_CHUNK_WORDS,
        }
    }
}

/// Top-level residency configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidencyConfig {
    /// Skip every GPU engine and run on software stand-ins only
    pub simulated: bool,
    pub reasoning: EndpointConfig,
    /// Cheaper reasoning deployment tried when the primary fails to load
    pub reasoning_fallback: Option<EndpointConfig>,
    pub routing: EndpointConfig,
    pub speech: EndpointConfig,
    pub bootstrap: BootstrapConfig,
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        Self {
            simulated: false,
            reasoning: EndpointConfig::new("http://127.0.0.1:8000", "google/medgemma-1.5-4b-it")
                .with_gpu_memory_utilization(0.85)
                .with_max_model_len(8192),
            reasoning_fallback: None,
            routing: EndpointConfig::new("http://127.0.0.1:8001", "google/functiongemma-3-270m")
                .with_gpu_memory_utilization(0.30)
                .with_max_model_len(2048),
            speech: EndpointConfig::new("http://127.0.0.1:8002", "google/medasr")
                .with_gpu_memory_utilization(0.30)
                .with_max_model_len(1024),
            bootstrap: BootstrapConfig::default(),
        }
    }
}

impl ResidencyConfig {
    /// Load from a file, applying `${VAR}` substitution and `MEDSCRIBE__`
    /// environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path)?;
        Self::from_str_with_env(&content, format, env_source())
    }

    /// Parse from a string with an explicit format. Environment overrides
    /// still apply.
    pub fn from_str(content: &str, format: FileFormat) -> ConfigResult<Self> {
        Self::from_str_with_env(content, format, env_source())
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_str_with_env("{}", FileFormat::Json, env_source())
    }

    pub(crate) fn from_str_with_env(
        content: &str,
        format: FileFormat,
        env: Environment,
    ) -> ConfigResult<Self> {
        let substituted = substitute_vars(content, |name| std::env::var(name).ok());

        let config: Self = Cfg::builder()
            .add_source(File::from_str(&substituted, format))
            .add_source(env)
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.simulated {
            return Ok(());
        }
        self.reasoning.validate("reasoning")?;
        if let Some(fallback) = &self.reasoning_fallback {
            fallback.validate("reasoning_fallback")?;
        }
        if self.bootstrap.load_routing {
            self.routing.validate("routing")?;
        }
        if self.bootstrap.load_speech {
            self.speech.validate("speech")?;
        }
        Ok(())
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

/// Detect configuration format from file extension
pub fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

static BRACED_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));
static BARE_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("valid regex"));

/// Substitute `${VAR}` and `$VAR` references using `lookup`. Unknown
/// variables are left untouched.
pub fn substitute_vars<F>(content: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let braced = BRACED_VAR.replace_all(content, |caps: &regex::Captures| {
        lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    });

    BARE_VAR
        .replace_all(&braced, |caps: &regex::Captures| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
