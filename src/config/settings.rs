//! Service settings
//!
//! Loaded from a JSON file, then overridden from the environment, then
//! validated.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{get_settings_path, ConfigError};
use crate::inference::engine::SamplingParams;
use crate::inference::lifecycle::LifecycleConfig;
use crate::inference::streaming::DEFAULT_CHANNEL_CAPACITY;
use crate::inference::template::DEFAULT_HUB_ENDPOINT;

/// Model served when nothing else is configured
pub const DEFAULT_MODEL: &str = "DragonLLM/qwen3-8b-fin-v1.0";

/// Which engine backend to load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// llama.cpp over GGUF weights (needs the `llama` feature)
    Llama,
    /// Deterministic canned replies
    Scripted,
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "llama" => Ok(BackendKind::Llama),
            "scripted" => Ok(BackendKind::Scripted),
            other => Err(ConfigError::InvalidValue {
                key: "backend".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Model id, or a direct path to GGUF weights
    pub model: String,
    pub backend: BackendKind,
    /// Hub cache directory searched for weights
    pub cache_dir: PathBuf,
    /// Environment variables searched for an access token, in priority order
    pub credential_env_vars: Vec<String>,
    /// Hub endpoint for the chat template fallback
    pub template_endpoint: String,
    /// Milliseconds between checks while another caller initializes
    pub init_poll_interval_ms: u64,
    pub init_max_polls: u32,
    pub stream_channel_capacity: usize,
    pub max_concurrent_generations: usize,
    /// Defaults for parameters a request leaves out
    pub sampling: SamplingParams,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Context window size
    pub context_size: u32,
    /// Reply of the scripted backend
    pub scripted_reply: String,
    pub host: String,
    pub port: u16,
    /// Applies to non-streaming completions only
    pub request_timeout_secs: u64,
    /// Reload the engine during startup warm-up even if it is loaded
    pub force_model_reload: bool,
    /// Default tracing level, overridden by RUST_LOG
    pub log_level: String,
}

fn default_cache_dir() -> PathBuf {
    std::env::var("HF_HOME")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp/huggingface"))
}

impl Default for ServiceSettings {
    fn default() -> Self {
        let lifecycle = LifecycleConfig::default();
        Self {
            model: DEFAULT_MODEL.to_string(),
            backend: if cfg!(feature = "llama") {
                BackendKind::Llama
            } else {
                BackendKind::Scripted
            },
            cache_dir: default_cache_dir(),
            credential_env_vars: lifecycle.credential_env_vars,
            template_endpoint: DEFAULT_HUB_ENDPOINT.to_string(),
            init_poll_interval_ms: lifecycle.poll_interval.as_millis() as u64,
            init_max_polls: lifecycle.max_polls,
            stream_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_concurrent_generations: 1,
            sampling: SamplingParams::default(),
            gpu_layers: 99, // Offload all layers to GPU by default
            context_size: 8192,
            scripted_reply: "This is a scripted reply.".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 300,
            force_model_reload: false,
            log_level: "info".to_string(),
        }
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: other.to_string(),
        }),
    }
}

impl ServiceSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        self.sampling.validate();

        if self.model.trim().is_empty() {
            self.model = DEFAULT_MODEL.to_string();
        }
        if self.init_poll_interval_ms == 0 {
            self.init_poll_interval_ms = 1000;
        }
        if self.init_max_polls == 0 {
            self.init_max_polls = 300;
        }
        self.stream_channel_capacity = self.stream_channel_capacity.clamp(1, 4096);
        if self.max_concurrent_generations == 0 {
            self.max_concurrent_generations = 1;
        }
        if self.context_size == 0 {
            self.context_size = 8192;
        }
        if self.port == 0 {
            self.port = 8080;
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = 300;
        }
        if self.log_level.trim().is_empty() {
            self.log_level = "info".to_string();
        }
        if self.credential_env_vars.is_empty() {
            self.credential_env_vars = LifecycleConfig::default().credential_env_vars;
        }
    }

    /// Applies environment overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(model) = lookup("MODEL") {
            self.model = model;
        }
        if let Some(backend) = lookup("FINSERVE_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Some(host) = lookup("FINSERVE_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("FINSERVE_PORT") {
            self.port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "FINSERVE_PORT".to_string(),
                value: port.clone(),
            })?;
        }
        if let Some(flag) = lookup("FORCE_MODEL_RELOAD") {
            self.force_model_reload = parse_flag("FORCE_MODEL_RELOAD", &flag)?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level.to_lowercase();
        }
        if let Some(cache) = lookup("HF_HOME") {
            self.cache_dir = PathBuf::from(cache);
        }
        Ok(())
    }

    /// Loads settings from the default location and the process
    /// environment.
    ///
    /// A missing or corrupt file falls back to defaults; a bad environment
    /// override is an error.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = match get_settings_path() {
            Ok(path) => Self::load_file(&path),
            Err(e) => {
                tracing::warn!("Failed to locate settings, using defaults: {}", e);
                Self::default()
            }
        };
        settings.apply_overrides(|key| {
            std::env::var(key).ok().filter(|v| !v.trim().is_empty())
        })?;
        settings.validate();
        Ok(settings)
    }

    /// Reads a settings file, falling back to defaults on any problem.
    pub fn load_file(path: &Path) -> Self {
        match Self::load_file_internal(path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Failed to load settings, using defaults: {}", e);
                Self::default()
            }
        }
    }

    fn load_file_internal(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("Settings file not found, using defaults");
            return Ok(Self::default());
        }

        let json = fs::read_to_string(path)?;
        let mut settings: Self = serde_json::from_str(&json)?;
        settings.validate();

        tracing::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Save settings to `path`
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        tracing::debug!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Lifecycle configuration derived from these settings
    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            model_id: self.model.clone(),
            cache_dir: self.cache_dir.clone(),
            credential_env_vars: self.credential_env_vars.clone(),
            poll_interval: Duration::from_millis(self.init_poll_interval_ms),
            max_polls: self.init_max_polls,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// `host:port` to bind
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
