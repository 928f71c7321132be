//! Engine capability surface
//!
//! The generation engine and its text codec are consumed as opaque
//! capabilities. A backend knows how to load them; the rest of the crate only
//! talks to the traits defined here.
//!
//! # Architecture
//!
//! Backends such as llama.cpp hold native state that is not `Send`, so their
//! implementations run the real work on a dedicated worker thread and expose a
//! `Send + Sync` facade. Callers never see the native types.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::message::ChatTurn;

/// Coarse classification of an initialization failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitFailureKind {
    /// Credential missing, rejected or lacking access to the model
    Auth,
    /// Model or codec files could not be fetched or found
    Download,
    /// Anything else
    Other,
}

impl InitFailureKind {
    /// Classifies an underlying error by inspecting its text.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let auth_markers = ["401", "403", "unauthorized", "forbidden", "authentication"];
        if auth_markers.iter().any(|m| lower.contains(m)) {
            return Self::Auth;
        }
        let download_markers = [
            "404",
            "not found",
            "download",
            "connection",
            "timed out",
            "no such file",
        ];
        if download_markers.iter().any(|m| lower.contains(m)) {
            return Self::Download;
        }
        Self::Other
    }
}

impl fmt::Display for InitFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth => f.write_str("auth error"),
            Self::Download => f.write_str("download error"),
            Self::Other => f.write_str("other"),
        }
    }
}

/// Errors that can occur while managing or running the engine
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Engine initialization timed out after {polls} polls")]
    InitializationTimeout { polls: u32 },

    #[error("Engine initialization failed ({kind}): {message}")]
    InitializationFailure {
        kind: InitFailureKind,
        message: String,
    },

    #[error("Engine is not ready")]
    NotReady,

    #[error("Generation failed: {0}")]
    GenerationFailure(String),

    #[error("Accelerator out of memory: {0}")]
    ResourceExhaustion(String),

    #[error("Codec failure: {0}")]
    Codec(String),
}

impl EngineError {
    /// Builds a classified initialization failure from any error text.
    pub fn init_failure(message: impl Into<String>) -> Self {
        let message = message.into();
        EngineError::InitializationFailure {
            kind: InitFailureKind::classify(&message),
            message,
        }
    }

    /// Builds a generation error, promoting out-of-memory conditions.
    pub fn generation(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let oom_word = lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| word == "oom");
        if lower.contains("out of memory") || oom_word {
            EngineError::ResourceExhaustion(message)
        } else {
            EngineError::GenerationFailure(message)
        }
    }

    /// Client-facing message drawn from a fixed vocabulary.
    pub fn public_message(&self) -> &'static str {
        match self {
            EngineError::InitializationTimeout { .. } => "initialization timed out",
            EngineError::InitializationFailure {
                kind: InitFailureKind::Auth,
                ..
            } => "authentication failed",
            EngineError::InitializationFailure {
                kind: InitFailureKind::Download,
                ..
            } => "model download failed",
            EngineError::NotReady => "model is not ready",
            _ => "an internal error occurred",
        }
    }

    /// True for errors that come from the engine lifecycle rather than a
    /// single generation.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            EngineError::InitializationTimeout { .. }
                | EngineError::InitializationFailure { .. }
                | EngineError::NotReady
        )
    }
}

/// Sampling parameters for one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Repetition penalty
    pub repetition_penalty: f32,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: 0.7,
            top_k: 20,
            top_p: 1.0,
            repetition_penalty: 1.05,
            seed: 0,
        }
    }
}

impl SamplingParams {
    /// Greedy decoding, the deterministic setting.
    pub fn is_greedy(&self) -> bool {
        self.temperature < 0.01
    }

    /// Clamps values into ranges every backend accepts.
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        if self.max_tokens == 0 {
            self.max_tokens = 1;
        }
        if self.repetition_penalty <= 0.0 {
            self.repetition_penalty = 1.0;
        }
    }
}

/// Access token used when fetching gated models
#[derive(Clone)]
pub struct Credential {
    /// The token itself
    pub token: String,
    /// Name of the environment variable it came from
    pub source: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("source", &self.source)
            .field("token", &format_args!("<{} chars>", self.token.len()))
            .finish()
    }
}

/// Everything a backend needs to load a model
#[derive(Debug, Clone)]
pub struct LoadSpec {
    pub model_id: String,
    pub credential: Option<Credential>,
    pub cache_dir: PathBuf,
}

/// Raw output of one generation
#[derive(Debug, Clone, Default)]
pub struct Generation {
    /// Decoded generated text, prompt excluded
    pub text: String,
    /// Number of prompt tokens the engine consumed
    pub prompt_tokens: usize,
}

/// Text codec: text to engine tokens and back
pub trait TextCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>, EngineError>;

    fn decode(&self, tokens: &[u32]) -> Result<String, EngineError>;

    /// Number of tokens `text` encodes to.
    fn count_tokens(&self, text: &str) -> Result<usize, EngineError> {
        Ok(self.encode(text)?.len())
    }

    /// Chat template source, if the codec ships one.
    fn chat_template(&self) -> Option<&str>;

    /// Installs a template fetched from elsewhere.
    fn set_chat_template(&mut self, template: String);

    /// Renders turns into a prompt ending in an open assistant turn.
    ///
    /// Returns `None` when the codec has no templating capability.
    fn apply_chat_template(&self, turns: &[ChatTurn]) -> Option<Result<String, EngineError>>;
}

/// Blocking generation capability
///
/// Every method blocks; callers must keep them off the async scheduler.
pub trait GenerationEngine: Send + Sync {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<Generation, EngineError>;

    /// Generates while handing each decoded text increment to `sink`.
    ///
    /// The returned text is the concatenation of every increment.
    fn generate_streaming(
        &self,
        prompt: &str,
        params: &SamplingParams,
        sink: &mut dyn FnMut(&str),
    ) -> Result<Generation, EngineError>;

    /// Frees per-generation buffers and purges cached accelerator memory.
    fn release_transient(&self) {}
}

/// Loads engines and codecs for one kind of runtime
pub trait EngineBackend: Send + Sync {
    fn name(&self) -> &str;

    fn load_codec(&self, spec: &LoadSpec) -> Result<Box<dyn TextCodec>, EngineError>;

    fn load_engine(
        &self,
        spec: &LoadSpec,
        codec: &dyn TextCodec,
    ) -> Result<Arc<dyn GenerationEngine>, EngineError>;

    /// Asks the accelerator to give back cached memory. Best effort.
    fn purge_accelerator_cache(&self) {}
}

/// Fetches a chat template when the codec lacks one
pub trait TemplateSource: Send + Sync {
    fn fetch(&self, spec: &LoadSpec) -> Result<Option<String>, EngineError>;
}

/// Template source that never finds anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTemplateSource;

impl TemplateSource for NoTemplateSource {
    fn fetch(&self, _spec: &LoadSpec) -> Result<Option<String>, EngineError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_init_failures() {
        assert_eq!(
            InitFailureKind::classify("401 Client Error: Unauthorized"),
            InitFailureKind::Auth
        );
        assert_eq!(
            InitFailureKind::classify("Access FORBIDDEN to gated repo"),
            InitFailureKind::Auth
        );
        assert_eq!(
            InitFailureKind::classify("model file not found in cache"),
            InitFailureKind::Download
        );
        assert_eq!(
            InitFailureKind::classify("unexpected tensor shape"),
            InitFailureKind::Other
        );
    }

    #[test]
    fn test_public_messages_are_sanitized() {
        let err = EngineError::init_failure("401 Unauthorized for token hf_secret");
        assert_eq!(err.public_message(), "authentication failed");
        assert!(!err.public_message().contains("hf_secret"));

        let err = EngineError::InitializationTimeout { polls: 300 };
        assert_eq!(err.public_message(), "initialization timed out");

        let err = EngineError::generation("segfault in kernel at 0xdeadbeef");
        assert_eq!(err.public_message(), "an internal error occurred");
    }

    #[test]
    fn test_generation_errors_detect_oom() {
        let err = EngineError::generation("CUDA out of memory. Tried to allocate 2 GiB");
        assert!(matches!(err, EngineError::ResourceExhaustion(_)));
        assert_eq!(err.public_message(), "an internal error occurred");

        let err = EngineError::generation("decode failed");
        assert!(matches!(err, EngineError::GenerationFailure(_)));
    }

    #[test]
    fn test_sampling_params_default() {
        let params = SamplingParams::default();
        assert_eq!(params.max_tokens, 1000);
        assert!((params.temperature - 0.7).abs() < 0.001);
        assert_eq!(params.top_k, 20);
        assert!((params.top_p - 1.0).abs() < 0.001);
        assert!(!params.is_greedy());
    }

    #[test]
    fn test_sampling_params_validation() {
        let mut params = SamplingParams {
            temperature: 5.0,
            top_p: 2.0,
            max_tokens: 0,
            repetition_penalty: -1.0,
            ..Default::default()
        };
        params.validate();
        assert_eq!(params.temperature, 2.0);
        assert_eq!(params.top_p, 1.0);
        assert_eq!(params.max_tokens, 1);
        assert_eq!(params.repetition_penalty, 1.0);
    }

    #[test]
    fn test_credential_debug_hides_token() {
        let cred = Credential {
            token: "hf_supersecret".to_string(),
            source: "HF_TOKEN".to_string(),
        };
        let shown = format!("{:?}", cred);
        assert!(shown.contains("HF_TOKEN"));
        assert!(!shown.contains("supersecret"));
    }
}
