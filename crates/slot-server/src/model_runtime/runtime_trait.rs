//! Backend contract consumed by the serving core.
//!
//! A `ModelLoader` turns a model path plus a resolved device into a
//! `ModelHandle`. Every method here is blocking: callers run them on the
//! worker pool, never on the request dispatcher.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Token budget used when a request leaves `max_tokens` unset.
pub const DEFAULT_TOKEN_BUDGET: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Standard,
    Dllm,
    Sherry,
}

impl ModelFormat {
    pub const ALL: [ModelFormat; 3] = [ModelFormat::Standard, ModelFormat::Dllm, ModelFormat::Sherry];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::Standard => "standard",
            ModelFormat::Dllm => "dllm",
            ModelFormat::Sherry => "sherry",
        }
    }

    /// Parses a caller-supplied type hint that names a format.
    pub fn from_hint(hint: &str) -> Option<Self> {
        let hint = hint.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|f| f.as_str() == hint)
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 1.0,
            max_tokens: None,
            stop: Vec::new(),
            seed: None,
        }
    }
}

impl GenerationParams {
    pub fn token_budget(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_TOKEN_BUDGET)
    }
}

/// Result of a non-streaming generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Incremental token texts. Ends on end-of-sequence, stop string, or budget.
pub type TokenIter<'a> = Box<dyn Iterator<Item = anyhow::Result<String>> + Send + 'a>;

/// A loaded model. Implementations must tolerate concurrent calls.
pub trait ModelHandle: Send + Sync {
    /// Architecture reported by the backend, if it knows one.
    fn model_type(&self) -> Option<String>;

    fn generate(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<Generation>;

    fn stream_generate(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<TokenIter<'_>>;

    /// Byte size of the model's parameters, excluding runtime overhead.
    fn parameter_bytes(&self) -> u64;

    /// Ask the runtime to return cached device memory. Called on GPU devices during unload.
    fn release_device_cache(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Free every backend resource. The handle is not used afterwards.
    fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadSpec {
    pub model_path: PathBuf,
    /// Resolved device id, e.g. `cpu` or `cuda:0`.
    pub device: String,
    pub format: ModelFormat,
    pub model_type_hint: Option<String>,
}

pub trait ModelLoader: Send + Sync {
    fn format(&self) -> ModelFormat;

    fn name(&self) -> &str;

    fn load(&self, spec: &LoadSpec) -> anyhow::Result<Arc<dyn ModelHandle>>;
}
