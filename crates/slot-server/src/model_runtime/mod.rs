//! Model backends.
//!
//! - `runtime_trait`: the blocking `ModelLoader` / `ModelHandle` contract
//! - `format_detector`: picks standard / dllm / sherry once per load
//! - `backend_registry`: format → loader map used by the slot manager
//! - `llama_server_runtime`: standard models served by llama.cpp processes
//! - `sampling`: decode loop for backends that expose raw logits
pub mod runtime_trait;
pub mod format_detector;
pub mod backend_registry;
pub mod llama_server_runtime;
pub mod sampling;

pub use runtime_trait::{
    Generation, GenerationParams, LoadSpec, ModelFormat, ModelHandle, ModelLoader, TokenIter,
    DEFAULT_TOKEN_BUDGET,
};
pub use format_detector::FormatDetector;
pub use backend_registry::BackendRegistry;
pub use llama_server_runtime::{LlamaServerHandle, LlamaServerLoader, LlamaServerSettings};
pub use sampling::{sample_next_token, LogitsModel, SamplingHandle};
