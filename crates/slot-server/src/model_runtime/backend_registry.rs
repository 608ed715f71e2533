//! Backend Registry
//!
//! Maps each model format to the loader that serves it. The format is
//! resolved once per load; after that the core only talks to the returned
//! `ModelHandle`.

use super::format_detector::FormatDetector;
use super::llama_server_runtime::{LlamaServerLoader, LlamaServerSettings};
use super::runtime_trait::*;
use anyhow::Context;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Default)]
pub struct BackendRegistry {
    loaders: HashMap<ModelFormat, Arc<dyn ModelLoader>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard models are served by spawned llama-server processes.
    pub fn with_defaults(settings: LlamaServerSettings) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LlamaServerLoader::new(settings)));
        registry
    }

    /// Registers a loader for its format, returning the one it replaced.
    pub fn register(&mut self, loader: Arc<dyn ModelLoader>) -> Option<Arc<dyn ModelLoader>> {
        info!("Registered '{}' backend for {} models", loader.name(), loader.format());
        self.loaders.insert(loader.format(), loader)
    }

    pub fn formats(&self) -> Vec<ModelFormat> {
        ModelFormat::ALL
            .into_iter()
            .filter(|f| self.loaders.contains_key(f))
            .collect()
    }

    pub fn loader_for(&self, format: ModelFormat) -> anyhow::Result<Arc<dyn ModelLoader>> {
        self.loaders.get(&format).cloned().ok_or_else(|| {
            anyhow::anyhow!(
                "No backend registered for {} models (available: {:?})",
                format,
                self.formats()
            )
        })
    }

    /// Detects the format and loads the model. Blocking.
    pub fn load(
        &self,
        model_path: &Path,
        device: &str,
        model_type_hint: Option<&str>,
    ) -> anyhow::Result<(ModelFormat, Arc<dyn ModelHandle>)> {
        let format = FormatDetector::detect(model_path, model_type_hint);
        let loader = self.loader_for(format)?;

        let spec = LoadSpec {
            model_path: model_path.to_path_buf(),
            device: device.to_string(),
            format,
            model_type_hint: model_type_hint.map(str::to_string),
        };

        info!(
            "Loading {} on {} with '{}' backend",
            model_path.display(),
            device,
            loader.name()
        );
        let handle = loader
            .load(&spec)
            .map_err(|e| {
                error!("'{}' backend failed to load {}: {:#}", loader.name(), model_path.display(), e);
                e
            })
            .with_context(|| format!("{} backend could not load {}", format, model_path.display()))?;

        Ok((format, handle))
    }
}
