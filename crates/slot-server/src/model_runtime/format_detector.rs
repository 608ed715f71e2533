//! Model format detection.
//!
//! Runs once per load. A type hint that names a format wins; otherwise the
//! `config.json` next to (or inside) the model path is inspected. Anything
//! unrecognised is served by the standard backend.

use super::runtime_trait::ModelFormat;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.json";

pub struct FormatDetector;

impl FormatDetector {
    pub fn detect(path: &Path, hint: Option<&str>) -> ModelFormat {
        if let Some(format) = hint.and_then(ModelFormat::from_hint) {
            info!("Using model format '{}' from type hint for {}", format, path.display());
            return format;
        }

        let format = Self::detect_from_config(path).unwrap_or(ModelFormat::Standard);
        info!("Detected model format '{}' for {}", format, path.display());
        format
    }

    fn config_path(path: &Path) -> Option<PathBuf> {
        if path.is_dir() {
            Some(path.join(CONFIG_FILE))
        } else {
            path.parent().map(|p| p.join(CONFIG_FILE))
        }
    }

    /// Looks for format markers in `model_type` and `architectures`.
    pub fn detect_from_config(path: &Path) -> Option<ModelFormat> {
        let config_path = Self::config_path(path)?;
        let raw = std::fs::read_to_string(&config_path).ok()?;
        let config: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                debug!("Ignoring unparsable {}: {}", config_path.display(), e);
                return None;
            }
        };

        let mut markers: Vec<String> = Vec::new();
        if let Some(model_type) = config.get("model_type").and_then(|v| v.as_str()) {
            markers.push(model_type.to_ascii_lowercase());
        }
        if let Some(architectures) = config.get("architectures").and_then(|v| v.as_array()) {
            markers.extend(
                architectures
                    .iter()
                    .filter_map(|a| a.as_str())
                    .map(|a| a.to_ascii_lowercase()),
            );
        }

        if markers.iter().any(|m| m.contains("sherry")) {
            Some(ModelFormat::Sherry)
        } else if markers.iter().any(|m| m.contains("dllm") || m.contains("diffusion")) {
            Some(ModelFormat::Dllm)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn model_dir(config: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), config).unwrap();
        dir
    }

    #[test]
    fn test_hint_overrides_config() {
        let dir = model_dir(r#"{"model_type": "sherry"}"#);
        assert_eq!(FormatDetector::detect(dir.path(), Some("dllm")), ModelFormat::Dllm);
    }

    #[test]
    fn test_non_format_hint_falls_through_to_config() {
        let dir = model_dir(r#"{"model_type": "sherry_lm"}"#);
        assert_eq!(FormatDetector::detect(dir.path(), Some("llama")), ModelFormat::Sherry);
    }

    #[test]
    fn test_architectures_mark_diffusion_models() {
        let dir = model_dir(r#"{"model_type": "llama", "architectures": ["LLaDAModelLM", "DiffusionLM"]}"#);
        assert_eq!(FormatDetector::detect(dir.path(), None), ModelFormat::Dllm);
    }

    #[test]
    fn test_config_next_to_weight_file() {
        let dir = model_dir(r#"{"architectures": ["DllmForCausalLM"]}"#);
        let weights = dir.path().join("model.gguf");
        fs::write(&weights, b"GGUF").unwrap();
        assert_eq!(FormatDetector::detect(&weights, None), ModelFormat::Dllm);
    }

    #[test]
    fn test_missing_or_plain_config_is_standard() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(FormatDetector::detect(dir.path(), None), ModelFormat::Standard);

        let dir = model_dir(r#"{"model_type": "qwen2"}"#);
        assert_eq!(FormatDetector::detect(dir.path(), None), ModelFormat::Standard);

        let dir = model_dir("not json");
        assert_eq!(FormatDetector::detect(dir.path(), None), ModelFormat::Standard);
    }
}
