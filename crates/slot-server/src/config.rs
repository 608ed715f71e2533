// slot-server/src/config.rs

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use validator::Validate;

use crate::model_runtime::LlamaServerSettings;

pub const LOOPBACK_HOST: &str = "127.0.0.1";
pub const ALL_INTERFACES_HOST: &str = "0.0.0.0";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub max_loaded_models: usize,
    pub lan_access: bool,
    pub settings_file: Option<PathBuf>,
    pub llama_bin: Option<PathBuf>,
    pub ctx_size: u32,
    pub gpu_layers: u32,
    pub threads: u32,
    pub startup_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub blocking_threads: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        // Auto-detect threads if set to "auto"
        let threads = match var("LLAMA_THREADS", "auto").as_str() {
            "auto" => Self::auto_detect_threads(),
            value => value.parse().context("LLAMA_THREADS must be a number or 'auto'")?,
        };

        let blocking_threads = match lookup("BLOCKING_THREADS") {
            Some(value) => value.parse().context("BLOCKING_THREADS must be a number")?,
            None => Self::auto_detect_blocking_threads(),
        };

        let lan_access = Self::parse_bool(&var("LAN_ACCESS", "false")).context("LAN_ACCESS must be true or false")?;
        let api_host = match lookup("API_HOST") {
            Some(host) => host,
            None if lan_access => ALL_INTERFACES_HOST.to_string(),
            None => LOOPBACK_HOST.to_string(),
        };

        let llama_bin = lookup("LLAMA_BIN").filter(|v| !v.is_empty()).map(PathBuf::from);
        if let Some(bin) = &llama_bin {
            if !bin.exists() {
                warn!("LLAMA_BIN points to {} which does not exist", bin.display());
            }
        }

        let config = Self {
            api_host,
            api_port: var("API_PORT", "8000").parse().context("API_PORT must be a port number")?,
            max_loaded_models: var("MAX_LOADED_MODELS", "2")
                .parse()
                .context("MAX_LOADED_MODELS must be a number")?,
            lan_access,
            settings_file: lookup("SETTINGS_FILE").filter(|v| !v.is_empty()).map(PathBuf::from),
            llama_bin,
            ctx_size: var("LLAMA_CTX_SIZE", "4096").parse().context("LLAMA_CTX_SIZE must be a number")?,
            gpu_layers: var("LLAMA_GPU_LAYERS", "999")
                .parse()
                .context("LLAMA_GPU_LAYERS must be a number")?,
            threads,
            startup_timeout_seconds: var("LLAMA_STARTUP_TIMEOUT_SECONDS", "120")
                .parse()
                .context("LLAMA_STARTUP_TIMEOUT_SECONDS must be a number")?,
            request_timeout_seconds: var("REQUEST_TIMEOUT_SECONDS", "600")
                .parse()
                .context("REQUEST_TIMEOUT_SECONDS must be a number")?,
            blocking_threads,
        };

        if config.max_loaded_models == 0 {
            anyhow::bail!("MAX_LOADED_MODELS must be at least 1");
        }
        Ok(config)
    }

    fn parse_bool(value: &str) -> Result<bool> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => Err(anyhow::anyhow!("unrecognized boolean '{}'", other)),
        }
    }

    fn auto_detect_threads() -> u32 {
        let num_cpus = num_cpus::get() as u32;
        info!("Auto‑detected CPU cores: {}", num_cpus);

        match num_cpus {
            0..=2 => 1,
            3..=4 => (num_cpus * 2) / 3,
            5..=8 => (num_cpus * 3) / 5,
            9..=16 => num_cpus / 2,
            17..=32 => (num_cpus * 2) / 5,
            _ => 16,
        }
    }

    /// Loads and generations hold a blocking thread each; leave headroom above the core count.
    fn auto_detect_blocking_threads() -> usize {
        (num_cpus::get() * 2).clamp(4, 64)
    }

    pub fn serving(&self) -> ServingConfig {
        ServingConfig {
            host: self.api_host.clone(),
            api_port: self.api_port,
            max_loaded_models: self.max_loaded_models,
            lan_access: self.lan_access,
        }
    }

    /// Overlays the settings saved by `/api/configure`, if `SETTINGS_FILE` exists.
    pub fn apply_settings_file(&mut self) {
        let Some(path) = self.settings_file.clone() else {
            return;
        };
        match ServingConfig::load(&path) {
            Ok(Some(saved)) => {
                info!("Serving settings loaded from {}", path.display());
                self.apply_serving(&saved);
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable settings file {}: {:#}", path.display(), e),
        }
    }

    /// Copies persisted serving settings back over the environment values.
    pub fn apply_serving(&mut self, serving: &ServingConfig) {
        self.api_host = serving.host.clone();
        self.api_port = serving.api_port;
        self.max_loaded_models = serving.max_loaded_models;
        self.lan_access = serving.lan_access;
    }

    /// Applies serving overrides with the same host/`lan_access` rules as `/api/configure`.
    pub fn apply_update(&mut self, update: &ServingUpdate) {
        let (next, _) = self.serving().apply(update);
        self.apply_serving(&next);
    }

    pub fn llama_settings(&self) -> LlamaServerSettings {
        LlamaServerSettings {
            binary: self.llama_bin.clone(),
            host: LOOPBACK_HOST.to_string(),
            ctx_size: self.ctx_size,
            gpu_layers: self.gpu_layers,
            threads: self.threads,
            startup_timeout: Duration::from_secs(self.startup_timeout_seconds),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- LAN Access: {}", self.lan_access);
        info!("- Max Loaded Models: {}", self.max_loaded_models);
        match &self.llama_bin {
            Some(bin) => info!("- Llama Binary: {}", bin.display()),
            None => info!("- Llama Binary: (search PATH)"),
        }
        info!("- Context Size: {}", self.ctx_size);
        info!("- GPU Layers: {}", self.gpu_layers);
        info!("- Threads: {}", self.threads);
        info!("- Backend Startup Timeout: {}s", self.startup_timeout_seconds);
        info!("- Request Timeout: {}s", self.request_timeout_seconds);
        info!("- Blocking Threads: {}", self.blocking_threads);
        if let Some(path) = &self.settings_file {
            info!("- Settings File: {}", path.display());
        }
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.api_host, self.api_port))
    }
}

/// Settings surfaced by `/api/status` and changed by `/api/configure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServingConfig {
    pub host: String,
    pub api_port: u16,
    pub max_loaded_models: usize,
    pub lan_access: bool,
}

/// Partial update accepted by `/api/configure`.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ServingUpdate {
    #[validate(length(min = 1))]
    pub host: Option<String>,
    #[validate(range(min = 1))]
    pub api_port: Option<u16>,
    #[validate(range(min = 1))]
    pub max_loaded_models: Option<usize>,
    pub lan_access: Option<bool>,
}

impl ServingConfig {
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.host, self.api_port)
    }

    /// Returns the updated settings and whether the bind address changed.
    ///
    /// `lan_access` picks all-interfaces or loopback; an explicit `host` wins
    /// over it and sets `lan_access` to match.
    pub fn apply(&self, update: &ServingUpdate) -> (ServingConfig, bool) {
        let mut next = self.clone();

        if let Some(lan) = update.lan_access {
            next.lan_access = lan;
            next.host = if lan { ALL_INTERFACES_HOST } else { LOOPBACK_HOST }.to_string();
        }
        if let Some(host) = &update.host {
            next.lan_access = Self::is_all_interfaces(host);
            next.host = host.clone();
        }
        if let Some(port) = update.api_port {
            next.api_port = port;
        }
        if let Some(max) = update.max_loaded_models {
            next.max_loaded_models = max;
        }

        let restart_required = next.host != self.host || next.api_port != self.api_port;
        (next, restart_required)
    }

    fn is_all_interfaces(host: &str) -> bool {
        host.parse::<IpAddr>().map(|ip| ip.is_unspecified()).unwrap_or(false)
    }

    /// `Ok(None)` when the file does not exist yet.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(config))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    fn serving() -> ServingConfig {
        ServingConfig {
            host: LOOPBACK_HOST.to_string(),
            api_port: 8000,
            max_loaded_models: 2,
            lan_access: false,
        }
    }

    // ===== Environment Tests =====

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.api_host, "127.0.0.1");
        assert_eq!(config.api_port, 8000);
        assert_eq!(config.max_loaded_models, 2);
        assert!(!config.lan_access);
        assert_eq!(config.ctx_size, 4096);
        assert_eq!(config.gpu_layers, 999);
        assert_eq!(config.request_timeout_seconds, 600);
        assert!(config.threads >= 1);
        assert!(config.blocking_threads >= 4);
        assert!(config.llama_bin.is_none());
    }

    #[test]
    fn test_lan_access_switches_default_host() {
        let config = config_from(&[("LAN_ACCESS", "true")]).unwrap();
        assert_eq!(config.api_host, "0.0.0.0");

        let config = config_from(&[("LAN_ACCESS", "true"), ("API_HOST", "192.168.1.5")]).unwrap();
        assert_eq!(config.api_host, "192.168.1.5");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(config_from(&[("API_PORT", "eighty")]).is_err());
        assert!(config_from(&[("MAX_LOADED_MODELS", "0")]).is_err());
        assert!(config_from(&[("LAN_ACCESS", "maybe")]).is_err());
        assert!(config_from(&[("LLAMA_THREADS", "many")]).is_err());
    }

    #[test]
    fn test_explicit_threads() {
        let config = config_from(&[("LLAMA_THREADS", "3"), ("BLOCKING_THREADS", "12")]).unwrap();
        assert_eq!(config.threads, 3);
        assert_eq!(config.blocking_threads, 12);
    }

    #[test]
    fn test_api_addr_parsing() {
        let mut config = config_from(&[("API_PORT", "3000")]).unwrap();
        let addr = config.api_addr().unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_eq!(addr.port(), 3000);

        config.api_host = "not a host".to_string();
        assert!(config.api_addr().is_err());
    }

    #[test]
    fn test_llama_settings_follow_config() {
        let config = config_from(&[("LLAMA_BIN", "/opt/llama-server"), ("LLAMA_STARTUP_TIMEOUT_SECONDS", "5")]).unwrap();
        let settings = config.llama_settings();
        assert_eq!(settings.binary, Some(PathBuf::from("/opt/llama-server")));
        assert_eq!(settings.startup_timeout, Duration::from_secs(5));
        assert_eq!(settings.host, "127.0.0.1");
    }

    // ===== Configure Tests =====

    #[test]
    fn test_capacity_change_needs_no_restart() {
        let update = ServingUpdate {
            max_loaded_models: Some(4),
            ..Default::default()
        };
        let (next, restart) = serving().apply(&update);
        assert_eq!(next.max_loaded_models, 4);
        assert!(!restart);
    }

    #[test]
    fn test_lan_access_forces_host() {
        let update = ServingUpdate {
            lan_access: Some(true),
            ..Default::default()
        };
        let (next, restart) = serving().apply(&update);
        assert_eq!(next.host, "0.0.0.0");
        assert!(next.lan_access);
        assert!(restart);

        let update = ServingUpdate {
            lan_access: Some(false),
            ..Default::default()
        };
        let (back, restart) = next.apply(&update);
        assert_eq!(back.host, "127.0.0.1");
        assert!(restart);
    }

    #[test]
    fn test_explicit_host_wins_and_flips_lan_access() {
        let update = ServingUpdate {
            host: Some("0.0.0.0".into()),
            lan_access: Some(false),
            ..Default::default()
        };
        let (next, _) = serving().apply(&update);
        assert_eq!(next.host, "0.0.0.0");
        assert!(next.lan_access);

        let update = ServingUpdate {
            host: Some("10.0.0.2".into()),
            ..Default::default()
        };
        let (next, restart) = next.apply(&update);
        assert!(!next.lan_access);
        assert!(restart);
    }

    #[test]
    fn test_command_line_host_wins_over_lan_flag() {
        let mut config = config_from(&[]).unwrap();
        config.apply_update(&ServingUpdate {
            host: Some("10.0.0.2".into()),
            lan_access: Some(true),
            ..Default::default()
        });
        assert_eq!(config.api_host, "10.0.0.2");
        assert!(!config.lan_access);

        let mut config = config_from(&[]).unwrap();
        config.apply_update(&ServingUpdate {
            lan_access: Some(true),
            api_port: Some(9000),
            ..Default::default()
        });
        assert_eq!(config.api_host, ALL_INTERFACES_HOST);
        assert!(config.lan_access);
        assert_eq!(config.api_port, 9000);
    }

    #[test]
    fn test_port_change_requires_restart() {
        let update = ServingUpdate {
            api_port: Some(9000),
            ..Default::default()
        };
        let (next, restart) = serving().apply(&update);
        assert_eq!(next.api_url(), "http://127.0.0.1:9000");
        assert!(restart);
    }

    #[test]
    fn test_update_validation() {
        let update = ServingUpdate {
            max_loaded_models: Some(0),
            ..Default::default()
        };
        assert!(update.validate().is_err());
        assert!(ServingUpdate::default().validate().is_ok());
    }

    // ===== Settings File Tests =====

    #[test]
    fn test_settings_file_roundtrip_and_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        assert!(ServingConfig::load(&path).unwrap().is_none());

        let saved = ServingConfig {
            api_port: 8123,
            max_loaded_models: 5,
            ..serving()
        };
        saved.save(&path).unwrap();
        assert_eq!(ServingConfig::load(&path).unwrap(), Some(saved.clone()));

        let path_str = path.to_string_lossy().to_string();
        let mut config = config_from(&[("SETTINGS_FILE", path_str.as_str())]).unwrap();
        config.apply_settings_file();
        assert_eq!(config.serving(), saved);
    }

    #[test]
    fn test_corrupt_settings_file_falls_back_to_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let path_str = path.to_string_lossy().to_string();
        let mut config = config_from(&[("SETTINGS_FILE", path_str.as_str()), ("API_PORT", "8100")]).unwrap();
        config.apply_settings_file();
        assert_eq!(config.serving().api_port, 8100);
    }
}
