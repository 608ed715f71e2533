//! Shared state handed to every HTTP handler.
//!
//! Handlers reach the slot manager, the device inventory and the live serving
//! settings through one cheaply cloneable `AppState`.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    config::{Config, ServingConfig, ServingUpdate},
    devices::DeviceManager,
    model_manager::ModelManager,
    model_runtime::BackendRegistry,
    worker_pool::{WorkerPool, WorkerPoolConfig},
};

/// Atomic counters for request accounting
pub struct AtomicCounters {
    pub total_requests: AtomicUsize,
    pub completed_generations: AtomicUsize,
    pub failed_generations: AtomicUsize,
}

impl AtomicCounters {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicUsize::new(0),
            completed_generations: AtomicUsize::new(0),
            failed_generations: AtomicUsize::new(0),
        }
    }

    pub fn inc_total_requests(&self) -> usize {
        self.total_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_completed(&self) -> usize {
        self.completed_generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_failed(&self) -> usize {
        self.failed_generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            completed_generations: self.completed_generations.load(Ordering::Relaxed),
            failed_generations: self.failed_generations.load(Ordering::Relaxed),
        }
    }
}

impl Default for AtomicCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub total_requests: usize,
    pub completed_generations: usize,
    pub failed_generations: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub manager: ModelManager,
    pub devices: Arc<DeviceManager>,
    pub serving: Arc<ArcSwap<ServingConfig>>,
    pub settings_file: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub counters: Arc<AtomicCounters>,
    configure_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(manager: ModelManager, serving: ServingConfig, settings_file: Option<PathBuf>) -> Self {
        Self {
            devices: manager.devices().clone(),
            manager,
            serving: Arc::new(ArcSwap::from_pointee(serving)),
            settings_file,
            started_at: Utc::now(),
            counters: Arc::new(AtomicCounters::new()),
            configure_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Wires the real device inventory and the default backends from `cfg`.
    pub fn from_config(cfg: &Config) -> Self {
        let devices = Arc::new(DeviceManager::new());
        let backends = Arc::new(BackendRegistry::with_defaults(cfg.llama_settings()));
        let pool = WorkerPool::new(WorkerPoolConfig::new(cfg));
        let manager = ModelManager::new(devices, backends, pool, cfg.max_loaded_models);
        Self::new(manager, cfg.serving(), cfg.settings_file.clone())
    }

    pub fn serving(&self) -> Arc<ServingConfig> {
        self.serving.load_full()
    }

    /// Applies a configure request. Capacity changes reach the manager
    /// immediately; bind changes are stored and reported as needing a restart.
    pub fn configure(&self, update: &ServingUpdate) -> anyhow::Result<(ServingConfig, bool)> {
        let _guard = self.configure_lock.lock().unwrap_or_else(|p| p.into_inner());
        let current = self.serving.load_full();
        let (next, restart_required) = current.apply(update);

        if let Some(path) = &self.settings_file {
            next.save(path)?;
        }
        if next.max_loaded_models != current.max_loaded_models {
            self.manager.set_max_loaded_models(next.max_loaded_models);
        }
        if restart_required {
            warn!(
                "Bind address changed to {}; restart the server to apply it",
                next.api_url()
            );
        }
        info!("Serving configuration updated: {:?}", next);
        self.serving.store(Arc::new(next.clone()));
        Ok((next, restart_required))
    }
}
