//! Slot lifecycle, admission control and device-scoped load serialization.
//!
//! All registry mutation goes through `ModelManager`. The registry mutex is
//! never held across an await; long work (loading, teardown, generation)
//! runs on the worker pool. Loads onto the same device id are serialized by
//! a per-device async mutex, loads onto different devices run in parallel.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard,
};

use dashmap::DashMap;
use tokio::sync::OwnedRwLockReadGuard;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::{
    devices::{DeviceKind, DeviceManager},
    error::{ManagerError, ManagerResult},
    metrics,
    model_runtime::{BackendRegistry, Generation, GenerationParams, ModelHandle},
    slots::{LoadedModel, ModelSlot, SlotRegistry, SlotState, SlotView},
    worker_pool::WorkerPool,
};

/// Shared access to a READY slot's model. Unload waits until every lease is dropped.
pub struct InferenceLease {
    slot_id: String,
    model_name: String,
    handle: Arc<dyn ModelHandle>,
    _guard: OwnedRwLockReadGuard<()>,
}

impl InferenceLease {
    pub fn slot_id(&self) -> &str {
        &self.slot_id
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn handle(&self) -> &Arc<dyn ModelHandle> {
        &self.handle
    }
}

#[derive(Clone)]
pub struct ModelManager {
    registry: Arc<Mutex<SlotRegistry>>,
    device_locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    devices: Arc<DeviceManager>,
    backends: Arc<BackendRegistry>,
    pool: WorkerPool,
    max_loaded_models: Arc<AtomicUsize>,
}

impl ModelManager {
    pub fn new(
        devices: Arc<DeviceManager>,
        backends: Arc<BackendRegistry>,
        pool: WorkerPool,
        max_loaded_models: usize,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(SlotRegistry::new())),
            device_locks: Arc::new(DashMap::new()),
            devices,
            backends,
            pool,
            max_loaded_models: Arc::new(AtomicUsize::new(max_loaded_models)),
        }
    }

    pub fn max_loaded_models(&self) -> usize {
        self.max_loaded_models.load(Ordering::SeqCst)
    }

    /// Takes effect for the next load; already loaded slots are kept.
    pub fn set_max_loaded_models(&self, max: usize) {
        let previous = self.max_loaded_models.swap(max, Ordering::SeqCst);
        if previous != max {
            info!("max_loaded_models changed {} → {}", previous, max);
        }
    }

    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.devices
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    fn registry(&self) -> MutexGuard<'_, SlotRegistry> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn device_lock(&self, device: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.device_locks
            .entry(device.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn transition(slot: &mut ModelSlot, next: SlotState) -> ManagerResult<()> {
        if !slot.state.can_transition_to(next) {
            return Err(ManagerError::Internal(format!(
                "invalid transition {} → {} for slot {}",
                slot.state, next, slot.slot_id
            )));
        }
        debug!("Slot {} ({}): {} → {}", slot.slot_id, slot.model_name, slot.state, next);
        slot.state = next;
        Ok(())
    }

    fn publish_ready_count(registry: &SlotRegistry) {
        let ready = registry
            .ordered()
            .iter()
            .filter(|s| s.state == SlotState::Ready)
            .count();
        metrics::set_loaded_slots(ready);
    }

    fn check_capacity(&self, registry: &SlotRegistry) -> ManagerResult<()> {
        let max = self.max_loaded_models();
        let active = registry.active_count();
        if active >= max {
            warn!("Rejecting load: {} active slot(s), limit {}", active, max);
            return Err(ManagerError::CapacityExceeded { max });
        }
        Ok(())
    }

    /// Device resolution enumerates accelerators, so it runs on the worker pool.
    async fn resolve_device(&self, device_spec: &str) -> ManagerResult<String> {
        let devices = self.devices.clone();
        let spec = device_spec.to_string();
        self.pool
            .run("device resolve", move || Ok(devices.resolve_device(&spec)))
            .await
            .map_err(|e| ManagerError::Internal(format!("{:#}", e)))?
    }

    /// Loads a model into a new slot and returns it once READY.
    ///
    /// Fails fast with `CapacityExceeded` when LOADING + READY slots already
    /// reach the limit; nothing is registered in that case. A backend failure
    /// leaves the slot in ERROR for inspection.
    pub async fn load(
        &self,
        model_path: impl Into<PathBuf>,
        model_name: impl Into<String>,
        device_spec: &str,
        model_type: Option<String>,
    ) -> ManagerResult<SlotView> {
        self.check_capacity(&self.registry())?;

        let model_path = model_path.into();
        let model_name = model_name.into();
        let device = self.resolve_device(device_spec).await?;
        let mut slot = ModelSlot::new(model_name, model_path.clone(), device.clone(), model_type.clone());
        Self::transition(&mut slot, SlotState::Loading)?;
        let slot_id = slot.slot_id.clone();
        let model_name = slot.model_name.clone();

        {
            // re-checked under the same lock as the insert so concurrent loads cannot overshoot
            let mut registry = self.registry();
            self.check_capacity(&registry)?;
            if !registry.insert(slot) {
                return Err(ManagerError::Internal(format!("duplicate slot id {}", slot_id)));
            }
        }
        info!(
            "Slot {} registered: '{}' from {} on {}",
            slot_id,
            model_name,
            model_path.display(),
            device
        );

        // spawned so a dropped request cannot strand the slot in LOADING
        let manager = self.clone();
        tokio::spawn(async move { manager.finish_load(slot_id, model_path, device, model_type).await })
            .await
            .map_err(|e| ManagerError::Internal(format!("load task failed: {}", e)))?
    }

    async fn finish_load(
        &self,
        slot_id: String,
        model_path: PathBuf,
        device: String,
        model_type: Option<String>,
    ) -> ManagerResult<SlotView> {
        let lock = self.device_lock(&device);
        let _device_guard = lock.lock().await;
        debug!("Slot {} holds the {} device lock", slot_id, device);

        let backends = self.backends.clone();
        let devices = self.devices.clone();
        let job_device = device.clone();
        let loaded = self
            .pool
            .run("model load", move || {
                let (format, handle) = backends.load(&model_path, &job_device, model_type.as_deref())?;
                let is_gpu = DeviceKind::parse(&job_device).is_some_and(|k| k.is_gpu());
                let (gpu_bytes, ram_bytes) = if is_gpu {
                    (devices.get_device_memory_used(&job_device), 0)
                } else {
                    (0, handle.parameter_bytes())
                };
                Ok((format, handle, gpu_bytes, ram_bytes))
            })
            .await;

        let mut registry = self.registry();
        let Some(slot) = registry.get_mut(&slot_id) else {
            return Err(ManagerError::Internal(format!("slot {} vanished while loading", slot_id)));
        };

        match loaded {
            Ok((format, handle, gpu_bytes, ram_bytes)) => {
                slot.model_type = handle.model_type().or_else(|| slot.model_type.take());
                slot.gpu_memory_bytes = gpu_bytes;
                slot.ram_memory_bytes = ram_bytes;
                slot.loaded = Some(LoadedModel::new(handle, format));
                slot.error = None;
                Self::transition(slot, SlotState::Ready)?;
                info!(
                    "Slot {} ready: '{}' on {} (gpu {} B, ram {} B)",
                    slot.slot_id, slot.model_name, slot.device, gpu_bytes, ram_bytes
                );
                let view = slot.view();
                Self::publish_ready_count(&registry);
                Ok(view)
            }
            Err(e) => {
                let err = ManagerError::BackendLoad(e);
                error!("Slot {} ('{}') failed to load: {}", slot.slot_id, slot.model_name, err);
                slot.error = Some(err.to_string());
                Self::transition(slot, SlotState::Error)?;
                Err(err)
            }
        }
    }

    /// Tears down a slot and removes it from the registry.
    ///
    /// In-flight generations on the slot finish first. On teardown failure the
    /// slot stays in ERROR without its handle, so a retry removes it cleanly.
    pub async fn unload(&self, slot_id: &str) -> ManagerResult<()> {
        let (loaded, device) = {
            let mut registry = self.registry();
            let slot = registry
                .get_mut(slot_id)
                .ok_or_else(|| ManagerError::SlotNotFound(slot_id.to_string()))?;
            if matches!(slot.state, SlotState::Loading | SlotState::Unloading) {
                return Err(ManagerError::SlotBusy {
                    slot_id: slot_id.to_string(),
                    state: slot.state,
                });
            }
            Self::transition(slot, SlotState::Unloading)?;
            let loaded = slot.loaded.take();
            let device = slot.device.clone();
            Self::publish_ready_count(&registry);
            (loaded, device)
        };
        info!("Unloading slot {}", slot_id);

        let manager = self.clone();
        let slot_id = slot_id.to_string();
        tokio::spawn(async move { manager.finish_unload(slot_id, loaded, device).await })
            .await
            .map_err(|e| ManagerError::Internal(format!("unload task failed: {}", e)))?
    }

    async fn finish_unload(
        &self,
        slot_id: String,
        loaded: Option<LoadedModel>,
        device: String,
    ) -> ManagerResult<()> {
        if let Some(loaded) = loaded {
            let _drained = loaded.lease.clone().write_owned().await;
            debug!("Slot {} drained", slot_id);

            let is_gpu = DeviceKind::parse(&device).is_some_and(|k| k.is_gpu());
            let handle = loaded.handle;
            let teardown = self
                .pool
                .run("model unload", move || {
                    handle.shutdown()?;
                    if is_gpu {
                        handle.release_device_cache()?;
                    }
                    Ok(())
                })
                .await;

            if let Err(e) = teardown {
                let err = ManagerError::BackendTeardown(e);
                error!("Slot {} failed to unload: {}", slot_id, err);
                let mut registry = self.registry();
                if let Some(slot) = registry.get_mut(&slot_id) {
                    slot.error = Some(err.to_string());
                    Self::transition(slot, SlotState::Error)?;
                }
                return Err(err);
            }
        }

        let mut registry = self.registry();
        registry.remove(&slot_id);
        Self::publish_ready_count(&registry);
        info!("Slot {} unloaded", slot_id);
        Ok(())
    }

    /// Lease on the first READY slot named `model_name`.
    pub fn get_model_for_inference(&self, model_name: &str) -> ManagerResult<InferenceLease> {
        let registry = self.registry();
        let slot = registry
            .find_ready(model_name)
            .ok_or_else(|| ManagerError::ModelNotLoaded(model_name.to_string()))?;
        let loaded = slot.loaded.as_ref().ok_or_else(|| {
            ManagerError::Internal(format!("ready slot {} has no loaded model", slot.slot_id))
        })?;
        let guard = loaded.lease.clone().try_read_owned().map_err(|_| {
            ManagerError::Internal(format!("slot {} is draining", slot.slot_id))
        })?;
        Ok(InferenceLease {
            slot_id: slot.slot_id.clone(),
            model_name: slot.model_name.clone(),
            handle: loaded.handle.clone(),
            _guard: guard,
        })
    }

    /// Full generation on the worker pool.
    pub async fn generate(
        &self,
        lease: InferenceLease,
        prompt: String,
        params: GenerationParams,
    ) -> ManagerResult<Generation> {
        self.pool
            .run("generate", move || lease.handle.generate(&prompt, &params))
            .await
            .map_err(ManagerError::Inference)
    }

    /// Incremental generation on the worker pool. Stops pulling tokens once
    /// the returned stream is dropped.
    pub fn stream(
        &self,
        lease: InferenceLease,
        prompt: String,
        params: GenerationParams,
    ) -> ReceiverStream<anyhow::Result<String>> {
        self.pool.stream("stream generate", move |sink| {
            let tokens = match lease.handle.stream_generate(&prompt, &params) {
                Ok(tokens) => tokens,
                Err(e) => {
                    sink.send(Err(e));
                    return;
                }
            };
            for token in tokens {
                let failed = token.is_err();
                if !sink.send(token) {
                    debug!("Client for slot {} went away, stopping generation", lease.slot_id);
                    return;
                }
                if failed {
                    return;
                }
            }
        })
    }

    pub fn list_slots(&self) -> Vec<SlotView> {
        self.registry().ordered().into_iter().map(|s| s.view()).collect()
    }

    pub fn get_slot(&self, slot_id: &str) -> Option<SlotView> {
        self.registry().get(slot_id).map(|s| s.view())
    }

    /// Names of READY slots, first occurrence order, without duplicates.
    pub fn list_model_names(&self) -> Vec<String> {
        let registry = self.registry();
        let mut names: Vec<String> = Vec::new();
        for slot in registry.ordered() {
            if slot.state == SlotState::Ready && !names.contains(&slot.model_name) {
                names.push(slot.model_name.clone());
            }
        }
        names
    }

    pub fn active_count(&self) -> usize {
        self.registry().active_count()
    }

    /// Unloads every slot that is not mid-transition. Used at process exit.
    pub async fn shutdown(&self) {
        let ids = self.registry().ids();
        for slot_id in ids {
            match self.unload(&slot_id).await {
                Ok(()) => {}
                Err(ManagerError::SlotNotFound(_)) => {}
                Err(e) => warn!("Slot {} not unloaded during shutdown: {}", slot_id, e),
            }
        }
    }
}
