//! Slot records and the in-memory registry that owns them.
//!
//! The registry is only mutated through `ModelManager`; everything here is
//! plain data plus the state machine rules.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::model_runtime::{ModelFormat, ModelHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Unloaded,
    Loading,
    Ready,
    Unloading,
    Error,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Unloaded => "unloaded",
            SlotState::Loading => "loading",
            SlotState::Ready => "ready",
            SlotState::Unloading => "unloading",
            SlotState::Error => "error",
        }
    }

    /// Counted by admission control.
    pub fn is_active(&self) -> bool {
        matches!(self, SlotState::Loading | SlotState::Ready)
    }

    pub fn can_transition_to(&self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Ready)
                | (Loading, Error)
                | (Ready, Unloading)
                | (Error, Unloading)
                | (Unloaded, Unloading)
                | (Unloading, Error)
        )
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend resources owned by a READY slot.
pub struct LoadedModel {
    pub handle: Arc<dyn ModelHandle>,
    pub format: ModelFormat,
    /// Shared by in-flight generations, taken exclusively by unload to drain them.
    pub lease: Arc<RwLock<()>>,
}

impl LoadedModel {
    pub fn new(handle: Arc<dyn ModelHandle>, format: ModelFormat) -> Self {
        Self {
            handle,
            format,
            lease: Arc::new(RwLock::new(())),
        }
    }
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct ModelSlot {
    pub slot_id: String,
    pub model_name: String,
    pub model_path: PathBuf,
    pub device: String,
    pub model_type: Option<String>,
    pub state: SlotState,
    pub gpu_memory_bytes: u64,
    pub ram_memory_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
    pub loaded: Option<LoadedModel>,
    seq: u64,
}

impl ModelSlot {
    pub fn new(
        model_name: impl Into<String>,
        model_path: impl Into<PathBuf>,
        device: impl Into<String>,
        model_type: Option<String>,
    ) -> Self {
        Self {
            slot_id: uuid::Uuid::new_v4().simple().to_string(),
            model_name: model_name.into(),
            model_path: model_path.into(),
            device: device.into(),
            model_type,
            state: SlotState::Unloaded,
            gpu_memory_bytes: 0,
            ram_memory_bytes: 0,
            created_at: Utc::now(),
            error: None,
            loaded: None,
            seq: 0,
        }
    }

    pub fn view(&self) -> SlotView {
        SlotView {
            slot_id: self.slot_id.clone(),
            model_name: self.model_name.clone(),
            model_path: self.model_path.display().to_string(),
            device: self.device.clone(),
            state: self.state,
            gpu_memory_bytes: self.gpu_memory_bytes,
            ram_memory_bytes: self.ram_memory_bytes,
            model_type: self.model_type.clone(),
            created_at: self.created_at,
            error: self.error.clone(),
        }
    }
}

/// Serializable snapshot of a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotView {
    pub slot_id: String,
    pub model_name: String,
    pub model_path: String,
    pub device: String,
    pub state: SlotState,
    pub gpu_memory_bytes: u64,
    pub ram_memory_bytes: u64,
    pub model_type: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Arena of slots keyed by slot id. Iteration follows registration order.
#[derive(Debug, Default)]
pub struct SlotRegistry {
    slots: HashMap<String, ModelSlot>,
    next_seq: u64,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, slot_id: &str) -> bool {
        self.slots.contains_key(slot_id)
    }

    /// Registers a slot. Returns false if the id is already present.
    pub fn insert(&mut self, mut slot: ModelSlot) -> bool {
        if self.slots.contains_key(&slot.slot_id) {
            return false;
        }
        slot.seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(slot.slot_id.clone(), slot);
        true
    }

    pub fn get(&self, slot_id: &str) -> Option<&ModelSlot> {
        self.slots.get(slot_id)
    }

    pub fn get_mut(&mut self, slot_id: &str) -> Option<&mut ModelSlot> {
        self.slots.get_mut(slot_id)
    }

    pub fn remove(&mut self, slot_id: &str) -> Option<ModelSlot> {
        self.slots.remove(slot_id)
    }

    /// Slots in LOADING or READY.
    pub fn active_count(&self) -> usize {
        self.slots.values().filter(|s| s.state.is_active()).count()
    }

    pub fn ordered(&self) -> Vec<&ModelSlot> {
        let mut slots: Vec<&ModelSlot> = self.slots.values().collect();
        slots.sort_by_key(|s| s.seq);
        slots
    }

    /// First READY slot (in registration order) carrying `model_name`.
    pub fn find_ready(&self, model_name: &str) -> Option<&ModelSlot> {
        self.ordered()
            .into_iter()
            .find(|s| s.state == SlotState::Ready && s.model_name == model_name)
    }

    pub fn ids(&self) -> Vec<String> {
        self.ordered().into_iter().map(|s| s.slot_id.clone()).collect()
    }
}
