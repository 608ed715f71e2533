//! Error taxonomy for slot management and inference.
//!
//! Backends report opaque `anyhow` errors; the manager wraps them here so the
//! HTTP layer can map each failure class to a status code.

use thiserror::Error;

use crate::slots::SlotState;

#[derive(Debug, Error)]
pub enum ManagerError {
    /// Admission control is full. Retryable after an unload.
    #[error("Maximum loaded models reached ({max}). Unload a model first.")]
    CapacityExceeded { max: usize },

    #[error("Invalid device '{device}': {reason}")]
    InvalidDevice { device: String, reason: String },

    #[error("Slot not found: {0}")]
    SlotNotFound(String),

    /// No READY slot carries the requested model name.
    #[error("Model '{0}' is not loaded")]
    ModelNotLoaded(String),

    #[error("Slot {slot_id} is {state}; another transition is in progress")]
    SlotBusy { slot_id: String, state: SlotState },

    #[error("Failed to load model: {0:#}")]
    BackendLoad(anyhow::Error),

    #[error("Failed to unload model: {0:#}")]
    BackendTeardown(anyhow::Error),

    #[error("Generation failed: {0:#}")]
    Inference(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ManagerError {
    pub fn invalid_device(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDevice {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller can succeed by retrying the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. } | Self::SlotBusy { .. })
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;
