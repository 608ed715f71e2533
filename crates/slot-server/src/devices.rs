// slot-server/src/devices.rs
//! Compute device inventory.
//!
//! The CPU entry always exists and reports host memory from `sysinfo`.
//! CUDA devices come from NVML when the driver library is present; a
//! unified-memory accelerator (Apple Silicon) is reported with host memory
//! figures because it exposes no separate pool.

use std::sync::Mutex;

use lazy_static::lazy_static;
use nvml_wrapper::Nvml;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{debug, info};

use crate::error::{ManagerError, ManagerResult};

pub const CPU_DEVICE: &str = "cpu";
pub const UNIFIED_DEVICE: &str = "mps";
pub const AUTO_DEVICE: &str = "auto";

lazy_static! {
    static ref CUDA_DEVICE_RE: Regex = Regex::new(r"^cuda(?::(\d+))?$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub name: String,
    pub memory_total: u64,
    pub memory_available: u64,
    pub is_available: bool,
}

/// Device class derived from a device id string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    /// `cuda` or `cuda:N`
    Cuda(Option<u32>),
    Unified,
}

impl DeviceKind {
    pub fn parse(device_id: &str) -> Option<Self> {
        if device_id == CPU_DEVICE {
            return Some(Self::Cpu);
        }
        if device_id == UNIFIED_DEVICE {
            return Some(Self::Unified);
        }
        let caps = CUDA_DEVICE_RE.captures(device_id)?;
        match caps.get(1) {
            Some(index) => index.as_str().parse().ok().map(|i| Self::Cuda(Some(i))),
            None => Some(Self::Cuda(None)),
        }
    }

    /// GPU-class devices report allocated memory through the device runtime.
    pub fn is_gpu(&self) -> bool {
        matches!(self, Self::Cuda(_))
    }

    pub fn cuda_index(&self) -> Option<u32> {
        match self {
            Self::Cuda(index) => Some(index.unwrap_or(0)),
            _ => None,
        }
    }
}

/// Source of accelerator information. NVML in production, static tables in tests.
pub trait AcceleratorSource: Send + Sync {
    /// One entry per CUDA device, ids `cuda:0`, `cuda:1`, ...
    fn gpus(&self) -> Vec<DeviceInfo>;

    /// Bytes currently allocated on the given CUDA device.
    fn gpu_memory_used(&self, index: u32) -> Option<u64>;

    fn has_unified_memory(&self) -> bool;
}

pub struct NvmlAccelerators {
    nvml: Option<Nvml>,
}

impl NvmlAccelerators {
    pub fn detect() -> Self {
        let nvml = match Nvml::init() {
            Ok(nvml) => {
                info!("NVML initialized, CUDA devices will be reported");
                Some(nvml)
            }
            Err(e) => {
                debug!("NVML unavailable ({}), no CUDA devices reported", e);
                None
            }
        };
        Self { nvml }
    }
}

impl AcceleratorSource for NvmlAccelerators {
    fn gpus(&self) -> Vec<DeviceInfo> {
        let Some(nvml) = &self.nvml else {
            return Vec::new();
        };
        let count = nvml.device_count().unwrap_or(0);
        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let Ok(device) = nvml.device_by_index(index) else {
                continue;
            };
            let name = device.name().unwrap_or_else(|_| format!("CUDA device {}", index));
            match device.memory_info() {
                Ok(memory) => devices.push(DeviceInfo {
                    device_id: format!("cuda:{}", index),
                    name,
                    memory_total: memory.total,
                    memory_available: memory.free,
                    is_available: true,
                }),
                Err(e) => {
                    debug!("Skipping memory stats for cuda:{}: {}", index, e);
                    devices.push(DeviceInfo {
                        device_id: format!("cuda:{}", index),
                        name,
                        memory_total: 0,
                        memory_available: 0,
                        is_available: true,
                    });
                }
            }
        }
        devices
    }

    fn gpu_memory_used(&self, index: u32) -> Option<u64> {
        let nvml = self.nvml.as_ref()?;
        let device = nvml.device_by_index(index).ok()?;
        device.memory_info().ok().map(|m| m.used)
    }

    fn has_unified_memory(&self) -> bool {
        cfg!(all(target_os = "macos", target_arch = "aarch64"))
    }
}

pub struct DeviceManager {
    accelerators: Box<dyn AcceleratorSource>,
    system: Mutex<System>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::with_accelerators(Box::new(NvmlAccelerators::detect()))
    }

    pub fn with_accelerators(accelerators: Box<dyn AcceleratorSource>) -> Self {
        Self {
            accelerators,
            system: Mutex::new(System::new()),
        }
    }

    /// Host memory as (total, available) bytes.
    fn host_memory(&self) -> (u64, u64) {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_memory();
        (system.total_memory(), system.available_memory())
    }

    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let (total, available) = self.host_memory();
        let mut devices = vec![DeviceInfo {
            device_id: CPU_DEVICE.to_string(),
            name: format!("CPU ({} threads)", num_cpus::get()),
            memory_total: total,
            memory_available: available,
            is_available: true,
        }];

        devices.extend(self.accelerators.gpus());

        if self.accelerators.has_unified_memory() {
            devices.push(DeviceInfo {
                device_id: UNIFIED_DEVICE.to_string(),
                name: "Apple Silicon (unified memory)".to_string(),
                memory_total: total,
                memory_available: available,
                is_available: true,
            });
        }

        devices
    }

    /// Resolve a logical device request. `auto` picks the first available GPU,
    /// then the unified-memory accelerator, then the CPU. Anything else is
    /// validated; CUDA ids come back in `cuda:<index>` form.
    pub fn resolve_device(&self, spec: &str) -> ManagerResult<String> {
        let spec = spec.trim();

        if spec.is_empty() || spec == AUTO_DEVICE {
            let resolved = self
                .accelerators
                .gpus()
                .into_iter()
                .find(|d| d.is_available)
                .map(|d| d.device_id)
                .or_else(|| {
                    self.accelerators
                        .has_unified_memory()
                        .then(|| UNIFIED_DEVICE.to_string())
                })
                .unwrap_or_else(|| CPU_DEVICE.to_string());
            debug!("Resolved device 'auto' to '{}'", resolved);
            return Ok(resolved);
        }

        match DeviceKind::parse(spec) {
            Some(DeviceKind::Cpu) => Ok(spec.to_string()),
            Some(DeviceKind::Unified) => {
                if self.accelerators.has_unified_memory() {
                    Ok(spec.to_string())
                } else {
                    Err(ManagerError::invalid_device(
                        spec,
                        "no unified-memory accelerator on this host",
                    ))
                }
            }
            Some(DeviceKind::Cuda(index)) => {
                let gpus = self.accelerators.gpus();
                let wanted = index.unwrap_or(0) as usize;
                if gpus.is_empty() {
                    Err(ManagerError::invalid_device(spec, "no CUDA devices detected"))
                } else if wanted >= gpus.len() {
                    Err(ManagerError::invalid_device(
                        spec,
                        format!("only {} CUDA device(s) detected", gpus.len()),
                    ))
                } else {
                    // bare `cuda` and `cuda:0` name the same GPU and must share a load lock
                    Ok(format!("cuda:{}", wanted))
                }
            }
            None => Err(ManagerError::invalid_device(
                spec,
                "expected 'auto', 'cpu', 'mps', 'cuda' or 'cuda:<index>'",
            )),
        }
    }

    /// Bytes currently allocated on a GPU-class device; 0 for devices without
    /// a cheap query. Shared devices report the total, not a per-model delta.
    pub fn get_device_memory_used(&self, device_id: &str) -> u64 {
        DeviceKind::parse(device_id)
            .and_then(|kind| kind.cuda_index())
            .and_then(|index| self.accelerators.gpu_memory_used(index))
            .unwrap_or(0)
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}
