// slot-server/src/lib.rs

pub mod api;
pub mod config;
pub mod devices;
pub mod error;
pub mod metrics;
pub mod model_manager;
pub mod model_runtime;
pub mod server;
pub mod shared_state;
pub mod slots;
pub mod telemetry;
pub mod worker_pool;

#[cfg(test)]
pub(crate) mod test_support;

// Public API exports
pub use config::{Config, ServingConfig, ServingUpdate};
pub use devices::{DeviceInfo, DeviceManager};
pub use error::{ManagerError, ManagerResult};
pub use model_manager::{InferenceLease, ModelManager};
pub use server::{build_router, run_server};
pub use shared_state::AppState;
pub use slots::{SlotState, SlotView};
