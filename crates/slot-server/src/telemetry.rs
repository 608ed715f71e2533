// slot-server/src/telemetry.rs
//! Tracing setup. `RUST_LOG` picks the filter; a malformed value falls back
//! to `DEFAULT_FILTER` and is reported once the subscriber is live.

use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

pub const DEFAULT_FILTER: &str = "info,tower_http=info";

/// Filter for a raw `RUST_LOG` value, plus the parse error when it had to fall back.
pub fn log_filter(raw: Option<&str>) -> (EnvFilter, Option<String>) {
    let raw = raw.map(str::trim).filter(|r| !r.is_empty());
    match raw.map(EnvFilter::try_new) {
        Some(Ok(filter)) => (filter, None),
        Some(Err(e)) => (EnvFilter::new(DEFAULT_FILTER), Some(format!("{}", e))),
        None => (EnvFilter::new(DEFAULT_FILTER), None),
    }
}

/// Installs the global subscriber. Later calls leave the first one in place
/// and return false.
pub fn init_tracing() -> bool {
    let raw = std::env::var("RUST_LOG").ok();
    let (filter, rejected) = log_filter(raw.as_deref());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_thread_names(true)
        .compact()
        .finish();

    let installed = tracing::subscriber::set_global_default(subscriber).is_ok();
    if let (true, Some(e)) = (installed, rejected) {
        warn!("Ignoring RUST_LOG ({}), using '{}'", e, DEFAULT_FILTER);
    }
    installed
}
