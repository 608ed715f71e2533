use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static LOADED_SLOTS: OnceLock<IntGauge> = OnceLock::new();
static ACTIVE_STREAMS: OnceLock<IntGauge> = OnceLock::new();
static GENERATED_TOKENS: OnceLock<IntCounter> = OnceLock::new();
static WORKER_JOBS: OnceLock<IntGauge> = OnceLock::new();

fn register<C>(cell: &OnceLock<C>, make: impl FnOnce() -> prometheus::Result<C>)
where
    C: prometheus::core::Collector + Clone + 'static,
{
    if cell.get().is_some() {
        return;
    }
    match make() {
        Ok(collector) => {
            if cell.set(collector.clone()).is_ok() {
                REGISTRY.register(Box::new(collector)).ok();
            }
        }
        Err(e) => warn!("Failed to create metric: {}", e),
    }
}

pub fn init_metrics() {
    register(&REQ_COUNTER, || {
        IntCounterVec::new(
            prometheus::opts!("requests_total", "Total requests per route"),
            &["route", "status"],
        )
    });
    register(&LOADED_SLOTS, || IntGauge::new("loaded_slots", "Slots in the ready state"));
    register(&ACTIVE_STREAMS, || IntGauge::new("active_streams", "Open streaming responses"));
    register(&GENERATED_TOKENS, || {
        IntCounter::new("generated_tokens_total", "Tokens produced across all slots")
    });
    register(&WORKER_JOBS, || {
        IntGauge::new("worker_jobs_in_flight", "Backend jobs running on the worker pool")
    });
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn set_loaded_slots(count: usize) {
    if let Some(gauge) = LOADED_SLOTS.get() {
        gauge.set(count as i64);
    }
}

pub fn inc_streams() {
    if let Some(gauge) = ACTIVE_STREAMS.get() {
        gauge.inc();
    }
}

pub fn dec_streams() {
    if let Some(gauge) = ACTIVE_STREAMS.get() {
        gauge.dec();
    }
}

pub fn add_generated_tokens(count: usize) {
    if let Some(counter) = GENERATED_TOKENS.get() {
        counter.inc_by(count as u64);
    }
}

pub fn inc_worker_jobs() {
    if let Some(gauge) = WORKER_JOBS.get() {
        gauge.inc();
    }
}

pub fn dec_worker_jobs() {
    if let Some(gauge) = WORKER_JOBS.get() {
        gauge.dec();
    }
}

/// Decrements `active_streams` when the stream it belongs to is dropped.
pub struct StreamGauge;

impl StreamGauge {
    pub fn enter() -> Self {
        inc_streams();
        Self
    }
}

impl Drop for StreamGauge {
    fn drop(&mut self) {
        dec_streams();
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("failed to encode metrics: {}", e).into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}
