//! Offload pool for CPU/GPU-bound backend work.
//!
//! Model loads, teardowns and every generation run on tokio's blocking pool
//! so the request dispatcher stays free to answer status and other slots.
//! Streaming jobs hand tokens back through a bounded channel.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use crate::{config::Config, metrics};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Upper bound for tokio's blocking pool, applied when the runtime is built.
    pub blocking_threads: usize,
    /// Tokens buffered between a streaming worker and its client.
    pub stream_buffer: usize,
}

impl WorkerPoolConfig {
    pub fn new(config: &Config) -> Self {
        Self {
            blocking_threads: config.blocking_threads,
            stream_buffer: 32,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            blocking_threads: num_cpus::get().max(4),
            stream_buffer: 32,
        }
    }
}

/// Counts a job as in flight for as long as it lives.
struct JobGuard {
    in_flight: Arc<AtomicUsize>,
}

impl JobGuard {
    fn enter(in_flight: Arc<AtomicUsize>) -> Self {
        in_flight.fetch_add(1, Ordering::Relaxed);
        metrics::inc_worker_jobs();
        Self { in_flight }
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        metrics::dec_worker_jobs();
    }
}

/// Sending half given to streaming jobs.
pub struct TokenSink {
    tx: mpsc::Sender<anyhow::Result<String>>,
}

impl TokenSink {
    /// Blocks while the buffer is full. Returns false once the receiver is gone.
    pub fn send(&self, item: anyhow::Result<String>) -> bool {
        self.tx.blocking_send(item).is_ok()
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    config: WorkerPoolConfig,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Runs `job` on the blocking pool and waits for its result.
    pub async fn run<T, F>(&self, job_name: &'static str, job: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = JobGuard::enter(self.in_flight.clone());
        let joined = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            job()
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(e) => {
                error!("{} worker failed: {}", job_name, e);
                Err(anyhow::anyhow!("{} worker failed: {}", job_name, e))
            }
        }
    }

    /// Starts a token-producing job and returns the stream of what it sends.
    pub fn stream<F>(&self, job_name: &'static str, job: F) -> ReceiverStream<anyhow::Result<String>>
    where
        F: FnOnce(&TokenSink) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let guard = JobGuard::enter(self.in_flight.clone());
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let sink = TokenSink { tx };
            job(&sink);
            debug!("{} worker finished", job_name);
        });
        ReceiverStream::new(rx)
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(WorkerPoolConfig::default())
    }
}
