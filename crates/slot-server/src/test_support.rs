//! Fakes shared by the unit tests: a simulated accelerator table, a scripted
//! logits model and a loader that hands out handles built on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::ServingConfig;
use crate::devices::{AcceleratorSource, DeviceInfo, DeviceManager};
use crate::model_manager::ModelManager;
use crate::model_runtime::{
    BackendRegistry, Generation, GenerationParams, LoadSpec, LogitsModel, ModelFormat, ModelHandle,
    ModelLoader, SamplingHandle, TokenIter,
};
use crate::shared_state::AppState;
use crate::worker_pool::WorkerPool;

const GIB: u64 = 1024 * 1024 * 1024;

pub struct StaticAccelerators {
    gpus: usize,
    unified: bool,
}

impl StaticAccelerators {
    pub const TOTAL_BYTES: u64 = 24 * GIB;
    pub const USED_BYTES: u64 = 3 * GIB;

    pub fn new(gpus: usize, unified: bool) -> Self {
        Self { gpus, unified }
    }
}

impl AcceleratorSource for StaticAccelerators {
    fn gpus(&self) -> Vec<DeviceInfo> {
        (0..self.gpus)
            .map(|index| DeviceInfo {
                device_id: format!("cuda:{}", index),
                name: format!("Test GPU {}", index),
                memory_total: Self::TOTAL_BYTES,
                memory_available: Self::TOTAL_BYTES - Self::USED_BYTES,
                is_available: true,
            })
            .collect()
    }

    fn gpu_memory_used(&self, index: u32) -> Option<u64> {
        ((index as usize) < self.gpus).then_some(Self::USED_BYTES)
    }

    fn has_unified_memory(&self) -> bool {
        self.unified
    }
}

const EOS: u32 = 0;
const PROMPT: u32 = 1;
const FIRST_WORD: u32 = 2;
const PEAK: f32 = 50.0;
const NEVER: f32 = -1e9;

/// Vocabulary of end-of-sequence, a prompt filler token, then the script words.
///
/// `new` makes the script the overwhelming favourite at every step, so any
/// temperature reproduces it. `uniform` spreads mass evenly over the words
/// for a fixed number of steps.
pub struct ScriptedModel {
    words: Vec<String>,
    uniform_steps: Option<usize>,
}

impl ScriptedModel {
    pub fn new(words: &[&str]) -> Self {
        Self {
            words: words.iter().map(|w| w.to_string()).collect(),
            uniform_steps: None,
        }
    }

    pub fn uniform(words: &[&str], steps: usize) -> Self {
        Self {
            words: words.iter().map(|w| w.to_string()).collect(),
            uniform_steps: Some(steps),
        }
    }

    fn vocab_size(&self) -> usize {
        self.words.len() + FIRST_WORD as usize
    }
}

impl LogitsModel for ScriptedModel {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        Ok(vec![PROMPT; text.split_whitespace().count()])
    }

    fn decode(&self, token: u32) -> anyhow::Result<String> {
        match token {
            EOS | PROMPT => Ok(String::new()),
            word => self
                .words
                .get((word - FIRST_WORD) as usize)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("token {} outside vocabulary", word)),
        }
    }

    fn eos_token(&self) -> u32 {
        EOS
    }

    fn next_logits(&self, tokens: &[u32]) -> anyhow::Result<Vec<f32>> {
        let step = tokens.iter().filter(|t| **t >= FIRST_WORD).count();
        let mut logits = vec![NEVER; self.vocab_size()];
        match self.uniform_steps {
            Some(steps) if step < steps => {
                for logit in logits.iter_mut().skip(FIRST_WORD as usize) {
                    *logit = 0.0;
                }
            }
            Some(_) => logits[EOS as usize] = PEAK,
            None if step < self.words.len() => logits[step + FIRST_WORD as usize] = PEAK,
            None => logits[EOS as usize] = PEAK,
        }
        Ok(logits)
    }

    fn parameter_bytes(&self) -> u64 {
        (self.vocab_size() * 4096) as u64
    }
}

#[derive(Default)]
struct Concurrency {
    current: HashMap<String, usize>,
    peak: HashMap<String, usize>,
    current_total: usize,
    peak_total: usize,
}

/// Loader for `standard` models that never touches the filesystem.
pub struct StubLoader {
    error: Option<String>,
    delay: Duration,
    model_type: Option<String>,
    fail_shutdown: bool,
    stream_failure_after: Option<usize>,
    loads: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
    concurrency: Mutex<Concurrency>,
}

impl StubLoader {
    pub const WORDS: [&'static str; 5] = ["Hello", " from", " the", " stub", "."];
    pub const REPLY: &'static str = "Hello from the stub.";
    pub const PARAMETER_BYTES: u64 = 64 * 1024 * 1024;
    pub const STREAM_ERROR: &'static str = "device lost mid-generation";

    pub fn new() -> Self {
        Self {
            error: None,
            delay: Duration::ZERO,
            model_type: None,
            fail_shutdown: false,
            stream_failure_after: None,
            loads: AtomicUsize::new(0),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            concurrency: Mutex::new(Concurrency::default()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_model_type(mut self, model_type: &str) -> Self {
        self.model_type = Some(model_type.to_string());
        self
    }

    pub fn with_failing_shutdown(mut self) -> Self {
        self.fail_shutdown = true;
        self
    }

    /// Streams fail with `STREAM_ERROR` after `tokens` tokens.
    pub fn with_stream_failure_after(mut self, tokens: usize) -> Self {
        self.stream_failure_after = Some(tokens);
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Shutdown calls received by handles from this loader, failed ones included.
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Most loads ever running at once, across all devices.
    pub fn max_concurrent(&self) -> usize {
        self.concurrency.lock().unwrap().peak_total
    }

    pub fn max_concurrent_on(&self, device: &str) -> usize {
        self.concurrency.lock().unwrap().peak.get(device).copied().unwrap_or(0)
    }

    fn enter(&self, device: &str) {
        let mut c = self.concurrency.lock().unwrap();
        let current = c.current.entry(device.to_string()).or_default();
        *current += 1;
        let now = *current;
        let peak = c.peak.entry(device.to_string()).or_default();
        *peak = (*peak).max(now);
        c.current_total += 1;
        c.peak_total = c.peak_total.max(c.current_total);
    }

    fn exit(&self, device: &str) {
        let mut c = self.concurrency.lock().unwrap();
        if let Some(current) = c.current.get_mut(device) {
            *current -= 1;
        }
        c.current_total -= 1;
    }
}

impl ModelLoader for StubLoader {
    fn format(&self) -> ModelFormat {
        ModelFormat::Standard
    }

    fn name(&self) -> &str {
        "stub"
    }

    fn load(&self, spec: &LoadSpec) -> anyhow::Result<Arc<dyn ModelHandle>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.enter(&spec.device);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.exit(&spec.device);

        if let Some(message) = &self.error {
            anyhow::bail!("{}", message);
        }
        Ok(Arc::new(StubHandle {
            inner: SamplingHandle::new(ScriptedModel::new(&Self::WORDS)),
            model_type: self.model_type.clone(),
            fail_shutdown: self.fail_shutdown,
            stream_failure_after: self.stream_failure_after,
            shutdowns: self.shutdowns.clone(),
        }))
    }
}

struct StubHandle {
    inner: SamplingHandle<ScriptedModel>,
    model_type: Option<String>,
    fail_shutdown: bool,
    stream_failure_after: Option<usize>,
    shutdowns: Arc<AtomicUsize>,
}

impl ModelHandle for StubHandle {
    fn model_type(&self) -> Option<String> {
        self.model_type.clone()
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<Generation> {
        self.inner.generate(prompt, params)
    }

    fn stream_generate(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<TokenIter<'_>> {
        let tokens = self.inner.stream_generate(prompt, params)?;
        match self.stream_failure_after {
            Some(after) => Ok(Box::new(
                tokens
                    .take(after)
                    .chain(std::iter::once(Err(anyhow::anyhow!(StubLoader::STREAM_ERROR)))),
            )),
            None => Ok(tokens),
        }
    }

    fn parameter_bytes(&self) -> u64 {
        StubLoader::PARAMETER_BYTES
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_shutdown {
            anyhow::bail!("device reported busy during teardown");
        }
        Ok(())
    }
}

/// Manager over simulated GPUs (`cuda:0..gpus`) with `loader` as the only backend.
pub fn manager_with(loader: Arc<StubLoader>, max_loaded_models: usize, gpus: usize) -> ModelManager {
    let devices = Arc::new(DeviceManager::with_accelerators(Box::new(StaticAccelerators::new(
        gpus, false,
    ))));
    let mut backends = BackendRegistry::new();
    backends.register(loader);
    ModelManager::new(devices, Arc::new(backends), WorkerPool::default(), max_loaded_models)
}

/// Handler state over `manager_with(loader, max_loaded_models, 0)` bound to 127.0.0.1:8000.
pub fn test_state(loader: Arc<StubLoader>, max_loaded_models: usize) -> AppState {
    let serving = ServingConfig {
        host: "127.0.0.1".to_string(),
        api_port: 8000,
        max_loaded_models,
        lan_access: false,
    };
    AppState::new(manager_with(loader, max_loaded_models, 0), serving, None)
}
