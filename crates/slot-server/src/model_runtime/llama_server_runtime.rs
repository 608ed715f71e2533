//! llama-server Runtime Adapter
//!
//! Serves standard models by spawning one llama.cpp `llama-server` process
//! per slot on a free loopback port and proxying `/completion` over HTTP.
//! Calls block on the captured tokio handle, so they must run on the
//! blocking pool.

use super::runtime_trait::*;
use crate::devices::DeviceKind;
use anyhow::Context;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

const BINARY_NAME: &str = "llama-server";
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct LlamaServerSettings {
    /// Explicit binary path; `PATH` is searched when unset.
    pub binary: Option<PathBuf>,
    pub host: String,
    pub ctx_size: u32,
    pub gpu_layers: u32,
    pub threads: u32,
    pub startup_timeout: Duration,
}

impl Default for LlamaServerSettings {
    fn default() -> Self {
        Self {
            binary: None,
            host: "127.0.0.1".to_string(),
            ctx_size: 4096,
            gpu_layers: 999,
            threads: 4,
            startup_timeout: Duration::from_secs(120),
        }
    }
}

pub struct LlamaServerLoader {
    settings: LlamaServerSettings,
}

impl LlamaServerLoader {
    pub fn new(settings: LlamaServerSettings) -> Self {
        Self { settings }
    }

    fn resolve_binary(&self) -> anyhow::Result<PathBuf> {
        let binary = match &self.settings.binary {
            Some(path) => path.clone(),
            None => which::which(BINARY_NAME)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("{} not found on PATH; set LLAMA_BIN", BINARY_NAME))?,
        };
        if !binary.exists() {
            anyhow::bail!("llama-server binary not found at: {}", binary.display());
        }
        Ok(binary)
    }

    fn free_port(host: &str) -> anyhow::Result<u16> {
        let listener = std::net::TcpListener::bind((host, 0))
            .with_context(|| format!("Failed to reserve a port on {}", host))?;
        Ok(listener.local_addr()?.port())
    }

    fn command(&self, binary: &Path, spec: &LoadSpec, port: u16) -> Command {
        let settings = &self.settings;
        let mut cmd = Command::new(binary);
        cmd.arg("--model").arg(&spec.model_path)
            .arg("--host").arg(&settings.host)
            .arg("--port").arg(port.to_string())
            .arg("--ctx-size").arg(settings.ctx_size.to_string())
            .arg("--threads").arg(settings.threads.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match DeviceKind::parse(&spec.device) {
            Some(DeviceKind::Cuda(index)) => {
                cmd.env("CUDA_VISIBLE_DEVICES", index.unwrap_or(0).to_string())
                    .arg("--n-gpu-layers").arg(settings.gpu_layers.to_string());
            }
            Some(DeviceKind::Unified) => {
                cmd.arg("--n-gpu-layers").arg(settings.gpu_layers.to_string());
            }
            Some(DeviceKind::Cpu) | None => {
                cmd.arg("--n-gpu-layers").arg("0");
            }
        }
        cmd
    }
}

impl ModelLoader for LlamaServerLoader {
    fn format(&self) -> ModelFormat {
        ModelFormat::Standard
    }

    fn name(&self) -> &str {
        "llama-server"
    }

    fn load(&self, spec: &LoadSpec) -> anyhow::Result<Arc<dyn ModelHandle>> {
        if !spec.model_path.exists() {
            anyhow::bail!("Model file not found: {}", spec.model_path.display());
        }
        let runtime = Handle::try_current()
            .context("llama-server backend must be driven from inside the tokio runtime")?;
        let binary = self.resolve_binary()?;
        let port = Self::free_port(&self.settings.host)?;

        info!("Starting llama-server for: {}", spec.model_path.display());
        info!("  Binary: {}", binary.display());
        info!("  Port: {}", port);
        info!("  Device: {}", spec.device);

        let child = self
            .command(&binary, spec, port)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", binary.display()))?;

        let mut handle = LlamaServerHandle::attach(
            format!("http://{}:{}", self.settings.host, port),
            runtime,
            model_size(&spec.model_path),
        );
        handle.process = Mutex::new(Some(child));

        // on failure the handle is dropped, which kills the process
        handle.wait_until_ready(self.settings.startup_timeout)?;
        info!("llama-server ready at {}", handle.base_url);

        Ok(Arc::new(handle))
    }
}

/// Weight bytes on disk: the file itself, or the files directly inside a directory.
fn model_size(path: &Path) -> u64 {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => std::fs::read_dir(path)
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| e.metadata().ok())
                    .filter(|m| m.is_file())
                    .map(|m| m.len())
                    .sum()
            })
            .unwrap_or(0),
        Err(_) => 0,
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tokens_evaluated: usize,
    #[serde(default)]
    tokens_predicted: usize,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
}

pub struct LlamaServerHandle {
    base_url: String,
    client: reqwest::Client,
    runtime: Handle,
    process: Mutex<Option<Child>>,
    parameter_bytes: u64,
}

impl LlamaServerHandle {
    /// Wraps a server that is already listening at `base_url`.
    pub fn attach(base_url: impl Into<String>, runtime: Handle, parameter_bytes: u64) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            runtime,
            process: Mutex::new(None),
            parameter_bytes,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn completion_url(&self) -> String {
        format!("{}/completion", self.base_url)
    }

    fn completion_body(prompt: &str, params: &GenerationParams, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "prompt": prompt,
            "n_predict": params.token_budget(),
            "temperature": params.temperature.max(0.0),
            "top_p": params.top_p,
            "stop": params.stop,
            "stream": stream,
        });
        if let Some(seed) = params.seed {
            body["seed"] = seed.into();
        }
        body
    }

    async fn probe_health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).timeout(Duration::from_secs(2)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Polls `/health` until it answers, the process exits, or the timeout passes.
    pub fn wait_until_ready(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut process = self.process.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(child) = process.as_mut() {
                    if let Some(status) = child.try_wait()? {
                        process.take();
                        anyhow::bail!("llama-server exited during startup ({})", status);
                    }
                }
            }
            if self.runtime.block_on(self.probe_health()) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!("llama-server failed to start within {}s", timeout.as_secs());
            }
            std::thread::sleep(HEALTH_POLL_INTERVAL);
        }
    }

    async fn post_completion(&self, body: &serde_json::Value) -> anyhow::Result<reqwest::Response> {
        let resp = self
            .client
            .post(self.completion_url())
            .json(body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Inference request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Inference failed ({}): {}", status, body);
        }
        Ok(resp)
    }
}

impl ModelHandle for LlamaServerHandle {
    fn model_type(&self) -> Option<String> {
        None
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<Generation> {
        let body = Self::completion_body(prompt, params, false);
        self.runtime.block_on(async {
            let resp = self.post_completion(&body).await?;
            let parsed: CompletionResponse = resp
                .json()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;
            Ok(Generation {
                text: parsed.content,
                prompt_tokens: parsed.tokens_evaluated,
                completion_tokens: parsed.tokens_predicted,
            })
        })
    }

    fn stream_generate(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<TokenIter<'_>> {
        let body = Self::completion_body(prompt, params, true);
        let resp = self.runtime.block_on(self.post_completion(&body))?;
        let bytes = resp.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec()));
        Ok(Box::new(SseTokens {
            runtime: self.runtime.clone(),
            bytes: Box::pin(bytes),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        }))
    }

    fn parameter_bytes(&self) -> u64 {
        self.parameter_bytes
    }

    fn release_device_cache(&self) -> anyhow::Result<()> {
        debug!("llama-server frees device memory on process exit");
        Ok(())
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        let mut process = self.process.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(mut child) = process.take() {
            info!("Stopping llama-server at {}", self.base_url);
            child
                .kill()
                .with_context(|| format!("Failed to kill llama-server at {}", self.base_url))?;
            let _ = child.wait();
        }
        Ok(())
    }
}

impl Drop for LlamaServerHandle {
    fn drop(&mut self) {
        let process = self.process.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(mut child) = process.take() {
            if let Err(e) = child.kill() {
                warn!("Failed to kill llama-server process: {}", e);
            }
            let _ = child.wait();
        }
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>;

/// Blocking iterator over the `content` fields of a llama-server SSE response.
struct SseTokens {
    runtime: Handle,
    bytes: ByteStream,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

impl SseTokens {
    fn drain_lines(&mut self) -> anyhow::Result<()> {
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                return Ok(());
            }
            let chunk: CompletionChunk = serde_json::from_str(data)
                .with_context(|| format!("Malformed stream chunk: {}", data))?;
            if !chunk.content.is_empty() {
                self.pending.push_back(chunk.content);
            }
            if chunk.stop {
                self.done = true;
                return Ok(());
            }
        }
        Ok(())
    }
}

impl Iterator for SseTokens {
    type Item = anyhow::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Some(Ok(token));
            }
            if self.done {
                return None;
            }
            match self.runtime.block_on(self.bytes.next()) {
                Some(Ok(chunk)) => {
                    self.buffer.extend_from_slice(&chunk);
                    if let Err(e) = self.drain_lines() {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(anyhow::anyhow!("Stream read error: {}", e)));
                }
                None => {
                    self.buffer.push(b'\n');
                    let tail = self.drain_lines();
                    self.done = true;
                    if let Err(e) = tail {
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}
