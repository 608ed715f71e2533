//! Token sampling and the decode loop shared by logits-level backends.
//!
//! `SamplingHandle` adapts any `LogitsModel` into a `ModelHandle`. The
//! non-streaming path is the concatenation of the streaming path, so a
//! greedy request produces the same text either way.

use super::runtime_trait::{Generation, GenerationParams, ModelHandle, TokenIter};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Lower bound applied to temperature before scaling logits.
pub const TEMPERATURE_FLOOR: f32 = 1e-5;

/// Index of the largest logit, first one on ties.
pub fn argmax(logits: &[f32]) -> Option<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &value) in logits.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((i, value)),
        }
    }
    best.map(|(i, _)| i as u32)
}

/// Softmax of `logits / temperature`, computed stably.
pub fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let scale = 1.0 / temperature.max(TEMPERATURE_FLOOR);
    let max = logits
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits
        .iter()
        .map(|&v| if v.is_nan() { 0.0 } else { ((v - max) * scale).exp() })
        .collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}

/// Zeroes everything outside the smallest set whose mass reaches `top_p`.
fn nucleus_filter(probs: &mut [f32], top_p: f32) {
    if top_p >= 1.0 || top_p <= 0.0 {
        return;
    }
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
    let mut cumulative = 0.0;
    let mut keep = order.len();
    for (rank, &index) in order.iter().enumerate() {
        cumulative += probs[index];
        if cumulative >= top_p {
            keep = rank + 1;
            break;
        }
    }
    for &index in &order[keep..] {
        probs[index] = 0.0;
    }
}

/// Greedy when `temperature <= 0`, otherwise a draw from the tempered softmax.
pub fn sample_next_token<R: Rng + ?Sized>(
    logits: &[f32],
    temperature: f32,
    top_p: f32,
    rng: &mut R,
) -> Option<u32> {
    if logits.is_empty() {
        return None;
    }
    if temperature <= 0.0 {
        return argmax(logits);
    }
    let mut probs = softmax(logits, temperature);
    nucleus_filter(&mut probs, top_p);
    match WeightedIndex::new(&probs) {
        Ok(dist) => Some(dist.sample(rng) as u32),
        Err(_) => argmax(logits),
    }
}

/// A model that exposes next-token logits plus its tokenizer.
pub trait LogitsModel: Send + Sync {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>>;

    fn decode(&self, token: u32) -> anyhow::Result<String>;

    fn eos_token(&self) -> u32;

    /// Logits for the position following `tokens`.
    fn next_logits(&self, tokens: &[u32]) -> anyhow::Result<Vec<f32>>;

    fn parameter_bytes(&self) -> u64;

    fn model_type(&self) -> Option<String> {
        None
    }
}

pub struct SamplingHandle<M> {
    model: M,
}

impl<M: LogitsModel> SamplingHandle<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn decode_loop(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<DecodeLoop<'_, M>> {
        let tokens = self.model.encode(prompt)?;
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(DecodeLoop {
            model: &self.model,
            prompt_tokens: tokens.len(),
            tokens,
            params: params.clone(),
            rng,
            produced: 0,
            text: String::new(),
            emitted: 0,
            finished: false,
        })
    }
}

/// Step-by-step generation. Yields text pieces as soon as they cannot be
/// part of a stop string.
pub struct DecodeLoop<'a, M> {
    model: &'a M,
    tokens: Vec<u32>,
    prompt_tokens: usize,
    params: GenerationParams,
    rng: StdRng,
    produced: u32,
    text: String,
    emitted: usize,
    finished: bool,
}

impl<'a, M: LogitsModel> DecodeLoop<'a, M> {
    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    pub fn completion_tokens(&self) -> usize {
        self.produced as usize
    }

    /// Bytes at the end of the pending text that could still open a stop string.
    fn held_back(&self) -> usize {
        let pending = &self.text[self.emitted..];
        self.params
            .stop
            .iter()
            .filter(|s| !s.is_empty())
            .flat_map(|stop| {
                (1..stop.len())
                    .rev()
                    .filter(|&k| stop.is_char_boundary(k) && pending.ends_with(&stop[..k]))
                    .take(1)
            })
            .max()
            .unwrap_or(0)
    }

    fn find_stop(&self) -> Option<usize> {
        let pending = &self.text[self.emitted..];
        self.params
            .stop
            .iter()
            .filter(|s| !s.is_empty())
            .filter_map(|stop| pending.find(stop.as_str()))
            .min()
            .map(|rel| self.emitted + rel)
    }

    fn take_until(&mut self, end: usize) -> Option<String> {
        if end <= self.emitted {
            return None;
        }
        let piece = self.text[self.emitted..end].to_string();
        self.emitted = end;
        Some(piece)
    }

    fn step(&mut self) -> anyhow::Result<Option<u32>> {
        if self.produced >= self.params.token_budget() {
            debug!("Token budget of {} exhausted", self.produced);
            return Ok(None);
        }
        let logits = self.model.next_logits(&self.tokens)?;
        let token = sample_next_token(&logits, self.params.temperature, self.params.top_p, &mut self.rng);
        match token {
            Some(token) if token != self.model.eos_token() => Ok(Some(token)),
            _ => Ok(None),
        }
    }
}

impl<'a, M: LogitsModel> Iterator for DecodeLoop<'a, M> {
    type Item = anyhow::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                let end = self.text.len();
                return self.take_until(end).map(Ok);
            }

            let token = match self.step() {
                Ok(Some(token)) => token,
                Ok(None) => {
                    self.finished = true;
                    continue;
                }
                Err(e) => {
                    self.finished = true;
                    self.emitted = self.text.len();
                    return Some(Err(e));
                }
            };

            self.tokens.push(token);
            self.produced += 1;
            match self.model.decode(token) {
                Ok(piece) => self.text.push_str(&piece),
                Err(e) => {
                    self.finished = true;
                    self.emitted = self.text.len();
                    return Some(Err(e));
                }
            }

            if let Some(stop_at) = self.find_stop() {
                self.finished = true;
                let piece = self.take_until(stop_at);
                self.emitted = self.text.len();
                match piece {
                    Some(piece) => return Some(Ok(piece)),
                    None => return None,
                }
            }

            let safe_end = self.text.len() - self.held_back();
            if let Some(piece) = self.take_until(safe_end) {
                return Some(Ok(piece));
            }
        }
    }
}

impl<M: LogitsModel> ModelHandle for SamplingHandle<M> {
    fn model_type(&self) -> Option<String> {
        self.model.model_type()
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<Generation> {
        let mut decode = self.decode_loop(prompt, params)?;
        let mut text = String::new();
        for piece in decode.by_ref() {
            text.push_str(&piece?);
        }
        Ok(Generation {
            text,
            prompt_tokens: decode.prompt_tokens(),
            completion_tokens: decode.completion_tokens(),
        })
    }

    fn stream_generate(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<TokenIter<'_>> {
        Ok(Box::new(self.decode_loop(prompt, params)?))
    }

    fn parameter_bytes(&self) -> u64 {
        self.model.parameter_bytes()
    }
}
