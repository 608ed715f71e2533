//! OpenAI-compatible endpoints.
//!
//! Flow: Client POST → READY slot lookup by model name → worker pool
//! generation → JSON body, or one SSE chunk per produced token followed by a
//! terminal chunk and `[DONE]`.

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};
use validator::Validate;

use super::{ApiError, ValidJson};
use crate::{metrics, model_runtime::GenerationParams, shared_state::AppState};

pub const FINISH_REASON: &str = "stop";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// `stop` accepts a single string or a list, as OpenAI clients send either.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    fn into_vec(self) -> Vec<String> {
        match self {
            StopSequences::One(s) => vec![s],
            StopSequences::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChatCompletionRequest {
    #[validate(length(min = 1))]
    pub model: String,
    #[validate(length(min = 1))]
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub top_p: f32,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    pub stop: Option<StopSequences>,
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CompletionRequest {
    #[validate(length(min = 1))]
    pub model: String,
    pub prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub top_p: f32,
    #[serde(default = "default_completion_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub stream: bool,
    pub stop: Option<StopSequences>,
    pub seed: Option<u64>,
}

fn default_temperature() -> f32 { 0.7 }
fn default_top_p() -> f32 { 1.0 }
fn default_completion_max_tokens() -> u32 { 256 }

impl ChatCompletionRequest {
    fn params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            stop: self.stop.clone().map(StopSequences::into_vec).unwrap_or_default(),
            seed: self.seed,
        }
    }
}

impl CompletionRequest {
    fn params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: Some(self.max_tokens),
            stop: self.stop.clone().map(StopSequences::into_vec).unwrap_or_default(),
            seed: self.seed,
        }
    }
}

/// Flattens messages into `Role: content` lines and cues the assistant turn.
pub fn build_chat_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let role = match message.role.as_str() {
            "system" => "System",
            "user" => "User",
            "assistant" => "Assistant",
            other => other,
        };
        prompt.push_str(role);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("Assistant:");
    prompt
}

fn completion_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ModelCard {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelCard>,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub text: String,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct CompletionChunkChoice {
    pub index: u32,
    pub text: String,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct CompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChunkChoice>,
}

/// Builds the SSE payload for a token (`Some`) or for the terminal chunk (`None`).
trait ChunkFactory: Send + 'static {
    fn chunk(&self, token: Option<String>) -> Event;
}

struct ChatChunks {
    id: String,
    created: i64,
    model: String,
}

impl ChunkFactory for ChatChunks {
    fn chunk(&self, token: Option<String>) -> Event {
        let finish_reason = token.is_none().then_some(FINISH_REASON);
        json_event(&ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta: Delta { content: token },
                finish_reason,
            }],
        })
    }
}

struct TextChunks {
    id: String,
    created: i64,
    model: String,
}

impl ChunkFactory for TextChunks {
    fn chunk(&self, token: Option<String>) -> Event {
        let finish_reason = token.is_none().then_some(FINISH_REASON);
        json_event(&CompletionChunk {
            id: self.id.clone(),
            object: "text_completion",
            created: self.created,
            model: self.model.clone(),
            choices: vec![CompletionChunkChoice {
                index: 0,
                text: token.unwrap_or_default(),
                finish_reason,
            }],
        })
    }
}

fn json_event<T: Serialize>(payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(data) => Event::default().data(data),
        Err(e) => Event::default().data(serde_json::json!({"error": {"message": e.to_string()}}).to_string()),
    }
}

/// Relays worker tokens as SSE. Yields to the scheduler after every token;
/// dropping the response closes the channel and stops the worker.
fn sse_response<C: ChunkFactory>(
    state: AppState,
    tokens: ReceiverStream<anyhow::Result<String>>,
    chunks: C,
) -> Response {
    let stream = async_stream::stream! {
        let _gauge = metrics::StreamGauge::enter();
        let mut tokens = tokens;
        let mut produced = 0usize;
        let mut failed = false;

        while let Some(token) = tokens.next().await {
            match token {
                Ok(text) => {
                    produced += 1;
                    debug!("token {}: {:?}", produced, text);
                    yield Ok::<_, Infallible>(chunks.chunk(Some(text)));
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    error!("Stream generation failed: {:#}", e);
                    failed = true;
                    yield Ok(json_event(&serde_json::json!({
                        "error": {"message": format!("{:#}", e)}
                    })));
                    break;
                }
            }
        }

        metrics::add_generated_tokens(produced);
        if failed {
            state.counters.inc_failed();
        } else {
            state.counters.inc_completed();
            yield Ok(chunks.chunk(None));
        }
        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

/// GET /v1/models
pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    let created = state.started_at.timestamp();
    let data = state
        .manager
        .list_model_names()
        .into_iter()
        .map(|id| ModelCard {
            id,
            object: "model",
            created,
            owned_by: "local",
        })
        .collect();
    Json(ModelList { object: "list", data })
}

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let request_num = state.counters.inc_total_requests();
    let lease = state.manager.get_model_for_inference(&req.model)?;
    info!(
        "Chat request #{} for '{}' on slot {} (stream: {})",
        request_num,
        req.model,
        lease.slot_id(),
        req.stream
    );

    let prompt = build_chat_prompt(&req.messages);
    let params = req.params();

    if req.stream {
        let tokens = state.manager.stream(lease, prompt, params);
        let chunks = ChatChunks {
            id: completion_id("chatcmpl"),
            created: now(),
            model: req.model,
        };
        return Ok(sse_response(state, tokens, chunks));
    }

    let generation = match state.manager.generate(lease, prompt, params).await {
        Ok(generation) => generation,
        Err(e) => {
            state.counters.inc_failed();
            return Err(e.into());
        }
    };
    state.counters.inc_completed();
    metrics::add_generated_tokens(generation.completion_tokens);

    Ok(Json(ChatCompletionResponse {
        id: completion_id("chatcmpl"),
        object: "chat.completion",
        created: now(),
        model: req.model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: generation.text,
            },
            finish_reason: FINISH_REASON,
        }],
        usage: Usage::new(generation.prompt_tokens, generation.completion_tokens),
    })
    .into_response())
}

/// POST /v1/completions
pub async fn completions(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<CompletionRequest>,
) -> Result<Response, ApiError> {
    let request_num = state.counters.inc_total_requests();
    let lease = state.manager.get_model_for_inference(&req.model)?;
    info!(
        "Completion request #{} for '{}' on slot {} (stream: {})",
        request_num,
        req.model,
        lease.slot_id(),
        req.stream
    );

    let params = req.params();

    if req.stream {
        let tokens = state.manager.stream(lease, req.prompt, params);
        let chunks = TextChunks {
            id: completion_id("cmpl"),
            created: now(),
            model: req.model,
        };
        return Ok(sse_response(state, tokens, chunks));
    }

    let generation = match state.manager.generate(lease, req.prompt, params).await {
        Ok(generation) => generation,
        Err(e) => {
            state.counters.inc_failed();
            return Err(e.into());
        }
    };
    state.counters.inc_completed();
    metrics::add_generated_tokens(generation.completion_tokens);

    Ok(Json(CompletionResponse {
        id: completion_id("cmpl"),
        object: "text_completion",
        created: now(),
        model: req.model,
        choices: vec![CompletionChoice {
            index: 0,
            text: generation.text,
            finish_reason: FINISH_REASON,
        }],
        usage: Usage::new(generation.prompt_tokens, generation.completion_tokens),
    })
    .into_response())
}
