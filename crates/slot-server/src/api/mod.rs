// slot-server/src/api/mod.rs
//! HTTP surfaces: the slot control API under `/api` and the
//! OpenAI-compatible API under `/v1`.

pub mod control_api;
pub mod openai_api;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{error, warn};
use validator::Validate;

use crate::error::ManagerError;

pub use control_api::{configure, list_devices, list_slots, load_model, status, unload_model};
pub use openai_api::{chat_completions, completions, list_models};

/// Error returned by every handler. Rendered as `{"detail": "<message>"}`.
#[derive(Debug)]
pub enum ApiError {
    Manager(ManagerError),
    Validation(String),
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Manager(e) if e.is_retryable() => StatusCode::CONFLICT,
            ApiError::Manager(ManagerError::SlotNotFound(_) | ManagerError::ModelNotLoaded(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Manager(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn detail(&self) -> String {
        match self {
            ApiError::Manager(e) => e.to_string(),
            ApiError::Validation(msg) => msg.clone(),
            ApiError::Internal(e) => format!("{:#}", e),
        }
    }
}

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        ApiError::Manager(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(e: validator::ValidationErrors) -> Self {
        ApiError::Validation(e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::Validation(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = self.detail();
        if status.is_server_error() {
            error!("Request failed ({}): {}", status, detail);
        } else {
            warn!("Request rejected ({}): {}", status, detail);
        }
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

/// `Json<T>` that also runs `validator` checks, rejecting with 422.
pub struct ValidJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(ValidJson(value))
    }
}
