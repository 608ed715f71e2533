//! Slot control endpoints: list, load, unload, status, devices, configure.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use super::{ApiError, ValidJson};
use crate::{
    config::{ServingConfig, ServingUpdate},
    devices::{DeviceInfo, AUTO_DEVICE},
    shared_state::{AppState, CounterSnapshot},
    slots::SlotView,
};

#[derive(Debug, Deserialize, Validate)]
pub struct LoadRequest {
    #[validate(length(min = 1))]
    pub model_path: String,
    #[validate(length(min = 1))]
    pub model_name: String,
    #[serde(default = "default_device")]
    pub device: String,
    pub model_type: Option<String>,
}

fn default_device() -> String {
    AUTO_DEVICE.to_string()
}

#[derive(Debug, Deserialize, Validate)]
pub struct UnloadRequest {
    #[validate(length(min = 1))]
    pub slot_id: String,
}

#[derive(Debug, Serialize)]
pub struct SlotsResponse {
    pub slots: Vec<SlotView>,
}

#[derive(Debug, Serialize)]
pub struct LoadResponse {
    pub success: bool,
    pub slot: SlotView,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub running: bool,
    pub slots: Vec<SlotView>,
    pub devices: Vec<DeviceInfo>,
    pub config: ServingConfig,
    pub api_url: String,
    pub uptime_seconds: i64,
    pub stats: CounterSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ConfigureResponse {
    pub success: bool,
    pub config: ServingConfig,
    pub restart_required: bool,
}

/// Device enumeration touches NVML and the OS, so it runs on the worker pool.
async fn inventory(state: &AppState) -> Result<Vec<DeviceInfo>, ApiError> {
    let devices = state.devices.clone();
    let listed = state
        .manager
        .pool()
        .run("device inventory", move || Ok(devices.list_devices()))
        .await?;
    Ok(listed)
}

/// GET /api/slots
pub async fn list_slots(State(state): State<AppState>) -> Json<SlotsResponse> {
    Json(SlotsResponse {
        slots: state.manager.list_slots(),
    })
}

/// POST /api/load
pub async fn load_model(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<LoadRequest>,
) -> Result<Json<LoadResponse>, ApiError> {
    info!("Load requested: '{}' from {} on {}", req.model_name, req.model_path, req.device);
    let slot = state
        .manager
        .load(req.model_path, req.model_name, &req.device, req.model_type)
        .await?;
    Ok(Json(LoadResponse { success: true, slot }))
}

/// POST /api/unload
pub async fn unload_model(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<UnloadRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state.manager.unload(&req.slot_id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// GET /api/status
pub async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let devices = inventory(&state).await?;
    let config = state.serving().as_ref().clone();
    Ok(Json(StatusResponse {
        running: true,
        slots: state.manager.list_slots(),
        devices,
        api_url: config.api_url(),
        config,
        uptime_seconds: (chrono::Utc::now() - state.started_at).num_seconds(),
        stats: state.counters.snapshot(),
    }))
}

/// GET /api/devices
pub async fn list_devices(State(state): State<AppState>) -> Result<Json<DevicesResponse>, ApiError> {
    Ok(Json(DevicesResponse {
        devices: inventory(&state).await?,
    }))
}

/// POST /api/configure
pub async fn configure(
    State(state): State<AppState>,
    ValidJson(update): ValidJson<ServingUpdate>,
) -> Result<Json<ConfigureResponse>, ApiError> {
    let (config, restart_required) = state.configure(&update)?;
    Ok(Json(ConfigureResponse {
        success: true,
        config,
        restart_required,
    }))
}

#[cfg(test)]
mod tests {
    use crate::server::build_router;
    use crate::test_support::{test_state, StubLoader};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(max: usize) -> Router {
        build_router(test_state(Arc::new(StubLoader::new()), max), std::time::Duration::from_secs(30))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_load_capacity_unload_cycle() {
        let app = app(1);

        let (status, body) = call(
            &app,
            "POST",
            "/api/load",
            Some(json!({"model_path": "/m/a", "model_name": "a", "device": "cpu"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["slot"]["state"], "ready");
        assert_eq!(body["slot"]["device"], "cpu");
        let slot_id = body["slot"]["slot_id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            "POST",
            "/api/load",
            Some(json!({"model_path": "/m/b", "model_name": "b", "device": "cpu"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["detail"].as_str().unwrap().contains("Maximum loaded models"));

        let (status, body) = call(&app, "POST", "/api/unload", Some(json!({"slot_id": slot_id}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, _) = call(
            &app,
            "POST",
            "/api/load",
            Some(json!({"model_path": "/m/b", "model_name": "b", "device": "cpu"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, "GET", "/api/slots", None).await;
        let slots = body["slots"].as_array().unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0]["model_name"], "b");
    }

    #[tokio::test]
    async fn test_default_device_is_auto() {
        let app = app(1);
        let (status, body) = call(
            &app,
            "POST",
            "/api/load",
            Some(json!({"model_path": "/m/a", "model_name": "a"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["slot"]["device"], "cpu");
    }

    #[tokio::test]
    async fn test_unload_unknown_slot_is_404() {
        let (status, body) = call(&app(1), "POST", "/api/unload", Some(json!({"slot_id": "nope"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["detail"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_invalid_device_is_500() {
        let (status, body) = call(
            &app(1),
            "POST",
            "/api/load",
            Some(json!({"model_path": "/m/a", "model_name": "a", "device": "cuda:3"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].as_str().unwrap().contains("cuda:3"));
    }

    #[tokio::test]
    async fn test_backend_failure_is_500_and_slot_stays_visible() {
        let app = build_router(
            test_state(Arc::new(StubLoader::failing("weights corrupted")), 1),
            std::time::Duration::from_secs(30),
        );
        let (status, body) = call(
            &app,
            "POST",
            "/api/load",
            Some(json!({"model_path": "/m/a", "model_name": "a", "device": "cpu"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].as_str().unwrap().contains("weights corrupted"));

        let (_, body) = call(&app, "GET", "/api/slots", None).await;
        assert_eq!(body["slots"][0]["state"], "error");
    }

    #[tokio::test]
    async fn test_validation_errors_are_422() {
        let app = app(1);
        let (status, body) = call(
            &app,
            "POST",
            "/api/load",
            Some(json!({"model_path": "", "model_name": "a"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].is_string());

        let (status, _) = call(&app, "POST", "/api/load", Some(json!({"model_name": "a"}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = call(&app, "POST", "/api/configure", Some(json!({"max_loaded_models": 0}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_status_and_devices() {
        let app = app(2);
        let (status, body) = call(&app, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], true);
        assert_eq!(body["devices"][0]["device_id"], "cpu");
        assert_eq!(body["config"]["max_loaded_models"], 2);
        assert_eq!(body["api_url"], "http://127.0.0.1:8000");
        assert!(body["slots"].as_array().unwrap().is_empty());

        let (status, body) = call(&app, "GET", "/api/devices", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["devices"][0]["device_id"], "cpu");
    }

    #[tokio::test]
    async fn test_configure_capacity_applies_immediately() {
        let app = app(1);
        let (status, body) = call(&app, "POST", "/api/configure", Some(json!({"max_loaded_models": 2}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["restart_required"], false);
        assert_eq!(body["config"]["max_loaded_models"], 2);

        for name in ["a", "b"] {
            let (status, _) = call(
                &app,
                "POST",
                "/api/load",
                Some(json!({"model_path": "/m/x", "model_name": name, "device": "cpu"})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_configure_lan_access_requires_restart() {
        let app = app(1);
        let (status, body) = call(&app, "POST", "/api/configure", Some(json!({"lan_access": true}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["restart_required"], true);
        assert_eq!(body["config"]["host"], "0.0.0.0");

        let (_, body) = call(&app, "GET", "/api/status", None).await;
        assert_eq!(body["config"]["lan_access"], true);
    }
}
