use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::command::{DeviceCommand, DeviceSettings};
use crate::config::WebSettings;
use crate::error::SyncError;
use crate::mqtt::DeviceId;
use crate::publish::CommandPublisher;
use crate::staleness::StatusService;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub status: StatusService,
    pub publisher: CommandPublisher,
    pub health: SharedState,
    pub history_limit: i64,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sensor/{device_id}/status", get(device_status))
        .route("/sensor/{device_id}/config", get(device_config).post(set_config))
        .route("/sensor/{device_id}/valve", post(set_valve))
        .route("/sensor/{device_id}/restart", post(restart))
        .route("/sensor/{device_id}/commands", post(send_command))
        .route("/mqtt-logs/{device_id}", get(sensor_history))
        .route("/api/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ValveRequest {
    valve: u32,
    status: bool,
}

async fn device_status(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let device_id = device(device_id)?;
    let read = state.status.read_status(&device_id).await?;
    Ok(Json(read.status))
}

async fn device_config(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let device_id = device(device_id)?;
    Ok(Json(state.status.read_config(&device_id).await?))
}

async fn sensor_history(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let device_id = device(device_id)?;
    let rows = state
        .status
        .recent_readings(&device_id, state.history_limit)
        .await?;
    Ok(Json(rows))
}

async fn set_valve(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(req): Json<ValveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    dispatch(&state, device_id, DeviceCommand::valve(req.valve, req.status)).await
}

async fn set_config(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(settings): Json<DeviceSettings>,
) -> Result<impl IntoResponse, ApiError> {
    dispatch(&state, device_id, DeviceCommand::SetConfig(settings.into())).await
}

async fn restart(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    dispatch(&state, device_id, DeviceCommand::Restart).await
}

async fn send_command(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(command): Json<DeviceCommand>,
) -> Result<impl IntoResponse, ApiError> {
    dispatch(&state, device_id, command).await
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.health.read().await;
    Json(st.to_health())
}

async fn dispatch(
    state: &AppState,
    device_id: String,
    command: DeviceCommand,
) -> Result<(StatusCode, Json<DeviceCommand>), ApiError> {
    let device_id = device(device_id)?;
    state.publisher.send(&device_id, &command).await?;
    Ok((StatusCode::ACCEPTED, Json(command)))
}

fn device(raw: String) -> Result<DeviceId, ApiError> {
    DeviceId::new(raw).ok_or(ApiError::BadDeviceId)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub enum ApiError {
    BadDeviceId,
    Sync(SyncError),
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        Self::Sync(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadDeviceId => (StatusCode::BAD_REQUEST, "invalid device id".to_string()),
            Self::Sync(SyncError::DeviceNotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("device {id} not found"))
            }
            Self::Sync(e) => {
                error!("request failed: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, settings: &WebSettings) -> Result<()> {
    let addr = format!("{}:{}", settings.bind, settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))?;

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::HubState;
    use crate::store::{AuditTag, HardwareStatus, SensorReading, StateStore};
    use crate::testing::{dev, sample_settings, Harness, RecordingTransport, T0};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app_with(h: &Harness, publisher: CommandPublisher) -> Router {
        let health = HubState::shared();
        router(AppState {
            status: StatusService::new(h.store(), h.clock.clone(), publisher.clone(), 30),
            publisher: publisher.with_health(health.clone()),
            health,
            history_limit: 2,
        })
    }

    fn app(h: &Harness) -> Router {
        app_with(h, h.publisher())
    }

    async fn call(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&v).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn seed_status(h: &Harness, updated_at: i64) {
        h.db.upsert_status(&HardwareStatus {
            device_id: dev("dev-A"),
            valve: vec![false, true],
            moisture: vec![true, false],
            uptime: 12,
            updated_at,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn status_of_unknown_device_is_404() {
        let h = Harness::new().await;
        let (status, body) = call(app(&h), Method::GET, "/sensor/ghost/status", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "device ghost not found");
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn fresh_status_is_returned_without_poll() {
        let h = Harness::new().await;
        seed_status(&h, T0 - 5).await;

        let (status, body) = call(app(&h), Method::GET, "/sensor/dev-A/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device_id"], "dev-A");
        assert_eq!(body["valve"], serde_json::json!([false, true]));
        assert_eq!(body["updated_at"], T0 - 5);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn stale_status_is_still_returned() {
        let h = Harness::new().await;
        seed_status(&h, T0 - 120).await;

        let (status, body) = call(app(&h), Method::GET, "/sensor/dev-A/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uptime"], 12);
    }

    #[tokio::test]
    async fn config_roundtrips_through_store() {
        let h = Harness::new().await;
        let (status, _) = call(app(&h), Method::GET, "/sensor/dev-A/config", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        h.db.upsert_config(&crate::store::DeviceConfig {
            device_id: dev("dev-A"),
            settings: sample_settings(),
            updated_at: T0,
        })
        .await
        .unwrap();

        let (status, body) = call(app(&h), Method::GET, "/sensor/dev-A/config", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["wifi_ssid"], "Flamingo");
        assert_eq!(body["updated_at"], T0);
    }

    #[tokio::test]
    async fn valve_request_publishes_open_valve() {
        let h = Harness::new().await;
        let (status, body) = call(
            app(&h),
            Method::POST,
            "/sensor/dev-A/valve",
            Some(serde_json::json!({"valve": 3, "status": true})),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, serde_json::json!({"command": "open_valve", "valve": 3}));
        assert_eq!(
            h.transport.sent(),
            vec![(
                "/dev-A/commands".to_string(),
                serde_json::json!({"command": "open_valve", "valve": 3})
            )]
        );
        assert_eq!(h.db.audit_count(AuditTag::PublishFromCloud).await, 1);
    }

    #[tokio::test]
    async fn set_config_and_restart_publish() {
        let h = Harness::new().await;
        let settings = serde_json::to_value(sample_settings()).unwrap();

        let (status, _) = call(app(&h), Method::POST, "/sensor/dev-A/config", Some(settings)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, _) = call(app(&h), Method::POST, "/sensor/dev-A/restart", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1["command"], "set_config");
        assert_eq!(sent[0].1["watering_duration"], 300);
        assert_eq!(sent[0].1["mqtt_server"], "broker.hivemq.com");
        assert_eq!(sent[1].1, serde_json::json!({"command": "restart"}));
    }

    #[tokio::test]
    async fn generic_command_endpoint_accepts_any_command() {
        let h = Harness::new().await;
        let (status, _) = call(
            app(&h),
            Method::POST,
            "/sensor/dev-A/commands",
            Some(serde_json::json!({"command": "shutdown", "time": 600})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(h.transport.sent()[0].1["time"], 600);
    }

    #[tokio::test]
    async fn publish_failure_is_500() {
        let h = Harness::new().await;
        let publisher = CommandPublisher::new(
            Arc::new(RecordingTransport::failing()),
            h.store(),
            h.clock.clone(),
        );
        let (status, body) = call(
            app_with(&h, publisher),
            Method::POST,
            "/sensor/dev-A/restart",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "internal error");
    }

    #[tokio::test]
    async fn wildcard_device_id_is_400() {
        let h = Harness::new().await;
        let (status, _) = call(app(&h), Method::POST, "/sensor/%23/restart", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let h = Harness::new().await;
        for (i, created_at) in [T0, T0 + 1, T0 + 2].into_iter().enumerate() {
            h.db.insert_sensor_reading(&SensorReading {
                device_id: dev("dev-A"),
                valve: vec![false],
                moisture: vec![i % 2 == 0],
                client_name: "dev-A".into(),
                created_at,
            })
            .await
            .unwrap();
        }

        let (status, body) = call(app(&h), Method::GET, "/mqtt-logs/dev-A", None).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["created_at"], T0 + 2);
        assert_eq!(rows[1]["created_at"], T0 + 1);
    }

    #[tokio::test]
    async fn health_reports_published_commands() {
        let h = Harness::new().await;
        let app = app(&h);
        call(app.clone(), Method::POST, "/sensor/dev-A/restart", None).await;

        let (status, body) = call(app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mqtt_connected"], false);
        assert_eq!(body["counters"]["commands_published"], 1);
        assert_eq!(body["events"][0]["kind"], "command");
    }
}
