use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::{
    backend::{BackendError, ConsoleBackend, Instance},
    broker::{BrokerError, ConsoleBroker},
    console::ConsoleResponse,
};

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<ConsoleBroker>,
    pub backend: Arc<dyn ConsoleBackend>,
}

impl AppState {
    pub fn new(broker: Arc<ConsoleBroker>, backend: Arc<dyn ConsoleBackend>) -> Self {
        Self { broker, backend }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(health_check))
        .route("/servers/:id/action", post(server_action))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(handle)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct ConsoleActionBody {
    #[serde(rename = "type", default)]
    pub console_type: Option<String>,
}

/// Server actions this service answers, keyed the way clients name them.
#[derive(Debug, Deserialize)]
pub enum ConsoleAction {
    #[serde(rename = "os-getVNCConsole")]
    Vnc(ConsoleActionBody),
    #[serde(rename = "os-getVNCConsole-new")]
    PersistedVnc(ConsoleActionBody),
    #[serde(rename = "os-getSPICEConsole")]
    Spice(ConsoleActionBody),
    #[serde(rename = "os-getRDPConsole")]
    Rdp(ConsoleActionBody),
    #[serde(rename = "os-getSerialConsole")]
    Serial(ConsoleActionBody),
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    NotImplemented(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::NotImplemented(msg) => {
                (StatusCode::NOT_IMPLEMENTED, "not_implemented", msg)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg),
        };
        (
            status,
            Json(ApiErrorBody {
                error: code,
                message: Some(message),
            }),
        )
            .into_response()
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::NotReady(msg) => ApiError::Conflict(msg),
            BrokerError::UnsupportedConsoleType(msg) => ApiError::BadRequest(msg),
            BrokerError::NotImplemented(msg) => ApiError::NotImplemented(msg),
            BrokerError::NotFound(msg) => ApiError::NotFound(msg),
            BrokerError::InvariantViolation(_) => {
                error!(error = %err, "console request failed on a backend contract violation");
                ApiError::Internal("console backend returned an unusable console url".into())
            }
            BrokerError::Backend(_) => {
                error!(error = %err, "console request failed in the backend");
                ApiError::Internal("unexpected console backend failure".into())
            }
        }
    }
}

/// POST /servers/{id}/action - dispatch a console action for one instance
pub async fn server_action(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    body: Bytes,
) -> ApiResult<ConsoleResponse> {
    let action: ConsoleAction = serde_json::from_slice(&body)
        .map_err(|err| ApiError::BadRequest(format!("unsupported server action: {err}")))?;
    debug!(%instance_id, ?action, "console action requested");

    let broker = &state.broker;
    let response = match action {
        ConsoleAction::Serial(body) => {
            broker
                .serial_console(&instance_id, body.console_type.as_deref())
                .await?
        }
        ConsoleAction::Vnc(body) => {
            let instance = resolve_instance(&state, &instance_id).await?;
            broker
                .vnc_console(&instance, body.console_type.as_deref())
                .await?
        }
        ConsoleAction::PersistedVnc(body) => {
            let instance = resolve_instance(&state, &instance_id).await?;
            broker
                .persisted_vnc_console(&instance, body.console_type.as_deref())
                .await?
        }
        ConsoleAction::Spice(body) => {
            let instance = resolve_instance(&state, &instance_id).await?;
            broker
                .spice_console(&instance, body.console_type.as_deref())
                .await?
        }
        ConsoleAction::Rdp(body) => {
            let instance = resolve_instance(&state, &instance_id).await?;
            broker
                .rdp_console(&instance, body.console_type.as_deref())
                .await?
        }
    };

    Ok(Json(response))
}

async fn resolve_instance(state: &AppState, instance_id: &str) -> Result<Instance, ApiError> {
    state
        .backend
        .get_instance(instance_id)
        .await
        .map_err(|err| match err {
            BackendError::InstanceNotFound(_) => ApiError::NotFound(err.to_string()),
            other => {
                error!(%instance_id, error = %other, "instance lookup failed");
                ApiError::Internal("instance lookup failed".into())
            }
        })
}
