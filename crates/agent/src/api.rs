//! HTTP API: monitoring control, detection queries, health and metrics

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ids_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::{encode_metrics, IdsMetrics},
    ControlAction, DetectionEntry, Distribution, IdsError, MonitoringSupervisor, RiskStatus,
    ThreatSummary, DEFAULT_RECENT_LIMIT,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub supervisor: MonitoringSupervisor,
    pub health_registry: HealthRegistry,
    pub metrics: IdsMetrics,
}

impl AppState {
    pub fn new(
        supervisor: MonitoringSupervisor,
        health_registry: HealthRegistry,
        metrics: IdsMetrics,
    ) -> Self {
        Self {
            supervisor,
            health_registry,
            metrics,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    ServiceUnavailable(&'static str),
    InvalidAction(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, *msg),
            ApiError::InvalidAction(action) => {
                info!(action = %action, "Rejected control request");
                (StatusCode::BAD_REQUEST, "Invalid action")
            }
            ApiError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<IdsError> for ApiError {
    fn from(err: IdsError) -> Self {
        match err {
            IdsError::InvalidAction(action) => ApiError::InvalidAction(action),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

const MONITORING_UNAVAILABLE: &str = "Monitoring service not available";

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: RiskStatus,
    pub monitoring_active: bool,
    pub total_packets: u64,
    pub total_attacks: u64,
    pub detection_rate: f64,
    pub last_threat: Option<ThreatSummary>,
    pub distribution: Distribution,
    pub stream_position: u64,
}

async fn api_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatusResponse>> {
    let supervisor = &state.supervisor;
    if !supervisor.oracle_loaded() {
        return Err(ApiError::ServiceUnavailable(MONITORING_UNAVAILABLE));
    }

    let stats = supervisor.stats();
    let distribution = supervisor.ledger().distribution()?;

    Ok(Json(StatusResponse {
        status: stats.status,
        monitoring_active: supervisor.is_running(),
        total_packets: stats.total_packets,
        total_attacks: stats.total_attacks,
        detection_rate: stats.detection_rate,
        last_threat: stats.last_threat,
        distribution,
        stream_position: supervisor.stream_position(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs: Vec<DetectionEntry>,
    pub count: usize,
}

async fn api_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
    let logs = state.supervisor.ledger().recent_entries(limit)?;
    Ok(Json(LogsResponse {
        count: logs.len(),
        logs,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub action: String,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: &'static str,
}

async fn api_control(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ControlRequest>,
) -> ApiResult<Json<ControlResponse>> {
    if !state.supervisor.oracle_loaded() {
        return Err(ApiError::ServiceUnavailable(MONITORING_UNAVAILABLE));
    }

    let action: ControlAction = request.action.parse()?;
    let success = state.supervisor.apply(action).await;
    let message = match (action, success) {
        (ControlAction::Start, true) => "Monitoring started",
        (ControlAction::Start, false) => "Already running",
        (ControlAction::Stop, true) => "Monitoring stopped",
        (ControlAction::Stop, false) => "Not running",
    };
    info!(action = %action, success, "Control request handled");

    Ok(Json(ControlResponse { success, message }))
}

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub status: ComponentStatus,
    pub model_loaded: bool,
    pub database_connected: bool,
    pub monitoring_available: bool,
    pub monitoring_active: bool,
}

async fn api_health(State(state): State<Arc<AppState>>) -> Json<ServiceHealth> {
    let health = state.health_registry.health().await;
    let supervisor = &state.supervisor;
    let model_loaded = supervisor.oracle_loaded();

    Json(ServiceHealth {
        status: health.status,
        model_loaded,
        database_connected: supervisor.ledger().len().is_ok(),
        monitoring_available: model_loaded,
        monitoring_active: supervisor.is_running(),
    })
}

/// Returns 200 if healthy or degraded, 503 if any component is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = if health.status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Gauges owned by the supervisor are synced on scrape; the worker only
/// updates them between ticks
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    state.metrics.set_monitoring_active(state.supervisor.is_running());
    state
        .metrics
        .set_stream_position(state.supervisor.stream_position());

    match encode_metrics() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        )
            .into_response(),
        Err(e) => ApiError::Internal(format!("Failed to encode metrics: {}", e)).into_response(),
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/logs", get(api_logs))
        .route("/api/control", post(api_control))
        .route("/api/health", get(api_health))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
