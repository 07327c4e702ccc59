//! Control-plane handlers.
//!
//! Operator endpoints read and write through the supervisor; `/route` goes
//! through the dispatcher. Failures map to problem responses carrying a
//! JSON `error` field.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use herd_dispatch::DispatchError;

use crate::metrics::render_metrics;
use crate::ApiState;

fn problem(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// GET /
pub async fn root() -> Redirect {
    Redirect::temporary("/cluster/status")
}

/// GET /instances
pub async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    let mut snapshots = Vec::new();
    for worker in state.supervisor.snapshot() {
        snapshots.push(worker.snapshot().await);
    }
    Json(snapshots)
}

/// POST /instances/{port}/disable
pub async fn disable_instance(
    State(state): State<ApiState>,
    Path(port): Path<u16>,
) -> impl IntoResponse {
    match state.supervisor.get(port) {
        Some(worker) => {
            worker.set_disabled(true);
            (StatusCode::OK, format!("Instance {port} disabled")).into_response()
        }
        None => problem(
            StatusCode::NOT_FOUND,
            &format!("no instance on port {port}"),
        ),
    }
}

/// POST /instances/{port}/enable
pub async fn enable_instance(
    State(state): State<ApiState>,
    Path(port): Path<u16>,
) -> impl IntoResponse {
    match state.supervisor.get(port) {
        Some(worker) => {
            worker.set_disabled(false);
            (StatusCode::OK, format!("Instance {port} enabled")).into_response()
        }
        None => problem(
            StatusCode::NOT_FOUND,
            &format!("no instance on port {port}"),
        ),
    }
}

/// Aggregate pool view served by /cluster/status.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub workers: usize,
    pub alive: usize,
    pub total_inflight: u64,
    pub average_composite_load: f64,
    pub cluster_rps: f64,
    pub rps_history: Vec<f64>,
}

/// GET /cluster/status
pub async fn cluster_status(State(state): State<ApiState>) -> impl IntoResponse {
    let workers = state.supervisor.snapshot();
    if workers.is_empty() {
        return problem(StatusCode::SERVICE_UNAVAILABLE, "cluster has no workers");
    }

    let mut alive = 0;
    let mut total_inflight: u64 = 0;
    let mut load_sum = 0.0;
    for worker in &workers {
        if worker.is_alive().await {
            alive += 1;
        }
        total_inflight += u64::from(worker.inflight());
        load_sum += worker.composite_load();
    }

    Json(ClusterStatus {
        workers: workers.len(),
        alive,
        total_inflight,
        average_composite_load: load_sum / workers.len() as f64,
        cluster_rps: state.supervisor.cluster_rps(),
        rps_history: state.supervisor.rps_history(),
    })
    .into_response()
}

/// Manual scale request body.
#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub action: String,
    #[serde(default)]
    pub count: Option<u32>,
}

/// POST /cluster/scale
pub async fn scale_cluster(State(state): State<ApiState>, body: Bytes) -> impl IntoResponse {
    let request: ScaleRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return problem(
                StatusCode::BAD_REQUEST,
                &format!("invalid scale request: {e}"),
            )
        }
    };
    let count = request.count.unwrap_or(1);

    match request.action.as_str() {
        "up" => {
            let mut started = 0;
            for _ in 0..count {
                match state.supervisor.start_instance().await {
                    Ok(Some(_)) => started += 1,
                    Ok(None) => break, // at maxInstances
                    Err(e) => {
                        warn!(error = %e, "manual scale-up start failed");
                        break;
                    }
                }
            }
            (StatusCode::OK, format!("Scaled up by {started} instance(s)")).into_response()
        }
        "down" => {
            let ports: Vec<u16> = state
                .supervisor
                .snapshot()
                .iter()
                .take(count as usize)
                .map(|w| w.port())
                .collect();
            let mut killed = 0;
            for port in ports {
                if state.supervisor.kill_instance(port).await {
                    killed += 1;
                }
            }
            (
                StatusCode::OK,
                format!("Scaled down by {killed} instance(s)"),
            )
                .into_response()
        }
        other => problem(
            StatusCode::BAD_REQUEST,
            &format!("unknown scale action '{other}', expected \"up\" or \"down\""),
        ),
    }
}

/// POST /route — dispatcher entry point. `X-User` selects the counter
/// bucket; the body is forwarded opaquely once it parses as JSON.
pub async fn route_request(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if serde_json::from_slice::<serde_json::Value>(&body).is_err() {
        return problem(StatusCode::BAD_REQUEST, "request body is not valid JSON");
    }

    let user = headers.get("x-user").and_then(|v| v.to_str().ok());
    match state.dispatcher.dispatch(user, body).await {
        Ok(response) => (
            StatusCode::OK,
            [("content-type", "application/json")],
            response,
        )
            .into_response(),
        Err(e @ DispatchError::NoEligibleWorker) => {
            problem(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
        }
        Err(e @ DispatchError::Upstream { .. }) => problem(StatusCode::BAD_GATEWAY, &e.to_string()),
    }
}

/// GET /health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    if state.supervisor.alive_count().await > 0 {
        (StatusCode::OK, "Cluster healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "No live workers")
    }
}

/// GET /metrics
pub async fn metrics_text(State(state): State<ApiState>) -> impl IntoResponse {
    let mut snapshots = Vec::new();
    for worker in state.supervisor.snapshot() {
        snapshots.push(worker.snapshot().await);
    }
    let body = render_metrics(&snapshots, &state.supervisor.user_requests());
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        body,
    )
}

/// POST /users/reset
pub async fn reset_users(State(state): State<ApiState>) -> impl IntoResponse {
    state.supervisor.reset_users();
    (StatusCode::OK, "User counters reset")
}
