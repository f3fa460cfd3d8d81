use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::db::HealthCheckSnapshot;
use crate::state::AppState;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/info", get(info))
        .route("/live", get(live))
        .route("/ready", get(ready))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    store: &'static str,
    cache: &'static str,
    timestamp: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LivenessResponse {
    status: &'static str,
    timestamp: String,
    uptime: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadinessResponse {
    status: &'static str,
    timestamp: String,
    uptime: u64,
    store: &'static str,
    store_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    database_monitor: Option<HealthCheckSnapshot>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoResponse {
    service: &'static str,
    version: &'static str,
    store_backend: &'static str,
    start_time: String,
    uptime: u64,
}

enum Probe {
    Up { latency_ms: u64 },
    Down,
    Timeout,
}

impl Probe {
    fn label(&self) -> &'static str {
        match self {
            Probe::Up { .. } => "connected",
            Probe::Down => "disconnected",
            Probe::Timeout => "timeout",
        }
    }

    fn is_up(&self) -> bool {
        matches!(self, Probe::Up { .. })
    }
}

async fn probe<F, E>(check: F) -> Probe
where
    F: std::future::Future<Output = Result<(), E>>,
{
    let started = Instant::now();
    match tokio::time::timeout(PROBE_TIMEOUT, check).await {
        Ok(Ok(())) => Probe::Up {
            latency_ms: started.elapsed().as_millis() as u64,
        },
        Ok(Err(_)) => Probe::Down,
        Err(_) => Probe::Timeout,
    }
}

async fn root(State(state): State<AppState>) -> Response {
    let sessions = state.sessions();
    let ctx = sessions.context();
    let store = probe(ctx.store.ping()).await;
    let cache = probe(ctx.cache.ping()).await;
    let ok = store.is_up() && cache.is_up();

    let response = HealthResponse {
        status: if ok { "ok" } else { "degraded" },
        store: store.label(),
        cache: cache.label(),
        timestamp: now_iso(),
    };

    let status_code = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(response)).into_response()
}

async fn live(State(state): State<AppState>) -> Response {
    Json(LivenessResponse {
        status: "healthy",
        timestamp: now_iso(),
        uptime: state.uptime_seconds(),
    })
    .into_response()
}

async fn ready(State(state): State<AppState>) -> Response {
    let sessions = state.sessions();
    let store = probe(sessions.context().store.ping()).await;
    let database_monitor = match state.db_proxy() {
        Some(proxy) => Some(proxy.health_status().await),
        None => None,
    };

    let monitor_degraded = database_monitor.as_ref().is_some_and(|m| m.degraded);
    let status = match store {
        Probe::Up { .. } if monitor_degraded => "degraded",
        Probe::Up { .. } => "healthy",
        Probe::Timeout => "degraded",
        Probe::Down => "unhealthy",
    };
    let store_latency_ms = match store {
        Probe::Up { latency_ms } => Some(latency_ms),
        _ => None,
    };

    let response = ReadinessResponse {
        status,
        timestamp: now_iso(),
        uptime: state.uptime_seconds(),
        store: store.label(),
        store_latency_ms,
        database_monitor,
    };

    let status_code = match status {
        "healthy" | "degraded" => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response)).into_response()
}

async fn info(State(state): State<AppState>) -> Response {
    let started: chrono::DateTime<chrono::Utc> = state.started_at_system().into();
    Json(InfoResponse {
        service: "exam-backend",
        version: env!("CARGO_PKG_VERSION"),
        store_backend: if state.db_proxy().is_some() {
            "postgres"
        } else {
            "memory"
        },
        start_time: started.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        uptime: state.uptime_seconds(),
    })
    .into_response()
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
