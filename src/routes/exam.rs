use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::assembly::types::{ItemId, SubjectId};
use crate::response::AppError;
use crate::services::device;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/start", post(start))
        .route("/sync", post(sync))
        .route("/submit", post(submit))
        .route("/session/:id", get(view))
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    user_fingerprint: String,
    subject_id: SubjectId,
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    session_id: String,
    #[serde(default)]
    answers: BTreeMap<ItemId, String>,
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    session_id: String,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    status: &'static str,
}

async fn start(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(payload): Json<StartRequest>,
) -> Result<impl IntoResponse, AppError> {
    let meta = device::capture(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    tracing::info!(
        fingerprint = %payload.user_fingerprint,
        subject_id = payload.subject_id,
        ip = ?meta.ip,
        device = %meta.device,
        location = %meta.location,
        "exam start requested"
    );

    let snapshot = state
        .sessions()
        .start(&payload.user_fingerprint, payload.subject_id, meta)
        .await?;
    Ok(Json(snapshot))
}

async fn sync(
    State(state): State<AppState>,
    Json(payload): Json<SyncRequest>,
) -> Result<impl IntoResponse, AppError> {
    let session_id = require_session_id(&payload.session_id)?;
    state.sessions().sync(session_id, payload.answers).await?;
    Ok(Json(SyncResponse { status: "synced" }))
}

async fn submit(
    State(state): State<AppState>,
    Json(payload): Json<SubmitRequest>,
) -> Result<impl IntoResponse, AppError> {
    let session_id = require_session_id(&payload.session_id)?;
    let report = state.sessions().submit(session_id).await?;
    Ok(Json(report))
}

async fn view(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session_id = require_session_id(&session_id)?;
    let snapshot = state.sessions().view(session_id).await?;
    Ok(Json(snapshot))
}

fn require_session_id(raw: &str) -> Result<&str, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation("session_id is required"));
    }
    Ok(trimmed)
}
