//! Agent-facing file tunnel endpoints: long-poll for work, post resolutions,
//! fetch staged upload payloads.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::{app_state::AppState, error::ApiResult};

use super::authenticate_agent;

pub(crate) fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/agent/file-requests/poll", post(poll))
        .route("/agent/file-requests/{id}/resolve", post(resolve))
        .route("/agent/file-requests/{id}/upload", get(fetch_upload))
}

async fn poll(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let node_id = authenticate_agent(&state, &headers)?;
    let requests = state.file_tunnel.poll_requests(node_id).await;
    Ok(Json(requests))
}

async fn resolve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult<impl IntoResponse> {
    let node_id = authenticate_agent(&state, &headers)?;
    let accepted = state.file_tunnel.resolve_request(node_id, &id, payload).await;
    Ok(Json(serde_json::json!({ "accepted": accepted })))
}

async fn fetch_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let node_id = authenticate_agent(&state, &headers)?;
    match state.file_tunnel.get_upload_data(node_id, &id).await {
        Some(data) => Ok((
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "application/octet-stream",
            )],
            data,
        )
            .into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}
