//! Operator-facing backup and file endpoints.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::{
    app_state::AppState,
    backup::BackupStream,
    error::ApiResult,
};

use super::{load_server, operator_id};

pub(crate) fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/servers/{uuid}/backups", get(list_backups))
        .route("/servers/{uuid}/backups/{name}/store", post(store_backup))
        .route(
            "/servers/{uuid}/backups/{name}/restore",
            post(restore_backup),
        )
        .route("/servers/{uuid}/backups/{name}", get(download_backup))
        .route("/servers/{uuid}/backups/{name}", delete(delete_backup))
        .route("/servers/{uuid}/backups/retention", post(apply_retention))
        .route("/servers/{uuid}/files", get(read_directory))
}

async fn list_backups(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = operator_id(&headers)?;
    let server = load_server(&state, &user, uuid).await?;
    let objects = state.transfers.list_backups(&server).await?;
    Ok(Json(objects))
}

async fn store_backup(
    State(state): State<AppState>,
    Path((uuid, name)): Path<(Uuid, String)>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = operator_id(&headers)?;
    let server = load_server(&state, &user, uuid).await?;
    let descriptor = state.transfers.store_backup(&server, &name).await?;
    Ok((StatusCode::CREATED, Json(descriptor)))
}

async fn restore_backup(
    State(state): State<AppState>,
    Path((uuid, name)): Path<(Uuid, String)>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = operator_id(&headers)?;
    let server = load_server(&state, &user, uuid).await?;
    let pushed = state.transfers.restore_backup(&server, &name).await?;
    Ok(Json(json!({ "pushed": pushed })))
}

async fn download_backup(
    State(state): State<AppState>,
    Path((uuid, name)): Path<(Uuid, String)>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = operator_id(&headers)?;
    let server = load_server(&state, &user, uuid).await?;
    let stream = state.transfers.open_backup(&server, &name).await?;

    let body = match stream {
        BackupStream::File(file) => Body::from_stream(ReaderStream::new(file)),
        BackupStream::Reader(reader) => Body::from_stream(ReaderStream::new(reader)),
        BackupStream::Channel(rx) => {
            Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, std::io::Error>))
        }
    };

    let file_name = if name.ends_with(".tar.gz") {
        name
    } else {
        format!("{name}.tar.gz")
    };
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        body,
    ))
}

async fn delete_backup(
    State(state): State<AppState>,
    Path((uuid, name)): Path<(Uuid, String)>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = operator_id(&headers)?;
    let server = load_server(&state, &user, uuid).await?;
    state.transfers.delete_backup(&server, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn apply_retention(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = operator_id(&headers)?;
    let server = load_server(&state, &user, uuid).await?;
    let removed = state.transfers.apply_retention(&server).await?;
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Deserialize)]
struct ReadDirectoryQuery {
    #[serde(default = "default_path")]
    path: String,
}

fn default_path() -> String {
    "/".to_string()
}

async fn read_directory(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Query(query): Query<ReadDirectoryQuery>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = operator_id(&headers)?;
    let server = load_server(&state, &user, uuid).await?;
    let listing = state
        .transfers
        .read_remote_directory(&server, &query.path)
        .await?;
    Ok(Json(listing))
}
