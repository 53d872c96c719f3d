use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    app_state::AppState,
    directory::ServerRecord,
    error::{ApiResult, AppError},
    secrets,
};

mod backups;
mod file_tunnel;

const USER_ID_HEADER: &str = "x-aero-user-id";
pub(crate) const NODE_ID_HEADER: &str = "x-aero-node-id";

pub fn build_router(state: AppState) -> Router {
    Router::<AppState>::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .merge(file_tunnel::router())
        .merge(backups::router())
        .with_state(state)
}

pub fn build_metrics_router(state: AppState) -> Router {
    Router::<AppState>::new()
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[derive(Serialize)]
struct NodeTunnelHealth {
    node_id: Uuid,
    status: &'static str,
    last_heartbeat_secs: Option<u64>,
    last_error: Option<String>,
    last_event_secs: Option<u64>,
}

pub(crate) async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot().await;
    let statuses: Vec<NodeTunnelHealth> = snapshot
        .statuses
        .iter()
        .map(|status| NodeTunnelHealth {
            node_id: status.node_id,
            status: match status.status {
                crate::tunnel::TunnelStatus::Connected => "connected",
                crate::tunnel::TunnelStatus::Disconnected => "disconnected",
            },
            last_heartbeat_secs: status.last_heartbeat_secs,
            last_error: status.last_error.clone(),
            last_event_secs: status.last_event_secs,
        })
        .collect();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "tunnelSessionsActive": snapshot.total,
        "tunnelFreshestHeartbeatSecs": snapshot.freshest_heartbeat_age.map(|d| d.as_secs()),
        "tunnelStatuses": statuses,
    }))
}

/// Operator-facing view of the running configuration. Credential fields are
/// masked before they leave the plane.
pub(crate) async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let mut storage = json!({
        "mode": state.backups.mode.as_str(),
        "baseDir": state.backups.base_dir,
        "streamDir": state.backups.stream_dir,
        "localDir": state.backups.local_dir,
        "retention": {
            "count": state.backups.retention.count,
            "days": state.backups.retention.days,
        },
        "s3": {
            "bucket": state.backups.s3.bucket,
            "region": state.backups.s3.region,
            "endpoint": state.backups.s3.endpoint,
            "access_key": state.backups.s3.access_key,
            "secret_key": state.backups.s3.secret_key,
        },
        "sftp": {
            "host": state.backups.sftp.host,
            "port": state.backups.sftp.port,
            "username": state.backups.sftp.username,
            "password": state.backups.sftp.password,
            "private_key": state.backups.sftp.private_key,
            "passphrase": state.backups.sftp.passphrase,
            "base_path": state.backups.sftp.base_path,
        },
    });
    if let Some(s3) = storage.get_mut("s3") {
        secrets::redact_fields(s3);
    }
    if let Some(sftp) = storage.get_mut("sftp") {
        secrets::redact_fields(sftp);
    }

    let snapshot = state.registry.snapshot().await;
    Json(json!({
        "storage": storage,
        "tunnelSessionsActive": snapshot.total,
    }))
}

pub(crate) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics_handle.render();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
}

/// Authenticates an agent request: bearer token in the configured header
/// plus the node id header. Returns the node id.
pub(crate) fn authenticate_agent(state: &AppState, headers: &HeaderMap) -> ApiResult<Uuid> {
    let token = headers
        .get(state.tunnel.token_header.as_str())
        .and_then(|value| value.to_str().ok())
        .and_then(parse_bearer)
        .ok_or_else(|| AppError::unauthorized("missing agent token"))?;
    if !state.agent_auth.verify(&token) {
        return Err(AppError::unauthorized("invalid agent token"));
    }
    headers
        .get(NODE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| AppError::bad_request("missing or invalid node id header"))
}

fn parse_bearer(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let prefix = "Bearer ";
    if raw.len() <= prefix.len() || !raw.starts_with(prefix) {
        return None;
    }
    Some(raw[prefix.len()..].to_string())
}

/// Identifies the operator making a request. Authentication itself happens
/// upstream; the plane only enforces per-server access.
pub(crate) fn operator_id(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::unauthorized("missing operator identity"))
}

/// Looks up a server and checks the operator may act on it.
pub(crate) async fn load_server(
    state: &AppState,
    user_id: &str,
    server_uuid: Uuid,
) -> ApiResult<ServerRecord> {
    let server = state
        .directory
        .server_by_uuid(server_uuid)
        .await?
        .ok_or_else(|| AppError::not_found("server not found"))?;
    if !state.directory.can_access(user_id, server_uuid).await? {
        return Err(AppError::forbidden("no access to this server"));
    }
    Ok(server)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::directory::MemoryDirectory;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn healthz_reports_ok_without_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = app_state(dir.path().to_str().unwrap(), MemoryDirectory::permissive());
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["tunnelSessionsActive"], 0);
    }

    #[tokio::test]
    async fn status_redacts_storage_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = app_state(dir.path().to_str().unwrap(), MemoryDirectory::permissive());
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["storage"]["sftp"]["password"], "********");
        assert_eq!(body["storage"]["mode"], "local");
    }

    #[tokio::test]
    async fn agent_authentication_requires_valid_bearer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = app_state(dir.path().to_str().unwrap(), MemoryDirectory::permissive());

        let mut headers = HeaderMap::new();
        assert!(authenticate_agent(&state, &headers).is_err());

        headers.insert(
            "x-aero-tunnel-token",
            format!("Bearer {AGENT_TOKEN}").parse().expect("header"),
        );
        // Token valid but node id missing.
        assert!(authenticate_agent(&state, &headers).is_err());

        let node_id = Uuid::new_v4();
        headers.insert(NODE_ID_HEADER, node_id.to_string().parse().expect("header"));
        assert_eq!(authenticate_agent(&state, &headers).expect("auth"), node_id);

        headers.insert(
            "x-aero-tunnel-token",
            "Bearer wrong-token".parse().expect("header"),
        );
        assert!(authenticate_agent(&state, &headers).is_err());
    }
}
