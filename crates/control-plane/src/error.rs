use axum::{response::IntoResponse, Json};

/// Failures on the push-transport command path.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("no active tunnel for node")]
    NoTunnel,
    #[error("tunnel is at capacity")]
    Overloaded,
    #[error("tunnel channel closed")]
    ChannelClosed,
    #[error("no response before timeout")]
    Timeout,
    #[error("tunnel disconnected")]
    Disconnected,
    #[error("agent reported failure: {0}")]
    Remote(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Failures on the long-poll file tunnel path.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FileTunnelError {
    #[error("request timed out")]
    Timeout,
    #[error("node has {pending} pending and {queued} queued requests (limit {limit})")]
    Capacity {
        pending: usize,
        queued: usize,
        limit: usize,
    },
    #[error("upload exceeds the {limit_mb} MB limit")]
    UploadTooLarge { limit_mb: u64 },
    #[error("file tunnel stopped")]
    Stopped,
}

/// Failures while moving a backup archive between an agent and storage.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("storage configuration error: {0}")]
    Config(String),
    #[error("invalid backup name: {0}")]
    InvalidName(String),
    #[error("backup not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    FileTunnel(#[from] FileTunnelError),
    #[error("storage backend failure: {0}")]
    Backend(#[source] anyhow::Error),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Application error type for HTTP handlers.
#[derive(Debug)]
pub struct AppError {
    pub status: axum::http::StatusCode,
    pub code: &'static str,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: axum::http::StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: msg.into(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: axum::http::StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: msg.into(),
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self {
            status: axum::http::StatusCode::FORBIDDEN,
            code: "forbidden",
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: axum::http::StatusCode::NOT_FOUND,
            code: "not_found",
            message: msg.into(),
        }
    }

    pub fn internal(msg: &str) -> Self {
        Self {
            status: axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: msg.to_string(),
        }
    }

    fn new(status: axum::http::StatusCode, code: &'static str, message: String) -> Self {
        Self {
            status,
            code,
            message,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(serde_json::json!({
            "error": self.message,
            "code": self.code,
        }));
        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        crate::telemetry::record_internal_error_metrics(&err);
        AppError::internal("internal server error")
    }
}

impl From<CommandError> for AppError {
    fn from(err: CommandError) -> Self {
        use axum::http::StatusCode;
        let message = err.to_string();
        match err {
            CommandError::NoTunnel => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "tunnel_unavailable", message)
            }
            CommandError::Overloaded => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "tunnel_overloaded", message)
            }
            CommandError::Timeout => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "tunnel_timeout", message)
            }
            CommandError::ChannelClosed | CommandError::Disconnected => {
                Self::new(StatusCode::BAD_GATEWAY, "tunnel_closed", message)
            }
            CommandError::Remote(_) => Self::new(StatusCode::BAD_GATEWAY, "agent_error", message),
            CommandError::Protocol(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "tunnel_protocol_error", message)
            }
        }
    }
}

impl From<FileTunnelError> for AppError {
    fn from(err: FileTunnelError) -> Self {
        use axum::http::StatusCode;
        let message = err.to_string();
        match err {
            FileTunnelError::Timeout => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "request_timeout", message)
            }
            FileTunnelError::Capacity { .. } => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, "node_at_capacity", message)
            }
            FileTunnelError::UploadTooLarge { .. } => {
                Self::new(StatusCode::PAYLOAD_TOO_LARGE, "upload_too_large", message)
            }
            FileTunnelError::Stopped => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "service_stopped", message)
            }
        }
    }
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        use axum::http::StatusCode;
        match err {
            TransferError::Config(_) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "storage_config",
                err.to_string(),
            ),
            TransferError::InvalidName(_) => AppError::bad_request(err.to_string()),
            TransferError::NotFound(_) => AppError::not_found(err.to_string()),
            TransferError::Command(inner) => inner.into(),
            TransferError::FileTunnel(inner) => inner.into(),
            TransferError::Backend(_) | TransferError::Io(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "backend_error", err.to_string())
            }
        }
    }
}
