use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("call session {0} not found")]
    SessionNotFound(Uuid),

    #[error("call session {0} is not answered")]
    SessionNotAnswered(Uuid),

    #[error("call session {0} already has an active supervision")]
    SupervisionInProgress(Uuid),

    #[error("supervision {0} not found")]
    SupervisionNotFound(Uuid),

    #[error("lead {lead_id} is already queued in campaign {campaign_id}")]
    AlreadyQueued { campaign_id: Uuid, lead_id: Uuid },

    #[error("campaign {0} not found")]
    CampaignNotFound(Uuid),

    #[error("queue item {0} not found")]
    QueueItemNotFound(Uuid),

    #[error("recording {0} not found")]
    RecordingNotFound(Uuid),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The provider refused or could not place the call. The session was persisted and failed.
    #[error("provider could not place call for session {session_id}: {reason}")]
    ProviderUnavailable { session_id: Uuid, reason: String },

    #[error("provider error: {0}")]
    Provider(String),

    /// The provider answered with a client error; repeating the request will not help.
    #[error("provider rejected request: {0}")]
    ProviderRejected(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Errors worth another attempt at the call site.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Provider(_) | AppError::Timeout(_) | AppError::Store(_)
        )
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::SessionNotFound(_)
            | AppError::SupervisionNotFound(_)
            | AppError::CampaignNotFound(_)
            | AppError::QueueItemNotFound(_)
            | AppError::RecordingNotFound(_) => StatusCode::NOT_FOUND,
            AppError::SessionNotAnswered(_)
            | AppError::SupervisionInProgress(_)
            | AppError::AlreadyQueued { .. } => StatusCode::CONFLICT,
            AppError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ProviderUnavailable { .. }
            | AppError::Provider(_)
            | AppError::ProviderRejected(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AppError::Timeout("provider request")
        } else {
            AppError::Provider(e.to_string())
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error=%self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub async fn handle_error(e: impl std::error::Error) {
    error!("ERROR: {e}")
}
