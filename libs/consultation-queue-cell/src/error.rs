use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;

use crate::models::QueueItemStatus;

/// Error taxonomy of the consultation queue engine. Every kind maps to one
/// stable machine-readable code; nothing here is retried internally, and a
/// rejected transition leaves state unchanged.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Queue item not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Transition not allowed from status {status}: {detail}")]
    InvalidState {
        status: QueueItemStatus,
        detail: String,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment is pending for this entry")]
    PaymentRequired,

    #[error("The payment window for this entry has expired")]
    PaymentWindowExpired,

    #[error("Outside the waiting-room window ({opens_at} to {closes_at})")]
    OutOfWindow {
        opens_at: DateTime<Utc>,
        closes_at: DateTime<Utc>,
    },

    #[error("Emergency broadcast exceeds the maximum of {max} candidate doctors")]
    TooManyCandidates { max: usize },

    #[error("Emergency broadcast limit reached, resets at {reset_at}")]
    EmergencyLimitReached {
        reset_at: DateTime<Utc>,
        retry_after_seconds: i64,
    },

    #[error("Store error: {0}")]
    Store(String),
}

impl QueueError {
    /// Stable machine-readable code, independent of transport.
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::InvalidArgument(_) => "invalid_argument",
            QueueError::NotFound(_) => "not_found",
            QueueError::Forbidden(_) => "forbidden",
            QueueError::InvalidState { .. } => "invalid_state",
            QueueError::Conflict(_) => "conflict",
            QueueError::PaymentRequired => "payment_required",
            QueueError::PaymentWindowExpired => "payment_window_expired",
            QueueError::OutOfWindow { .. } => "out_of_window",
            QueueError::TooManyCandidates { .. } => "too_many_candidates",
            QueueError::EmergencyLimitReached { .. } => "emergency_limit_reached",
            QueueError::Store(_) => "store_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            QueueError::InvalidArgument(_) | QueueError::TooManyCandidates { .. } => {
                StatusCode::BAD_REQUEST
            }
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::Forbidden(_) => StatusCode::FORBIDDEN,
            QueueError::InvalidState { .. } | QueueError::Conflict(_) => StatusCode::CONFLICT,
            QueueError::PaymentRequired | QueueError::PaymentWindowExpired => {
                StatusCode::PAYMENT_REQUIRED
            }
            QueueError::OutOfWindow { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            QueueError::EmergencyLimitReached { .. } => StatusCode::TOO_MANY_REQUESTS,
            QueueError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for QueueError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!("Queue error: {}: {}", status, message);
        } else {
            tracing::debug!("Queue error: {}: {}", status, message);
        }

        let mut error = json!({
            "code": self.code(),
            "message": message,
        });

        match &self {
            QueueError::EmergencyLimitReached {
                reset_at,
                retry_after_seconds,
            } => {
                error["reset_at"] = json!(reset_at);
                error["retry_after_seconds"] = json!(retry_after_seconds);
            }
            QueueError::OutOfWindow { opens_at, closes_at } => {
                error["opens_at"] = json!(opens_at);
                error["closes_at"] = json!(closes_at);
            }
            QueueError::InvalidState { status, .. } => {
                error["current_status"] = json!(status);
            }
            _ => {}
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}
