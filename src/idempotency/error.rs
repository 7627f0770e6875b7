//! Caller-visible idempotency failures and their HTTP rendering.

use thiserror::Error;

use super::fingerprint::TokenError;
use crate::{Response, StatusCode};

/// A request rejected by the idempotency layer. The handler did not run.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("{header} header is required for this operation")]
    MissingToken { header: String },

    #[error("invalid idempotency key: {0}")]
    InvalidToken(#[from] TokenError),

    #[error("idempotency key was already used with a different request payload")]
    PayloadMismatch,

    #[error("a request with this idempotency key is still being processed; retry later")]
    InProgress,

    #[error("idempotency store is unavailable")]
    StoreUnavailable,
}

/// Coarse classification of an [`IdempotencyError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request cannot be accepted as sent: a malformed token, or a
    /// protected request that cannot be deduplicated right now.
    Caller,
    /// The token collides with another attempt.
    Conflict,
}

impl IdempotencyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingToken { .. } | Self::InvalidToken(_) | Self::StoreUnavailable => {
                ErrorKind::Caller
            }
            Self::PayloadMismatch | Self::InProgress => ErrorKind::Conflict,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Caller => StatusCode::BadRequest,
            ErrorKind::Conflict => StatusCode::Conflict,
        }
    }

    /// Stable machine-readable code, sent as the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken { .. } => "IDEMPOTENCY_KEY_REQUIRED",
            Self::InvalidToken(_) => "IDEMPOTENCY_KEY_INVALID",
            Self::PayloadMismatch => "IDEMPOTENCY_KEY_REUSED",
            Self::InProgress => "IDEMPOTENCY_IN_PROGRESS",
            Self::StoreUnavailable => "IDEMPOTENCY_UNAVAILABLE",
        }
    }

    /// Render as `{"statusCode", "error", "message"}`.
    pub fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "statusCode": status.as_u16(),
            "error": self.code(),
            "message": self.to_string(),
        });
        Response::json(status, &body)
    }
}
