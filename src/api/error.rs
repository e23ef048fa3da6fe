//! Mapping of domain errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::error;

use crate::pipeline::SubmissionError;
use crate::release::ReleaseError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error(transparent)]
    Release(#[from] ReleaseError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Submission(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Release(e) => match e {
                ReleaseError::Invalid(_) => StatusCode::BAD_REQUEST,
                ReleaseError::NotFound(_) => StatusCode::NOT_FOUND,
                ReleaseError::Forbidden { .. } => StatusCode::FORBIDDEN,
                ReleaseError::InvalidTransition { .. }
                | ReleaseError::Incomplete { .. }
                | ReleaseError::GateFailed { .. }
                | ReleaseError::NoQcReport
                | ReleaseError::Stale { .. } => StatusCode::CONFLICT,
                ReleaseError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn body(&self) -> Value {
        let mut body = json!({ "error": self.to_string() });
        let code = match self {
            ApiError::Submission(_) => "invalid_submission",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Internal(_) => "internal",
            ApiError::Release(e) => e.code(),
        };
        body["code"] = json!(code);

        if let ApiError::Release(e) = self {
            match e {
                ReleaseError::GateFailed { gate, .. } => body["gate"] = json!(gate),
                ReleaseError::Incomplete { missing } => body["missing"] = json!(missing),
                ReleaseError::Forbidden { permission } => body["permission"] = json!(permission),
                ReleaseError::InvalidTransition { from, .. } => body["status"] = json!(from),
                ReleaseError::Stale { expected } => body["expected"] = json!(expected),
                _ => {}
            }
        }
        body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %format!("{self:#}"), "request failed");
            // Internal details stay in the log.
            return (status, Json(json!({ "error": "internal error", "code": "internal" })))
                .into_response();
        }
        (status, Json(self.body())).into_response()
    }
}
