use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::GenaiError;

/// The single error envelope sent to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u16,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Caller input: bad credential, malformed body, unsupported role.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Already shaped for the caller; passes through unchanged.
    #[error("{kind} ({status}): {message}")]
    OpenAi {
        status: StatusCode,
        kind: &'static str,
        message: String,
    },
    /// Non-2xx answer from the backend.
    #[error("backend error ({status}): {message}")]
    Backend { status: StatusCode, message: String },
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn normalize(&self) -> ApiError {
        let api_error = match self {
            Self::InvalidRequest(message) => ApiError {
                code: StatusCode::BAD_REQUEST.as_u16(),
                message: message.clone(),
                kind: "invalid_request_error".to_string(),
            },
            Self::OpenAi {
                status,
                kind,
                message,
            } => ApiError {
                code: status.as_u16(),
                message: message.clone(),
                kind: (*kind).to_string(),
            },
            Self::Backend { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS => ApiError {
                code: status.as_u16(),
                message: "Rate limit exceeded".to_string(),
                kind: "rate_limit_error".to_string(),
            },
            Self::Backend { status, message } => ApiError {
                code: status.as_u16(),
                message: message.clone(),
                kind: "server_error".to_string(),
            },
            Self::Internal(message) => ApiError {
                code: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                message: message.clone(),
                kind: "server_error".to_string(),
            },
        };
        tracing::warn!(
            code = api_error.code,
            kind = %api_error.kind,
            error = %self,
            "request failed"
        );
        api_error
    }
}

impl From<GenaiError> for GatewayError {
    fn from(err: GenaiError) -> Self {
        match err {
            GenaiError::Api { status, message, .. } => Self::Backend { status, message },
            GenaiError::InvalidRequest(message) => Self::InvalidRequest(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let api_error = self.normalize();
        (api_error.status(), Json(api_error)).into_response()
    }
}
