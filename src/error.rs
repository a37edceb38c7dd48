use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenaiError {
    /// Non-2xx answer from the backend. `message` is Google's `error.message` when the
    /// body carries one, otherwise the trimmed body.
    #[error("backend returned {status}: {message}")]
    Api {
        status: StatusCode,
        message: String,
        body: String,
    },
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected backend response: {0}")]
    InvalidResponse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
}

impl GenaiError {
    pub fn api(status: StatusCode, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = google_error_message(&body)
            .or_else(|| Some(body.trim().to_string()).filter(|text| !text.is_empty()))
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("backend request failed")
                    .to_string()
            });
        Self::Api {
            status,
            message,
            body,
        }
    }
}

fn google_error_message(body: &str) -> Option<String> {
    let value = serde_json::from_str::<Value>(body).ok()?;
    value
        .pointer("/error/message")?
        .as_str()
        .map(str::to_string)
}

pub type Result<T> = std::result::Result<T, GenaiError>;
