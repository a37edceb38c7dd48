//! Outbound Server-Sent-Events framing.
//!
//! Payloads handed to [`Event`] are usually pre-framed (`data: {...}`); the encoder
//! rewrites embedded newlines into `data:` continuation lines so one payload always
//! stays one event, escapes carriage returns, and terminates the event with a blank
//! line only when the payload carries its own `data` prefix.

use axum::http::HeaderMap;
use axum::http::header::{self, HeaderValue};
use bytes::Bytes;

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    data: String,
}

impl Event {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }

    /// A pre-framed `data: <payload>` event.
    pub fn data(payload: &str) -> Self {
        Self::new(format!("data: {payload}"))
    }

    pub fn done() -> Self {
        Self::data(DONE_SENTINEL)
    }

    pub fn encode(&self) -> Bytes {
        let mut out = String::with_capacity(self.data.len() + 2);
        for ch in self.data.chars() {
            match ch {
                '\n' => out.push_str("\ndata:"),
                '\r' => out.push_str("\\r"),
                other => out.push(other),
            }
        }
        if self.data.starts_with("data") {
            out.push_str("\n\n");
        }
        Bytes::from(out)
    }
}

/// Sets the event-stream response headers. An existing `Cache-Control` is left alone.
pub fn apply_event_stream_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    if !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::TRANSFER_ENCODING,
        HeaderValue::from_static("chunked"),
    );
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
}
