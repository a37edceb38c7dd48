#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, Response};
use futures_util::StreamExt;
use genai_gateway::embedding::EmbeddingModel;
use genai_gateway::gateway::{GatewayConfig, GatewayState, router};
use genai_gateway::model::{LanguageModel, StreamResult};
use genai_gateway::session::{Connector, Session};
use genai_gateway::types::{
    ContentPart, FinishReason, GenerateRequest, GenerateResponse, ModelInfo, StreamChunk, Usage,
};
use genai_gateway::{GenaiError, Result};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    RateLimited,
    Broken,
    FailMidStream,
}

#[derive(Default)]
pub struct Calls {
    pub connects: AtomicUsize,
    pub credentials: Mutex<Vec<String>>,
    pub models: Mutex<Vec<String>>,
}

impl Calls {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_model(&self) -> Option<String> {
        self.models.lock().ok()?.last().cloned()
    }
}

pub struct FakeConnector {
    pub behavior: Behavior,
    pub calls: Arc<Calls>,
}

impl Connector for FakeConnector {
    fn connect(&self, credential: &str) -> Result<Arc<dyn Session>> {
        self.calls.connects.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut credentials) = self.calls.credentials.lock() {
            credentials.push(credential.to_string());
        }
        Ok(Arc::new(FakeSession {
            behavior: self.behavior,
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct FakeSession {
    behavior: Behavior,
    calls: Arc<Calls>,
}

impl FakeSession {
    fn record(&self, model: &str) {
        if let Ok(mut models) = self.calls.models.lock() {
            models.push(model.to_string());
        }
    }

    fn fail(&self) -> Option<GenaiError> {
        match self.behavior {
            Behavior::RateLimited => Some(GenaiError::api(
                reqwest::StatusCode::TOO_MANY_REQUESTS,
                r#"{"error":{"code":429,"message":"Resource has been exhausted"}}"#,
            )),
            Behavior::Broken => Some(GenaiError::InvalidResponse(
                "backend returned garbage".to_string(),
            )),
            Behavior::Succeed | Behavior::FailMidStream => None,
        }
    }
}

#[async_trait]
impl LanguageModel for FakeSession {
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        if let Some(err) = self.fail() {
            return Err(err);
        }
        Ok(vec![
            ModelInfo {
                id: "gemini-pro".to_string(),
                display_name: None,
            },
            ModelInfo {
                id: "text-embedding-004".to_string(),
                display_name: None,
            },
        ])
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        self.record(&request.model);
        if let Some(err) = self.fail() {
            return Err(err);
        }
        Ok(GenerateResponse {
            content: vec![ContentPart::Text {
                text: "hello".to_string(),
            }],
            finish_reason: FinishReason::Stop,
            usage: Usage {
                input_tokens: Some(1),
                output_tokens: Some(2),
                total_tokens: Some(3),
            },
        })
    }

    async fn stream(&self, request: GenerateRequest) -> Result<StreamResult> {
        self.record(&request.model);
        if let Some(err) = self.fail() {
            return Err(err);
        }
        let mut chunks = vec![
            Ok(StreamChunk::TextDelta {
                text: "hel".to_string(),
            }),
            Ok(StreamChunk::TextDelta {
                text: "lo\nworld".to_string(),
            }),
        ];
        if self.behavior == Behavior::FailMidStream {
            chunks.push(Err(GenaiError::api(
                reqwest::StatusCode::SERVICE_UNAVAILABLE,
                r#"{"error":{"code":503,"message":"The model is overloaded"}}"#,
            )));
        } else {
            chunks.push(Ok(StreamChunk::FinishReason(FinishReason::Stop)));
            chunks.push(Ok(StreamChunk::Usage(Usage {
                input_tokens: Some(4),
                output_tokens: Some(5),
                total_tokens: Some(9),
            })));
        }
        Ok(futures_util::stream::iter(chunks).boxed())
    }
}

#[async_trait]
impl EmbeddingModel for FakeSession {
    async fn embed(&self, model: &str, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        self.record(model);
        if let Some(err) = self.fail() {
            return Err(err);
        }
        // Encode each input's first byte so callers can check ordering.
        Ok(texts
            .iter()
            .map(|text| vec![f32::from(text.as_bytes().first().copied().unwrap_or_default())])
            .collect())
    }
}

pub fn app(behavior: Behavior) -> (Router, Arc<Calls>) {
    app_with_config(behavior, GatewayConfig::default())
}

pub fn app_with_config(behavior: Behavior, config: GatewayConfig) -> (Router, Arc<Calls>) {
    let calls = Arc::new(Calls::default());
    let connector = FakeConnector {
        behavior,
        calls: Arc::clone(&calls),
    };
    (
        router(GatewayState::new(Arc::new(connector), config)),
        calls,
    )
}

pub fn post_json(path: &str, body: impl Into<String>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("authorization", "Bearer sk-test")
        .header("content-type", "application/json")
        .body(Body::from(body.into()))
        .expect("request")
}

pub fn get(path: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("authorization", "Bearer sk-test")
        .body(Body::empty())
        .expect("request")
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf8")
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_text(response).await).expect("json body")
}

/// Splits an SSE body into the payloads of its events, joining continuation lines.
pub fn sse_payloads(raw: &str) -> Vec<String> {
    raw.split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| {
            frame
                .lines()
                .map(|line| {
                    line.strip_prefix("data: ")
                        .or_else(|| line.strip_prefix("data:"))
                        .unwrap_or(line)
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect()
}
