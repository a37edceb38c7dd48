use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::Deserialize;
use serde_json::json;

use super::genai::{self, CallIds, GenerateContentResponse};
use crate::embedding::EmbeddingModel;
use crate::model::{LanguageModel, StreamResult};
use crate::session::{Connector, Session};
use crate::types::{
    ContentPart, GenerateRequest, GenerateResponse, ModelInfo, StreamChunk, Usage,
};
use crate::{GenaiError, Result};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const LIST_MODELS_PAGE_SIZE: u32 = 1000;

/// Builds per-credential [`Google`] sessions over one shared connection pool.
#[derive(Clone)]
pub struct GoogleConnector {
    http: reqwest::Client,
    base_url: String,
}

impl GoogleConnector {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }
}

impl Connector for GoogleConnector {
    fn connect(&self, credential: &str) -> Result<Arc<dyn Session>> {
        let session = Google::new(self.http.clone(), self.base_url.clone(), credential)?;
        Ok(Arc::new(session))
    }
}

/// A Gemini session bound to one caller's API key.
#[derive(Clone)]
pub struct Google {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl Google {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(GenaiError::InvalidRequest(
                "google api key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        self.url(&format!("{}:{method}", genai::model_path(model)))
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                tracing::debug!(%status, error = %err, "failed to read backend error body");
                String::new()
            }
        };
        Err(GenaiError::api(status, body))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListModelsResponse {
    #[serde(default)]
    models: Vec<NativeModel>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NativeModel {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SingleEmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    #[serde(default)]
    values: Vec<f32>,
}

/// Per-stream bookkeeping for the incremental decoder.
struct StreamState {
    events: BoxStream<'static, Result<String>>,
    pending: VecDeque<Result<StreamChunk>>,
    call_ids: CallIds,
    has_tool_calls: bool,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    done: bool,
}

impl StreamState {
    fn absorb(&mut self, data: &str) -> Result<()> {
        let chunk = serde_json::from_str::<GenerateContentResponse>(data)?;
        if let Some(metadata) = chunk.usage_metadata.as_ref() {
            self.usage = Some(Usage::from(metadata));
        }
        let Some(candidate) = chunk.first_candidate() else {
            return Ok(());
        };
        if let Some(reason) = candidate.finish_reason.as_deref() {
            self.finish_reason = Some(reason.to_string());
        }
        for part in genai::candidate_parts(candidate, &mut self.call_ids) {
            match part {
                ContentPart::Text { text } => {
                    self.pending.push_back(Ok(StreamChunk::TextDelta { text }));
                }
                ContentPart::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    self.has_tool_calls = true;
                    self.pending.push_back(Ok(StreamChunk::ToolCallStart {
                        id: id.clone(),
                        name,
                    }));
                    self.pending.push_back(Ok(StreamChunk::ToolCallDelta {
                        id,
                        arguments_delta: arguments.to_string(),
                    }));
                }
                ContentPart::Image { .. } | ContentPart::ToolResult { .. } => {}
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.done = true;
        let reason = genai::map_finish_reason(self.finish_reason.as_deref(), self.has_tool_calls);
        self.pending.push_back(Ok(StreamChunk::FinishReason(reason)));
        if let Some(usage) = self.usage.take() {
            self.pending.push_back(Ok(StreamChunk::Usage(usage)));
        }
    }
}

#[async_trait]
impl LanguageModel for Google {
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut builder = self
                .http
                .get(self.url("models"))
                .query(&[("pageSize", LIST_MODELS_PAGE_SIZE.to_string())]);
            if let Some(token) = page_token.as_deref() {
                builder = builder.query(&[("pageToken", token)]);
            }
            let page = self.send(builder).await?.json::<ListModelsResponse>().await?;
            out.extend(page.models.into_iter().map(|model| ModelInfo {
                id: model
                    .name
                    .strip_prefix("models/")
                    .unwrap_or(&model.name)
                    .to_string(),
                display_name: model.display_name,
            }));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => return Ok(out),
            }
        }
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let body = genai::generate_body(&request)?;
        let builder = self
            .http
            .post(self.model_url(&request.model, "generateContent"))
            .json(&body);
        let parsed = self
            .send(builder)
            .await?
            .json::<GenerateContentResponse>()
            .await?;

        let mut call_ids = CallIds::new();
        let candidate = parsed.first_candidate();
        let content = candidate
            .map(|c| genai::candidate_parts(c, &mut call_ids))
            .unwrap_or_default();
        let has_tool_calls = content
            .iter()
            .any(|part| matches!(part, ContentPart::ToolCall { .. }));
        let finish_reason = genai::map_finish_reason(
            candidate.and_then(|c| c.finish_reason.as_deref()),
            has_tool_calls,
        );
        let usage = parsed
            .usage_metadata
            .as_ref()
            .map(Usage::from)
            .unwrap_or_default();

        Ok(GenerateResponse {
            content,
            finish_reason,
            usage,
        })
    }

    async fn stream(&self, request: GenerateRequest) -> Result<StreamResult> {
        let body = genai::generate_body(&request)?;
        let builder = self
            .http
            .post(self.model_url(&request.model, "streamGenerateContent"))
            .query(&[("alt", "sse")])
            .header("Accept", "text/event-stream")
            .json(&body);
        let response = self.send(builder).await?;

        let state = StreamState {
            events: crate::utils::sse::sse_data_stream_from_response(response),
            pending: VecDeque::new(),
            call_ids: CallIds::new(),
            has_tool_calls: false,
            finish_reason: None,
            usage: None,
            done: false,
        };

        let chunks = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.done {
                    return None;
                }
                match state.events.next().await {
                    Some(Ok(data)) => {
                        if let Err(err) = state.absorb(&data) {
                            state.done = true;
                            state.pending.push_back(Err(err));
                        }
                    }
                    Some(Err(err)) => {
                        state.done = true;
                        state.pending.push_back(Err(err));
                    }
                    None => state.finish(),
                }
            }
        });

        Ok(Box::pin(chunks))
    }
}

#[async_trait]
impl EmbeddingModel for Google {
    async fn embed(&self, model: &str, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let expected = texts.len();
        let model_path = genai::model_path(model);

        let vectors = if let [text] = texts.as_slice() {
            let builder = self
                .http
                .post(self.model_url(model, "embedContent"))
                .json(&json!({
                    "model": model_path,
                    "content": { "parts": [{ "text": text }] }
                }));
            let parsed = self
                .send(builder)
                .await?
                .json::<SingleEmbedResponse>()
                .await?;
            vec![parsed.embedding.values]
        } else {
            let requests = texts
                .iter()
                .map(|text| {
                    json!({
                        "model": model_path,
                        "content": { "parts": [{ "text": text }] }
                    })
                })
                .collect::<Vec<_>>();
            let builder = self
                .http
                .post(self.model_url(model, "batchEmbedContents"))
                .json(&json!({ "requests": requests }));
            let parsed = self
                .send(builder)
                .await?
                .json::<BatchEmbedResponse>()
                .await?;
            parsed.embeddings.into_iter().map(|e| e.values).collect()
        };

        if vectors.len() != expected {
            return Err(GenaiError::InvalidResponse(format!(
                "google returned {} embeddings for {expected} inputs",
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}
