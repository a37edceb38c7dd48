use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use super::GatewayError;
use super::config::GatewayConfig;
use super::relay::relay_chat_stream;
use super::sse::apply_event_stream_headers;
use super::translation::{
    self, ChatChunkEncoder, generate_completion_id, now_epoch_seconds,
};
use crate::embedding::EmbeddingModel;
use crate::model::LanguageModel;
use crate::session::{Connector, Session};

const WELCOME_MESSAGE: &str = "Welcome to the OpenAI API! Documentation is available at https://platform.openai.com/docs/api-reference";

#[derive(Clone)]
pub struct GatewayState {
    connector: Arc<dyn Connector>,
    config: Arc<GatewayConfig>,
}

impl GatewayState {
    pub fn new(connector: Arc<dyn Connector>, config: GatewayConfig) -> Self {
        Self {
            connector,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn connect(&self, credential: &str) -> Result<Arc<dyn Session>, GatewayError> {
        Ok(self.connector.connect(credential)?)
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        .route("/v1/models", get(handle_models_list))
        .route("/v1/models/:model", get(handle_models_retrieve))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/embeddings", post(handle_embeddings))
        .route("/models", get(handle_models_list))
        .route("/models/:model", get(handle_models_retrieve))
        .route("/chat/completions", post(handle_chat_completions))
        .route("/embeddings", post(handle_embeddings))
        .with_state(state)
}

/// Extracts the caller credential from `Authorization: Bearer <token>`.
fn extract_bearer(headers: &HeaderMap) -> Result<String, GatewayError> {
    let malformed = || GatewayError::invalid_request("missing or malformed Authorization header");
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .ok_or_else(malformed)?;
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .ok_or_else(malformed)?;
    rest.split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(malformed)
}

async fn read_json_body(body: Body, max_bytes: usize) -> Result<Value, GatewayError> {
    let bytes = to_bytes(body, max_bytes)
        .await
        .map_err(|_| GatewayError::OpenAi {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            kind: "invalid_request_error",
            message: format!("request body exceeds {max_bytes} bytes"),
        })?;
    translation::parse_json_body(&bytes)
}

async fn handle_index() -> Response {
    (
        StatusCode::MISDIRECTED_REQUEST,
        Json(json!({ "message": WELCOME_MESSAGE })),
    )
        .into_response()
}

async fn handle_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn handle_models_list(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let credential = extract_bearer(&headers)?;
    let session = state.connect(&credential)?;
    let models = session.list_models().await?;
    Ok(Json(translation::models_list_to_openai(&models)).into_response())
}

async fn handle_models_retrieve(
    State(state): State<GatewayState>,
    Path(model): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let credential = extract_bearer(&headers)?;
    let session = state.connect(&credential)?;
    let models = session.list_models().await?;

    let wanted = state.config().resolve_model(&model);
    let wanted = wanted.strip_prefix("models/").unwrap_or(wanted);
    if !models.iter().any(|m| m.id == wanted) {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Model not found" })),
        )
            .into_response());
    }
    Ok(Json(translation::model_to_openai(&model)).into_response())
}

async fn handle_chat_completions(
    State(state): State<GatewayState>,
    req: Request<Body>,
) -> Result<Response, GatewayError> {
    let (parts, body) = req.into_parts();
    let credential = extract_bearer(&parts.headers)?;
    let body = read_json_body(body, state.config().max_body_bytes).await?;
    let parsed = translation::chat_completions_request(&body)?;

    let mut request = parsed.request;
    request.model = state.config().resolve_model(&parsed.model).to_string();
    tracing::info!(
        model = %parsed.model,
        backend_model = %request.model,
        stream = parsed.stream,
        messages = request.messages.len(),
        "chat completion"
    );

    let session = state.connect(&credential)?;
    let id = generate_completion_id();
    let created = now_epoch_seconds();

    if !parsed.stream {
        let response = session.generate(request).await?;
        let body = translation::generate_response_to_chat_completion(
            &response,
            &id,
            &parsed.model,
            created,
        );
        return Ok(Json(body).into_response());
    }

    // Open the backend stream before committing to a 200 so early failures keep their status.
    let upstream = session.stream(request).await?;
    let encoder =
        ChatChunkEncoder::new(id, parsed.model, created).with_usage(parsed.include_usage);
    let body = relay_chat_stream(upstream, encoder, session);

    let mut response = Response::new(Body::from_stream(body));
    apply_event_stream_headers(response.headers_mut());
    Ok(response)
}

async fn handle_embeddings(
    State(state): State<GatewayState>,
    req: Request<Body>,
) -> Result<Response, GatewayError> {
    let (parts, body) = req.into_parts();
    let credential = extract_bearer(&parts.headers)?;
    let body = read_json_body(body, state.config().max_body_bytes).await?;
    let parsed = translation::embeddings_request(&body)?;

    let backend_model = state.config().resolve_model(&parsed.model).to_string();
    tracing::info!(
        model = %parsed.model,
        backend_model = %backend_model,
        inputs = parsed.input.len(),
        "embeddings"
    );

    let session = state.connect(&credential)?;
    let embeddings = session.embed(&backend_model, parsed.input).await?;
    Ok(Json(translation::embeddings_to_openai_response(
        embeddings,
        &parsed.model,
    ))
    .into_response())
}
