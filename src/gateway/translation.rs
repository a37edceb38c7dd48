//! OpenAI wire shapes <-> backend request/response types.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value, json};

use super::GatewayError;
use crate::types::{
    ContentPart, FinishReason, GenerateRequest, GenerateResponse, ImageSource, Message,
    ModelInfo, ResponseFormat, Role, StreamChunk, Tool, ToolChoice, Usage,
};

type ParseResult<T> = std::result::Result<T, String>;

pub const OWNED_BY: &str = "google";

/// A validated `/v1/chat/completions` body.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletionRequest {
    /// Model id exactly as the caller sent it; echoed back in responses.
    pub model: String,
    pub stream: bool,
    pub include_usage: bool,
    pub request: GenerateRequest,
}

/// A validated `/v1/embeddings` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: Vec<String>,
}

pub fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn generate_completion_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("chatcmpl-{ts_ms}-{seq}")
}

pub fn parse_json_body(body: &[u8]) -> Result<Value, GatewayError> {
    let value = serde_json::from_slice::<Value>(body)
        .map_err(|err| GatewayError::invalid_request(format!("invalid JSON body: {err}")))?;
    if !value.is_object() {
        return Err(GatewayError::invalid_request(
            "request body must be a JSON object",
        ));
    }
    Ok(value)
}

fn required_model(obj: &Map<String, Value>) -> ParseResult<String> {
    obj.get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| "missing field: model".to_string())
}

fn optional_f32(obj: &Map<String, Value>, key: &str) -> ParseResult<Option<f32>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(|v| Some(v as f32))
            .ok_or_else(|| format!("{key} must be a number")),
    }
}

fn optional_u32(obj: &Map<String, Value>, key: &str) -> ParseResult<Option<u32>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| format!("{key} must be a non-negative integer")),
    }
}

fn optional_bool(obj: &Map<String, Value>, key: &str) -> ParseResult<bool> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(value)) => Ok(*value),
        Some(_) => Err(format!("{key} must be a boolean")),
    }
}

pub fn chat_completions_request(body: &Value) -> Result<ChatCompletionRequest, GatewayError> {
    parse_chat_completions_request(body).map_err(GatewayError::InvalidRequest)
}

fn parse_chat_completions_request(body: &Value) -> ParseResult<ChatCompletionRequest> {
    let obj = body
        .as_object()
        .ok_or_else(|| "request body must be a JSON object".to_string())?;
    let model = required_model(obj)?;

    let raw_messages = obj
        .get("messages")
        .and_then(Value::as_array)
        .filter(|messages| !messages.is_empty())
        .ok_or_else(|| "missing field: messages".to_string())?;

    let mut messages = Vec::with_capacity(raw_messages.len());
    let mut known_call_ids = HashSet::<String>::new();
    for raw in raw_messages {
        let message = parse_openai_chat_message(raw)?;
        for part in &message.content {
            match part {
                ContentPart::ToolCall { id, .. } => {
                    known_call_ids.insert(id.clone());
                }
                ContentPart::ToolResult { tool_call_id, .. }
                    if !known_call_ids.contains(tool_call_id) =>
                {
                    return Err(format!(
                        "tool message references unknown tool_call_id: {tool_call_id}"
                    ));
                }
                _ => {}
            }
        }
        messages.push(message);
    }
    if !messages.iter().any(carries_turn_content) {
        return Err("request has no user or assistant content".to_string());
    }

    if let Some(n) = optional_u32(obj, "n")? {
        if n > 1 {
            return Err("n > 1 is not supported".to_string());
        }
    }

    let mut request = GenerateRequest::new(model.clone(), messages);
    request.temperature = optional_f32(obj, "temperature")?;
    request.top_p = optional_f32(obj, "top_p")?;
    request.max_tokens = match optional_u32(obj, "max_completion_tokens")? {
        Some(value) => Some(value),
        None => optional_u32(obj, "max_tokens")?,
    };
    request.presence_penalty = optional_f32(obj, "presence_penalty")?;
    request.frequency_penalty = optional_f32(obj, "frequency_penalty")?;
    request.seed = match obj.get("seed") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            value
                .as_i64()
                .ok_or_else(|| "seed must be an integer".to_string())?,
        ),
    };
    if let Some(stop) = obj.get("stop") {
        request.stop_sequences = parse_stop_sequences(stop)?;
    }
    if let Some(format) = obj.get("response_format").filter(|v| !v.is_null()) {
        request.response_format = Some(parse_response_format(format)?);
    }
    if let Some(tools) = obj.get("tools").filter(|v| !v.is_null()) {
        let tools = parse_openai_tools(tools)?;
        request.tools = (!tools.is_empty()).then_some(tools);
    }
    if let Some(choice) = obj.get("tool_choice").filter(|v| !v.is_null()) {
        request.tool_choice = Some(parse_openai_tool_choice(choice)?);
    }

    let stream = optional_bool(obj, "stream")?;
    let include_usage = match obj.get("stream_options").and_then(Value::as_object) {
        Some(options) => optional_bool(options, "include_usage")?,
        None => false,
    };

    Ok(ChatCompletionRequest {
        model,
        stream,
        include_usage,
        request,
    })
}

fn parse_openai_chat_message(message: &Value) -> ParseResult<Message> {
    let obj = message
        .as_object()
        .ok_or_else(|| "chat message must be an object".to_string())?;

    let role = obj
        .get("role")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "chat message missing role".to_string())?;
    let role = match role {
        "system" | "developer" => Role::System,
        "user" => Role::User,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        other => return Err(format!("unsupported role: {other}")),
    };

    if role == Role::Tool {
        let tool_call_id = obj
            .get("tool_call_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "tool message missing tool_call_id".to_string())?;
        let content = parse_openai_content_parts(obj.get("content").unwrap_or(&Value::Null))?
            .into_iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text),
                _ => None,
            })
            .collect::<String>();
        return Ok(Message::tool_result(tool_call_id, content));
    }

    let mut content = parse_openai_content_parts(obj.get("content").unwrap_or(&Value::Null))?;
    if role == Role::System
        && content
            .iter()
            .any(|part| !matches!(part, ContentPart::Text { .. }))
    {
        return Err("system messages only support text content".to_string());
    }
    if role == Role::Assistant {
        if let Some(calls) = obj.get("tool_calls").filter(|v| !v.is_null()) {
            let calls = calls
                .as_array()
                .ok_or_else(|| "tool_calls must be an array".to_string())?;
            for call in calls {
                content.push(parse_openai_tool_call(call)?);
            }
        }
    }

    Ok(Message { role, content })
}

/// True when the message becomes at least one backend turn part. System text is
/// hoisted out of the turn list and empty text is dropped.
fn carries_turn_content(message: &Message) -> bool {
    message.role != Role::System
        && message.content.iter().any(|part| match part {
            ContentPart::Text { text } => !text.is_empty(),
            _ => true,
        })
}

fn parse_openai_content_parts(value: &Value) -> ParseResult<Vec<ContentPart>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(text) => Ok(vec![ContentPart::Text { text: text.clone() }]),
        Value::Array(items) => items.iter().map(parse_openai_content_part).collect(),
        _ => Err("message content must be a string or an array of parts".to_string()),
    }
}

fn parse_openai_content_part(item: &Value) -> ParseResult<ContentPart> {
    let obj = item
        .as_object()
        .ok_or_else(|| "content part must be an object".to_string())?;
    match obj.get("type").and_then(Value::as_str).unwrap_or_default() {
        "text" => {
            let text = obj
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| "text content part missing text".to_string())?;
            Ok(ContentPart::Text {
                text: text.to_string(),
            })
        }
        "image_url" => {
            let url = obj
                .get("image_url")
                .and_then(|v| v.get("url").or(Some(v)))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| "image_url content part missing url".to_string())?;
            Ok(ContentPart::Image {
                source: parse_image_url(url)?,
            })
        }
        other => Err(format!("unsupported content part type: {other}")),
    }
}

/// `data:<mime>;base64,<payload>` URLs are inlined; anything else is passed by reference.
fn parse_image_url(url: &str) -> ParseResult<ImageSource> {
    let Some(rest) = url.strip_prefix("data:") else {
        return Ok(ImageSource::Url {
            url: url.to_string(),
        });
    };
    let (meta, data) = rest
        .split_once(',')
        .ok_or_else(|| "malformed data url".to_string())?;
    let media_type = meta
        .strip_suffix(";base64")
        .filter(|m| !m.is_empty())
        .ok_or_else(|| "data url must be base64 encoded with a media type".to_string())?;
    Ok(ImageSource::Base64 {
        media_type: media_type.to_string(),
        data: data.to_string(),
    })
}

fn parse_openai_tool_call(value: &Value) -> ParseResult<ContentPart> {
    let obj = value
        .as_object()
        .ok_or_else(|| "tool call must be an object".to_string())?;
    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "tool call missing id".to_string())?;
    let function = obj
        .get("function")
        .and_then(Value::as_object)
        .ok_or_else(|| "tool call missing function".to_string())?;
    let name = function
        .get("name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "tool call missing function.name".to_string())?;
    let arguments = match function.get("arguments") {
        None | Some(Value::Null) => json!({}),
        Some(Value::String(raw)) if raw.trim().is_empty() => json!({}),
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw)
            .map_err(|err| format!("tool call {id} has invalid JSON arguments: {err}"))?,
        Some(other) => other.clone(),
    };
    Ok(ContentPart::ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    })
}

fn parse_openai_tools(value: &Value) -> ParseResult<Vec<Tool>> {
    let items = value
        .as_array()
        .ok_or_else(|| "tools must be an array".to_string())?;

    let mut out = Vec::with_capacity(items.len());
    for tool in items {
        let obj = tool
            .as_object()
            .ok_or_else(|| "tool must be an object".to_string())?;
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("function");
        if kind != "function" {
            return Err(format!("unsupported tool type: {kind}"));
        }
        let function = obj
            .get("function")
            .and_then(Value::as_object)
            .ok_or_else(|| "tool missing function".to_string())?;
        let name = function
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "tool missing function.name".to_string())?;
        out.push(Tool {
            name: name.to_string(),
            description: function
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            parameters: function.get("parameters").cloned().unwrap_or(Value::Null),
        });
    }
    Ok(out)
}

fn parse_openai_tool_choice(value: &Value) -> ParseResult<ToolChoice> {
    match value {
        Value::String(choice) => match choice.as_str() {
            "auto" => Ok(ToolChoice::Auto),
            "none" => Ok(ToolChoice::None),
            "required" => Ok(ToolChoice::Required),
            other => Err(format!("unsupported tool_choice: {other}")),
        },
        Value::Object(obj) => obj
            .get("function")
            .and_then(|function| function.get("name"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|name| ToolChoice::Tool {
                name: name.to_string(),
            })
            .ok_or_else(|| "tool_choice missing function.name".to_string()),
        _ => Err("tool_choice must be a string or an object".to_string()),
    }
}

fn parse_stop_sequences(value: &Value) -> ParseResult<Option<Vec<String>>> {
    let stops = match value {
        Value::Null => Vec::new(),
        Value::String(stop) => vec![stop.clone()],
        Value::Array(values) => values
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| "stop must contain only strings".to_string())
            })
            .collect::<ParseResult<Vec<_>>>()?,
        _ => return Err("stop must be a string or an array of strings".to_string()),
    };
    let stops = stops
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    Ok((!stops.is_empty()).then_some(stops))
}

fn parse_response_format(value: &Value) -> ParseResult<ResponseFormat> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| "response_format missing type".to_string())?;
    match kind {
        "text" => Ok(ResponseFormat::Text),
        "json_object" => Ok(ResponseFormat::JsonObject),
        "json_schema" => {
            let schema = value
                .get("json_schema")
                .and_then(|v| v.get("schema"))
                .cloned()
                .ok_or_else(|| "response_format.json_schema.schema is required".to_string())?;
            Ok(ResponseFormat::JsonSchema { schema })
        }
        other => Err(format!("unsupported response_format type: {other}")),
    }
}

pub fn embeddings_request(body: &Value) -> Result<EmbeddingRequest, GatewayError> {
    parse_embeddings_request(body).map_err(GatewayError::InvalidRequest)
}

fn parse_embeddings_request(body: &Value) -> ParseResult<EmbeddingRequest> {
    let obj = body
        .as_object()
        .ok_or_else(|| "request body must be a JSON object".to_string())?;
    let model = required_model(obj)?;
    let input = match obj.get("input") {
        Some(Value::String(text)) => vec![text.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| "input must be a string or an array of strings".to_string())
            })
            .collect::<ParseResult<Vec<_>>>()?,
        None | Some(Value::Null) => Vec::new(),
        Some(_) => return Err("input must be a string or an array of strings".to_string()),
    };
    if input.is_empty() {
        return Err("missing field: input".to_string());
    }
    Ok(EmbeddingRequest { model, input })
}

fn finish_reason_to_chat_finish_reason(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Length => "length",
        FinishReason::ToolCalls => "tool_calls",
        FinishReason::ContentFilter => "content_filter",
        FinishReason::Stop | FinishReason::Error | FinishReason::Unknown => "stop",
    }
}

fn usage_to_chat_usage(usage: &Usage) -> Value {
    let prompt = usage.input_tokens.unwrap_or_default();
    let completion = usage.output_tokens.unwrap_or_default();
    let total = usage
        .total_tokens
        .unwrap_or_else(|| prompt.saturating_add(completion));
    json!({
        "prompt_tokens": prompt,
        "completion_tokens": completion,
        "total_tokens": total,
    })
}

fn tool_call_to_openai(id: &str, name: &str, arguments: &Value) -> Value {
    json!({
        "id": id,
        "type": "function",
        "function": { "name": name, "arguments": arguments.to_string() },
    })
}

pub fn generate_response_to_chat_completion(
    response: &GenerateResponse,
    id: &str,
    model: &str,
    created: u64,
) -> Value {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for part in &response.content {
        match part {
            ContentPart::Text { text: chunk } => text.push_str(chunk),
            ContentPart::ToolCall {
                id,
                name,
                arguments,
            } => tool_calls.push(tool_call_to_openai(id, name, arguments)),
            ContentPart::Image { .. } | ContentPart::ToolResult { .. } => {}
        }
    }

    let mut message = Map::new();
    message.insert("role".to_string(), Value::String("assistant".to_string()));
    let content = if text.is_empty() && !tool_calls.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    };
    message.insert("content".to_string(), content);
    if !tool_calls.is_empty() {
        message.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }

    let mut out = Map::new();
    out.insert("id".to_string(), Value::String(id.to_string()));
    out.insert(
        "object".to_string(),
        Value::String("chat.completion".to_string()),
    );
    out.insert("created".to_string(), Value::from(created));
    out.insert("model".to_string(), Value::String(model.to_string()));
    out.insert(
        "choices".to_string(),
        json!([{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish_reason_to_chat_finish_reason(response.finish_reason),
        }]),
    );
    let usage = &response.usage;
    if usage.input_tokens.is_some() || usage.output_tokens.is_some() {
        out.insert("usage".to_string(), usage_to_chat_usage(usage));
    }
    Value::Object(out)
}

/// Turns backend stream chunks into serialized `chat.completion.chunk` objects.
///
/// The first emitted delta carries `role: assistant`; tool calls keep the index they
/// were first seen at; [`ChatChunkEncoder::finish`] yields the closing finish-reason
/// chunk and, when requested, a usage-only chunk.
#[derive(Debug)]
pub struct ChatChunkEncoder {
    id: String,
    model: String,
    created: u64,
    include_usage: bool,
    role_sent: bool,
    tool_call_index: HashMap<String, usize>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

impl ChatChunkEncoder {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: u64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            include_usage: false,
            role_sent: false,
            tool_call_index: HashMap::new(),
            finish_reason: None,
            usage: None,
        }
    }

    pub fn with_usage(mut self, include_usage: bool) -> Self {
        self.include_usage = include_usage;
        self
    }

    fn envelope(&self, choices: Value, usage: Option<Value>) -> String {
        let mut out = Map::new();
        out.insert("id".to_string(), Value::String(self.id.clone()));
        out.insert(
            "object".to_string(),
            Value::String("chat.completion.chunk".to_string()),
        );
        out.insert("created".to_string(), Value::from(self.created));
        out.insert("model".to_string(), Value::String(self.model.clone()));
        out.insert("choices".to_string(), choices);
        if let Some(usage) = usage {
            out.insert("usage".to_string(), usage);
        }
        Value::Object(out).to_string()
    }

    fn delta_chunk(&mut self, mut delta: Map<String, Value>, finish: Option<FinishReason>) -> String {
        if !self.role_sent {
            self.role_sent = true;
            delta.insert("role".to_string(), Value::String("assistant".to_string()));
        }
        let finish_reason = finish
            .map(|reason| Value::String(finish_reason_to_chat_finish_reason(reason).to_string()))
            .unwrap_or(Value::Null);
        self.envelope(
            json!([{ "index": 0, "delta": Value::Object(delta), "finish_reason": finish_reason }]),
            None,
        )
    }

    fn call_index(&mut self, id: &str) -> usize {
        let next = self.tool_call_index.len();
        *self.tool_call_index.entry(id.to_string()).or_insert(next)
    }

    pub fn push(&mut self, chunk: StreamChunk) -> Option<String> {
        match chunk {
            StreamChunk::TextDelta { text } => {
                if text.is_empty() {
                    return None;
                }
                let mut delta = Map::new();
                delta.insert("content".to_string(), Value::String(text));
                Some(self.delta_chunk(delta, None))
            }
            StreamChunk::ToolCallStart { id, name } => {
                let index = self.call_index(&id);
                let mut delta = Map::new();
                delta.insert(
                    "tool_calls".to_string(),
                    json!([{
                        "index": index,
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": "" },
                    }]),
                );
                Some(self.delta_chunk(delta, None))
            }
            StreamChunk::ToolCallDelta {
                id,
                arguments_delta,
            } => {
                if arguments_delta.is_empty() {
                    return None;
                }
                let index = self.call_index(&id);
                let mut delta = Map::new();
                delta.insert(
                    "tool_calls".to_string(),
                    json!([{ "index": index, "function": { "arguments": arguments_delta } }]),
                );
                Some(self.delta_chunk(delta, None))
            }
            StreamChunk::FinishReason(reason) => {
                self.finish_reason = Some(reason);
                None
            }
            StreamChunk::Usage(usage) => {
                self.usage = Some(usage);
                None
            }
        }
    }

    pub fn finish(&mut self) -> Vec<String> {
        let reason = self.finish_reason.take().unwrap_or(FinishReason::Stop);
        let mut out = vec![self.delta_chunk(Map::new(), Some(reason))];
        if self.include_usage {
            let usage = self.usage.take().unwrap_or_default();
            out.push(self.envelope(json!([]), Some(usage_to_chat_usage(&usage))));
        }
        out
    }
}

pub fn model_to_openai(id: &str) -> Value {
    json!({ "id": id, "object": "model", "owned_by": OWNED_BY })
}

pub fn models_list_to_openai(models: &[ModelInfo]) -> Value {
    let data = models
        .iter()
        .map(|model| model_to_openai(&model.id))
        .collect::<Vec<_>>();
    json!({ "object": "list", "data": data })
}

pub fn embeddings_to_openai_response(embeddings: Vec<Vec<f32>>, model: &str) -> Value {
    let data = embeddings
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| {
            let embedding = embedding
                .into_iter()
                .map(|v| {
                    serde_json::Number::from_f64(f64::from(v))
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                })
                .collect::<Vec<_>>();
            json!({ "object": "embedding", "index": index, "embedding": embedding })
        })
        .collect::<Vec<_>>();
    json!({
        "object": "list",
        "data": data,
        "model": model,
        "usage": { "prompt_tokens": 0, "total_tokens": 0 },
    })
}
