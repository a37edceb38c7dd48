//! Conversion between the crate's request types and the Gemini REST wire shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::{Map, Number, Value, json};

use crate::types::{
    ContentPart, FinishReason, GenerateRequest, ImageSource, Message, ResponseFormat, Role, Tool,
    ToolChoice, Usage,
};
use crate::{GenaiError, Result};

/// Schema keys the Gemini `Schema` object accepts; everything else is dropped.
const SCHEMA_KEYS: &[&str] = &[
    "type",
    "format",
    "title",
    "description",
    "nullable",
    "enum",
    "required",
    "minItems",
    "maxItems",
    "minLength",
    "maxLength",
    "pattern",
    "minimum",
    "maximum",
    "minProperties",
    "maxProperties",
    "propertyOrdering",
];

pub(crate) fn model_path(model: &str) -> String {
    let model = model.trim();
    if model.starts_with("models/") || model.starts_with("tunedModels/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

static CALL_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Mints tool-call ids for one backend response. Gemini assigns none, so every
/// response gets its own prefix and ids stay distinct across conversation turns.
#[derive(Debug)]
pub(crate) struct CallIds {
    prefix: String,
    next: u64,
}

impl CallIds {
    pub(crate) fn new() -> Self {
        let seq = CALL_ID_SEQ.fetch_add(1, Ordering::Relaxed);
        let ts_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .unwrap_or(0);
        Self::with_prefix(format!("call_{ts_ms:x}{seq:04x}"))
    }

    pub(crate) fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 0,
        }
    }

    fn mint(&mut self) -> String {
        let id = format!("{}_{}", self.prefix, self.next);
        self.next = self.next.saturating_add(1);
        id
    }
}

fn image_part(source: &ImageSource) -> Value {
    match source {
        ImageSource::Url { url } => json!({
            "fileData": { "mimeType": guess_image_mime(url), "fileUri": url }
        }),
        ImageSource::Base64 { media_type, data } => json!({
            "inlineData": { "mimeType": media_type, "data": data }
        }),
    }
}

fn guess_image_mime(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else if path.ends_with(".heic") {
        "image/heic"
    } else {
        "image/jpeg"
    }
}

/// Pushes `parts` as a turn for `role`, merging into the previous turn when it has the same role.
fn push_turn(contents: &mut Vec<Value>, role: &str, parts: Vec<Value>) {
    if parts.is_empty() {
        return;
    }
    if let Some(last) = contents.last_mut() {
        if last.get("role").and_then(Value::as_str) == Some(role) {
            if let Some(existing) = last.get_mut("parts").and_then(Value::as_array_mut) {
                existing.extend(parts);
                return;
            }
        }
    }
    contents.push(json!({ "role": role, "parts": parts }));
}

/// Converts messages into `(contents, systemInstruction)`. Message order is preserved.
pub(crate) fn convert_messages(messages: &[Message]) -> Result<(Vec<Value>, Option<Value>)> {
    // Call id -> function name, updated as turns are walked so a result binds to the
    // closest preceding call with that id.
    let mut tool_names = HashMap::<&str, &str>::new();
    let mut system_texts = Vec::<String>::new();
    let mut contents = Vec::<Value>::new();

    for message in messages {
        match message.role {
            Role::System => {
                let mut text = String::new();
                for part in &message.content {
                    match part {
                        ContentPart::Text { text: chunk } => text.push_str(chunk),
                        other => {
                            return Err(GenaiError::InvalidRequest(format!(
                                "system messages only support text content, got {other:?}"
                            )));
                        }
                    }
                }
                if !text.trim().is_empty() {
                    system_texts.push(text);
                }
            }
            Role::User => {
                let mut parts = Vec::new();
                for part in &message.content {
                    match part {
                        ContentPart::Text { text } if text.is_empty() => {}
                        ContentPart::Text { text } => parts.push(json!({ "text": text })),
                        ContentPart::Image { source } => parts.push(image_part(source)),
                        other => {
                            return Err(GenaiError::InvalidRequest(format!(
                                "unsupported user content part: {other:?}"
                            )));
                        }
                    }
                }
                push_turn(&mut contents, "user", parts);
            }
            Role::Assistant => {
                let mut parts = Vec::new();
                for part in &message.content {
                    match part {
                        ContentPart::Text { text } if text.is_empty() => {}
                        ContentPart::Text { text } => parts.push(json!({ "text": text })),
                        ContentPart::ToolCall {
                            id,
                            name,
                            arguments,
                        } => {
                            tool_names.insert(id.as_str(), name.as_str());
                            parts.push(json!({
                                "functionCall": { "name": name, "args": arguments }
                            }));
                        }
                        other => {
                            return Err(GenaiError::InvalidRequest(format!(
                                "unsupported assistant content part: {other:?}"
                            )));
                        }
                    }
                }
                push_turn(&mut contents, "model", parts);
            }
            Role::Tool => {
                let mut parts = Vec::new();
                for part in &message.content {
                    let ContentPart::ToolResult {
                        tool_call_id,
                        content,
                    } = part
                    else {
                        return Err(GenaiError::InvalidRequest(format!(
                            "unsupported tool content part: {part:?}"
                        )));
                    };
                    let Some(name) = tool_names.get(tool_call_id.as_str()) else {
                        return Err(GenaiError::InvalidRequest(format!(
                            "tool message references unknown tool_call_id: {tool_call_id}"
                        )));
                    };
                    let response = serde_json::from_str::<Value>(content)
                        .ok()
                        .filter(Value::is_object)
                        .unwrap_or_else(|| json!({ "content": content }));
                    parts.push(json!({
                        "functionResponse": { "name": name, "response": response }
                    }));
                }
                push_turn(&mut contents, "user", parts);
            }
        }
    }

    let system_instruction = (!system_texts.is_empty()).then(|| {
        json!({
            "parts": system_texts
                .into_iter()
                .map(|text| json!({ "text": text }))
                .collect::<Vec<_>>()
        })
    });

    Ok((contents, system_instruction))
}

/// Rewrites a JSON schema into the OpenAPI subset Gemini accepts. Returns `None` for
/// schemas that carry no constraint (null, or an empty root object).
pub(crate) fn sanitize_schema(schema: &Value, is_root: bool) -> Option<Value> {
    let input = match schema {
        Value::Null => return None,
        Value::Bool(_) => return Some(json!({ "type": "boolean" })),
        Value::Object(input) => input,
        other => return Some(other.clone()),
    };

    let mut out = Map::new();
    for key in SCHEMA_KEYS {
        if let Some(value) = input.get(*key) {
            out.insert((*key).to_string(), value.clone());
        }
    }

    if let Some(Value::Array(types)) = input.get("type") {
        let non_null = types
            .iter()
            .filter_map(Value::as_str)
            .filter(|t| *t != "null")
            .collect::<Vec<_>>();
        if non_null.len() < types.len() {
            out.insert("nullable".to_string(), Value::Bool(true));
        }
        match non_null.as_slice() {
            [] => {
                out.remove("type");
            }
            [single] => {
                out.insert("type".to_string(), Value::String((*single).to_string()));
            }
            many => {
                out.remove("type");
                let any_of = many.iter().map(|t| json!({ "type": t })).collect();
                out.insert("anyOf".to_string(), Value::Array(any_of));
            }
        }
    }

    if let Some(value) = input.get("const") {
        out.insert("enum".to_string(), Value::Array(vec![value.clone()]));
    }

    if let Some(properties) = input.get("properties").and_then(Value::as_object) {
        let mapped = properties
            .iter()
            .map(|(key, value)| {
                let value = sanitize_schema(value, false).unwrap_or_else(|| json!({}));
                (key.clone(), value)
            })
            .collect::<Map<_, _>>();
        if mapped.is_empty() && is_root {
            return None;
        }
        out.insert("properties".to_string(), Value::Object(mapped));
    } else if is_root && input.get("type").and_then(Value::as_str) == Some("object") {
        return None;
    }

    if let Some(items) = input.get("items") {
        if let Some(items) = sanitize_schema(items, false) {
            out.insert("items".to_string(), items);
        }
    }

    for key in ["anyOf", "oneOf"] {
        let Some(variants) = input.get(key).and_then(Value::as_array) else {
            continue;
        };
        let nullable = variants
            .iter()
            .any(|v| v.get("type").and_then(Value::as_str) == Some("null"));
        let mut mapped = variants
            .iter()
            .filter(|v| v.get("type").and_then(Value::as_str) != Some("null"))
            .filter_map(|v| sanitize_schema(v, false))
            .collect::<Vec<_>>();
        if nullable {
            out.insert("nullable".to_string(), Value::Bool(true));
        }
        if mapped.len() == 1 {
            if let Some(Value::Object(single)) = mapped.pop() {
                out.extend(single);
            }
        } else if !mapped.is_empty() {
            out.insert("anyOf".to_string(), Value::Array(mapped));
        }
    }

    Some(Value::Object(out))
}

fn tool_declaration(tool: &Tool) -> Value {
    let mut out = Map::new();
    out.insert("name".to_string(), Value::String(tool.name.clone()));
    if let Some(description) = tool.description.as_deref() {
        out.insert(
            "description".to_string(),
            Value::String(description.to_string()),
        );
    }
    if let Some(parameters) = sanitize_schema(&tool.parameters, true) {
        out.insert("parameters".to_string(), parameters);
    }
    Value::Object(out)
}

fn tool_config(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!({ "functionCallingConfig": { "mode": "AUTO" } }),
        ToolChoice::None => json!({ "functionCallingConfig": { "mode": "NONE" } }),
        ToolChoice::Required => json!({ "functionCallingConfig": { "mode": "ANY" } }),
        ToolChoice::Tool { name } => json!({
            "functionCallingConfig": { "mode": "ANY", "allowedFunctionNames": [name] }
        }),
    }
}

fn number(value: f32) -> Option<Value> {
    Number::from_f64(f64::from(value)).map(Value::Number)
}

fn generation_config(request: &GenerateRequest) -> Map<String, Value> {
    let mut config = Map::new();
    if let Some(value) = request.temperature.and_then(number) {
        config.insert("temperature".to_string(), value);
    }
    if let Some(value) = request.top_p.and_then(number) {
        config.insert("topP".to_string(), value);
    }
    if let Some(max_tokens) = request.max_tokens {
        config.insert("maxOutputTokens".to_string(), Value::from(max_tokens));
    }
    if let Some(stop) = request.stop_sequences.as_ref().filter(|s| !s.is_empty()) {
        config.insert("stopSequences".to_string(), json!(stop));
    }
    if let Some(value) = request.presence_penalty.and_then(number) {
        config.insert("presencePenalty".to_string(), value);
    }
    if let Some(value) = request.frequency_penalty.and_then(number) {
        config.insert("frequencyPenalty".to_string(), value);
    }
    if let Some(seed) = request.seed {
        config.insert("seed".to_string(), Value::from(seed));
    }
    match request.response_format.as_ref() {
        None | Some(ResponseFormat::Text) => {}
        Some(ResponseFormat::JsonObject) => {
            config.insert(
                "responseMimeType".to_string(),
                Value::String("application/json".to_string()),
            );
        }
        Some(ResponseFormat::JsonSchema { schema }) => {
            config.insert(
                "responseMimeType".to_string(),
                Value::String("application/json".to_string()),
            );
            if let Some(schema) = sanitize_schema(schema, true) {
                config.insert("responseSchema".to_string(), schema);
            }
        }
    }
    config
}

/// Builds the `generateContent` / `streamGenerateContent` body.
pub(crate) fn generate_body(request: &GenerateRequest) -> Result<Value> {
    let (contents, system_instruction) = convert_messages(&request.messages)?;
    if contents.is_empty() {
        return Err(GenaiError::InvalidRequest(
            "request has no user or assistant content".to_string(),
        ));
    }

    let mut body = Map::new();
    body.insert("contents".to_string(), Value::Array(contents));
    if let Some(system_instruction) = system_instruction {
        body.insert("systemInstruction".to_string(), system_instruction);
    }

    let config = generation_config(request);
    if !config.is_empty() {
        body.insert("generationConfig".to_string(), Value::Object(config));
    }

    if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
        let declarations = tools.iter().map(tool_declaration).collect::<Vec<_>>();
        body.insert(
            "tools".to_string(),
            json!([{ "functionDeclarations": declarations }]),
        );
    }
    if let Some(choice) = request.tool_choice.as_ref() {
        body.insert("toolConfig".to_string(), tool_config(choice));
    }

    Ok(Value::Object(body))
}

pub(crate) fn map_finish_reason(finish_reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    match finish_reason {
        Some("STOP") if has_tool_calls => FinishReason::ToolCalls,
        Some("STOP") => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some(
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" | "IMAGE_SAFETY",
        ) => FinishReason::ContentFilter,
        Some("MALFORMED_FUNCTION_CALL") => FinishReason::Error,
        None if has_tool_calls => FinishReason::ToolCalls,
        _ => FinishReason::Unknown,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<u64>,
    #[serde(default)]
    candidates_token_count: Option<u64>,
    #[serde(default)]
    total_token_count: Option<u64>,
}

impl From<&UsageMetadata> for Usage {
    fn from(value: &UsageMetadata) -> Self {
        let mut usage = Usage {
            input_tokens: value.prompt_token_count,
            output_tokens: value.candidates_token_count,
            total_tokens: value.total_token_count,
        };
        usage.merge_total();
        usage
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentResponse {
    #[serde(default)]
    pub(crate) candidates: Vec<Candidate>,
    #[serde(default)]
    pub(crate) usage_metadata: Option<UsageMetadata>,
}

impl GenerateContentResponse {
    pub(crate) fn first_candidate(&self) -> Option<&Candidate> {
        self.candidates.first()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Candidate {
    #[serde(default)]
    pub(crate) content: Option<CandidateContent>,
    #[serde(default)]
    pub(crate) finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CandidateContent {
    #[serde(default)]
    pub(crate) parts: Vec<Value>,
}

/// Extracts text and function-call parts in order. Call ids are minted from `call_ids`
/// because Gemini does not assign them.
pub(crate) fn candidate_parts(candidate: &Candidate, call_ids: &mut CallIds) -> Vec<ContentPart> {
    let Some(content) = candidate.content.as_ref() else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for part in &content.parts {
        if part.get("thought").and_then(Value::as_bool) == Some(true) {
            continue;
        }
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            if !text.is_empty() {
                out.push(ContentPart::Text {
                    text: text.to_string(),
                });
            }
            continue;
        }
        if let Some(call) = part.get("functionCall") {
            let Some(name) = call.get("name").and_then(Value::as_str) else {
                continue;
            };
            out.push(ContentPart::ToolCall {
                id: call_ids.mint(),
                name: name.to_string(),
                arguments: call.get("args").cloned().unwrap_or_else(|| json!({})),
            });
        }
    }
    out
}
