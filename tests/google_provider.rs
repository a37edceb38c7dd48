use futures_util::StreamExt;
use genai_gateway::embedding::EmbeddingModel;
use genai_gateway::model::LanguageModel;
use genai_gateway::providers::google::Google;
use genai_gateway::types::{
    ContentPart, FinishReason, GenerateRequest, Message, Role, StreamChunk, Usage,
};
use genai_gateway::GenaiError;
use httpmock::prelude::*;
use serde_json::json;

fn session(server: &MockServer) -> genai_gateway::Result<Google> {
    Google::new(reqwest::Client::new(), server.url("/v1beta"), "key-abc")
}

#[tokio::test]
async fn generate_posts_native_body_and_maps_response() -> genai_gateway::Result<()> {
    if genai_gateway::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/gemini-1.5-flash:generateContent")
                .header("x-goog-api-key", "key-abc")
                .json_body(json!({
                    "contents": [{ "role": "user", "parts": [{ "text": "hi" }] }],
                    "systemInstruction": { "parts": [{ "text": "be brief" }] },
                    "generationConfig": { "maxOutputTokens": 16 }
                }));
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "candidates": [{
                        "content": { "role": "model", "parts": [{ "text": "hello" }] },
                        "finishReason": "STOP"
                    }],
                    "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 1, "totalTokenCount": 4 }
                }));
        })
        .await;

    let mut request = GenerateRequest::new(
        "gemini-1.5-flash",
        vec![Message::system("be brief"), Message::user("hi")],
    );
    request.max_tokens = Some(16);
    let response = session(&server)?.generate(request).await?;

    mock.assert_async().await;
    assert_eq!(response.text(), "hello");
    assert_eq!(response.finish_reason, FinishReason::Stop);
    assert_eq!(
        response.usage,
        Usage {
            input_tokens: Some(3),
            output_tokens: Some(1),
            total_tokens: Some(4),
        }
    );
    Ok(())
}

#[tokio::test]
async fn generate_surfaces_backend_status_as_api_error() -> genai_gateway::Result<()> {
    if genai_gateway::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/gemini-pro:generateContent");
            then.status(429)
                .header("content-type", "application/json")
                .body(r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#);
        })
        .await;

    let err = session(&server)?
        .generate(GenerateRequest::new("gemini-pro", vec![Message::user("hi")]))
        .await
        .expect_err("rate limited");
    match err {
        GenaiError::Api {
            status,
            message,
            body,
        } => {
            assert_eq!(status.as_u16(), 429);
            assert!(body.contains("Quota exceeded"));
            assert!(message.contains("Quota exceeded"));
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn stream_parses_sse_chunks() -> genai_gateway::Result<()> {
    if genai_gateway::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let sse = concat!(
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\r\n\r\n",
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]}}]}\r\n\r\n",
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"functionCall\":{\"name\":\"add\",\"args\":{\"a\":1}}}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":1,\"candidatesTokenCount\":2,\"totalTokenCount\":3}}\r\n\r\n",
    );

    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/gemini-pro:streamGenerateContent")
                .query_param("alt", "sse")
                .header("x-goog-api-key", "key-abc");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse);
        })
        .await;

    let mut stream = session(&server)?
        .stream(GenerateRequest::new("gemini-pro", vec![Message::user("hi")]))
        .await?;
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk?);
    }

    mock.assert_async().await;
    let call_id = match &chunks[2] {
        StreamChunk::ToolCallStart { id, .. } => id.clone(),
        other => panic!("expected tool call start, got {other:?}"),
    };
    assert!(call_id.starts_with("call_"));
    assert_eq!(
        chunks,
        vec![
            StreamChunk::TextDelta {
                text: "Hel".to_string()
            },
            StreamChunk::TextDelta {
                text: "lo".to_string()
            },
            StreamChunk::ToolCallStart {
                id: call_id.clone(),
                name: "add".to_string()
            },
            StreamChunk::ToolCallDelta {
                id: call_id,
                arguments_delta: "{\"a\":1}".to_string()
            },
            StreamChunk::FinishReason(FinishReason::ToolCalls),
            StreamChunk::Usage(Usage {
                input_tokens: Some(1),
                output_tokens: Some(2),
                total_tokens: Some(3),
            }),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn stream_rejects_non_success_before_yielding() -> genai_gateway::Result<()> {
    if genai_gateway::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/gemini-pro:streamGenerateContent");
            then.status(403)
                .body(r#"{"error":{"code":403,"message":"API key not valid"}}"#);
        })
        .await;

    let result = session(&server)?
        .stream(GenerateRequest::new("gemini-pro", vec![Message::user("hi")]))
        .await;
    assert!(matches!(result, Err(GenaiError::Api { status, .. }) if status.as_u16() == 403));
    Ok(())
}

#[tokio::test]
async fn list_models_follows_page_tokens_and_strips_prefix() -> genai_gateway::Result<()> {
    if genai_gateway::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let server = MockServer::start_async().await;
    let first = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1beta/models")
                .query_param_missing("pageToken")
                .header("x-goog-api-key", "key-abc");
            then.status(200).json_body(json!({
                "models": [{ "name": "models/gemini-pro", "displayName": "Gemini Pro" }],
                "nextPageToken": "p2"
            }));
        })
        .await;
    let second = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1beta/models")
                .query_param("pageToken", "p2");
            then.status(200).json_body(json!({
                "models": [{ "name": "models/text-embedding-004" }]
            }));
        })
        .await;

    let models = session(&server)?.list_models().await?;

    first.assert_calls(1);
    second.assert_calls(1);
    let ids = models.iter().map(|m| m.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["gemini-pro", "text-embedding-004"]);
    assert_eq!(models[0].display_name.as_deref(), Some("Gemini Pro"));
    Ok(())
}

#[tokio::test]
async fn embed_batches_inputs_in_order() -> genai_gateway::Result<()> {
    if genai_gateway::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/text-embedding-004:batchEmbedContents")
                .json_body(json!({
                    "requests": [
                        { "model": "models/text-embedding-004", "content": { "parts": [{ "text": "a" }] } },
                        { "model": "models/text-embedding-004", "content": { "parts": [{ "text": "b" }] } },
                        { "model": "models/text-embedding-004", "content": { "parts": [{ "text": "c" }] } }
                    ]
                }));
            then.status(200).json_body(json!({
                "embeddings": [{ "values": [0.0] }, { "values": [1.0] }, { "values": [2.0] }]
            }));
        })
        .await;

    let vectors = session(&server)?
        .embed(
            "text-embedding-004",
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
        )
        .await?;

    mock.assert_async().await;
    assert_eq!(vectors, vec![vec![0.0], vec![1.0], vec![2.0]]);
    Ok(())
}

#[tokio::test]
async fn embed_single_input_uses_embed_content() -> genai_gateway::Result<()> {
    if genai_gateway::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/text-embedding-004:embedContent")
                .body_includes("\"text\":\"only\"");
            then.status(200)
                .json_body(json!({ "embedding": { "values": [0.25, 0.5] } }));
        })
        .await;

    let vector = session(&server)?
        .embed_single("text-embedding-004", "only".to_string())
        .await?;

    mock.assert_async().await;
    assert_eq!(vector, vec![0.25, 0.5]);
    Ok(())
}

#[tokio::test]
async fn embed_rejects_mismatched_result_count() -> genai_gateway::Result<()> {
    if genai_gateway::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/e:batchEmbedContents");
            then.status(200)
                .json_body(json!({ "embeddings": [{ "values": [1.0] }] }));
        })
        .await;

    let err = session(&server)?
        .embed("e", vec!["a".to_string(), "b".to_string()])
        .await
        .expect_err("count mismatch");
    assert!(matches!(err, GenaiError::InvalidResponse(_)));
    Ok(())
}

#[tokio::test]
async fn tool_round_trip_across_turns_sends_matching_function_names() -> genai_gateway::Result<()> {
    if genai_gateway::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let user = json!({ "role": "user", "parts": [{ "text": "weather then time" }] });
    let weather_call = json!({ "role": "model", "parts": [
        { "functionCall": { "name": "get_weather", "args": { "city": "Oslo" } } }
    ]});
    let weather_result = json!({ "role": "user", "parts": [
        { "functionResponse": { "name": "get_weather", "response": { "temp": 3 } } }
    ]});
    let time_call = json!({ "role": "model", "parts": [
        { "functionCall": { "name": "get_time", "args": {} } }
    ]});
    let time_result = json!({ "role": "user", "parts": [
        { "functionResponse": { "name": "get_time", "response": { "content": "noon" } } }
    ]});

    let server = MockServer::start_async().await;
    let mut turns = Vec::new();
    for (contents, reply) in [
        (
            vec![user.clone()],
            json!({ "parts": [{ "functionCall": { "name": "get_weather", "args": { "city": "Oslo" } } }] }),
        ),
        (
            vec![user.clone(), weather_call.clone(), weather_result.clone()],
            json!({ "parts": [{ "functionCall": { "name": "get_time", "args": {} } }] }),
        ),
        (
            vec![user, weather_call, weather_result, time_call, time_result],
            json!({ "parts": [{ "text": "3C at noon" }] }),
        ),
    ] {
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1beta/models/gemini-pro:generateContent")
                    .json_body(json!({ "contents": contents }));
                then.status(200).json_body(json!({
                    "candidates": [{ "content": reply, "finishReason": "STOP" }]
                }));
            })
            .await;
        turns.push(mock);
    }

    let google = session(&server)?;
    let mut messages = vec![Message::user("weather then time")];

    let first = google
        .generate(GenerateRequest::new("gemini-pro", messages.clone()))
        .await?;
    let weather_id = tool_call_id(&first.content);
    messages.push(Message {
        role: Role::Assistant,
        content: first.content,
    });
    messages.push(Message::tool_result(weather_id.clone(), "{\"temp\":3}"));

    let second = google
        .generate(GenerateRequest::new("gemini-pro", messages.clone()))
        .await?;
    let time_id = tool_call_id(&second.content);
    assert_ne!(weather_id, time_id);
    messages.push(Message {
        role: Role::Assistant,
        content: second.content,
    });
    messages.push(Message::tool_result(time_id, "noon"));

    let last = google
        .generate(GenerateRequest::new("gemini-pro", messages))
        .await?;
    assert_eq!(last.text(), "3C at noon");
    for mock in &turns {
        mock.assert_async().await;
    }
    Ok(())
}

fn tool_call_id(content: &[ContentPart]) -> String {
    content
        .iter()
        .find_map(|part| match part {
            ContentPart::ToolCall { id, .. } => Some(id.clone()),
            _ => None,
        })
        .expect("tool call in response")
}
