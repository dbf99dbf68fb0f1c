//! End-to-end Ollama chat through the factory and facade against a mock server.

mod support;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer};

use infergate::error::ErrorKind;
use infergate::prelude::*;
use support::{mock_config, ndjson_response};

fn hello_world_lines() -> Vec<serde_json::Value> {
    let line = |text: &str| {
        json!({
            "model": "llama3.2",
            "created_at": "2024-05-01T10:00:00Z",
            "message": {"role": "assistant", "content": text},
            "done": false
        })
    };
    vec![
        line("Hello"),
        line(" world"),
        line("!"),
        json!({
            "model": "llama3.2",
            "created_at": "2024-05-01T10:00:01Z",
            "message": {"role": "assistant", "content": ""},
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 5,
            "eval_count": 10,
            "total_duration": 1234567
        }),
    ]
}

async fn client_for(server: &MockServer) -> ProviderClient {
    let provider = ProviderFactory::new()
        .create(&mock_config(ProviderType::Ollama, &server.uri()))
        .unwrap();
    ProviderClient::new(provider)
}

#[tokio::test]
async fn native_stream_yields_four_chunks_and_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"model": "llama3.2", "stream": true})))
        .respond_with(ndjson_response(&hello_world_lines()))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let mut stream = client
        .generate_chat_completion(
            &RequestContext::new(),
            GenerateOptions::new("llama3.2").message(ChatMessage::user("hi")),
        )
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await.unwrap() {
        chunks.push(chunk);
    }
    assert_eq!(chunks.len(), 4);
    let text: String = chunks.iter().map(|c| c.text()).collect();
    assert_eq!(text, "Hello world!");

    let last = chunks.last().unwrap();
    assert!(last.done);
    assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
    assert_eq!(last.usage, Some(Usage::new(5, 10)));
    assert_eq!(last.usage.unwrap().total_tokens, 15);

    // A drained stream stays at end-of-stream.
    assert!(stream.next().await.unwrap().is_none());

    let m = client.metrics();
    assert_eq!(m.requests, 1);
    assert_eq!(m.successes, 1);
    assert_eq!(m.prompt_tokens, 5);
    assert_eq!(m.completion_tokens, 10);
}

#[tokio::test]
async fn json_format_is_sent_as_string() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"format": "json"})))
        .respond_with(ndjson_response(&hello_world_lines()))
        .expect(1)
        .mount(&server)
        .await;

    let text = client_for(&server)
        .await
        .generate_chat_completion(
            &RequestContext::new(),
            GenerateOptions::new("llama3.2")
                .message(ChatMessage::user("give me json"))
                .response_format_raw("json"),
        )
        .await
        .unwrap()
        .collect_text()
        .await
        .unwrap();
    assert_eq!(text, "Hello world!");
}

#[tokio::test]
async fn schema_format_is_sent_as_object() {
    let schema = json!({
        "type": "object",
        "properties": {"city": {"type": "string"}},
        "required": ["city"]
    });
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"format": schema.clone()})))
        .respond_with(ndjson_response(&hello_world_lines()))
        .expect(1)
        .mount(&server)
        .await;

    client_for(&server)
        .await
        .generate_chat_completion(
            &RequestContext::new(),
            GenerateOptions::new("llama3.2")
                .message(ChatMessage::user("where?"))
                .response_format_raw(&schema.to_string()),
        )
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
}

#[tokio::test]
async fn cancelled_context_fails_before_sending() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ndjson_response(&hello_world_lines()))
        .expect(0)
        .mount(&server)
        .await;

    let ctx = RequestContext::new();
    ctx.cancel();
    let err = client_for(&server)
        .await
        .generate_chat_completion(
            &ctx,
            GenerateOptions::new("llama3.2").message(ChatMessage::user("hi")),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn missing_model_surfaces_not_found_with_context() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            wiremock::ResponseTemplate::new(404)
                .set_body_json(json!({"error": "model 'nope' not found"})),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = client
        .generate_chat_completion(
            &RequestContext::new(),
            GenerateOptions::new("nope").message(ChatMessage::user("hi")),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.provider(), Some("ollama"));
    assert_eq!(err.operation(), Some("chat"));
    assert_eq!(client.metrics().errors, 1);
}
