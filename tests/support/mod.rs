//! Shared helpers for the integration tests: mock response bodies and configs.

#![allow(dead_code)]

use serde_json::Value;
use wiremock::ResponseTemplate;

use infergate::config::{ProviderConfig, ProviderType};

/// One JSON value per line.
pub fn ndjson(lines: &[Value]) -> String {
    lines.iter().map(|l| format!("{l}\n")).collect()
}

/// `data:` frames separated by blank lines.
pub fn sse(frames: &[&str]) -> String {
    frames.iter().map(|f| format!("data: {f}\n\n")).collect()
}

pub fn ndjson_response(lines: &[Value]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "application/x-ndjson")
        .set_body_string(ndjson(lines))
}

pub fn sse_response(frames: &[&str]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(sse(frames))
}

/// Config for `ty` pointed at a mock server, with a dummy key where one is needed.
pub fn mock_config(ty: ProviderType, uri: &str) -> ProviderConfig {
    let cfg = ProviderConfig::new(ty.clone()).with_base_url(uri);
    match ty {
        ProviderType::Ollama => cfg,
        _ => cfg.with_api_key("test-key"),
    }
}
