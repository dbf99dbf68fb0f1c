//! Building a gateway from a YAML document and persisting OAuth credentials.

mod support;

use chrono::{TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use infergate::auth::CredentialStore;
use infergate::prelude::*;
use infergate::{ErrorKind, OAuthCredential};

fn document(uri: &str) -> String {
    format!(
        r#"
providers:
  local:
    type: ollama
    base_url: {uri}
    default_model: llama3.2
  claude:
    type: anthropic
    base_url: {uri}
    api_key: sk-ant-test
    options:
      anthropic_version: "2023-06-01"
"#
    )
}

#[tokio::test]
async fn gateway_routes_by_section_and_tracks_metrics() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/version"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "0.5.1"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant-test"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;

    let app = AppConfig::from_yaml(&document(&server.uri())).unwrap();
    let gateway = Gateway::from_config(&ProviderFactory::new(), &app).unwrap();
    assert_eq!(gateway.keys().collect::<Vec<_>>(), vec!["claude", "local"]);

    let ctx = RequestContext::new();
    let local = gateway.client("local").unwrap();
    let health = local.health_check(&ctx).await.unwrap();
    assert!(health.healthy);
    assert_eq!(health.version.as_deref(), Some("0.5.1"));
    assert_eq!(local.provider().default_model(), "llama3.2");

    assert!(gateway.client("claude").unwrap().health_check(&ctx).await.unwrap().healthy);

    let metrics = gateway.metrics();
    assert_eq!(metrics["local"].requests, 1);
    assert_eq!(metrics["local"].successes, 1);
    assert_eq!(metrics["claude"].successes, 1);

    let err = gateway.client("missing").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn credentials_persist_atomically_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    let store = CredentialStore::new(&path);

    let credential = OAuthCredential {
        id: "personal".into(),
        client_id: "client-1".into(),
        client_secret: None,
        access_token: SecretString::from("access-1".to_string()),
        refresh_token: Some(SecretString::from("refresh-1".to_string())),
        expires_at: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        scopes: vec!["openid".into()],
    };
    store
        .save_credential("gem", &ProviderType::Gemini, &credential)
        .unwrap();

    let mut rotated = credential.clone();
    rotated.access_token = SecretString::from("access-2".to_string());
    store
        .save_credential("gem", &ProviderType::Gemini, &rotated)
        .unwrap();

    let loaded = store.credentials("gem").unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].access_token.expose_secret(), "access-2");

    // Only the canonical file remains; the temp file was renamed over it.
    let names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(names, vec!["config.yaml".to_string()]);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let app = AppConfig::load(&path).unwrap();
    let section = app.provider("gem").unwrap();
    assert_eq!(section.provider_type, ProviderType::Gemini);
    assert_eq!(section.effective_auth_mode(), infergate::AuthMode::OAuth);
}
