//! Device authorization grant (RFC 8628).

use std::time::Duration;

use serde::Deserialize;

use super::pkce::PkcePair;
use super::{OAuthEndpoints, TokenOutcome, token_request};
use crate::auth::credentials::TokenResponse;
use crate::context::RequestContext;
use crate::error::{LlmError, classify_http_error};
use crate::http::{HttpClient, HttpRequest};

pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Device authorization response (RFC 8628 §3.2).
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub interval: Option<u64>,
    /// Verifier paired with the challenge sent in the request, if any.
    #[serde(skip)]
    pub code_verifier: Option<String>,
}

impl DeviceAuthorization {
    /// URL to show the user, preferring the one with the code pre-filled.
    pub fn display_uri(&self) -> &str {
        self.verification_uri_complete
            .as_deref()
            .unwrap_or(&self.verification_uri)
    }
}

pub struct DeviceFlow<'a> {
    http: &'a HttpClient,
    endpoints: &'a OAuthEndpoints,
    slow_down_step: Duration,
}

impl<'a> DeviceFlow<'a> {
    pub fn new(http: &'a HttpClient, endpoints: &'a OAuthEndpoints) -> Self {
        Self {
            http,
            endpoints,
            slow_down_step: SLOW_DOWN_STEP,
        }
    }

    /// Interval increase applied on `slow_down`.
    pub fn with_slow_down_step(mut self, step: Duration) -> Self {
        self.slow_down_step = step;
        self
    }

    pub async fn request_code(&self, ctx: &RequestContext) -> Result<DeviceAuthorization, LlmError> {
        let Some(url) = &self.endpoints.device_code_url else {
            return Err(LlmError::ConfigurationError(
                "device flow requires a device_code_url".to_string(),
            ));
        };
        let scope = self.endpoints.scope_string();
        let pkce = self.endpoints.device_pkce.then(PkcePair::generate);
        let mut fields: Vec<(&str, &str)> = vec![("client_id", &self.endpoints.client_id)];
        if !scope.is_empty() {
            fields.push(("scope", &scope));
        }
        if let Some(p) = &pkce {
            fields.push(("code_challenge", &p.challenge));
            fields.push(("code_challenge_method", "S256"));
        }
        let req = HttpRequest::post_form(url, &fields);
        let response = self.http.send_unchecked(ctx, &req).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = ctx
            .run(async { response.text().await.map_err(LlmError::from) })
            .await?;
        if !status.is_success() {
            return Err(classify_http_error(
                self.http.provider_id(),
                status.as_u16(),
                &body,
                &headers,
            ));
        }
        let mut auth: DeviceAuthorization = serde_json::from_str(&body).map_err(|e| {
            LlmError::ParseError(format!("device authorization response: {e}"))
        })?;
        auth.code_verifier = pkce.map(|p| p.verifier);
        tracing::info!(
            target: "infergate::auth",
            verification_uri = %auth.verification_uri,
            expires_in = auth.expires_in,
            "device code issued"
        );
        Ok(auth)
    }

    /// Poll the token endpoint until the user approves, denies, or the code
    /// expires. Cancelling `ctx` stops polling.
    pub async fn poll(
        &self,
        ctx: &RequestContext,
        auth: &DeviceAuthorization,
    ) -> Result<TokenResponse, LlmError> {
        let mut interval = auth.interval.map_or(DEFAULT_INTERVAL, Duration::from_secs);
        // An unrepresentable lifetime means the code never expires on our side.
        let expires = tokio::time::Instant::now().checked_add(Duration::from_secs(auth.expires_in));
        let mut fields: Vec<(&str, &str)> = vec![
            ("grant_type", DEVICE_CODE_GRANT),
            ("device_code", &auth.device_code),
        ];
        if let Some(v) = &auth.code_verifier {
            fields.push(("code_verifier", v));
        }

        loop {
            if let Some(expires) = expires
                && tokio::time::Instant::now() + interval > expires
            {
                return Err(LlmError::TimeoutError(
                    "device code expired before authorization completed".to_string(),
                ));
            }
            ctx.sleep(interval).await?;

            match token_request(self.http, ctx, self.endpoints, &fields).await? {
                TokenOutcome::Granted(token) => {
                    tracing::info!(target: "infergate::auth", "device authorization granted");
                    return Ok(token);
                }
                TokenOutcome::Rejected(err) => match err.error.as_str() {
                    "authorization_pending" => {
                        tracing::debug!(target: "infergate::auth", "authorization pending");
                    }
                    "slow_down" => {
                        interval += self.slow_down_step;
                        tracing::debug!(target: "infergate::auth", interval_ms = interval.as_millis() as u64, "server asked to slow down");
                    }
                    _ => return Err(err.into_error()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpConfig;
    use secrecy::ExposeSecret;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Answers with a fixed sequence of bodies, repeating the last one.
    struct Sequence {
        calls: Arc<AtomicUsize>,
        replies: Vec<(u16, serde_json::Value)>,
    }

    impl Respond for Sequence {
        fn respond(&self, _req: &Request) -> ResponseTemplate {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let (status, body) = &self.replies[n.min(self.replies.len() - 1)];
            ResponseTemplate::new(*status).set_body_json(body.clone())
        }
    }

    fn endpoints(server: &MockServer) -> OAuthEndpoints {
        OAuthEndpoints::qwen("cid")
            .with_device_code_url(format!("{}/device/code", server.uri()))
            .with_token_url(format!("{}/token", server.uri()))
    }

    async fn mount_device_code(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/device/code"))
            .and(body_string_contains("code_challenge_method=S256"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "dev",
                "user_code": "ABCD-1234",
                "verification_uri": "https://example.test/activate",
                "expires_in": 60,
                "interval": 0
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn pending_then_slow_down_then_granted() {
        let server = MockServer::start().await;
        mount_device_code(&server).await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("device_code=dev"))
            .and(body_string_contains("code_verifier="))
            .respond_with(Sequence {
                calls: calls.clone(),
                replies: vec![
                    (400, json!({"error": "authorization_pending"})),
                    (400, json!({"error": "slow_down"})),
                    (200, json!({"access_token": "tok", "refresh_token": "ref", "expires_in": 3600})),
                ],
            })
            .mount(&server)
            .await;

        let http = HttpClient::new("qwen", HttpConfig::default()).unwrap();
        let ep = endpoints(&server);
        let flow = DeviceFlow::new(&http, &ep).with_slow_down_step(Duration::from_millis(10));
        let ctx = RequestContext::new();
        let auth = flow.request_code(&ctx).await.unwrap();
        assert_eq!(auth.user_code, "ABCD-1234");
        assert!(auth.code_verifier.is_some());

        let token = flow.poll(&ctx, &auth).await.unwrap();
        assert_eq!(token.access_token.expose_secret(), "tok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn access_denied_fails() {
        let server = MockServer::start().await;
        mount_device_code(&server).await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "access_denied"})))
            .mount(&server)
            .await;
        let http = HttpClient::new("qwen", HttpConfig::default()).unwrap();
        let ep = endpoints(&server);
        let flow = DeviceFlow::new(&http, &ep);
        let ctx = RequestContext::new();
        let auth = flow.request_code(&ctx).await.unwrap();
        let err = flow.poll(&ctx, &auth).await.unwrap_err();
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        let http = HttpClient::new("qwen", HttpConfig::default()).unwrap();
        let ep = OAuthEndpoints::qwen("cid").with_token_url("http://127.0.0.1:9/token");
        let flow = DeviceFlow::new(&http, &ep);
        let auth = DeviceAuthorization {
            device_code: "d".into(),
            user_code: "u".into(),
            verification_uri: "v".into(),
            verification_uri_complete: None,
            expires_in: 600,
            interval: Some(30),
            code_verifier: None,
        };
        let ctx = RequestContext::new();
        let c = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.cancel();
        });
        let err = flow.poll(&ctx, &auth).await.unwrap_err();
        assert!(matches!(err, LlmError::Cancelled));
    }
}
