//! OAuth 2.0 endpoints and token exchange.

pub mod device;
pub mod pkce;

use secrecy::{ExposeSecret, SecretString};

use super::credentials::{OAuthErrorResponse, TokenResponse};
use crate::config::{ProviderConfig, ProviderType};
use crate::context::RequestContext;
use crate::error::{LlmError, classify_http_error};
use crate::http::{HttpClient, HttpRequest};

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GEMINI_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];

pub const QWEN_DEVICE_CODE_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/device/code";
pub const QWEN_TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
pub const QWEN_SCOPES: &[&str] = &["openid", "profile", "email", "model.completion"];

/// Where and as whom to run an OAuth flow.
#[derive(Clone)]
pub struct OAuthEndpoints {
    pub client_id: String,
    pub client_secret: Option<SecretString>,
    pub auth_url: Option<String>,
    pub token_url: String,
    pub device_code_url: Option<String>,
    pub scopes: Vec<String>,
    /// Send a PKCE challenge with the device-code request (Qwen requires it).
    pub device_pkce: bool,
}

impl std::fmt::Debug for OAuthEndpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthEndpoints")
            .field("client_id", &self.client_id)
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("device_code_url", &self.device_code_url)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

impl OAuthEndpoints {
    /// Google authorization-code endpoints used for Gemini.
    pub fn gemini(client_id: impl Into<String>, client_secret: Option<SecretString>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            auth_url: Some(GOOGLE_AUTH_URL.to_string()),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            device_code_url: None,
            scopes: GEMINI_SCOPES.iter().map(|s| s.to_string()).collect(),
            device_pkce: false,
        }
    }

    /// Qwen device-code endpoints.
    pub fn qwen(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            auth_url: None,
            token_url: QWEN_TOKEN_URL.to_string(),
            device_code_url: Some(QWEN_DEVICE_CODE_URL.to_string()),
            scopes: QWEN_SCOPES.iter().map(|s| s.to_string()).collect(),
            device_pkce: true,
        }
    }

    /// Endpoints for refreshing the credentials of `config`. The provider's
    /// preset applies unless `options.token_url` overrides it.
    pub fn for_provider(
        config: &ProviderConfig,
        client_id: &str,
        client_secret: Option<SecretString>,
    ) -> Result<Self, LlmError> {
        let mut endpoints = match &config.provider_type {
            ProviderType::Gemini => Self::gemini(client_id, client_secret),
            ProviderType::Qwen => Self::qwen(client_id),
            other => {
                let Some(token_url) = config.option_str("token_url") else {
                    return Err(LlmError::ConfigurationError(format!(
                        "provider type '{other}' has no OAuth preset; set options.token_url"
                    )));
                };
                Self {
                    client_id: client_id.to_string(),
                    client_secret,
                    auth_url: config.option_str("auth_url").map(str::to_string),
                    token_url: token_url.to_string(),
                    device_code_url: config.option_str("device_code_url").map(str::to_string),
                    scopes: Vec::new(),
                    device_pkce: false,
                }
            }
        };
        if let Some(url) = config.option_str("token_url") {
            endpoints.token_url = url.to_string();
        }
        Ok(endpoints)
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    pub fn with_auth_url(mut self, url: impl Into<String>) -> Self {
        self.auth_url = Some(url.into());
        self
    }

    pub fn with_device_code_url(mut self, url: impl Into<String>) -> Self {
        self.device_code_url = Some(url.into());
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    /// Client credentials appended to every token request.
    fn client_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![("client_id", self.client_id.clone())];
        if let Some(secret) = &self.client_secret
            && !secret.expose_secret().is_empty()
        {
            fields.push(("client_secret", secret.expose_secret().to_string()));
        }
        fields
    }
}

/// Outcome of one token endpoint call.
#[derive(Debug)]
pub enum TokenOutcome {
    Granted(TokenResponse),
    Rejected(OAuthErrorResponse),
}

/// POST `fields` plus the client credentials to the token endpoint.
pub async fn token_request(
    http: &HttpClient,
    ctx: &RequestContext,
    endpoints: &OAuthEndpoints,
    fields: &[(&str, &str)],
) -> Result<TokenOutcome, LlmError> {
    let client = endpoints.client_fields();
    let mut all: Vec<(&str, &str)> = fields.to_vec();
    all.extend(client.iter().map(|(k, v)| (*k, v.as_str())));
    let req = HttpRequest::post_form(&endpoints.token_url, &all);

    let response = http.send_unchecked(ctx, &req).await?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = ctx
        .run(async { response.text().await.map_err(LlmError::from) })
        .await?;

    if status.is_success() {
        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::ParseError(format!("token endpoint returned malformed JSON: {e}"))
        })?;
        return Ok(TokenOutcome::Granted(token));
    }
    match serde_json::from_str::<OAuthErrorResponse>(&body) {
        Ok(err) => Ok(TokenOutcome::Rejected(err)),
        Err(_) => Err(classify_http_error(
            http.provider_id(),
            status.as_u16(),
            &body,
            &headers,
        )),
    }
}

/// Exchange a refresh token for a new access token.
pub async fn refresh_token(
    http: &HttpClient,
    ctx: &RequestContext,
    endpoints: &OAuthEndpoints,
    refresh_token: &SecretString,
) -> Result<TokenResponse, LlmError> {
    let fields = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token.expose_secret()),
    ];
    match token_request(http, ctx, endpoints, &fields).await? {
        TokenOutcome::Granted(token) => Ok(token),
        TokenOutcome::Rejected(err) => Err(LlmError::AuthenticationError(format!(
            "token refresh failed: {}",
            err.describe()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpConfig;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn unknown_provider_needs_token_url() {
        let cfg = ProviderConfig::new(ProviderType::OpenAi);
        assert!(OAuthEndpoints::for_provider(&cfg, "c", None).is_err());
        let cfg = cfg.with_option("token_url", serde_json::json!("https://idp/token"));
        let e = OAuthEndpoints::for_provider(&cfg, "c", None).unwrap();
        assert_eq!(e.token_url, "https://idp/token");
    }

    #[tokio::test]
    async fn refresh_posts_form_and_parses_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=r%2F1"))
            .and(body_string_contains("client_id=cid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new", "expires_in": 3600, "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let http = HttpClient::new("oauth", HttpConfig::default()).unwrap();
        let endpoints = OAuthEndpoints::qwen("cid").with_token_url(format!("{}/token", server.uri()));
        let token = refresh_token(
            &http,
            &RequestContext::new(),
            &endpoints,
            &SecretString::from("r/1".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(token.access_token.expose_secret(), "new");
    }

    #[tokio::test]
    async fn invalid_grant_is_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant", "error_description": "revoked"
            })))
            .mount(&server)
            .await;
        let http = HttpClient::new("oauth", HttpConfig::default()).unwrap();
        let endpoints = OAuthEndpoints::qwen("cid").with_token_url(server.uri());
        let err = refresh_token(
            &http,
            &RequestContext::new(),
            &endpoints,
            &SecretString::from("r".to_string()),
        )
        .await
        .unwrap_err();
        assert!(err.is_auth_error());
        assert!(err.to_string().contains("revoked"));
    }
}
