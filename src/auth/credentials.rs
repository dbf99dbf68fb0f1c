//! OAuth token endpoint wire types.

use chrono::{DateTime, TimeDelta, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::OAuthCredential;
use crate::error::LlmError;

/// Successful token endpoint response (RFC 6749 §5.1).
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(with = "crate::config::secret_serde")]
    pub access_token: SecretString,
    #[serde(default, with = "crate::config::secret_serde::option")]
    pub refresh_token: Option<SecretString>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Space-separated scope list.
    #[serde(default)]
    pub scope: Option<String>,
    /// Qwen returns the API host the token is valid for.
    #[serde(default)]
    pub resource_url: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Lifetime assumed when the endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN: u64 = 3600;

impl TokenResponse {
    /// `now + expires_in`, saturating at the last representable instant.
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        i64::try_from(secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Build a persisted credential. When the endpoint does not rotate the
    /// refresh token, the previous one is kept.
    pub fn into_credential(
        self,
        id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<SecretString>,
        previous: Option<&OAuthCredential>,
        now: DateTime<Utc>,
    ) -> OAuthCredential {
        let expires_at = self.expires_at(now);
        let mut scopes = self.scopes();
        if scopes.is_empty()
            && let Some(prev) = previous
        {
            scopes = prev.scopes.clone();
        }
        let refresh_token = self
            .refresh_token
            .filter(|t| !t.expose_secret().is_empty())
            .or_else(|| previous.and_then(|p| p.refresh_token.clone()));
        OAuthCredential {
            id: id.into(),
            client_id: client_id.into(),
            client_secret,
            access_token: self.access_token,
            refresh_token,
            expires_at,
            scopes,
        }
    }
}

/// Token endpoint error body (RFC 6749 §5.2, RFC 8628 §3.5).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl OAuthErrorResponse {
    pub fn describe(&self) -> String {
        match &self.error_description {
            Some(d) if !d.is_empty() => format!("{}: {d}", self.error),
            _ => self.error.clone(),
        }
    }

    pub fn into_error(self) -> LlmError {
        match self.error.as_str() {
            "expired_token" => {
                LlmError::TimeoutError(format!("authorization expired ({})", self.describe()))
            }
            "temporarily_unavailable" | "server_error" => {
                LlmError::api_error(503, self.describe())
            }
            _ => LlmError::AuthenticationError(self.describe()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_previous_refresh_token_when_not_rotated() {
        let now = Utc::now();
        let first: TokenResponse = serde_json::from_str(
            r#"{"access_token":"a1","refresh_token":"r1","expires_in":60,"scope":"x y"}"#,
        )
        .unwrap();
        let cred = first.into_credential("id", "client", None, None, now);
        assert_eq!(cred.scopes, vec!["x", "y"]);
        assert_eq!(cred.expires_at, now + chrono::Duration::seconds(60));

        let second: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a2","expires_in":120}"#).unwrap();
        let next = second.into_credential("id", "client", None, Some(&cred), now);
        assert_eq!(next.access_token.expose_secret(), "a2");
        assert_eq!(next.refresh_token.unwrap().expose_secret(), "r1");
        assert_eq!(next.scopes, vec!["x", "y"]);
    }

    #[test]
    fn huge_lifetimes_saturate() {
        let now = Utc::now();
        for secs in [9_223_372_036_854_775_000u64, u64::MAX, 10_000_000_000_000] {
            let token: TokenResponse =
                serde_json::from_value(serde_json::json!({"access_token": "a", "expires_in": secs}))
                    .unwrap();
            assert_eq!(token.expires_at(now), DateTime::<Utc>::MAX_UTC, "{secs}");
        }
        let token: TokenResponse = serde_json::from_str(r#"{"access_token":"a"}"#).unwrap();
        assert_eq!(token.expires_at(now), now + chrono::Duration::seconds(3600));
    }

    #[test]
    fn error_codes_map_to_taxonomy() {
        let e = OAuthErrorResponse {
            error: "access_denied".into(),
            error_description: None,
        };
        assert!(matches!(e.into_error(), LlmError::AuthenticationError(_)));
        let e = OAuthErrorResponse {
            error: "expired_token".into(),
            error_description: Some("too slow".into()),
        };
        assert!(matches!(e.into_error(), LlmError::TimeoutError(_)));
    }
}
