//! Credential lifecycle: API keys, OAuth flows, persistence and refresh.
//!
//! Adapters never hold raw secrets. They ask a [`TokenProvider`] for the
//! current credential before each request and report rejections back to it,
//! which lets key rings rotate and OAuth managers refresh.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::context::RequestContext;
use crate::error::LlmError;

pub mod api_key;
pub mod credentials;
pub mod manager;
pub mod oauth;
pub mod store;

pub use api_key::ApiKeyRing;
pub use credentials::{OAuthErrorResponse, TokenResponse};
pub use manager::{CredentialManager, DEFAULT_REFRESH_SKEW};
pub use oauth::{OAuthEndpoints, device::DeviceFlow, pkce::PkceFlow};
pub use store::CredentialStore;

/// Supplies the secret placed in an adapter's auth header.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current credential, refreshed first if it is about to expire.
    async fn token(&self, ctx: &RequestContext) -> Result<SecretString, LlmError>;

    /// The API answered 401/403 to a request carrying `rejected`.
    /// Returns true when retrying with a new credential may succeed.
    async fn on_rejected(
        &self,
        _ctx: &RequestContext,
        _rejected: &SecretString,
    ) -> Result<bool, LlmError> {
        Ok(false)
    }

    /// The API accepted a request carrying `accepted`.
    fn on_accepted(&self, _accepted: &SecretString) {}

    /// Short label for logs.
    fn kind(&self) -> &'static str;
}

/// A fixed credential.
pub struct StaticTokenProvider {
    token: SecretString,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self, _ctx: &RequestContext) -> Result<SecretString, LlmError> {
        Ok(self.token.clone())
    }

    fn kind(&self) -> &'static str {
        "static"
    }
}

pub(crate) fn same_secret(a: &SecretString, b: &SecretString) -> bool {
    a.expose_secret() == b.expose_secret()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_never_rotates() {
        let p = StaticTokenProvider::new("k");
        let ctx = RequestContext::new();
        let t = p.token(&ctx).await.unwrap();
        assert_eq!(t.expose_secret(), "k");
        assert!(!p.on_rejected(&ctx, &t).await.unwrap());
    }
}
