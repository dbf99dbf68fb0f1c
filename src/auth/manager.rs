//! OAuth credential manager with single-flight refresh.
//!
//! Each credential id has its own async mutex. A caller that finds the token
//! near expiry takes the mutex, re-reads the credential, and refreshes only if
//! no one else already did. Callers that queued behind the refresher wake up
//! to the new token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;

use super::oauth::{OAuthEndpoints, refresh_token};
use super::store::CredentialStore;
use super::{TokenProvider, same_secret};
use crate::config::{OAuthCredential, ProviderType};
use crate::context::RequestContext;
use crate::error::LlmError;
use crate::http::{HttpClient, HttpConfig};

/// Refresh this long before the recorded expiry.
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(60);

pub struct CredentialManager {
    provider_key: String,
    provider_type: ProviderType,
    endpoints: OAuthEndpoints,
    http: HttpClient,
    store: Option<Arc<CredentialStore>>,
    skew: Duration,
    credentials: RwLock<Vec<OAuthCredential>>,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("provider_key", &self.provider_key)
            .field("endpoints", &self.endpoints)
            .field("credentials", &self.read().len())
            .finish_non_exhaustive()
    }
}

impl CredentialManager {
    pub fn new(
        provider_key: impl Into<String>,
        provider_type: ProviderType,
        endpoints: OAuthEndpoints,
        credentials: Vec<OAuthCredential>,
    ) -> Result<Self, LlmError> {
        let provider_key = provider_key.into();
        let http = HttpClient::new(format!("{provider_key}-oauth"), HttpConfig::default())?;
        Ok(Self {
            provider_key,
            provider_type,
            endpoints,
            http,
            store: None,
            skew: DEFAULT_REFRESH_SKEW,
            credentials: RwLock::new(credentials),
            refresh_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Persist refreshed credentials to `store`.
    pub fn with_store(mut self, store: Arc<CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    pub fn with_http(mut self, http: HttpClient) -> Self {
        self.http = http;
        self
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<OAuthCredential>> {
        match self.credentials.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<OAuthCredential>> {
        match self.credentials.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn refresh_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.refresh_locks.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// The credential requests use: the first one configured.
    pub fn active(&self) -> Option<OAuthCredential> {
        self.read().first().cloned()
    }

    pub fn get(&self, id: &str) -> Option<OAuthCredential> {
        self.read().iter().find(|c| c.id == id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.read().iter().map(|c| c.id.clone()).collect()
    }

    fn replace(&self, cred: OAuthCredential) {
        let mut creds = self.write();
        match creds.iter_mut().find(|c| c.id == cred.id) {
            Some(slot) => *slot = cred,
            None => creds.push(cred),
        }
    }

    /// A valid access token for credential `id`, refreshing first when it is
    /// within the skew window of expiry.
    pub async fn access_token(&self, ctx: &RequestContext, id: &str) -> Result<SecretString, LlmError> {
        let cred = self.get(id).ok_or_else(|| {
            LlmError::AuthenticationError(format!("unknown credential '{id}'"))
        })?;
        if !cred.needs_refresh(Utc::now(), self.skew) {
            return Ok(cred.access_token);
        }
        self.refresh_if(ctx, id, |current| current.needs_refresh(Utc::now(), self.skew))
            .await
    }

    /// Refresh `id` unconditionally unless another caller already replaced
    /// the token `stale` while this one waited.
    pub async fn force_refresh(
        &self,
        ctx: &RequestContext,
        id: &str,
        stale: &SecretString,
    ) -> Result<SecretString, LlmError> {
        self.refresh_if(ctx, id, |current| same_secret(&current.access_token, stale))
            .await
    }

    async fn refresh_if(
        &self,
        ctx: &RequestContext,
        id: &str,
        still_needed: impl Fn(&OAuthCredential) -> bool,
    ) -> Result<SecretString, LlmError> {
        let lock = self.refresh_lock(id);
        let _guard = ctx
            .run(async { Ok::<_, LlmError>(lock.lock().await) })
            .await?;

        let current = self.get(id).ok_or_else(|| {
            LlmError::AuthenticationError(format!("unknown credential '{id}'"))
        })?;
        if !still_needed(&current) {
            tracing::debug!(target: "infergate::auth", credential = id, "token already refreshed by a concurrent caller");
            return Ok(current.access_token);
        }
        let Some(refresh) = current.refresh_token.clone() else {
            return Err(LlmError::AuthenticationError(format!(
                "credential '{id}' expired and has no refresh token; re-authenticate"
            )));
        };

        tracing::info!(target: "infergate::auth", provider = %self.provider_key, credential = id, "refreshing access token");
        let mut endpoints = self.endpoints.clone();
        if !current.client_id.is_empty() {
            endpoints.client_id = current.client_id.clone();
        }
        if current.client_secret.is_some() {
            endpoints.client_secret = current.client_secret.clone();
        }
        let token = refresh_token(&self.http, ctx, &endpoints, &refresh).await?;
        let updated = token.into_credential(
            current.id.clone(),
            current.client_id.clone(),
            current.client_secret.clone(),
            Some(&current),
            Utc::now(),
        );
        let access = updated.access_token.clone();
        if let Some(store) = &self.store {
            store.save_credential(&self.provider_key, &self.provider_type, &updated)?;
        }
        self.replace(updated);
        Ok(access)
    }
}

#[async_trait]
impl TokenProvider for CredentialManager {
    async fn token(&self, ctx: &RequestContext) -> Result<SecretString, LlmError> {
        let Some(active) = self.active() else {
            return Err(LlmError::AuthenticationError(format!(
                "provider '{}' has no OAuth credentials; run the OAuth flow first",
                self.provider_key
            )));
        };
        self.access_token(ctx, &active.id).await
    }

    async fn on_rejected(
        &self,
        ctx: &RequestContext,
        rejected: &SecretString,
    ) -> Result<bool, LlmError> {
        let Some(active) = self.active() else {
            return Ok(false);
        };
        if active.refresh_token.is_none() {
            return Ok(false);
        }
        self.force_refresh(ctx, &active.id, rejected).await?;
        Ok(true)
    }

    fn kind(&self) -> &'static str {
        "oauth"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cred(expires_in_secs: i64, refresh: Option<&str>) -> OAuthCredential {
        OAuthCredential {
            id: "main".into(),
            client_id: "cid".into(),
            client_secret: None,
            access_token: SecretString::from("old".to_string()),
            refresh_token: refresh.map(|r| SecretString::from(r.to_string())),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
            scopes: vec![],
        }
    }

    async fn token_server(expect: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "new", "expires_in": 3600}))
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(expect)
            .mount(&server)
            .await;
        server
    }

    fn manager(server: &MockServer, cred: OAuthCredential) -> CredentialManager {
        let ep = OAuthEndpoints::qwen("cid").with_token_url(format!("{}/token", server.uri()));
        CredentialManager::new("qwen", ProviderType::Qwen, ep, vec![cred]).unwrap()
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let server = token_server(0).await;
        let m = manager(&server, cred(3600, Some("r")));
        let t = m.token(&RequestContext::new()).await.unwrap();
        assert_eq!(t.expose_secret(), "old");
    }

    #[tokio::test]
    async fn token_inside_skew_is_refreshed_and_persisted() {
        let server = token_server(1).await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path().join("config.yaml")));
        let m = manager(&server, cred(30, Some("r"))).with_store(store.clone());

        let t = m.token(&RequestContext::new()).await.unwrap();
        assert_eq!(t.expose_secret(), "new");
        let saved = store.credentials("qwen").unwrap();
        assert_eq!(saved[0].access_token.expose_secret(), "new");
        assert_eq!(saved[0].refresh_token.as_ref().unwrap().expose_secret(), "r");
    }

    #[tokio::test]
    async fn concurrent_refreshes_coalesce() {
        let server = token_server(1).await;
        let m = Arc::new(manager(&server, cred(-10, Some("r"))));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = m.clone();
            handles.push(tokio::spawn(async move {
                m.token(&RequestContext::new()).await.map(|t| t.expose_secret().to_string())
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "new");
        }
    }

    #[tokio::test]
    async fn expired_without_refresh_token_fails() {
        let server = token_server(0).await;
        let m = manager(&server, cred(-10, None));
        let err = m.token(&RequestContext::new()).await.unwrap_err();
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn rejection_forces_one_refresh() {
        let server = token_server(1).await;
        let m = manager(&server, cred(3600, Some("r")));
        let ctx = RequestContext::new();
        let stale = m.token(&ctx).await.unwrap();
        assert!(m.on_rejected(&ctx, &stale).await.unwrap());
        // A second report of the same stale token finds it already replaced.
        assert!(m.on_rejected(&ctx, &stale).await.unwrap());
        assert_eq!(m.token(&ctx).await.unwrap().expose_secret(), "new");
    }
}
