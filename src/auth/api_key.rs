//! API-key ring with rotation.
//!
//! The first key is used until the API rejects it; a rejection advances to
//! the next key. Once every key has been rejected in a row the ring stops
//! rotating and the authentication error surfaces. A request that succeeds
//! with the active key starts the count again.

use std::sync::Mutex;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{TokenProvider, same_secret};
use crate::config::ProviderConfig;
use crate::context::RequestContext;
use crate::error::LlmError;

#[derive(Debug, Default)]
struct RingState {
    current: usize,
    /// Consecutive rejections since the active key last succeeded.
    rejected: usize,
}

pub struct ApiKeyRing {
    keys: Vec<SecretString>,
    state: Mutex<RingState>,
}

impl std::fmt::Debug for ApiKeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyRing")
            .field("keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}

impl ApiKeyRing {
    pub fn new(keys: Vec<SecretString>) -> Result<Self, LlmError> {
        let keys: Vec<_> = keys
            .into_iter()
            .filter(|k| !k.expose_secret().trim().is_empty())
            .collect();
        if keys.is_empty() {
            return Err(LlmError::MissingApiKey("no API key configured".to_string()));
        }
        Ok(Self {
            keys,
            state: Mutex::new(RingState::default()),
        })
    }

    pub fn single(key: impl Into<String>) -> Result<Self, LlmError> {
        Self::new(vec![SecretString::from(key.into())])
    }

    /// Read a key from an environment variable.
    pub fn from_env(var: &str) -> Result<Self, LlmError> {
        match std::env::var(var) {
            Ok(v) if !v.trim().is_empty() => Self::single(v.trim().to_string()),
            _ => Err(LlmError::MissingApiKey(format!(
                "environment variable {var} is not set"
            ))),
        }
    }

    /// Keys from a provider section: `api_keys`, then `api_key`, then `api_key_env`,
    /// then the provider's conventional variable.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, LlmError> {
        if !config.api_keys.is_empty() {
            return Self::new(config.api_keys.clone());
        }
        if let Some(key) = &config.api_key {
            return Self::new(vec![key.clone()]);
        }
        if let Some(var) = &config.api_key_env {
            return Self::from_env(var);
        }
        match config.provider_type.default_api_key_env() {
            Some(var) => Self::from_env(var),
            None => Err(LlmError::MissingApiKey(format!(
                "provider '{}' has no API key configured",
                config.name
            ))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.lock().current
    }

    pub fn current(&self) -> SecretString {
        self.keys[self.lock().current % self.keys.len()].clone()
    }

    /// Advance past `rejected` if it is still the active key.
    /// Returns false when every key has already been tried.
    pub fn rotate(&self, rejected: &SecretString) -> bool {
        let mut state = self.lock();
        let active = &self.keys[state.current % self.keys.len()];
        if !same_secret(active, rejected) {
            // Another caller already rotated.
            return true;
        }
        state.rejected += 1;
        if state.rejected >= self.keys.len() {
            tracing::warn!(target: "infergate::auth", keys = self.keys.len(), "every API key was rejected");
            return false;
        }
        state.current = (state.current + 1) % self.keys.len();
        tracing::info!(target: "infergate::auth", index = state.current, "rotated to next API key");
        true
    }

    /// Record that `key` worked; clears the rejection count if it is still active.
    pub fn accept(&self, key: &SecretString) {
        let mut state = self.lock();
        if state.rejected > 0 && same_secret(&self.keys[state.current % self.keys.len()], key) {
            state.rejected = 0;
        }
    }
}

#[async_trait]
impl TokenProvider for ApiKeyRing {
    async fn token(&self, _ctx: &RequestContext) -> Result<SecretString, LlmError> {
        Ok(self.current())
    }

    async fn on_rejected(
        &self,
        _ctx: &RequestContext,
        rejected: &SecretString,
    ) -> Result<bool, LlmError> {
        Ok(self.keys.len() > 1 && self.rotate(rejected))
    }

    fn on_accepted(&self, accepted: &SecretString) {
        self.accept(accepted);
    }

    fn kind(&self) -> &'static str {
        "api_key"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderType;

    fn ring(keys: &[&str]) -> ApiKeyRing {
        ApiKeyRing::new(keys.iter().map(|k| SecretString::from(k.to_string())).collect()).unwrap()
    }

    #[test]
    fn first_key_is_used() {
        let r = ring(&["a", "b"]);
        assert_eq!(r.current().expose_secret(), "a");
    }

    #[test]
    fn rotation_advances_and_stops_after_full_cycle() {
        let r = ring(&["a", "b", "c"]);
        assert!(r.rotate(&r.current()));
        assert_eq!(r.current().expose_secret(), "b");
        assert!(r.rotate(&r.current()));
        assert_eq!(r.current().expose_secret(), "c");
        assert!(!r.rotate(&r.current()));
        assert_eq!(r.current().expose_secret(), "c");
    }

    #[test]
    fn success_resets_the_rejection_count() {
        let r = ring(&["a", "b"]);
        assert!(r.rotate(&r.current()));
        r.accept(&r.current());
        // Much later, b is rejected once; a is tried again.
        assert!(r.rotate(&r.current()));
        assert_eq!(r.current().expose_secret(), "a");
        r.accept(&r.current());
        assert!(r.rotate(&r.current()));
        assert_eq!(r.current().expose_secret(), "b");

        // Without a success in between, a full cycle of rejections stops rotation.
        assert!(!r.rotate(&r.current()));
    }

    #[test]
    fn accepting_an_inactive_key_changes_nothing() {
        let r = ring(&["a", "b"]);
        let a = r.current();
        assert!(r.rotate(&a));
        r.accept(&a);
        assert!(!r.rotate(&r.current()));
    }

    #[test]
    fn stale_rejection_does_not_rotate_twice() {
        let r = ring(&["a", "b", "c"]);
        let first = r.current();
        assert!(r.rotate(&first));
        assert!(r.rotate(&first));
        assert_eq!(r.current().expose_secret(), "b");
    }

    #[test]
    fn empty_keys_are_rejected() {
        assert!(matches!(
            ApiKeyRing::new(vec![SecretString::from(" ".to_string())]),
            Err(LlmError::MissingApiKey(_))
        ));
    }

    #[test]
    fn config_precedence() {
        let cfg = ProviderConfig::new(ProviderType::OpenAi)
            .with_api_key("single")
            .with_api_keys(["x", "y"]);
        let r = ApiKeyRing::from_config(&cfg).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r.current().expose_secret(), "x");

        let cfg = ProviderConfig::new(ProviderType::OpenAi)
            .with_api_key_env("INFERGATE_TEST_SURELY_UNSET_VAR");
        assert!(ApiKeyRing::from_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn single_key_never_rotates() {
        let r = ring(&["only"]);
        let ctx = RequestContext::new();
        let t = r.token(&ctx).await.unwrap();
        assert!(!r.on_rejected(&ctx, &t).await.unwrap());
    }
}
