//! Persisted OAuth credentials.
//!
//! Credentials live in the provider sections of the application YAML file.
//! Every save re-reads the file, replaces the one credential, and writes the
//! document back atomically, so concurrent edits to other sections survive.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::{AppConfig, OAuthCredential, ProviderConfig, ProviderType, write_atomic};
use crate::error::LlmError;

#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store backed by `~/.infergate/config.yaml`.
    pub fn default_location() -> Result<Self, LlmError> {
        Ok(Self::new(AppConfig::default_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<AppConfig, LlmError> {
        AppConfig::load(&self.path)
    }

    pub fn credentials(&self, provider_key: &str) -> Result<Vec<OAuthCredential>, LlmError> {
        Ok(self
            .load()?
            .provider(provider_key)
            .map(|p| p.oauth_credentials.clone())
            .unwrap_or_default())
    }

    /// Insert or replace `credential` (matched by id) under `provider_key`,
    /// creating the section with `provider_type` if it does not exist.
    pub fn save_credential(
        &self,
        provider_key: &str,
        provider_type: &ProviderType,
        credential: &OAuthCredential,
    ) -> Result<(), LlmError> {
        let _guard = match self.write_lock.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let mut config = self.load()?;
        let section = config
            .providers
            .entry(provider_key.to_string())
            .or_insert_with(|| {
                ProviderConfig::new(provider_type.clone()).with_name(provider_key.to_string())
            });
        match section
            .oauth_credentials
            .iter_mut()
            .find(|c| c.id == credential.id)
        {
            Some(existing) => *existing = credential.clone(),
            None => section.oauth_credentials.push(credential.clone()),
        }
        let yaml = config.to_yaml()?;
        write_atomic(&self.path, yaml.as_bytes())?;
        tracing::info!(
            target: "infergate::auth",
            provider = provider_key,
            credential = %credential.id,
            expires_at = %credential.expires_at,
            "credential persisted"
        );
        Ok(())
    }
}
