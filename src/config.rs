//! Provider and application configuration
//!
//! The persisted form is a YAML document rooted at `~/.infergate/config.yaml`:
//!
//! ```yaml
//! providers:
//!   local:
//!     type: ollama
//!     base_url: http://localhost:11434
//!     default_model: llama3.2
//!   gemini:
//!     type: gemini
//!     oauth_credentials:
//!       - id: personal
//!         client_id: abc.apps.googleusercontent.com
//!         access_token: ya29...
//!         refresh_token: 1//...
//!         expires_at: 2025-01-01T00:00:00Z
//!         scopes: [https://www.googleapis.com/auth/cloud-platform]
//! ```
//!
//! Saving is atomic: the document is written to a temporary file in the same
//! directory with mode 0600 and renamed over the target.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::LlmError;

pub const APP_DIR: &str = ".infergate";
pub const CONFIG_FILE: &str = "config.yaml";

/// Serde helpers that read and write secrets as plain strings.
pub(crate) mod secret_serde {
    use super::*;

    pub fn serialize<S: Serializer>(secret: &SecretString, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(secret.expose_secret())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SecretString, D::Error> {
        Ok(SecretString::from(String::deserialize(d)?))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            secret: &Option<SecretString>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match secret {
                Some(v) => s.serialize_some(v.expose_secret()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<SecretString>, D::Error> {
            Ok(Option::<String>::deserialize(d)?
                .filter(|s| !s.is_empty())
                .map(SecretString::from))
        }
    }

    pub mod list {
        use super::*;
        use serde::ser::SerializeSeq;

        pub fn serialize<S: Serializer>(secrets: &[SecretString], s: S) -> Result<S::Ok, S::Error> {
            let mut seq = s.serialize_seq(Some(secrets.len()))?;
            for secret in secrets {
                seq.serialize_element(secret.expose_secret())?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<SecretString>, D::Error> {
            Ok(Vec::<String>::deserialize(d)?
                .into_iter()
                .map(SecretString::from)
                .collect())
        }
    }
}

/// Back-end dialect of a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderType {
    Ollama,
    OllamaCloud,
    OpenAi,
    Anthropic,
    Gemini,
    Qwen,
    Cerebras,
    OpenRouter,
    /// User-registered type, looked up in the factory by name.
    Custom(String),
}

impl ProviderType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ollama => "ollama",
            Self::OllamaCloud => "ollama-cloud",
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Qwen => "qwen",
            Self::Cerebras => "cerebras",
            Self::OpenRouter => "openrouter",
            Self::Custom(name) => name,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" | "ollama-local" => Self::Ollama,
            "ollama-cloud" | "ollama_cloud" => Self::OllamaCloud,
            "openai" | "openai-compatible" => Self::OpenAi,
            "anthropic" | "claude" => Self::Anthropic,
            "gemini" | "google" => Self::Gemini,
            "qwen" | "dashscope" => Self::Qwen,
            "cerebras" => Self::Cerebras,
            "openrouter" => Self::OpenRouter,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Environment variable conventionally holding this provider's key.
    pub fn default_api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::Ollama => None,
            Self::OllamaCloud => Some("OLLAMA_API_KEY"),
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::Qwen => Some("DASHSCOPE_API_KEY"),
            Self::Cerebras => Some("CEREBRAS_API_KEY"),
            Self::OpenRouter => Some("OPENROUTER_API_KEY"),
            Self::Custom(_) => None,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Ollama => "http://localhost:11434",
            Self::OllamaCloud => "https://ollama.com",
            Self::OpenAi => "https://api.openai.com",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::Qwen => "https://dashscope.aliyuncs.com/compatible-mode",
            Self::Cerebras => "https://api.cerebras.ai",
            Self::OpenRouter => "https://openrouter.ai",
            Self::Custom(_) => "",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ProviderType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ProviderType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(Self::parse(&String::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    None,
    ApiKey,
    ApiKeyList,
    OAuth,
}

/// A persisted OAuth token set.
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthCredential {
    pub id: String,
    pub client_id: String,
    #[serde(default, with = "secret_serde::option", skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<SecretString>,
    #[serde(with = "secret_serde")]
    pub access_token: SecretString,
    #[serde(default, with = "secret_serde::option", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<SecretString>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl std::fmt::Debug for OAuthCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredential")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

impl OAuthCredential {
    /// True when the token expires within `skew` of `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        let skew = chrono::Duration::from_std(skew).unwrap_or(chrono::Duration::zero());
        self.expires_at - now <= skew
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token
            .as_ref()
            .is_some_and(|t| !t.expose_secret().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_mode: Option<AuthMode>,
    #[serde(default, with = "secret_serde::option", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<SecretString>,
    #[serde(default, with = "secret_serde::list", skip_serializing_if = "Vec::is_empty")]
    pub api_keys: Vec<SecretString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub oauth_credentials: Vec<OAuthCredential>,
    #[serde(default)]
    pub default_model: String,
    /// Free-form provider knobs (`endpoint_format`, `timeout_secs`, `anthropic_version`, ...).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl ProviderConfig {
    pub fn new(provider_type: ProviderType) -> Self {
        Self {
            name: provider_type.as_str().to_string(),
            base_url: provider_type.default_base_url().to_string(),
            provider_type,
            auth_mode: None,
            api_key: None,
            api_keys: Vec::new(),
            api_key_env: None,
            oauth_credentials: Vec::new(),
            default_model: String::new(),
            options: serde_json::Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    pub fn with_api_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.api_keys = keys
            .into_iter()
            .map(|k| SecretString::from(k.into()))
            .collect();
        self
    }

    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = Some(var.into());
        self
    }

    pub fn with_oauth_credential(mut self, cred: OAuthCredential) -> Self {
        self.oauth_credentials.push(cred);
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Effective auth mode: explicit, else inferred from which credential fields are set.
    pub fn effective_auth_mode(&self) -> AuthMode {
        if let Some(mode) = self.auth_mode {
            return mode;
        }
        if !self.oauth_credentials.is_empty() {
            AuthMode::OAuth
        } else if !self.api_keys.is_empty() {
            AuthMode::ApiKeyList
        } else if self.api_key.is_some() || self.api_key_env.is_some() {
            AuthMode::ApiKey
        } else {
            AuthMode::None
        }
    }

    pub fn base_url_or_default(&self) -> String {
        if self.base_url.trim().is_empty() {
            self.provider_type.default_base_url().to_string()
        } else {
            self.base_url.trim_end_matches('/').to_string()
        }
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(|v| v.as_u64())
    }

    pub fn option_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(|v| v.as_bool())
    }

    /// Request timeout override from `options.timeout_secs`.
    pub fn timeout(&self) -> Option<Duration> {
        self.option_u64("timeout_secs").map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), LlmError> {
        let url = self.base_url_or_default();
        if url.is_empty() {
            return Err(LlmError::ConfigurationError(format!(
                "provider '{}' has no base_url",
                self.name
            )));
        }
        reqwest::Url::parse(&url).map_err(|e| {
            LlmError::ConfigurationError(format!("provider '{}' base_url '{url}': {e}", self.name))
        })?;
        match self.effective_auth_mode() {
            AuthMode::ApiKeyList if self.api_keys.is_empty() => Err(LlmError::ConfigurationError(
                format!("provider '{}' uses api_key_list but lists no keys", self.name),
            )),
            AuthMode::OAuth if self.oauth_credentials.is_empty() => {
                Err(LlmError::ConfigurationError(format!(
                    "provider '{}' uses oauth but has no oauth_credentials",
                    self.name
                )))
            }
            _ => Ok(()),
        }
    }
}

/// The whole persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl AppConfig {
    /// `~/.infergate/config.yaml`
    pub fn default_path() -> Result<PathBuf, LlmError> {
        let home = dirs::home_dir().ok_or_else(|| {
            LlmError::ConfigurationError("cannot determine home directory".to_string())
        })?;
        Ok(home.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn from_yaml(text: &str) -> Result<Self, LlmError> {
        let mut cfg: Self = serde_yaml::from_str(text)?;
        for (key, provider) in cfg.providers.iter_mut() {
            if provider.name.is_empty() {
                provider.name = key.clone();
            }
        }
        Ok(cfg)
    }

    pub fn to_yaml(&self) -> Result<String, LlmError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load from `path`; a missing file yields an empty configuration.
    pub fn load(path: &Path) -> Result<Self, LlmError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(LlmError::IoError(format!("reading {}: {e}", path.display()))),
        }
    }

    /// Atomically write to `path` (temp file in the same directory, 0600, rename).
    pub fn save(&self, path: &Path) -> Result<(), LlmError> {
        let yaml = self.to_yaml()?;
        write_atomic(path, yaml.as_bytes())
    }

    pub fn provider(&self, key: &str) -> Option<&ProviderConfig> {
        self.providers.get(key)
    }

    pub fn provider_mut(&mut self, key: &str) -> Option<&mut ProviderConfig> {
        self.providers.get_mut(key)
    }

    pub fn upsert_provider(&mut self, key: impl Into<String>, config: ProviderConfig) {
        self.providers.insert(key.into(), config);
    }
}

/// Write `bytes` to `path` so readers see either the old or the new file, never a prefix.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), LlmError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .map_err(|e| LlmError::IoError(format!("creating {}: {e}", dir.display())))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".config-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| LlmError::IoError(format!("creating temp file in {}: {e}", dir.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(|e| LlmError::IoError(format!("chmod temp file: {e}")))?;
    }

    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| LlmError::IoError(format!("writing temp file: {e}")))?;

    tmp.persist(path)
        .map_err(|e| LlmError::IoError(format!("replacing {}: {}", path.display(), e.error)))?;
    tracing::debug!(target: "infergate::auth", path = %path.display(), "configuration saved");
    Ok(())
}
