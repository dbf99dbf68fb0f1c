//! Provider factory
//!
//! Maps provider types to adapter constructors. Built-in types are registered
//! up front; custom types can be added at runtime. Registration takes the write
//! lock, `create` the read lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::auth::CredentialStore;
use crate::config::{AppConfig, ProviderConfig, ProviderType};
use crate::error::LlmError;
use crate::providers::{
    AnthropicProvider, GeminiProvider, LlmProvider, OllamaProvider, OpenAiProvider,
};

pub type ProviderConstructor = Arc<
    dyn Fn(&ProviderConfig, Option<Arc<CredentialStore>>) -> Result<Arc<dyn LlmProvider>, LlmError>
        + Send
        + Sync,
>;

pub struct ProviderFactory {
    constructors: RwLock<HashMap<ProviderType, ProviderConstructor>>,
    store: Option<Arc<CredentialStore>>,
}

impl std::fmt::Debug for ProviderFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderFactory")
            .field("types", &self.types())
            .field("store", &self.store.is_some())
            .finish()
    }
}

impl Default for ProviderFactory {
    fn default() -> Self {
        let factory = Self::empty();
        for ty in [ProviderType::Ollama, ProviderType::OllamaCloud] {
            factory.register(ty, |cfg, store| {
                Ok(Arc::new(OllamaProvider::with_store(cfg, store)?) as Arc<dyn LlmProvider>)
            });
        }
        for ty in [
            ProviderType::OpenAi,
            ProviderType::Qwen,
            ProviderType::Cerebras,
            ProviderType::OpenRouter,
        ] {
            factory.register(ty, |cfg, store| {
                Ok(Arc::new(OpenAiProvider::with_store(cfg, store)?) as Arc<dyn LlmProvider>)
            });
        }
        factory.register(ProviderType::Anthropic, |cfg, store| {
            Ok(Arc::new(AnthropicProvider::with_store(cfg, store)?) as Arc<dyn LlmProvider>)
        });
        factory.register(ProviderType::Gemini, |cfg, store| {
            Ok(Arc::new(GeminiProvider::with_store(cfg, store)?) as Arc<dyn LlmProvider>)
        });
        factory
    }
}

impl ProviderFactory {
    /// Factory with every built-in adapter registered.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self {
            constructors: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Persist refreshed OAuth tokens through `store` for adapters created from now on.
    pub fn with_store(mut self, store: Arc<CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register (or replace) the constructor for `ty`.
    pub fn register<F>(&self, ty: ProviderType, ctor: F)
    where
        F: Fn(&ProviderConfig, Option<Arc<CredentialStore>>) -> Result<Arc<dyn LlmProvider>, LlmError>
            + Send
            + Sync
            + 'static,
    {
        tracing::debug!(target: "infergate::provider", provider_type = %ty, "registering provider constructor");
        let mut map = match self.constructors.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(ty, Arc::new(ctor));
    }

    pub fn is_registered(&self, ty: &ProviderType) -> bool {
        let map = match self.constructors.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.contains_key(ty)
    }

    pub fn types(&self) -> Vec<ProviderType> {
        let map = match self.constructors.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut types: Vec<_> = map.keys().cloned().collect();
        types.sort();
        types
    }

    /// Build a configured adapter for `config.provider_type`.
    pub fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
        let ctor = {
            let map = match self.constructors.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.get(&config.provider_type).cloned()
        };
        let Some(ctor) = ctor else {
            return Err(LlmError::ConfigurationError(format!(
                "no provider registered for type '{}'",
                config.provider_type
            )));
        };
        let provider = ctor(config, self.store.clone())?;
        tracing::debug!(
            target: "infergate::provider",
            provider = provider.name(),
            provider_type = %config.provider_type,
            "created provider"
        );
        Ok(provider)
    }

    /// Adapter for `ty` with default settings, credentials from the environment.
    pub fn create_default(&self, ty: ProviderType) -> Result<Arc<dyn LlmProvider>, LlmError> {
        self.create(&ProviderConfig::new(ty))
    }

    /// One adapter per section of `app`, keyed like the document.
    pub fn create_all(
        &self,
        app: &AppConfig,
    ) -> Result<BTreeMap<String, Arc<dyn LlmProvider>>, LlmError> {
        app.providers
            .iter()
            .map(|(key, cfg)| Ok((key.clone(), self.create(cfg)?)))
            .collect()
    }
}
