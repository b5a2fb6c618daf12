//! Provider router: builds adapters from config and looks them up by name.

use std::collections::HashMap;
use std::sync::Arc;

use chatrelay_config::{AppConfig, ProviderConfig};
use chatrelay_core::error::ProviderError;
use chatrelay_core::provider::{Provider, ProviderFamily};
use tracing::{debug, warn};

use crate::anthropic::AnthropicProvider;
use crate::cli::CliProvider;
use crate::openai_compat::OpenAiCompatProvider;

/// Build the adapter for one configured provider.
pub fn build_provider(name: &str, config: &ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let provider: Arc<dyn Provider> = match config.family {
        ProviderFamily::ChatCompletions => Arc::new(OpenAiCompatProvider::from_config(name, config)?),
        ProviderFamily::MessageBlock => Arc::new(AnthropicProvider::from_config(name, config)?),
        ProviderFamily::CliSubprocess => Arc::new(CliProvider::from_config(name, config)?),
    };
    Ok(provider)
}

/// Routes requests to a named provider.
#[derive(Clone, Default)]
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under a name, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Build a router with every provider in the config.
///
/// A provider that fails to build is skipped with a warning unless it is the
/// active one, which is an error.
pub fn build_from_config(config: &AppConfig) -> Result<ProviderRouter, ProviderError> {
    let mut router = ProviderRouter::new();

    for (name, provider_config) in &config.providers {
        match build_provider(name, provider_config) {
            Ok(provider) => {
                debug!(provider = %name, family = %provider_config.family, "Registered provider");
                router.register(name.clone(), provider);
            }
            Err(e) if *name == config.active_provider => return Err(e),
            Err(e) => warn!(provider = %name, error = %e, "Skipping provider"),
        }
    }

    if !router.contains(&config.active_provider) {
        return Err(ProviderError::NotConfigured(format!(
            "active provider '{}' is not configured",
            config.active_provider
        )));
    }

    Ok(router)
}
