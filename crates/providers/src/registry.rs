//! Provider registry.
//!
//! Constructs and holds all configured model provider instances, and routes
//! `provider/model` selection strings to the matching adapter.

use std::collections::HashMap;
use std::sync::Arc;

use pv_domain::config::LlmConfig;
use pv_domain::error::{Error, Result};

use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    /// `provider/model` of the fleet default, when configured.
    default_model: Option<String>,
}

impl ProviderRegistry {
    /// Build the registry from the application's [`LlmConfig`].
    ///
    /// Env-var API keys are resolved eagerly here. Providers that fail to
    /// initialize are logged and skipped rather than aborting startup.
    pub fn from_config(config: &LlmConfig) -> Self {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();

        for pc in &config.providers {
            match OpenAiCompatProvider::from_config(pc) {
                Ok(provider) => {
                    tracing::info!(provider_id = %pc.id, "registered model provider");
                    providers.insert(pc.id.clone(), Arc::new(provider));
                }
                Err(e) => {
                    tracing::warn!(
                        provider_id = %pc.id,
                        error = %e,
                        "failed to initialize model provider, skipping"
                    );
                }
            }
        }

        Self {
            providers,
            default_model: config.default_model.clone(),
        }
    }

    /// Build a registry from pre-constructed providers (embedders, tests).
    pub fn with_providers(
        providers: HashMap<String, Arc<dyn LlmProvider>>,
        default_model: Option<String>,
    ) -> Self {
        Self {
            providers,
            default_model,
        }
    }

    /// Register a provider instance directly (used by tests and embedders).
    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn set_default_model(&mut self, model: Option<String>) {
        self.default_model = model;
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve a model selection to `(provider, model)`.
    ///
    /// `selection` may be `provider/model`, a bare model name (routed to the
    /// sole provider when only one is registered), or `None` to use the
    /// configured default.
    pub fn resolve(
        &self,
        selection: Option<&str>,
    ) -> Result<(Arc<dyn LlmProvider>, String)> {
        let selection = match selection {
            Some(s) => s.to_owned(),
            None => self
                .default_model
                .clone()
                .ok_or_else(|| Error::Config("no default model configured".into()))?,
        };

        if let Some((provider_id, model)) = selection.split_once('/') {
            let provider = self.providers.get(provider_id).cloned().ok_or_else(|| {
                Error::NotFound(format!("provider '{provider_id}' is not registered"))
            })?;
            return Ok((provider, model.to_owned()));
        }

        // Bare model name: unambiguous only with a single provider.
        if self.providers.len() == 1 {
            if let Some(provider) = self.providers.values().next().cloned() {
                return Ok((provider, selection));
            }
        }
        Err(Error::Validation(format!(
            "ambiguous model '{selection}': use provider/model form"
        )))
    }
}
