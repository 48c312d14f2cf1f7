//! Provider registry: resolves provider names to cached adapters.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use llm_core::LlmProvider;
use parking_lot::RwLock;

use super::error::{Error, Result};
use crate::config::Config;

/// Builds an adapter for a provider name.
pub type ProviderFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn LlmProvider>> + Send + Sync>;

/// Lazily constructed, shared provider adapters.
///
/// Lookups probe under a read lock. A miss takes the write lock and checks
/// again before constructing, so concurrent first use builds one adapter.
pub struct ProviderRegistry {
    cache: RwLock<HashMap<String, Arc<dyn LlmProvider>>>,
    factory: ProviderFactory,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new(factory: ProviderFactory) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Registry backed by the providers defined in `config`.
    #[must_use]
    pub fn from_config(config: Arc<Config>) -> Self {
        Self::new(Arc::new(move |name: &str| config.create_provider_by_name(name)))
    }

    /// Get the adapter for `name`, constructing it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unknown providers or unusable settings.
    pub fn get(&self, name: &str) -> Result<Arc<dyn LlmProvider>> {
        if let Some(provider) = self.cache.read().get(name) {
            return Ok(Arc::clone(provider));
        }

        let mut cache = self.cache.write();
        if let Some(provider) = cache.get(name) {
            return Ok(Arc::clone(provider));
        }
        let provider = (self.factory)(name)?;
        cache.insert(name.to_string(), Arc::clone(&provider));
        tracing::info!(provider = %name, "provider registered");
        Ok(provider)
    }

    /// Names of the adapters constructed so far.
    #[must_use]
    pub fn cached(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cache.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every cached adapter.
    pub fn shutdown(&self) {
        let mut cache = self.cache.write();
        tracing::debug!(count = cache.len(), "releasing providers");
        cache.clear();
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("cached", &self.cached())
            .finish_non_exhaustive()
    }
}

/// A requested model split into provider and upstream model name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    /// Parse `provider/model`, or infer the provider from a bare model name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when no provider can be determined.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if let Some((provider, model)) = reference.split_once('/') {
            if provider.is_empty() || model.is_empty() {
                return Err(Error::Config(format!("invalid model reference '{reference}'")));
            }
            return Ok(Self {
                provider: provider.to_string(),
                model: model.to_string(),
            });
        }

        let provider = match reference {
            m if m.starts_with("claude-") => "anthropic",
            m if ["gpt-", "o1-", "o3-", "o4-"].iter().any(|p| m.starts_with(p)) => "openai",
            m if m.starts_with("gemini-") => "google",
            m if m == "lorem" || m.starts_with("lorem-") => "lorem",
            _ => {
                return Err(Error::Config(format!(
                    "cannot infer provider for model '{reference}', use provider/model"
                )));
            }
        };
        Ok(Self {
            provider: provider.to_string(),
            model: reference.to_string(),
        })
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use llm_core::providers::{LoremConfig, LoremProvider};

    use super::*;

    fn counting_registry(counter: Arc<AtomicUsize>) -> ProviderRegistry {
        ProviderRegistry::new(Arc::new(move |name: &str| {
            if name != "lorem" {
                return Err(Error::Config(format!("unknown provider '{name}'")));
            }
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(5));
            Ok(Arc::new(LoremProvider::new(LoremConfig::default())) as Arc<dyn LlmProvider>)
        }))
    }

    #[test]
    fn concurrent_first_use_constructs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(counting_registry(Arc::clone(&counter)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.get("lorem").unwrap())
            })
            .collect();
        let providers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(providers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn unknown_provider_is_not_cached() {
        let registry = counting_registry(Arc::new(AtomicUsize::new(0)));
        assert!(matches!(registry.get("nope"), Err(Error::Config(_))));
        assert!(registry.cached().is_empty());
    }

    #[test]
    fn shutdown_clears_cache() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(Arc::clone(&counter));
        registry.get("lorem").unwrap();
        registry.shutdown();
        registry.get("lorem").unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn model_refs_parse_and_infer() {
        assert_eq!(
            ModelRef::parse("openrouter/meta/llama").unwrap(),
            ModelRef {
                provider: "openrouter".to_string(),
                model: "meta/llama".to_string()
            }
        );
        assert_eq!(ModelRef::parse("claude-sonnet-4").unwrap().provider, "anthropic");
        assert_eq!(ModelRef::parse("o3-mini").unwrap().provider, "openai");
        assert_eq!(ModelRef::parse("gemini-2.0-flash").unwrap().provider, "google");
        assert_eq!(ModelRef::parse("lorem-slow").unwrap().provider, "lorem");
        assert!(ModelRef::parse("mystery").is_err());
        assert!(ModelRef::parse("/x").is_err());
    }
}
