//! Provider factories by name.
//!
//! Built once at startup and passed to whatever assembles inputs.

use crate::error::{ProviderError, RegistryError};
use crate::provider::{FixtureProvider, Provider};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Builds a provider from its `[provider]` configuration table.
pub type ProviderFactory =
    Arc<dyn Fn(&toml::Value) -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync>;

/// Named provider factories.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: DashMap<String, ProviderFactory>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in providers.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        // A fresh registry has no names to collide with.
        let _ = registry.register(FixtureProvider::NAME, |config| {
            Ok(Arc::new(FixtureProvider::from_toml(config)?) as Arc<dyn Provider>)
        });
        registry
    }

    /// Register a factory under `name`.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&toml::Value) -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync + 'static,
    {
        match self.factories.entry(name.into()) {
            Entry::Occupied(entry) => Err(RegistryError::Duplicate(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::debug!("Registered provider {}", entry.key());
                entry.insert(Arc::new(factory));
                Ok(())
            }
        }
    }

    /// Build the provider registered under `name`.
    pub fn get(
        &self,
        name: &str,
        config: &toml::Value,
    ) -> Result<Arc<dyn Provider>, RegistryError> {
        // Clone out so the shard lock is not held while the factory runs.
        let factory = self
            .factories
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        factory(config).map_err(|source| RegistryError::Build {
            name: name.to_string(),
            source,
        })
    }

    /// True if a factory is registered under `name`.
    pub fn has(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_table() -> toml::Value {
        toml::from_str(r#"path = "/tmp/assets.json""#).unwrap()
    }

    #[test]
    fn builtin_registry_has_fixture() {
        let registry = ProviderRegistry::with_builtin();
        assert!(registry.has("fixture"));
        assert_eq!(registry.names(), vec!["fixture".to_string()]);

        let provider = registry.get("fixture", &fixture_table()).unwrap();
        assert_eq!(provider.name(), "fixture");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = ProviderRegistry::with_builtin();
        let err = registry
            .register("fixture", |config| {
                Ok(Arc::new(FixtureProvider::from_toml(config)?) as Arc<dyn Provider>)
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "fixture"));
    }

    #[test]
    fn concurrent_registration_admits_one_factory() {
        let registry = Arc::new(ProviderRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry
                        .register("okta", |config| {
                            Ok(Arc::new(FixtureProvider::from_toml(config)?) as Arc<dyn Provider>)
                        })
                        .is_ok()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(registry.names(), vec!["okta".to_string()]);
    }

    #[test]
    fn unknown_name_is_not_found() {
        let registry = ProviderRegistry::new();
        assert!(!registry.has("okta"));
        assert!(matches!(
            registry.get("okta", &fixture_table()),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn factory_failure_names_the_provider() {
        let registry = ProviderRegistry::with_builtin();
        let empty = toml::Value::Table(toml::map::Map::new());
        let err = registry
            .get("fixture", &empty)
            .err()
            .expect("empty table has no path");
        assert!(matches!(err, RegistryError::Build { ref name, .. } if name == "fixture"));
    }
}
