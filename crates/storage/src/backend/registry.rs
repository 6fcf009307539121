//! String-keyed backend factories.

use std::collections::BTreeMap;

use super::config::{BackendConfig, BackendConfigFile, StoredBackendConfig};
use super::StorageBackend;
use crate::error::StorageError;

/// Builds a backend from its configuration.
pub type BackendFactory =
    Box<dyn Fn(BackendConfig) -> Result<Box<dyn StorageBackend>, StorageError> + Send + Sync>;

/// Maps `storage_type` keys to backend factories.
#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one for the same key.
    pub fn register(&mut self, storage_type: impl Into<String>, factory: BackendFactory) {
        let storage_type: String = storage_type.into();
        if self.factories.insert(storage_type.clone(), factory).is_some() {
            log::debug!("Replaced storage backend factory for {}", storage_type);
        }
    }

    /// Registered keys, sorted.
    pub fn storage_types(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, storage_type: &str) -> bool {
        self.factories.contains_key(storage_type)
    }

    /// Build a backend.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if `storage_type` is not registered.
    pub fn create(
        &self,
        storage_type: &str,
        config: BackendConfig,
    ) -> Result<Box<dyn StorageBackend>, StorageError> {
        let factory: &BackendFactory = self.factories.get(storage_type).ok_or_else(|| {
            StorageError::invalid_config(format!(
                "Unsupported storage backend '{}'. Known backends: {}",
                storage_type,
                self.storage_types().join(", ")
            ))
        })?;
        factory(config)
    }

    /// Build the backend a dataset recorded, layering runtime parameters
    /// such as secrets over the stored ones.
    ///
    /// # Returns
    /// `None` if the dataset has no backend configured.
    pub fn load(
        &self,
        file: &BackendConfigFile,
        runtime: &BackendConfig,
    ) -> Result<Option<Box<dyn StorageBackend>>, StorageError> {
        let stored: StoredBackendConfig = match file.load()? {
            Some(stored) => stored,
            None => return Ok(None),
        };
        let mut config: BackendConfig = stored.config;
        config.extend(runtime.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.create(&stored.storage_type, config).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackendMetadata, ParameterKind, ParameterSpec};

    struct FakeBackend {
        metadata: BackendMetadata,
        config: BackendConfig,
    }

    impl StorageBackend for FakeBackend {
        fn metadata(&self) -> &BackendMetadata {
            &self.metadata
        }

        fn required_parameters(&self) -> Vec<ParameterSpec> {
            vec![ParameterSpec::new("root", "Root", ParameterKind::String)]
        }

        fn configuration(&self) -> &BackendConfig {
            &self.config
        }
    }

    fn registry() -> BackendRegistry {
        let mut registry: BackendRegistry = BackendRegistry::new();
        registry.register(
            "fake",
            Box::new(|config: BackendConfig| {
                let backend: Box<dyn StorageBackend> = Box::new(FakeBackend {
                    metadata: BackendMetadata {
                        storage_type: "fake".to_string(),
                        name: "Fake".to_string(),
                        description: "Test backend".to_string(),
                        is_managed: false,
                        client_should_dedup_on_push: false,
                        can_update_from_remote: false,
                    },
                    config,
                });
                Ok(backend)
            }),
        );
        registry
    }

    #[test]
    fn test_create_known_and_unknown() {
        let registry: BackendRegistry = registry();
        assert_eq!(registry.storage_types(), vec!["fake".to_string()]);

        let backend: Box<dyn StorageBackend> = registry.create("fake", BackendConfig::new()).unwrap();
        assert!(!backend.is_configured());
        assert_eq!(backend.missing_configuration(), vec!["root".to_string()]);
        assert!(backend.as_managed().is_none());

        let err: StorageError = registry.create("nope", BackendConfig::new()).err().unwrap();
        assert!(matches!(err, StorageError::InvalidConfig { .. }));
    }

    #[test]
    fn test_load_merges_runtime_parameters() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let file: BackendConfigFile = BackendConfigFile::new(dir.path());
        let registry: BackendRegistry = registry();
        assert!(registry.load(&file, &BackendConfig::new()).unwrap().is_none());

        file.save(&StoredBackendConfig {
            storage_type: "fake".to_string(),
            config: BackendConfig::new(),
        })
        .unwrap();
        let mut runtime: BackendConfig = BackendConfig::new();
        runtime.insert("root".to_string(), "/data".to_string());
        let backend: Box<dyn StorageBackend> = registry.load(&file, &runtime).unwrap().unwrap();
        assert!(backend.is_configured());
    }
}
