//! Backend configuration maps and their on-disk form.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::types::{ParameterKind, ParameterSpec};

/// Live parameter values of one backend.
pub type BackendConfig = BTreeMap<String, String>;

/// File in the dataset root recording which backend the dataset uses.
pub const BACKEND_CONFIG_FILE_NAME: &str = ".backend.json";

/// Required parameters that are absent or blank, in declaration order.
pub fn missing_parameters(required: &[ParameterSpec], config: &BackendConfig) -> Vec<String> {
    required
        .iter()
        .filter(|spec| {
            config
                .get(&spec.parameter)
                .map_or(true, |value| value.trim().is_empty())
        })
        .map(|spec| spec.parameter.clone())
        .collect()
}

/// Fail with `InvalidConfig` naming every missing parameter.
pub fn require_configured(
    storage_type: &str,
    required: &[ParameterSpec],
    config: &BackendConfig,
) -> Result<(), StorageError> {
    let missing: Vec<String> = missing_parameters(required, config);
    if missing.is_empty() {
        return Ok(());
    }
    Err(StorageError::invalid_config(format!(
        "{} backend is missing required parameter(s): {}",
        storage_type,
        missing.join(", ")
    )))
}

/// Look up a parameter that `require_configured` has already checked.
pub(crate) fn parameter<'a>(config: &'a BackendConfig, name: &str) -> Result<&'a str, StorageError> {
    config
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| StorageError::invalid_config(format!("missing parameter '{}'", name)))
}

/// Backend selection persisted with a dataset. Secret parameters are
/// never written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBackendConfig {
    pub storage_type: String,
    #[serde(default)]
    pub config: BackendConfig,
}

impl StoredBackendConfig {
    /// Capture a backend's configuration without its secrets.
    pub fn without_secrets(
        storage_type: &str,
        required: &[ParameterSpec],
        config: &BackendConfig,
    ) -> Self {
        let secrets: Vec<&str> = required
            .iter()
            .filter(|spec| spec.kind == ParameterKind::Secret)
            .map(|spec| spec.parameter.as_str())
            .collect();
        let config: BackendConfig = config
            .iter()
            .filter(|(k, _)| !secrets.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            storage_type: storage_type.to_string(),
            config,
        }
    }
}

/// `<root_dir>/.backend.json`.
#[derive(Debug, Clone)]
pub struct BackendConfigFile {
    path: PathBuf,
}

impl BackendConfigFile {
    pub fn new(root_dir: &Path) -> Self {
        Self {
            path: root_dir.join(BACKEND_CONFIG_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored configuration.
    ///
    /// # Returns
    /// `None` if the dataset has no backend configured yet.
    pub fn load(&self) -> Result<Option<StoredBackendConfig>, StorageError> {
        let data: Vec<u8> = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&self.path, e)),
        };
        let stored: StoredBackendConfig = serde_json::from_slice(&data).map_err(|e| {
            StorageError::invalid_config(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(Some(stored))
    }

    pub fn save(&self, stored: &StoredBackendConfig) -> Result<(), StorageError> {
        let data: Vec<u8> = serde_json::to_vec_pretty(stored).map_err(|e| StorageError::Other {
            message: e.to_string(),
        })?;
        let tmp: PathBuf = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(|e| StorageError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StorageError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::new("server_url", "Object service URL", ParameterKind::String),
            ParameterSpec::new("access_token", "Bearer token", ParameterKind::Secret),
        ]
    }

    #[test]
    fn test_missing_parameters_treats_blank_as_missing() {
        let mut config: BackendConfig = BackendConfig::new();
        config.insert("server_url".to_string(), "  ".to_string());
        assert_eq!(
            missing_parameters(&specs(), &config),
            vec!["server_url".to_string(), "access_token".to_string()]
        );

        config.insert("server_url".to_string(), "https://objects".to_string());
        config.insert("access_token".to_string(), "t".to_string());
        assert!(missing_parameters(&specs(), &config).is_empty());
        assert!(require_configured("x", &specs(), &config).is_ok());
    }

    #[test]
    fn test_require_configured_names_parameters() {
        let err: StorageError =
            require_configured("object_service_v1", &specs(), &BackendConfig::new()).unwrap_err();
        match err {
            StorageError::InvalidConfig { message } => {
                assert!(message.contains("server_url, access_token"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_config_file_round_trip_drops_secrets() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let file: BackendConfigFile = BackendConfigFile::new(dir.path());
        assert!(file.load().unwrap().is_none());

        let mut config: BackendConfig = BackendConfig::new();
        config.insert("server_url".to_string(), "https://objects".to_string());
        config.insert("access_token".to_string(), "secret".to_string());
        let stored: StoredBackendConfig =
            StoredBackendConfig::without_secrets("object_service_v1", &specs(), &config);
        file.save(&stored).unwrap();

        let loaded: StoredBackendConfig = file.load().unwrap().unwrap();
        assert_eq!(loaded.storage_type, "object_service_v1");
        assert_eq!(loaded.config.get("server_url").map(String::as_str), Some("https://objects"));
        assert!(!loaded.config.contains_key("access_token"));
    }

    #[test]
    fn test_config_file_corrupt() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(BACKEND_CONFIG_FILE_NAME), b"{not json").unwrap();
        let err: StorageError = BackendConfigFile::new(dir.path()).load().unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfig { .. }));
    }
}
