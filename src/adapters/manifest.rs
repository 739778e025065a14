use crate::config::toml_config::substitute_env_vars;
use crate::domain::model::{ObjectKey, ServiceObject};
use crate::domain::ports::ServiceStore;
use crate::utils::error::{HolepunchError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    services: Vec<ServiceObject>,
}

/// Services declared in a TOML manifest on disk.
///
/// The file is re-read on every call so edits show up on the next pass.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<Vec<ServiceObject>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let manifest: Manifest = toml::from_str(&substitute_env_vars(&content)?)?;

        let mut seen = HashSet::new();
        for service in &manifest.services {
            if !seen.insert(service.key()) {
                return Err(HolepunchError::ConfigError {
                    message: format!(
                        "service {} is declared twice in {}",
                        service.key(),
                        self.path.display()
                    ),
                });
            }
        }

        Ok(manifest.services)
    }
}

#[async_trait]
impl ServiceStore for ManifestStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ServiceObject>> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .find(|service| service.namespace == key.namespace && service.name == key.name))
    }

    async fn list(&self) -> Result<Vec<ObjectKey>> {
        Ok(self.load().await?.iter().map(ServiceObject::key).collect())
    }
}
