//! System definition model and resolution of (definition URL, version) pairs

mod model;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};

pub use model::{
    ContainerBuildSource, GitRepositorySource, NodePoolDefinition, SystemDefinition,
    WorkloadDefinition, WorkloadKind,
};

/// Turns a System's definition URL and a version into a resolved definition
#[async_trait]
pub trait DefinitionResolver: Send + Sync {
    async fn resolve(&self, definition_url: &str, version: &str) -> Result<SystemDefinition>;
}

/// Reads `<root>/<version>.yaml` for `file://<root>` definition URLs.
///
/// When a base directory is configured, relative roots are resolved against it.
#[derive(Clone, Debug, Default)]
pub struct FileResolver {
    base: Option<PathBuf>,
}

impl FileResolver {
    pub fn new(base: Option<PathBuf>) -> Self {
        Self { base }
    }

    fn definition_path(&self, definition_url: &str, version: &str) -> Result<PathBuf> {
        let root = definition_url.strip_prefix("file://").ok_or_else(|| {
            Error::DefinitionError(format!(
                "unsupported definition URL {definition_url}, expected file://"
            ))
        })?;
        if version.is_empty() || version.contains('/') || version.contains("..") {
            return Err(Error::DefinitionError(format!("invalid version {version:?}")));
        }
        let root = PathBuf::from(root);
        let root = match (&self.base, root.is_relative()) {
            (Some(base), true) => base.join(root),
            _ => root,
        };
        Ok(root.join(format!("{version}.yaml")))
    }
}

#[async_trait]
impl DefinitionResolver for FileResolver {
    async fn resolve(&self, definition_url: &str, version: &str) -> Result<SystemDefinition> {
        let path = self.definition_path(definition_url, version)?;
        debug!(path = %path.display(), "Reading system definition");
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::DefinitionError(format!("reading {}: {e}", path.display()))
        })?;
        let definition: SystemDefinition = serde_yaml::from_str(&raw)?;
        definition.validate()?;
        Ok(definition)
    }
}

/// Serves definitions registered in memory
#[derive(Default)]
pub struct StaticResolver {
    definitions: RwLock<HashMap<(String, String), SystemDefinition>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, definition_url: &str, version: &str, definition: SystemDefinition) {
        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        definitions.insert((definition_url.to_string(), version.to_string()), definition);
    }
}

#[async_trait]
impl DefinitionResolver for StaticResolver {
    async fn resolve(&self, definition_url: &str, version: &str) -> Result<SystemDefinition> {
        let definition = {
            let definitions = self
                .definitions
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            definitions
                .get(&(definition_url.to_string(), version.to_string()))
                .cloned()
        };
        let definition = definition.ok_or_else(|| {
            Error::DefinitionError(format!(
                "no definition for {definition_url} at version {version}"
            ))
        })?;
        definition.validate()?;
        Ok(definition)
    }
}
