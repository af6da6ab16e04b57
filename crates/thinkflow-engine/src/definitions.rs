use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use futures::future::BoxFuture;
use tracing::debug;

use thinkflow_core::error::{Result, ThinkflowError};
use thinkflow_core::traits::DefinitionStore;
use thinkflow_core::workflow::WorkflowDefinition;

/// Definitions held in memory, keyed by id.
#[derive(Default)]
pub struct InMemoryDefinitionStore {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definitions(definitions: impl IntoIterator<Item = WorkflowDefinition>) -> Self {
        let store = Self::new();
        for definition in definitions {
            store.insert(definition);
        }
        store
    }

    /// Add or replace a definition.
    pub fn insert(&self, definition: WorkflowDefinition) {
        if let Ok(mut map) = self.definitions.write() {
            map.insert(definition.id.clone(), definition);
        }
    }
}

impl DefinitionStore for InMemoryDefinitionStore {
    fn load(&self, id: String) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>> {
        let found = self
            .definitions
            .read()
            .map(|map| map.get(&id).cloned())
            .map_err(|e| ThinkflowError::Store(e.to_string()));
        Box::pin(async move { found })
    }
}

/// Definitions stored as `<dir>/<id>.json`.
pub struct FileDefinitionStore {
    dir: PathBuf,
}

impl FileDefinitionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !id.starts_with('.');
        if !valid {
            return Err(ThinkflowError::InvalidDefinition(format!(
                "invalid definition id: {:?}",
                id
            )));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

impl DefinitionStore for FileDefinitionStore {
    fn load(&self, id: String) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>> {
        Box::pin(async move {
            let path = self.path_for(&id)?;
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Definition file not found");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            let definition: WorkflowDefinition = serde_json::from_str(&content).map_err(|e| {
                ThinkflowError::InvalidDefinition(format!("{}: {}", path.display(), e))
            })?;
            if definition.id != id {
                return Err(ThinkflowError::InvalidDefinition(format!(
                    "{} declares id '{}'",
                    path.display(),
                    definition.id
                )));
            }
            Ok(Some(definition))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thinkflow_test_utils::fixtures::echo_definition;

    #[tokio::test]
    async fn test_in_memory_load() {
        let store = InMemoryDefinitionStore::with_definitions([echo_definition()]);
        let found = store.load("echo".into()).await.unwrap().unwrap();
        assert_eq!(found, echo_definition());
        assert!(store.load("nope".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_load() {
        let dir = tempfile::tempdir().unwrap();
        let json = serde_json::to_string_pretty(&echo_definition()).unwrap();
        std::fs::write(dir.path().join("echo.json"), json).unwrap();

        let store = FileDefinitionStore::new(dir.path());
        let found = store.load("echo".into()).await.unwrap().unwrap();
        assert_eq!(found.nodes.len(), 3);
        assert_eq!(found.inputs[0].name, "x");
        assert!(store.load("missing".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDefinitionStore::new(dir.path());
        for id in ["../etc/passwd", "", ".hidden", "a/b"] {
            let err = store.load(id.into()).await.unwrap_err();
            assert!(matches!(err, ThinkflowError::InvalidDefinition(_)), "{}", id);
        }
    }

    #[tokio::test]
    async fn test_file_malformed_and_mismatched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{ not json").unwrap();
        let mut other = echo_definition();
        other.id = "other".into();
        std::fs::write(
            dir.path().join("renamed.json"),
            serde_json::to_string(&other).unwrap(),
        )
        .unwrap();

        let store = FileDefinitionStore::new(dir.path());
        assert!(matches!(
            store.load("bad".into()).await,
            Err(ThinkflowError::InvalidDefinition(_))
        ));
        assert!(matches!(
            store.load("renamed".into()).await,
            Err(ThinkflowError::InvalidDefinition(_))
        ));
    }
}
