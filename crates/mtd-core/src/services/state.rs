use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{MtdError, Result};
use crate::models::{CloudSettings, Document, MtdSection, MtdSettings};

use super::registry::ServiceRegistry;

/// Durable sink for the registry. Every registry mutation is followed by a
/// checkpoint before the next externally visible action.
#[async_trait]
pub trait Checkpoint: Send + Sync {
    async fn checkpoint(&self, registry: &ServiceRegistry) -> Result<()>;
}

/// Loads and saves the YAML document holding settings, services and the
/// cloud section.
pub struct DocumentStore {
    document_path: PathBuf,
}

impl DocumentStore {
    pub fn new(document_path: &Path) -> Self {
        Self {
            document_path: document_path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.document_path
    }

    pub async fn load(&self) -> Result<Document> {
        if !self.document_path.exists() {
            return Err(MtdError::ConfigNotFound(self.document_path.clone()));
        }
        let yaml = tokio::fs::read_to_string(&self.document_path)
            .await
            .map_err(|e| MtdError::State(format!("failed to read document: {e}")))?;
        let document: Document =
            serde_yaml::from_str(&yaml).map_err(|e| MtdError::InvalidConfig(e.to_string()))?;
        Ok(document)
    }

    /// Write through a sibling temp file, flush it to disk, then rename, so
    /// a crash or power loss leaves either the old or the new document.
    pub async fn save(&self, document: &Document) -> Result<()> {
        if let Some(parent) = self.document_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    MtdError::State(format!("failed to create document dir: {e}"))
                })?;
            }
        }
        let yaml = serde_yaml::to_string(document)?;
        let temp_path = self.temp_path();
        self.write_synced(&temp_path, yaml.as_bytes())
            .await
            .map_err(|e| MtdError::State(format!("failed to write document: {e}")))?;
        tokio::fs::rename(&temp_path, &self.document_path)
            .await
            .map_err(|e| MtdError::State(format!("failed to replace document: {e}")))?;
        Ok(())
    }

    async fn write_synced(&self, path: &Path, contents: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(contents).await?;
        file.sync_all().await
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .document_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.document_path.with_file_name(name)
    }
}

/// Checkpoints the registry by rewriting the whole document with the
/// settings and cloud section it was loaded with.
pub struct DocumentCheckpoint {
    store: DocumentStore,
    settings: MtdSettings,
    cloud: CloudSettings,
}

impl DocumentCheckpoint {
    pub fn new(store: DocumentStore, settings: MtdSettings, cloud: CloudSettings) -> Self {
        Self {
            store,
            settings,
            cloud,
        }
    }

    pub fn document(&self, registry: &ServiceRegistry) -> Document {
        Document {
            mtd: MtdSection {
                settings: self.settings.clone(),
                services: registry.to_services(),
            },
            cloud: self.cloud.clone(),
        }
    }
}

#[async_trait]
impl Checkpoint for DocumentCheckpoint {
    async fn checkpoint(&self, registry: &ServiceRegistry) -> Result<()> {
        self.store.save(&self.document(registry)).await?;
        tracing::debug!(
            path = %self.store.path().display(),
            services = registry.len(),
            "registry checkpointed"
        );
        Ok(())
    }
}
