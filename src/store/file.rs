//! Local rule file store.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{RuleFileRevision, RuleStore, WriteReceipt};
use crate::error::StoreError;

/// Rule file on the local filesystem.
///
/// The revision token is the SHA-256 of the file content. Writes compare the
/// token against the file on disk and replace it atomically (temp file then
/// rename).
pub struct FileStore {
    path: PathBuf,
    /// Serializes check-and-replace within this process
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_revision(&self) -> Result<RuleFileRevision, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let token = content_token(&content);
        Ok(RuleFileRevision { content, token })
    }
}

#[async_trait]
impl RuleStore for FileStore {
    async fn fetch(&self) -> Result<RuleFileRevision, StoreError> {
        self.read_revision().await
    }

    async fn write(
        &self,
        base: &RuleFileRevision,
        content: &str,
        message: &str,
    ) -> Result<WriteReceipt, StoreError> {
        let _guard = self.lock.lock().await;

        let current = self.read_revision().await?;
        if current.token != base.token {
            log::debug!("{} changed since it was read", self.path.display());
            return Err(StoreError::Conflict);
        }

        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        log::info!("Updated {}: {}", self.path.display(), message);
        Ok(WriteReceipt {
            commit_url: None,
            token: content_token(content),
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Hex SHA-256 of the file content.
pub(crate) fn content_token(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}
