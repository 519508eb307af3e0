//! Versioned storage for the hosted rule file.
//!
//! A store hands out the file content together with an opaque revision
//! token, and only accepts a write conditioned on the token the writer last
//! read. A stale token is reported as [`StoreError::Conflict`].

mod file;
mod github;

pub use file::FileStore;
pub use github::{Committer, GitHubStore, DEFAULT_API_BASE};

use async_trait::async_trait;

use crate::error::StoreError;

/// Content of the rule file at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFileRevision {
    pub content: String,
    /// Opaque token identifying this revision
    pub token: String,
}

/// Result of a successful conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Link to the created commit, when the store has one
    pub commit_url: Option<String>,
    /// Token of the new revision
    pub token: String,
}

/// Versioned rule file storage.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Read the current revision.
    async fn fetch(&self) -> Result<RuleFileRevision, StoreError>;

    /// Replace the file with `content`, only if it is still at `base`.
    async fn write(
        &self,
        base: &RuleFileRevision,
        content: &str,
        message: &str,
    ) -> Result<WriteReceipt, StoreError>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}
