//! Version-control collaborator port.
//!
//! Checkpoints can be paired with an external snapshot of the working tree.
//! The engine talks to it only through [`VersionControlCheckpointer`]; the
//! [`NoopCheckpointer`] default reports a clean tree and produces no
//! references, so core logic never special-cases its absence.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("version control unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Files touched between a reference and the current working tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn total(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }
}

/// External snapshot provider.
pub trait VersionControlCheckpointer: Send + Sync {
    fn name(&self) -> &str;

    fn has_uncommitted_changes(&self) -> impl Future<Output = Result<bool, VcsError>> + Send;

    /// Record the working tree. `None` means no reference could be produced.
    fn create_snapshot(
        &self,
        message: &str,
    ) -> impl Future<Output = Result<Option<String>, VcsError>> + Send;

    /// Restore the working tree to a reference.
    fn reset_to(&self, reference: &str) -> impl Future<Output = Result<(), VcsError>> + Send;

    fn list_staged_files(&self) -> impl Future<Output = Result<Vec<String>, VcsError>> + Send;

    fn diff_summary(
        &self,
        reference: &str,
    ) -> impl Future<Output = Result<DiffSummary, VcsError>> + Send;
}

// ---------------------------------------------------------------------------
// Dynamic dispatch
// ---------------------------------------------------------------------------

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, VcsError>> + Send + 'a>>;

/// Object-safe version of [`VersionControlCheckpointer`] with boxed futures.
pub trait VersionControlCheckpointerDyn: Send + Sync {
    fn name(&self) -> &str;
    fn has_uncommitted_changes_boxed(&self) -> BoxFuture<'_, bool>;
    fn create_snapshot_boxed<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Option<String>>;
    fn reset_to_boxed<'a>(&'a self, reference: &'a str) -> BoxFuture<'a, ()>;
    fn list_staged_files_boxed(&self) -> BoxFuture<'_, Vec<String>>;
    fn diff_summary_boxed<'a>(&'a self, reference: &'a str) -> BoxFuture<'a, DiffSummary>;
}

impl<T: VersionControlCheckpointer> VersionControlCheckpointerDyn for T {
    fn name(&self) -> &str {
        VersionControlCheckpointer::name(self)
    }

    fn has_uncommitted_changes_boxed(&self) -> BoxFuture<'_, bool> {
        Box::pin(self.has_uncommitted_changes())
    }

    fn create_snapshot_boxed<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(self.create_snapshot(message))
    }

    fn reset_to_boxed<'a>(&'a self, reference: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.reset_to(reference))
    }

    fn list_staged_files_boxed(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(self.list_staged_files())
    }

    fn diff_summary_boxed<'a>(&'a self, reference: &'a str) -> BoxFuture<'a, DiffSummary> {
        Box::pin(self.diff_summary(reference))
    }
}

/// Type-erased version-control collaborator, chosen at startup from config.
pub struct BoxVcs {
    inner: Box<dyn VersionControlCheckpointerDyn>,
}

impl BoxVcs {
    pub fn new<T: VersionControlCheckpointer + 'static>(vcs: T) -> Self {
        Self {
            inner: Box::new(vcs),
        }
    }

    pub fn noop() -> Self {
        Self::new(NoopCheckpointer)
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn has_uncommitted_changes(&self) -> Result<bool, VcsError> {
        self.inner.has_uncommitted_changes_boxed().await
    }

    pub async fn create_snapshot(&self, message: &str) -> Result<Option<String>, VcsError> {
        self.inner.create_snapshot_boxed(message).await
    }

    pub async fn reset_to(&self, reference: &str) -> Result<(), VcsError> {
        self.inner.reset_to_boxed(reference).await
    }

    pub async fn list_staged_files(&self) -> Result<Vec<String>, VcsError> {
        self.inner.list_staged_files_boxed().await
    }

    pub async fn diff_summary(&self, reference: &str) -> Result<DiffSummary, VcsError> {
        self.inner.diff_summary_boxed(reference).await
    }
}

impl std::fmt::Debug for BoxVcs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxVcs").field("name", &self.name()).finish()
    }
}

// ---------------------------------------------------------------------------
// No-op default
// ---------------------------------------------------------------------------

/// Always clean; never produces a reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCheckpointer;

impl VersionControlCheckpointer for NoopCheckpointer {
    fn name(&self) -> &str {
        "none"
    }

    async fn has_uncommitted_changes(&self) -> Result<bool, VcsError> {
        Ok(false)
    }

    async fn create_snapshot(&self, _message: &str) -> Result<Option<String>, VcsError> {
        Ok(None)
    }

    async fn reset_to(&self, _reference: &str) -> Result<(), VcsError> {
        Ok(())
    }

    async fn list_staged_files(&self) -> Result<Vec<String>, VcsError> {
        Ok(Vec::new())
    }

    async fn diff_summary(&self, _reference: &str) -> Result<DiffSummary, VcsError> {
        Ok(DiffSummary::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_is_clean_and_reference_free() {
        let vcs = BoxVcs::noop();
        assert_eq!(vcs.name(), "none");
        assert!(!vcs.has_uncommitted_changes().await.unwrap());
        assert!(vcs.create_snapshot("pre-work").await.unwrap().is_none());
        vcs.reset_to("anything").await.unwrap();
        assert!(vcs.list_staged_files().await.unwrap().is_empty());
        assert!(vcs.diff_summary("anything").await.unwrap().is_empty());
    }

    #[test]
    fn diff_summary_total() {
        let d = DiffSummary {
            added: vec!["a.rs".into()],
            removed: vec![],
            modified: vec!["b.rs".into(), "c.rs".into()],
        };
        assert_eq!(d.total(), 3);
        assert!(!d.is_empty());
    }
}
