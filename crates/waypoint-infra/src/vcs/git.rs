//! Git-backed version-control collaborator.
//!
//! Snapshots are commits produced by `git stash create`, which captures the
//! index and tracked working-tree changes without touching either. A clean
//! tree snapshots to `HEAD`. Every snapshot is pinned under
//! `refs/waypoint/snapshots/` so `git gc` cannot collect it.
//!
//! Restores use `git read-tree -u --reset`, which rewrites the index and the
//! tracked files to match the snapshot. Untracked files are left alone.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use waypoint_core::vcs::{DiffSummary, VcsError, VersionControlCheckpointer};

const SNAPSHOT_REF_PREFIX: &str = "refs/waypoint/snapshots";

#[derive(Debug, Clone)]
pub struct GitCheckpointer {
    repository: PathBuf,
}

impl GitCheckpointer {
    pub fn new(repository: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
        }
    }

    pub fn repository(&self) -> &Path {
        &self.repository
    }

    /// Run `git -C <repo> <args>` and return trimmed stdout.
    async fn git(&self, args: &[&str]) -> Result<String, VcsError> {
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(&self.repository)
            // Snapshot commits need an identity even when the user has none.
            .args(["-c", "user.name=waypoint", "-c", "user.email=waypoint@localhost"])
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => VcsError::Unavailable("git executable not found".to_string()),
                _ => VcsError::Io(e),
            })?;

        if !output.status.success() {
            return Err(VcsError::Command {
                command: format!("git {}", args.join(" ")),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

impl VersionControlCheckpointer for GitCheckpointer {
    fn name(&self) -> &str {
        "git"
    }

    async fn has_uncommitted_changes(&self) -> Result<bool, VcsError> {
        let status = self.git(&["status", "--porcelain"]).await?;
        Ok(!status.is_empty())
    }

    async fn create_snapshot(&self, message: &str) -> Result<Option<String>, VcsError> {
        let stashed = self.git(&["stash", "create", message]).await?;
        let reference = if stashed.is_empty() {
            match self.git(&["rev-parse", "--verify", "HEAD"]).await {
                Ok(head) => head,
                // Repository without commits: nothing to point at.
                Err(VcsError::Command { .. }) => return Ok(None),
                Err(e) => return Err(e),
            }
        } else {
            stashed
        };

        let pin = format!("{SNAPSHOT_REF_PREFIX}/{reference}");
        self.git(&["update-ref", &pin, &reference]).await?;
        tracing::debug!(reference = reference.as_str(), "git snapshot created");
        Ok(Some(reference))
    }

    async fn reset_to(&self, reference: &str) -> Result<(), VcsError> {
        self.git(&["read-tree", "-u", "--reset", reference]).await?;
        tracing::info!(reference, "working tree reset");
        Ok(())
    }

    async fn list_staged_files(&self) -> Result<Vec<String>, VcsError> {
        let staged = self.git(&["diff", "--cached", "--name-only"]).await?;
        Ok(staged.lines().map(str::to_string).collect())
    }

    async fn diff_summary(&self, reference: &str) -> Result<DiffSummary, VcsError> {
        let diff = self.git(&["diff", "--name-status", "--no-renames", reference]).await?;
        Ok(parse_name_status(&diff))
    }
}

/// Parse `git diff --name-status` output.
///
/// Paths are relative to the snapshot: a file present now but not in the
/// snapshot is `added`.
fn parse_name_status(diff: &str) -> DiffSummary {
    let mut summary = DiffSummary::default();
    for line in diff.lines() {
        let Some((status, path)) = line.split_once('\t') else {
            continue;
        };
        let path = path.to_string();
        match status.chars().next() {
            Some('A') => summary.added.push(path),
            Some('D') => summary.removed.push(path),
            Some(_) => summary.modified.push(path),
            None => {}
        }
    }
    summary
}
