//! The VCS collaborator used by the sync engine.
//!
//! The engine never spawns git itself; it talks to a [`GitTool`].  Production
//! runs use [`SystemGit`], tests use an in-memory implementation.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::commands::{self, PushRun};

// ---------------------------------------------------------------------------
// Push mode
// ---------------------------------------------------------------------------

/// How a push guards against concurrent writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMode {
    /// Fast-forward only.
    Plain,
    /// `--force-with-lease=<refname>:<expected>`.  `expected == None` requires
    /// the ref to not exist yet.
    ForceWithLease {
        refname: String,
        expected: Option<String>,
    },
}

impl PushMode {
    /// Value for `--force-with-lease=`, if any.
    pub fn lease_arg(&self) -> Option<String> {
        match self {
            PushMode::Plain => None,
            PushMode::ForceWithLease { refname, expected } => Some(format!(
                "{refname}:{}",
                expected.as_deref().unwrap_or_default()
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Everything the sync engine needs from the version-control tool.
#[async_trait::async_trait]
pub trait GitTool: Send + Sync {
    /// Whether the workspace is a git repository.
    async fn is_repository(&self) -> Result<bool>;

    /// URL configured for `remote`, `None` when the remote does not exist.
    async fn remote_url(&self, remote: &str) -> Result<Option<String>>;

    /// Commit id `rev` points at, `None` when it does not resolve.
    async fn resolve_ref(&self, rev: &str) -> Result<Option<String>>;

    /// Number of commits reachable from `rev`.
    async fn count_commits(&self, rev: &str) -> Result<usize>;

    /// Refresh remote-tracking refs of `remote`.  With `branch` only that
    /// branch is fetched, otherwise every branch (stale refs are pruned).
    async fn fetch(&self, remote: &str, branch: Option<&str>, force: bool) -> Result<()>;

    /// Raw `git log --graph` output for `rev`, head first.
    async fn graph_log(&self, rev: &str) -> Result<String>;

    /// Push `refspec` to `remote`.  Rejections come back as an unsuccessful
    /// [`PushRun`], not as `Err`.
    async fn push(&self, remote: &str, refspec: &str, mode: &PushMode) -> Result<PushRun>;

    /// Whether the workspace uses LFS.
    async fn lfs_enabled(&self) -> Result<bool>;

    /// Commits in `range` touching LFS pointer lines, newest first.
    async fn lfs_commits(&self, range: &str) -> Result<Vec<String>>;

    /// Download the LFS objects referenced by `commit` from `remote`.
    async fn lfs_fetch(&self, remote: &str, commit: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// System git
// ---------------------------------------------------------------------------

/// Marker that identifies an LFS pointer line inside a diff.
pub const LFS_POINTER_PATTERN: &str = "oid sha256:";

/// [`GitTool`] backed by the `git` binary, operating on one workspace.
#[derive(Debug, Clone)]
pub struct SystemGit {
    workspace: PathBuf,
}

impl SystemGit {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

/// Name of the throwaway branch used to fetch LFS objects for `commit`.
fn lfs_fetch_branch(commit: &str) -> String {
    let short = commit.get(..8).unwrap_or(commit);
    format!("temp_lfs_fetch_{short}")
}

#[async_trait::async_trait]
impl GitTool for SystemGit {
    async fn is_repository(&self) -> Result<bool> {
        commands::git_is_repository(&self.workspace).await
    }

    async fn remote_url(&self, remote: &str) -> Result<Option<String>> {
        commands::git_remote_get_url(&self.workspace, remote).await
    }

    async fn resolve_ref(&self, rev: &str) -> Result<Option<String>> {
        commands::git_rev_parse(&self.workspace, rev).await
    }

    async fn count_commits(&self, rev: &str) -> Result<usize> {
        commands::git_rev_list_count(&self.workspace, rev).await
    }

    async fn fetch(&self, remote: &str, branch: Option<&str>, force: bool) -> Result<()> {
        let refspec = match branch {
            Some(branch) => super::bare_repo::tracking_refspec(remote, branch),
            None => format!("+refs/heads/*:refs/remotes/{remote}/*"),
        };
        commands::git_fetch(&self.workspace, remote, Some(&refspec), force).await?;
        Ok(())
    }

    async fn graph_log(&self, rev: &str) -> Result<String> {
        commands::git_log_graph(&self.workspace, rev).await
    }

    async fn push(&self, remote: &str, refspec: &str, mode: &PushMode) -> Result<PushRun> {
        commands::git_push(&self.workspace, remote, refspec, mode.lease_arg().as_deref()).await
    }

    async fn lfs_enabled(&self) -> Result<bool> {
        let attributes = self.workspace.join(".gitattributes");
        if let Ok(contents) = tokio::fs::read_to_string(&attributes).await {
            if contents.contains("filter=lfs") {
                return Ok(true);
            }
        }

        // A workspace without git-lfs installed simply is not an LFS workspace.
        match commands::git_lfs_ls_files(&self.workspace).await {
            Ok(files) => Ok(!files.is_empty()),
            Err(e) => {
                debug!(error = %e, "git lfs ls-files unavailable; assuming no LFS");
                Ok(false)
            }
        }
    }

    async fn lfs_commits(&self, range: &str) -> Result<Vec<String>> {
        commands::git_log_matching(&self.workspace, range, LFS_POINTER_PATTERN).await
    }

    async fn lfs_fetch(&self, remote: &str, commit: &str) -> Result<()> {
        let branch = lfs_fetch_branch(commit);
        commands::git_branch_create(&self.workspace, &branch, commit)
            .await
            .with_context(|| format!("failed to create {branch}"))?;

        let fetched = commands::git_lfs_fetch(&self.workspace, remote, &branch).await;

        if let Err(e) = commands::git_branch_delete(&self.workspace, &branch).await {
            warn!(%branch, error = %e, "failed to delete temporary LFS branch");
        }

        fetched
    }
}
