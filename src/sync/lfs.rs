//! Fetching LFS payloads a batch references before it is pushed.
//!
//! The destination server rejects pushes whose LFS pointers have no object
//! behind them, so every commit in the batch range that touches a pointer has
//! its objects pulled from the source first.  Failures only warn: the push
//! itself reports whatever is still missing.

use std::collections::HashSet;

use tracing::{debug, info, instrument, warn};

use super::model::short;
use crate::git::GitTool;

/// Revision range for a batch ending at `frontier`.
///
/// `base` is the previous frontier, or the destination head for the first
/// batch; without one the whole history of `frontier` is scanned.
pub fn batch_range(base: Option<&str>, frontier: &str) -> String {
    match base {
        Some(base) => format!("{base}..{frontier}"),
        None => frontier.to_string(),
    }
}

pub struct LargeObjectCoordinator {
    enabled: bool,
    source_remote: String,
}

impl LargeObjectCoordinator {
    pub fn new(enabled: bool, source_remote: impl Into<String>) -> Self {
        Self {
            enabled,
            source_remote: source_remote.into(),
        }
    }

    /// Probe the workspace.  A failed probe counts as "no LFS".
    pub async fn detect(git: &dyn GitTool, source_remote: &str) -> Self {
        let enabled = match git.lfs_enabled().await {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!(error = %e, "could not determine LFS usage; assuming none");
                false
            }
        };
        if enabled {
            info!("LFS detected; objects are fetched before each batch");
        }
        Self::new(enabled, source_remote)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Fetch the LFS objects referenced in `range`.  Returns how many commits
    /// were fetched successfully.
    #[instrument(skip(self, git))]
    pub async fn prepare(&self, git: &dyn GitTool, range: &str) -> usize {
        if !self.enabled {
            return 0;
        }

        let commits = match git.lfs_commits(range).await {
            Ok(commits) => commits,
            Err(e) => {
                warn!(error = %e, "failed to list LFS commits");
                return 0;
            }
        };

        // Oldest first, each commit once.
        let mut seen = HashSet::new();
        let ordered: Vec<String> = commits
            .into_iter()
            .rev()
            .filter(|c| seen.insert(c.clone()))
            .collect();

        if ordered.is_empty() {
            debug!("no LFS pointers in range");
            return 0;
        }

        let mut fetched = 0;
        for commit in &ordered {
            match git.lfs_fetch(&self.source_remote, commit).await {
                Ok(()) => fetched += 1,
                Err(e) => warn!(commit = short(commit), error = %e, "LFS fetch failed"),
            }
        }

        info!(fetched, total = ordered.len(), "LFS objects fetched");
        fetched
    }
}
