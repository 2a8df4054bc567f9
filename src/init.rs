//! `init`: prepare a bare sync workspace.
//!
//! Creates the bare repository, points the source remote at the mirrored
//! branches only, optionally adds the destination remote, fetches, and
//! reports what ended up configured.  Every step is idempotent.

use std::fmt::Write as _;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::credentials::sanitize_remote_url;
use crate::error::SyncError;
use crate::git::commands::{git_is_repository, git_remote_get_url};
use crate::git::{
    configure_fetch_refspecs, git_fetch_all, git_for_each_ref, init_bare_repo,
    list_fetch_refspecs, set_remote,
};
use crate::sync::Confirm;

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub repo_path: PathBuf,
    pub remote_name: String,
    pub remote_url: String,
    pub branches: Vec<String>,
    /// `(name, url)` of the destination remote, when one should be added.
    pub destination: Option<(String, String)>,
    pub fetch: bool,
    pub verify_only: bool,
}

impl InitOptions {
    /// Configuration block shown before anything is changed.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Repository path: {}", self.repo_path.display());
        let _ = writeln!(out, "Remote name:     {}", self.remote_name);
        let _ = writeln!(out, "Remote URL:      {}", sanitize_remote_url(&self.remote_url));
        if let Some((name, url)) = &self.destination {
            let _ = writeln!(out, "Destination:     {name} ({})", sanitize_remote_url(url));
        }
        let _ = writeln!(out, "Branches:        {}", self.branches.join(", "));
        let _ = writeln!(out, "Fetch after:     {}", if self.fetch { "yes" } else { "no" });
        out
    }
}

// ---------------------------------------------------------------------------
// Verification report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteStatus {
    pub name: String,
    /// Sanitized; `None` when the remote is not configured.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub source: RemoteStatus,
    pub refspecs: Vec<String>,
    pub destination: Option<RemoteStatus>,
    /// Remote-tracking branches present, as `remote/branch`.
    pub tracked: Vec<String>,
    /// Requested branches with no tracking ref yet.
    pub missing: Vec<String>,
}

impl VerificationReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let url = self.source.url.as_deref().unwrap_or("(not configured)");
        let _ = writeln!(out, "Remote '{}': {url}", self.source.name);
        let _ = writeln!(out, "Fetch refspecs ({}):", self.refspecs.len());
        for refspec in &self.refspecs {
            let _ = writeln!(out, "  - {refspec}");
        }
        if let Some(dest) = &self.destination {
            match &dest.url {
                Some(url) => {
                    let _ = writeln!(out, "Destination remote '{}': {url}", dest.name);
                }
                None => {
                    let _ = writeln!(out, "Destination remote '{}' not found", dest.name);
                }
            }
        }
        if self.tracked.is_empty() {
            let _ = writeln!(out, "No branches found (normal before the first fetch)");
        } else {
            let _ = writeln!(out, "Tracked branches ({}):", self.tracked.len());
            for branch in &self.tracked {
                let _ = writeln!(out, "  - {branch}");
            }
        }
        for branch in &self.missing {
            let _ = writeln!(out, "Expected branch not found: {branch}");
        }
        out
    }
}

/// Inspect the workspace without changing it.
#[instrument(skip(options), fields(repo = %options.repo_path.display()))]
pub async fn verify(options: &InitOptions) -> Result<VerificationReport, SyncError> {
    let repo = options.repo_path.as_path();
    if !git_is_repository(repo).await? {
        return Err(SyncError::Configuration(format!(
            "'{}' is not a git repository",
            repo.display()
        )));
    }

    let remote_status = |name: String, url: Option<String>| RemoteStatus {
        name,
        url: url.as_deref().map(sanitize_remote_url),
    };

    let source = remote_status(
        options.remote_name.clone(),
        git_remote_get_url(repo, &options.remote_name).await?,
    );
    let refspecs = list_fetch_refspecs(repo, &options.remote_name).await?;
    let destination = match &options.destination {
        Some((name, _)) => Some(remote_status(name.clone(), git_remote_get_url(repo, name).await?)),
        None => None,
    };

    let mut tracked: Vec<String> = git_for_each_ref(repo, "refs/remotes/")
        .await?
        .into_keys()
        .filter_map(|name| name.strip_prefix("refs/remotes/").map(str::to_string))
        .filter(|name| !name.ends_with("/HEAD"))
        .collect();
    tracked.sort();

    let missing = missing_branches(&options.remote_name, &options.branches, &tracked);

    Ok(VerificationReport {
        source,
        refspecs,
        destination,
        tracked,
        missing,
    })
}

fn missing_branches(remote: &str, branches: &[String], tracked: &[String]) -> Vec<String> {
    branches
        .iter()
        .filter(|b| !tracked.contains(&format!("{remote}/{b}")))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Create or update the workspace, then verify it.
///
/// Declining the confirmation returns [`SyncError::Cancelled`] before any
/// change.  A failed fetch is logged and the report still produced.
#[instrument(skip(options, confirm), fields(repo = %options.repo_path.display()))]
pub async fn run(
    options: &InitOptions,
    confirm: &dyn Confirm,
) -> Result<VerificationReport, SyncError> {
    if options.verify_only {
        return verify(options).await;
    }
    if options.branches.is_empty() {
        return Err(SyncError::Configuration("at least one branch is required".into()));
    }

    let prompt = format!("{}Proceed with the above configuration?", options.summary());
    if !confirm.confirm(&prompt).await? {
        return Err(SyncError::Cancelled("workspace initialisation declined".into()));
    }

    let repo = options.repo_path.as_path();
    init_bare_repo(repo).await?;
    set_remote(repo, &options.remote_name, &options.remote_url).await?;
    configure_fetch_refspecs(repo, &options.remote_name, &options.branches).await?;
    info!(remote = %options.remote_name, branches = options.branches.len(), "source remote configured");

    if let Some((name, url)) = &options.destination {
        match set_remote(repo, name, url).await {
            Ok(()) => info!(remote = %name, "destination remote configured"),
            Err(e) => warn!(remote = %name, error = %e, "failed to configure destination remote"),
        }
    }

    if options.fetch {
        match git_fetch_all(repo).await {
            Ok(result) => info!(refs_updated = result.refs_updated, "fetch complete"),
            Err(e) => warn!(error = %e, "fetch failed; configuration is complete"),
        }
    } else {
        info!("skipping fetch");
    }

    verify(options).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
