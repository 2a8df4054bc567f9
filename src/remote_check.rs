//! `check`: has anything moved on a remote since we last fetched it?
//!
//! Remote-tracking refs are the "local" view; `git ls-remote` is the live
//! one.  Optionally two remotes are compared with each other, which is how a
//! scheduler decides whether a mirror is behind.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;
use tracing::{info, instrument};

use crate::error::SyncError;
use crate::git::{git_for_each_ref, git_ls_remote_heads, GitTool, SystemGit};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchComparison {
    pub local: String,
    pub remote: String,
}

/// Tracking refs of one remote against its live values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComparisonResult {
    pub changed: BTreeMap<String, BranchComparison>,
    /// Tracked locally but gone from the remote.
    pub no_remote: BTreeMap<String, String>,
    pub unchanged: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemotePair {
    pub first: String,
    pub second: String,
}

/// Live values of two remotes against each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteToRemoteResult {
    pub changed: BTreeMap<String, RemotePair>,
    pub only_on_first: BTreeMap<String, String>,
    pub only_on_second: BTreeMap<String, String>,
    pub unchanged: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub remote: String,
    pub second_remote: Option<String>,
    /// Any branch differs, locally or between the remotes.
    pub remote_changed: bool,
    pub local: ComparisonResult,
    pub remote_to_remote: Option<RemoteToRemoteResult>,
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// Parse a `;`-separated branch list.  Empty input means "no filter".
pub fn parse_branch_filter(spec: &str) -> Option<BTreeSet<String>> {
    let branches: BTreeSet<String> = spec
        .split(';')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .collect();
    (!branches.is_empty()).then_some(branches)
}

fn keep(filter: Option<&BTreeSet<String>>, branch: &str) -> bool {
    filter.map_or(true, |f| f.contains(branch))
}

pub fn compare_local(
    local: &BTreeMap<String, String>,
    remote: &HashMap<String, String>,
) -> ComparisonResult {
    let mut result = ComparisonResult::default();
    for (branch, local_id) in local {
        match remote.get(branch) {
            None => {
                result.no_remote.insert(branch.clone(), local_id.clone());
            }
            Some(remote_id) if remote_id != local_id => {
                result.changed.insert(
                    branch.clone(),
                    BranchComparison {
                        local: local_id.clone(),
                        remote: remote_id.clone(),
                    },
                );
            }
            Some(_) => {
                result.unchanged.insert(branch.clone(), local_id.clone());
            }
        }
    }
    result
}

pub fn compare_remotes(
    branches: &BTreeSet<String>,
    first: &HashMap<String, String>,
    second: &HashMap<String, String>,
) -> RemoteToRemoteResult {
    let mut result = RemoteToRemoteResult::default();
    for branch in branches {
        match (first.get(branch), second.get(branch)) {
            (None, None) => {}
            (None, Some(id)) => {
                result.only_on_second.insert(branch.clone(), id.clone());
            }
            (Some(id), None) => {
                result.only_on_first.insert(branch.clone(), id.clone());
            }
            (Some(a), Some(b)) if a != b => {
                result.changed.insert(
                    branch.clone(),
                    RemotePair {
                        first: a.clone(),
                        second: b.clone(),
                    },
                );
            }
            (Some(a), Some(_)) => {
                result.unchanged.insert(branch.clone(), a.clone());
            }
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Git access
// ---------------------------------------------------------------------------

/// Branch -> id of the remote-tracking refs of `remote`.
async fn tracked_branches(
    workspace: &Path,
    remote: &str,
    filter: Option<&BTreeSet<String>>,
) -> Result<BTreeMap<String, String>, SyncError> {
    let prefix = format!("refs/remotes/{remote}/");
    let refs = git_for_each_ref(workspace, &prefix).await?;
    Ok(refs
        .into_iter()
        .filter_map(|(name, id)| {
            let branch = name.strip_prefix(&prefix)?.to_string();
            (branch != "HEAD" && keep(filter, &branch)).then_some((branch, id))
        })
        .collect())
}

/// Branch -> id as the remote reports it right now.
async fn live_branches(workspace: &Path, remote: &str) -> Result<HashMap<String, String>, SyncError> {
    let refs = git_ls_remote_heads(workspace, remote).await?;
    Ok(refs
        .into_iter()
        .filter_map(|(name, id)| Some((name.strip_prefix("refs/heads/")?.to_string(), id)))
        .collect())
}

async fn ensure_remote(git: &SystemGit, remote: &str) -> Result<(), SyncError> {
    if git.remote_url(remote).await?.is_none() {
        return Err(SyncError::Configuration(format!(
            "remote '{remote}' not found"
        )));
    }
    Ok(())
}

#[instrument(fields(workspace = %workspace.display()))]
pub async fn check(
    workspace: &Path,
    remote: &str,
    second_remote: Option<&str>,
    filter: Option<&BTreeSet<String>>,
) -> Result<CheckReport, SyncError> {
    if !workspace.is_dir() {
        return Err(SyncError::Configuration(format!(
            "workspace directory '{}' does not exist",
            workspace.display()
        )));
    }
    let git = SystemGit::new(workspace);
    ensure_remote(&git, remote).await?;
    if let Some(second) = second_remote {
        ensure_remote(&git, second).await?;
    }

    info!(%remote, "checking tracked branches against remote");
    let local = tracked_branches(workspace, remote, filter).await?;
    if local.is_empty() {
        return Err(SyncError::RefNotFound(format!(
            "no tracked branches for remote '{remote}'"
        )));
    }
    let live = live_branches(workspace, remote).await?;
    let local_result = compare_local(&local, &live);

    let remote_to_remote = match second_remote {
        Some(second) => {
            info!(first = %remote, %second, "comparing remotes");
            let mut branches: BTreeSet<String> = local.keys().cloned().collect();
            branches.extend(tracked_branches(workspace, second, filter).await?.into_keys());
            let second_live = live_branches(workspace, second).await?;
            Some(compare_remotes(&branches, &live, &second_live))
        }
        None => None,
    };

    let remote_changed = !local_result.changed.is_empty()
        || remote_to_remote
            .as_ref()
            .is_some_and(|r| !r.changed.is_empty());

    Ok(CheckReport {
        remote: remote.to_string(),
        second_remote: second_remote.map(str::to_string),
        remote_changed,
        local: local_result,
        remote_to_remote,
    })
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn short12(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn heading(out: &mut String, text: &str) {
    let rule = "=".repeat(80);
    let _ = write!(out, "\n{rule}\n{text}\n{rule}\n");
}

fn list(out: &mut String, entries: &BTreeMap<String, String>) {
    for (branch, id) in entries {
        let _ = writeln!(out, "  {branch}: {}", short12(id));
    }
}

/// Human-readable summary.
pub fn render(report: &CheckReport) -> String {
    let mut out = String::new();
    let remote = &report.remote;
    let local = &report.local;

    if !local.changed.is_empty() {
        heading(&mut out, &format!("WARNING: BRANCHES CHANGED on remote '{remote}'"));
        for (branch, c) in &local.changed {
            let _ = writeln!(out, "  {branch}\n    tracked: {}\n    remote:  {}", c.local, c.remote);
        }
    }
    if !local.no_remote.is_empty() {
        heading(&mut out, &format!("INFO: BRANCHES NOT ON REMOTE '{remote}'"));
        list(&mut out, &local.no_remote);
    }
    if local.changed.is_empty() {
        heading(&mut out, &format!("OK: NO CHANGES DETECTED on remote '{remote}'"));
    } else if !local.unchanged.is_empty() {
        heading(&mut out, &format!("OK: UNCHANGED BRANCHES on remote '{remote}'"));
    }
    list(&mut out, &local.unchanged);

    if let (Some(second), Some(r2r)) = (&report.second_remote, &report.remote_to_remote) {
        if !r2r.changed.is_empty() {
            heading(
                &mut out,
                &format!("WARNING: BRANCHES DIFFER between '{remote}' and '{second}'"),
            );
            for (branch, pair) in &r2r.changed {
                let _ = writeln!(
                    out,
                    "  {branch}\n    {remote}: {}\n    {second}: {}",
                    pair.first, pair.second
                );
            }
        }
        if !r2r.only_on_second.is_empty() {
            heading(&mut out, &format!("INFO: BRANCHES ONLY ON '{second}'"));
            list(&mut out, &r2r.only_on_second);
        }
        if !r2r.only_on_first.is_empty() {
            heading(&mut out, &format!("INFO: BRANCHES ONLY ON '{remote}'"));
            list(&mut out, &r2r.only_on_first);
        }
        if r2r.changed.is_empty() {
            heading(
                &mut out,
                &format!("OK: NO DIFFERENCES DETECTED between '{remote}' and '{second}'"),
            );
        } else if !r2r.unchanged.is_empty() {
            heading(&mut out, "OK: UNCHANGED BRANCHES (match on both remotes)");
        }
        list(&mut out, &r2r.unchanged);
    }

    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
