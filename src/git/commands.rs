//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function in this module shells out to the system `git` binary
//! inside an existing workspace (`git -C <repo>`).  Credentials live in the
//! configured remote URLs, so nothing here handles secrets directly, but
//! stderr is passed through [`sanitize_text`] before it ends up in an error.
//!
//! All functions are fully `async` and use the Tokio process runtime.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Output, Stdio};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::credentials::sanitize_text;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Summary of a `git fetch` operation.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Number of refs that were updated (new, changed or pruned).
    pub refs_updated: usize,
}

/// Raw result of a `git push`.  Classification happens in the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRun {
    pub success: bool,
    /// stdout followed by stderr.
    pub output: String,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `git` with prompts disabled and all streams captured.
///
/// The child gets its own process group so a terminal Ctrl-C reaches only
/// this process; a push that has started runs to completion.
pub(crate) fn git() -> Command {
    let mut cmd = Command::new("git");
    #[cfg(unix)]
    cmd.process_group(0);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd
}

/// [`git`] running inside `repo_path` (`git -C <repo>`).
pub(crate) fn git_in(repo_path: &Path) -> Command {
    let mut cmd = git();
    cmd.arg("-C").arg(repo_path);
    cmd
}

/// Run `cmd` and fail with the (sanitized) stderr when it exits non-zero.
pub(crate) async fn run_checked(mut cmd: Command, what: &str) -> Result<Output> {
    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to spawn {what}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{what} failed (status {}): {}",
            output.status,
            sanitize_text(stderr.trim()),
        );
    }

    Ok(output)
}

fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Repository / refs
// ---------------------------------------------------------------------------

/// Whether `repo_path` is inside a git repository (bare or not).
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_is_repository(repo_path: &Path) -> Result<bool> {
    if !repo_path.is_dir() {
        return Ok(false);
    }

    let mut cmd = git_in(repo_path);
    cmd.arg("rev-parse").arg("--git-dir");

    let output = cmd
        .output()
        .await
        .context("failed to spawn git rev-parse --git-dir")?;

    Ok(output.status.success())
}

/// `git remote get-url <remote>`; `None` when the remote is not configured.
#[instrument(fields(repo = %repo_path.display(), %remote))]
pub async fn git_remote_get_url(repo_path: &Path, remote: &str) -> Result<Option<String>> {
    let mut cmd = git_in(repo_path);
    cmd.arg("remote").arg("get-url").arg(remote);

    let output = cmd
        .output()
        .await
        .context("failed to spawn git remote get-url")?;

    if !output.status.success() {
        debug!("remote not configured");
        return Ok(None);
    }

    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((!url.is_empty()).then_some(url))
}

/// Resolve `rev` to a commit id; `None` when it does not exist.
#[instrument(fields(repo = %repo_path.display(), %rev))]
pub async fn git_rev_parse(repo_path: &Path, rev: &str) -> Result<Option<String>> {
    let mut cmd = git_in(repo_path);
    cmd.arg("rev-parse")
        .arg("--verify")
        .arg("--quiet")
        .arg(format!("{rev}^{{commit}}"));

    let output = cmd
        .output()
        .await
        .context("failed to spawn git rev-parse")?;

    if !output.status.success() {
        return Ok(None);
    }

    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((!id.is_empty()).then_some(id))
}

/// `git rev-list --count <rev>`.
#[instrument(fields(repo = %repo_path.display(), %rev))]
pub async fn git_rev_list_count(repo_path: &Path, rev: &str) -> Result<usize> {
    let mut cmd = git_in(repo_path);
    cmd.arg("rev-list").arg("--count").arg(rev);

    let output = run_checked(cmd, "git rev-list --count").await?;
    let text = String::from_utf8_lossy(&output.stdout);
    text.trim()
        .parse::<usize>()
        .with_context(|| format!("unexpected git rev-list --count output: {:?}", text.trim()))
}

/// Run `git for-each-ref` below `prefix` and return `ref_name -> object_id`.
///
/// Uses the format `%(objectname) %(refname)` so each output line is
/// `<oid> <refname>`.
#[instrument(fields(repo = %repo_path.display(), %prefix))]
pub async fn git_for_each_ref(repo_path: &Path, prefix: &str) -> Result<HashMap<String, String>> {
    let mut cmd = git_in(repo_path);
    cmd.arg("for-each-ref")
        .arg("--format=%(objectname) %(refname)")
        .arg(prefix);

    let output = run_checked(cmd, "git for-each-ref").await?;
    let refs = parse_ref_lines(&String::from_utf8_lossy(&output.stdout), ' ');

    debug!(ref_count = refs.len(), "git for-each-ref complete");
    Ok(refs)
}

/// Run `git ls-remote --heads <remote>` and return `ref_name -> object_id`.
#[instrument(fields(repo = %repo_path.display(), %remote))]
pub async fn git_ls_remote_heads(
    repo_path: &Path,
    remote: &str,
) -> Result<HashMap<String, String>> {
    let mut cmd = git_in(repo_path);
    cmd.arg("ls-remote").arg("--heads").arg(remote);

    let output = run_checked(cmd, "git ls-remote").await?;
    let refs = parse_ref_lines(&String::from_utf8_lossy(&output.stdout), '\t');

    debug!(ref_count = refs.len(), "git ls-remote complete");
    Ok(refs)
}

/// Parse `<oid><sep><refname>` lines.
fn parse_ref_lines(stdout: &str, sep: char) -> HashMap<String, String> {
    let mut refs = HashMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((oid, refname)) = line.split_once(sep) {
            refs.insert(refname.trim().to_string(), oid.trim().to_string());
        }
    }
    refs
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Run `git fetch --prune [--force] <remote> [<refspec>]` inside the workspace.
///
/// Returns a [`FetchResult`] summarising the update.
#[instrument(fields(repo = %repo_path.display(), %remote, ?refspec))]
pub async fn git_fetch(
    repo_path: &Path,
    remote: &str,
    refspec: Option<&str>,
    force: bool,
) -> Result<FetchResult> {
    let mut cmd = git_in(repo_path);
    cmd.arg("fetch").arg("--prune");
    if force {
        cmd.arg("--force");
    }
    cmd.arg(remote);
    if let Some(refspec) = refspec {
        cmd.arg(refspec);
    }

    debug!("spawning git fetch");

    let output = run_checked(cmd, "git fetch").await?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    let refs_updated = count_updated_refs(&stderr);

    debug!(refs_updated = refs_updated, "git fetch complete");

    Ok(FetchResult { refs_updated })
}

/// `git fetch --all`.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_fetch_all(repo_path: &Path) -> Result<FetchResult> {
    let mut cmd = git_in(repo_path);
    cmd.arg("fetch").arg("--all");

    let output = run_checked(cmd, "git fetch --all").await?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    Ok(FetchResult {
        refs_updated: count_updated_refs(&stderr),
    })
}

/// Count the number of ref-update lines in `git fetch` stderr.
///
/// Lines matching patterns like ` -> ` or `[new branch]` are counted.
fn count_updated_refs(stderr: &str) -> usize {
    stderr
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed.contains("->") && !trimmed.starts_with("From")
        })
        .count()
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

/// `git log --graph` of `rev` with one `<id> <unix ts> <parents>\t<summary>`
/// record per commit.  Graph decoration is left in place for the caller.
#[instrument(fields(repo = %repo_path.display(), %rev))]
pub async fn git_log_graph(repo_path: &Path, rev: &str) -> Result<String> {
    let mut cmd = git_in(repo_path);
    cmd.arg("log")
        .arg("--graph")
        .arg("--no-color")
        .arg("--format=%H %ct %P%x09%s")
        .arg(rev)
        .arg("--");

    let output = run_checked(cmd, "git log --graph").await?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Commit ids in `range` whose diff adds or removes a line matching `pattern`
/// (`git log -G`), newest first.
#[instrument(fields(repo = %repo_path.display(), %range, %pattern))]
pub async fn git_log_matching(repo_path: &Path, range: &str, pattern: &str) -> Result<Vec<String>> {
    let mut cmd = git_in(repo_path);
    cmd.arg("log")
        .arg(range)
        .arg("-G")
        .arg(pattern)
        .arg("--format=%H")
        .arg("--");

    let output = run_checked(cmd, "git log -G").await?;
    Ok(stdout_lines(&output))
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// `git push [<lease>] <remote> <refspec>`.
///
/// A non-zero exit is not an error here: the combined output is returned for
/// classification.  Only a failure to spawn git is.
#[instrument(fields(repo = %repo_path.display(), %remote, %refspec, ?lease))]
pub async fn git_push(
    repo_path: &Path,
    remote: &str,
    refspec: &str,
    lease: Option<&str>,
) -> Result<PushRun> {
    let mut cmd = git_in(repo_path);
    cmd.arg("push").arg("--porcelain");
    if let Some(lease) = lease {
        cmd.arg(format!("--force-with-lease={lease}"));
    }
    cmd.arg(remote).arg(refspec);

    debug!("spawning git push");

    let output = cmd.output().await.context("failed to spawn git push")?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }

    debug!(status = %output.status, "git push finished");

    Ok(PushRun {
        success: output.status.success(),
        output: combined,
    })
}

// ---------------------------------------------------------------------------
// Branches
// ---------------------------------------------------------------------------

/// `git branch --force <name> <commit>`.
#[instrument(fields(repo = %repo_path.display(), %name, %commit))]
pub async fn git_branch_create(repo_path: &Path, name: &str, commit: &str) -> Result<()> {
    let mut cmd = git_in(repo_path);
    cmd.arg("branch").arg("--force").arg(name).arg(commit);
    run_checked(cmd, "git branch").await?;
    Ok(())
}

/// `git branch -D <name>`.
#[instrument(fields(repo = %repo_path.display(), %name))]
pub async fn git_branch_delete(repo_path: &Path, name: &str) -> Result<()> {
    let mut cmd = git_in(repo_path);
    cmd.arg("branch").arg("-D").arg(name);
    run_checked(cmd, "git branch -D").await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// LFS
// ---------------------------------------------------------------------------

/// Paths tracked by LFS at `HEAD` (`git lfs ls-files --name-only`).
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_lfs_ls_files(repo_path: &Path) -> Result<Vec<String>> {
    let mut cmd = git_in(repo_path);
    cmd.arg("lfs").arg("ls-files").arg("--name-only");
    let output = run_checked(cmd, "git lfs ls-files").await?;
    Ok(stdout_lines(&output))
}

/// `git lfs fetch <remote> <refname>`.
#[instrument(fields(repo = %repo_path.display(), %remote, %refname))]
pub async fn git_lfs_fetch(repo_path: &Path, remote: &str, refname: &str) -> Result<()> {
    let mut cmd = git_in(repo_path);
    cmd.arg("lfs").arg("fetch").arg(remote).arg(refname);
    run_checked(cmd, "git lfs fetch").await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// `git config [--add] <key> <value>`.
#[instrument(fields(repo = %repo_path.display(), %key, %value))]
pub async fn git_config_set(repo_path: &Path, key: &str, value: &str, add: bool) -> Result<()> {
    let mut cmd = git_in(repo_path);
    cmd.arg("config");
    if add {
        cmd.arg("--add");
    }
    cmd.arg(key).arg(value);
    run_checked(cmd, "git config").await?;
    Ok(())
}

/// `git config --get-all <key>`; an unset key yields an empty list.
#[instrument(fields(repo = %repo_path.display(), %key))]
pub async fn git_config_get_all(repo_path: &Path, key: &str) -> Result<Vec<String>> {
    let mut cmd = git_in(repo_path);
    cmd.arg("config").arg("--get-all").arg(key);

    let output = cmd
        .output()
        .await
        .context("failed to spawn git config --get-all")?;

    // Exit status 1 means the key is not set.
    if output.status.code() == Some(1) {
        return Ok(Vec::new());
    }
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git config --get-all failed (status {}): {}",
            output.status,
            sanitize_text(stderr.trim()),
        );
    }

    Ok(stdout_lines(&output))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
