//! Reading commit history out of `git log --graph` and turning it into the
//! ordered delta that gets pushed.
//!
//! The linear order is a post-order walk from the head that visits parents
//! first-parent first.  Two properties follow and the planner relies on both:
//! parents always precede children, and the prefix ending at any commit on
//! the head's first-parent line is exactly that commit's ancestry.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info, instrument};

use super::model::{short, Commit, LogProjection, SyncRange};
use crate::error::SyncError;
use crate::git::GitTool;

// ---------------------------------------------------------------------------
// Decoration
// ---------------------------------------------------------------------------

/// Lines made only of graph drawing characters.
static DECORATION_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[|/\\*_.\-\s]*$").expect("static regex"));

/// Graph drawing in front of a record.
static LEADING_DECORATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[|/\\*_.\-\s]+").expect("static regex"));

/// Whether `line` carries no record at all.
pub fn is_decoration_only(line: &str) -> bool {
    DECORATION_ONLY.is_match(line)
}

/// Remove graph drawing in front of a record.  Idempotent.
pub fn strip_decoration(line: &str) -> &str {
    let start = LEADING_DECORATION.find(line).map_or(0, |m| m.end());
    line[start..].trim()
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn is_commit_id(s: &str) -> bool {
    (40..=64).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse one stripped `<id> <unix ts> <parents...>\t<summary>` record.
fn parse_record(record: &str) -> Option<Commit> {
    let (head, summary) = record.split_once('\t').unwrap_or((record, ""));
    let mut fields = head.split_whitespace();

    let id = fields.next().filter(|id| is_commit_id(id))?;
    let timestamp = fields
        .next()?
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))?;
    let parents = fields
        .map(|p| is_commit_id(p).then(|| p.to_string()))
        .collect::<Option<Vec<_>>>()?;

    Some(Commit {
        id: id.to_string(),
        timestamp,
        summary: summary.trim().to_string(),
        parents,
    })
}

/// Parse `git log --graph` output into commits, in output order (head first).
pub fn parse_graph_log(output: &str) -> Vec<Commit> {
    let mut commits = Vec::new();
    for line in output.lines() {
        if is_decoration_only(line) {
            continue;
        }
        match parse_record(strip_decoration(line)) {
            Some(commit) => commits.push(commit),
            None => debug!(line, "skipping unparseable log line"),
        }
    }
    commits
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Oldest-first order of everything reachable from `records[0]`.
pub fn linearize(records: &[Commit]) -> Vec<Commit> {
    let Some(head) = records.first() else {
        return Vec::new();
    };
    let by_id: HashMap<&str, &Commit> = records.iter().map(|c| (c.id.as_str(), c)).collect();

    let mut seen: HashSet<&str> = HashSet::with_capacity(records.len());
    let mut order = Vec::with_capacity(records.len());
    // (commit, index of the next parent to visit)
    let mut stack: Vec<(&Commit, usize)> = vec![(head, 0)];
    seen.insert(head.id.as_str());

    while let Some(top) = stack.last_mut() {
        let (commit, next) = *top;
        if let Some(parent_id) = commit.parents.get(next) {
            top.1 += 1;
            if let Some(parent) = by_id.get(parent_id.as_str()) {
                if seen.insert(parent.id.as_str()) {
                    stack.push((parent, 0));
                }
            }
        } else {
            order.push(commit.clone());
            stack.pop();
        }
    }

    order
}

/// Ids of `id` and everything reachable from it within `history`.
pub fn ancestors(history: &[Commit], id: &str) -> HashSet<String> {
    let by_id: HashMap<&str, &Commit> = history.iter().map(|c| (c.id.as_str(), c)).collect();
    let mut found = HashSet::new();
    let mut pending = vec![id];
    while let Some(current) = pending.pop() {
        if !found.insert(current.to_string()) {
            continue;
        }
        if let Some(commit) = by_id.get(current) {
            pending.extend(commit.parents.iter().map(String::as_str));
        }
    }
    found
}

/// Positions (ascending) of the first-parent line ending at the last commit.
pub fn first_parent_positions(commits: &[Commit]) -> Vec<usize> {
    let position: HashMap<&str, usize> = commits
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.as_str(), i))
        .collect();

    let mut line = Vec::new();
    let mut current = commits.len().checked_sub(1);
    while let Some(pos) = current {
        line.push(pos);
        current = commits[pos]
            .parents
            .first()
            .and_then(|p| position.get(p.as_str()).copied());
    }
    line.reverse();
    line
}

/// Oldest-first history of `rev`.
#[instrument(skip(git))]
pub async fn history(git: &dyn GitTool, rev: &str) -> Result<Vec<Commit>, SyncError> {
    let raw = git.graph_log(rev).await?;
    let commits = linearize(&parse_graph_log(&raw));
    debug!(
        commits = commits.len(),
        merges = commits.iter().filter(|c| c.is_merge()).count(),
        "history loaded"
    );
    Ok(commits)
}

/// Oldest-first `(id, summary)` projection of `rev`.
pub async fn projection(git: &dyn GitTool, rev: &str) -> Result<LogProjection, SyncError> {
    Ok(LogProjection::from_commits(&history(git, rev).await?))
}

// ---------------------------------------------------------------------------
// Delta
// ---------------------------------------------------------------------------

/// What the destination held when the delta was computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaBase {
    /// The destination branch does not exist.
    Absent,
    /// The destination holds at most one commit unrelated to the source; it
    /// is overwritten by the full history.
    Replaced { head: String },
    /// The destination head is part of the source history.
    Ancestor { head: String },
}

impl DeltaBase {
    pub fn head(&self) -> Option<&str> {
        match self {
            DeltaBase::Absent => None,
            DeltaBase::Replaced { head } | DeltaBase::Ancestor { head } => Some(head),
        }
    }
}

/// Commits to transfer, oldest first, and the state they build on.
#[derive(Debug, Clone)]
pub struct Delta {
    pub commits: Vec<Commit>,
    pub base: DeltaBase,
}

/// `destination..source` over the already linearized source `history`.
#[instrument(skip(git, history), fields(source = %range.source, destination = %range.destination))]
pub async fn delta(
    git: &dyn GitTool,
    range: &SyncRange,
    history: &[Commit],
    destination_head: Option<&str>,
) -> Result<Delta, SyncError> {
    let Some(head) = destination_head else {
        info!(commits = history.len(), "destination branch absent; transferring full history");
        return Ok(Delta {
            commits: history.to_vec(),
            base: DeltaBase::Absent,
        });
    };

    if history.iter().any(|c| c.id == head) {
        let known = ancestors(history, head);
        let commits: Vec<Commit> = history
            .iter()
            .filter(|c| !known.contains(&c.id))
            .cloned()
            .collect();
        debug!(
            destination_head = short(head),
            commits = commits.len(),
            "delta computed"
        );
        return Ok(Delta {
            commits,
            base: DeltaBase::Ancestor {
                head: head.to_string(),
            },
        });
    }

    let count = git.count_commits(&range.destination.tracking_ref()).await?;
    if count <= 1 {
        info!(
            destination_head = short(head),
            "destination effectively empty; transferring full history"
        );
        return Ok(Delta {
            commits: history.to_vec(),
            base: DeltaBase::Replaced {
                head: head.to_string(),
            },
        });
    }

    Err(SyncError::Divergence(format!(
        "{} head {} is not part of {} history ({count} commits on the destination)",
        range.destination,
        short(head),
        range.source,
    )))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::sync::testing::{id, FakeGit};
    use crate::sync::model::RemoteRef;

    fn merge_log() -> String {
        format!(
            "\
*   {m} 1700000300 {c} {s}\tMerge branch 'feature'
|\\
| * {s} 1700000200 {b}\tAdd feature
* | {c} 1700000250 {b}\tFix typo
|/
* {b} 1700000100 {a}\tSecond
* {a} 1700000000 \tInitial
",
            m = id(5),
            s = id(4),
            c = id(3),
            b = id(2),
            a = id(1),
        )
    }

    #[test]
    fn strips_leading_decoration() {
        assert_eq!(strip_decoration("| * abc 1 def\tmsg"), "abc 1 def\tmsg");
        assert_eq!(strip_decoration("*   abc"), "abc");
        assert_eq!(strip_decoration("abc"), "abc");
        assert!(is_decoration_only("|\\  "));
        assert!(is_decoration_only("| |/ "));
        assert!(is_decoration_only(""));
        assert!(!is_decoration_only("* abc"));
    }

    #[test]
    fn parses_graph_with_merge() {
        let commits = parse_graph_log(&merge_log());
        assert_eq!(commits.len(), 5);
        assert_eq!(commits[0].id, id(5));
        assert_eq!(commits[0].parents, vec![id(3), id(4)]);
        assert_eq!(commits[0].summary, "Merge branch 'feature'");
        assert!(commits[0].is_merge());
        assert!(commits[4].parents.is_empty());
        assert_eq!(commits[4].timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn skips_garbage_lines() {
        let log = format!("* {} 1700000000 \tInitial\n* not a record\n", id(1));
        assert_eq!(parse_graph_log(&log).len(), 1);
    }

    #[test]
    fn linearize_puts_parents_first() {
        let order: Vec<String> = linearize(&parse_graph_log(&merge_log()))
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(order, vec![id(1), id(2), id(3), id(4), id(5)]);
    }

    #[test]
    fn first_parent_line_skips_side_branch() {
        let commits = linearize(&parse_graph_log(&merge_log()));
        assert_eq!(first_parent_positions(&commits), vec![0, 1, 2, 4]);
        assert!(first_parent_positions(&[]).is_empty());
    }

    #[test]
    fn ancestors_of_merge_include_both_sides() {
        let commits = linearize(&parse_graph_log(&merge_log()));
        assert_eq!(ancestors(&commits, &id(5)).len(), 5);
        assert_eq!(ancestors(&commits, &id(4)).len(), 3);
    }

    fn range() -> SyncRange {
        SyncRange {
            source: RemoteRef::new("origin", "develop"),
            destination: RemoteRef::new("destination", "develop"),
        }
    }

    #[tokio::test]
    async fn delta_from_ancestor() {
        let git = FakeGit::linear(10);
        let history = history(&git, "refs/remotes/origin/develop").await.unwrap();
        let delta = delta(&git, &range(), &history, Some(&id(4))).await.unwrap();
        assert_eq!(delta.commits.len(), 6);
        assert_eq!(delta.commits[0].id, id(5));
        assert_eq!(delta.base, DeltaBase::Ancestor { head: id(4) });
    }

    #[tokio::test]
    async fn delta_without_destination_is_full_history() {
        let git = FakeGit::linear(10);
        let history = history(&git, "refs/remotes/origin/develop").await.unwrap();
        let delta = delta(&git, &range(), &history, None).await.unwrap();
        assert_eq!(delta.commits.len(), 10);
        assert_eq!(delta.base, DeltaBase::Absent);
    }

    #[tokio::test]
    async fn unrelated_single_commit_destination_is_replaced() {
        let git = FakeGit::linear(10);
        let stray = git.add_unrelated_root("README");
        git.set_destination(&stray);
        let history = history(&git, "refs/remotes/origin/develop").await.unwrap();
        let delta = delta(&git, &range(), &history, Some(&stray)).await.unwrap();
        assert_eq!(delta.commits.len(), 10);
        assert_eq!(delta.base, DeltaBase::Replaced { head: stray });
    }

    #[tokio::test]
    async fn unrelated_destination_history_diverges() {
        let git = FakeGit::linear(10);
        let root = git.add_unrelated_root("other root");
        let tip = git.add_commit(&[root.as_str()], "other tip");
        git.set_destination(&tip);
        let history = history(&git, "refs/remotes/origin/develop").await.unwrap();
        let err = delta(&git, &range(), &history, Some(&tip)).await.unwrap_err();
        assert!(matches!(err, SyncError::Divergence(_)), "{err}");
    }

    proptest! {
        #[test]
        fn strip_is_idempotent(line in "[-|/\\\\*_. ]{0,8}[0-9a-f ]{0,20}\t?[ -~]{0,20}") {
            let once = strip_decoration(&line);
            prop_assert_eq!(strip_decoration(once), once);
        }
    }
}
