//! Values passed between the sync components.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A commit as read from the source history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    /// Parent ids in order; the first one is the first parent.
    pub parents: Vec<String>,
}

impl Commit {
    pub fn short_id(&self) -> &str {
        short(&self.id)
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}

/// First eight characters of a commit id.
pub fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// `remote/branch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteRef {
    pub remote: String,
    pub branch: String,
}

impl RemoteRef {
    pub fn new(remote: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            branch: branch.into(),
        }
    }

    /// Where the last observed value lives locally.
    pub fn tracking_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.remote, self.branch)
    }

    /// Ref name on the remote side.
    pub fn head_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.remote, self.branch)
    }
}

/// The pair of refs a run mirrors between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRange {
    pub source: RemoteRef,
    pub destination: RemoteRef,
}

/// A contiguous slice of the delta, transferred by pushing its frontier.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Zero-based position in the plan.
    pub index: usize,
    pub commits: Vec<Commit>,
    pub frontier: Commit,
    /// Position of the frontier within the delta.
    pub frontier_position: usize,
    /// The previous batch's frontier already carries every commit in here.
    pub carried: bool,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }
}

/// One normalized line of a history projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub id: String,
    pub summary: String,
}

impl LogRecord {
    pub fn new(id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            summary: summary.into(),
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.summary)
    }
}

/// Ordered `(id, summary)` rendering of a ref's history, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogProjection {
    pub records: Vec<LogRecord>,
}

impl LogProjection {
    pub fn from_commits(commits: &[Commit]) -> Self {
        Self {
            records: commits
                .iter()
                .map(|c| LogRecord::new(c.id.clone(), c.summary.clone()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// One record per line, the format written to capture files.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&record.to_string());
            out.push('\n');
        }
        out
    }
}

/// Classified result of pushing one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The destination now points at the contained commit.
    Success(String),
    /// The destination moved or the push was not a fast-forward.
    Rejected(String),
    /// The server or the tool failed.
    ToolError(String),
}
