//! Checking that the destination's history is a faithful prefix of the
//! source's after every push.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tempfile::TempDir;
use tracing::{debug, info, instrument};

use super::graph;
use super::model::{LogProjection, LogRecord, RemoteRef};
use crate::error::SyncError;
use crate::git::GitTool;

/// Records shown on each side of a mismatch.
const WINDOW: usize = 10;

// ---------------------------------------------------------------------------
// Mismatch
// ---------------------------------------------------------------------------

/// First point at which the two projections disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub position: usize,
    pub source: LogRecord,
    pub destination: LogRecord,
    /// Up to ten records per side, starting at `position`.
    pub source_window: Vec<LogRecord>,
    pub destination_window: Vec<LogRecord>,
    pub source_capture: Option<PathBuf>,
    pub destination_capture: Option<PathBuf>,
}

impl Mismatch {
    /// Multi-line side-by-side listing for the operator.
    pub fn window_report(&self) -> String {
        let mut out = String::new();
        for (label, records) in [
            ("source", &self.source_window),
            ("destination", &self.destination_window),
        ] {
            out.push_str(&format!("{label} from position {}:\n", self.position));
            for record in records {
                out.push_str(&format!("  {record}\n"));
            }
        }
        for (label, path) in [
            ("source", &self.source_capture),
            ("destination", &self.destination_capture),
        ] {
            if let Some(path) = path {
                out.push_str(&format!("{label} log: {}\n", path.display()));
            }
        }
        out
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "first divergence at position {}: source `{}` vs destination `{}`",
            self.position, self.source, self.destination
        )
    }
}

/// Compare the overlapping prefix of two projections.  A shorter side that
/// matches is fine.
pub fn compare(source: &LogProjection, destination: &LogProjection) -> Option<Mismatch> {
    let position = source
        .records
        .iter()
        .zip(&destination.records)
        .position(|(s, d)| s != d)?;

    let window = |p: &LogProjection| {
        p.records[position..p.len().min(position + WINDOW)].to_vec()
    };

    Some(Mismatch {
        position,
        source: source.records[position].clone(),
        destination: destination.records[position].clone(),
        source_window: window(source),
        destination_window: window(destination),
        source_capture: None,
        destination_capture: None,
    })
}

// ---------------------------------------------------------------------------
// Captures
// ---------------------------------------------------------------------------

/// Where projection captures are written for the duration of a run.
pub struct LogCaptures {
    dir: PathBuf,
    // Removed on drop when no directory was configured.
    _temp: Option<TempDir>,
}

impl LogCaptures {
    pub fn new(kept: Option<&Path>) -> anyhow::Result<Self> {
        match kept {
            Some(dir) => {
                std::fs::create_dir_all(dir).with_context(|| {
                    format!("failed to create capture directory: {}", dir.display())
                })?;
                Ok(Self {
                    dir: dir.to_path_buf(),
                    _temp: None,
                })
            }
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("git-batch-sync-")
                    .tempdir()
                    .context("failed to create temporary capture directory")?;
                Ok(Self {
                    dir: temp.path().to_path_buf(),
                    _temp: Some(temp),
                })
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn write(&self, name: &str, projection: &LogProjection) -> anyhow::Result<PathBuf> {
        let path = self.dir.join(format!("{name}.log"));
        tokio::fs::write(&path, projection.render())
            .await
            .with_context(|| format!("failed to write capture {}", path.display()))?;
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

pub struct HistoryVerifier {
    enabled: bool,
    captures: Option<LogCaptures>,
    source: LogProjection,
    source_capture: Option<PathBuf>,
}

impl HistoryVerifier {
    pub fn new(enabled: bool, capture_dir: Option<&Path>) -> Result<Self, SyncError> {
        let captures = if enabled {
            let captures = LogCaptures::new(capture_dir)?;
            debug!(dir = %captures.dir().display(), "history captures");
            Some(captures)
        } else {
            None
        };
        Ok(Self {
            enabled,
            captures,
            source: LogProjection::default(),
            source_capture: None,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Record the source projection every later check compares against.
    pub async fn set_source(&mut self, projection: LogProjection) -> Result<(), SyncError> {
        if let Some(captures) = &self.captures {
            self.source_capture = Some(captures.write("source", &projection).await?);
        }
        self.source = projection;
        Ok(())
    }

    /// Force-fetch `destination` and compare its history with the source.
    /// `label` names the capture file.
    #[instrument(skip(self, git), fields(%destination))]
    pub async fn verify(
        &self,
        git: &dyn GitTool,
        destination: &RemoteRef,
        label: &str,
    ) -> Result<Option<Mismatch>, SyncError> {
        if !self.enabled {
            debug!("verification disabled");
            return Ok(None);
        }

        git.fetch(&destination.remote, Some(&destination.branch), true)
            .await?;
        let projection = graph::projection(git, &destination.tracking_ref()).await?;
        if projection.is_empty() {
            return Err(SyncError::ToolFailure {
                diagnostic: format!("no commits could be read from the history of {destination}"),
            });
        }

        let destination_capture = match &self.captures {
            Some(captures) => Some(
                captures
                    .write(&format!("destination-{label}"), &projection)
                    .await?,
            ),
            None => None,
        };

        match compare(&self.source, &projection) {
            None => {
                info!(
                    compared = self.source.len().min(projection.len()),
                    "destination history verified"
                );
                Ok(None)
            }
            Some(mut mismatch) => {
                mismatch.source_capture = self.source_capture.clone();
                mismatch.destination_capture = destination_capture;
                Ok(Some(mismatch))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn projection(records: &[(&str, &str)]) -> LogProjection {
        LogProjection {
            records: records
                .iter()
                .map(|(id, summary)| LogRecord::new(*id, *summary))
                .collect(),
        }
    }

    #[test]
    fn identical_projections_match() {
        let p = projection(&[("a", "one"), ("b", "two")]);
        assert!(compare(&p, &p).is_none());
    }

    #[test]
    fn strict_prefix_matches() {
        let src = projection(&[("a", "one"), ("b", "two"), ("c", "three")]);
        let dst = projection(&[("a", "one"), ("b", "two")]);
        assert!(compare(&src, &dst).is_none());
        assert!(compare(&dst, &src).is_none());
        assert!(compare(&src, &LogProjection::default()).is_none());
    }

    #[test]
    fn differing_summary_is_a_mismatch() {
        let src = projection(&[("a", "one"), ("b", "two")]);
        let dst = projection(&[("a", "one"), ("b", "two (amended)")]);
        let m = compare(&src, &dst).unwrap();
        assert_eq!(m.position, 1);
        assert_eq!(m.destination.summary, "two (amended)");
    }

    #[test]
    fn reordering_is_a_mismatch() {
        let src = projection(&[("a", "one"), ("b", "two"), ("c", "three")]);
        let dst = projection(&[("a", "one"), ("c", "three"), ("b", "two")]);
        let m = compare(&src, &dst).unwrap();
        assert_eq!(m.position, 1);
        assert_eq!(m.source.id, "b");
        assert_eq!(m.destination.id, "c");
    }

    #[test]
    fn window_is_capped_at_ten_records() {
        let ids: Vec<String> = (0..30).map(|i| format!("{i:02}")).collect();
        let src = LogProjection {
            records: ids.iter().map(|i| LogRecord::new(i.clone(), "s")).collect(),
        };
        let mut dst = src.clone();
        dst.records[5].summary = "changed".into();
        let m = compare(&src, &dst).unwrap();
        assert_eq!(m.position, 5);
        assert_eq!(m.source_window.len(), 10);
        assert_eq!(m.destination_window.len(), 10);
        assert_eq!(m.source_window[0].id, "05");
        assert!(m.window_report().contains("destination from position 5"));
    }

    #[tokio::test]
    async fn kept_capture_directory_survives() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("captures");
        {
            let captures = LogCaptures::new(Some(&dir)).unwrap();
            let path = captures
                .write("source", &projection(&[("a", "one")]))
                .await
                .unwrap();
            assert_eq!(std::fs::read_to_string(path).unwrap(), "a one\n");
        }
        assert!(dir.join("source.log").exists());
    }

    #[tokio::test]
    async fn temporary_captures_are_removed() {
        let dir = {
            let captures = LogCaptures::new(None).unwrap();
            captures
                .write("source", &projection(&[("a", "one")]))
                .await
                .unwrap();
            captures.dir().to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn unreadable_destination_history_is_a_tool_failure() {
        use crate::sync::testing::{id, FakeGit};

        let git = FakeGit::linear(3);
        git.set_destination(&id(2));
        git.unreadable_log("refs/remotes/destination/develop");

        let mut verifier = HistoryVerifier::new(true, None).unwrap();
        verifier
            .set_source(graph::projection(&git, "refs/remotes/origin/develop").await.unwrap())
            .await
            .unwrap();
        let err = verifier
            .verify(&git, &RemoteRef::new("destination", "develop"), "batch-001")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ToolFailure { .. }), "{err}");
    }
}
