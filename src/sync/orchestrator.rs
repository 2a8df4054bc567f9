//! The sync run: validate, plan, then push and verify batch by batch.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::confirm::Confirm;
use super::graph::{self, DeltaBase};
use super::lfs::{self, LargeObjectCoordinator};
use super::model::{short, Batch, Commit, LogProjection, PushOutcome, RemoteRef, SyncRange};
use super::planner;
use super::push::{PushClassifier, PushExecutor};
use super::verify::HistoryVerifier;
use crate::config::Config;
use crate::credentials::sanitize_remote_url;
use crate::error::SyncError;
use crate::git::GitTool;

// ---------------------------------------------------------------------------
// State / report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Validating,
    Planning,
    Preparing,
    Pushing,
    Verifying,
    Done,
    Aborted,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Validating => "validating",
            SyncState::Planning => "planning",
            SyncState::Preparing => "preparing",
            SyncState::Pushing => "pushing",
            SyncState::Verifying => "verifying",
            SyncState::Done => "done",
            SyncState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub source: String,
    pub destination: String,
    /// Commits in the delta.
    pub commits: usize,
    /// Batches in the plan.
    pub batches: usize,
    /// Batches that needed (and got) their own push.
    pub batches_pushed: usize,
    /// Total time spent in the inter-batch delay.
    pub pacing_ms: u64,
    pub lfs_commits_fetched: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Destination value observed at the end of the run.
    pub final_destination: Option<String>,
}

impl SyncReport {
    pub fn up_to_date(&self) -> bool {
        self.commits == 0
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct SyncOrchestrator<'a> {
    git: &'a dyn GitTool,
    confirm: &'a dyn Confirm,
    config: &'a Config,
    state: SyncState,
    abort: Arc<AtomicBool>,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(git: &'a dyn GitTool, confirm: &'a dyn Confirm, config: &'a Config) -> Self {
        Self {
            git,
            confirm,
            config,
            state: SyncState::Validating,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked before every push; setting it stops the run cleanly.
    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    fn transition(&mut self, next: SyncState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "state transition");
            self.state = next;
        }
    }

    fn range(&self) -> SyncRange {
        SyncRange {
            source: RemoteRef::new(&self.config.remotes.source, &self.config.branch),
            destination: RemoteRef::new(&self.config.remotes.destination, &self.config.branch),
        }
    }

    /// Run to completion.  On any error the destination is left wherever the
    /// last successful push put it.
    #[instrument(skip(self), fields(branch = %self.config.branch))]
    pub async fn run(&mut self) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let range = self.range();

        let result = self.run_inner(&range, started_at).await;
        match &result {
            Ok(_) => self.transition(SyncState::Done),
            Err(e) => {
                warn!(error = %e, state = %self.state, "sync aborted");
                self.transition(SyncState::Aborted);
            }
        }
        result
    }

    async fn run_inner(
        &mut self,
        range: &SyncRange,
        started_at: DateTime<Utc>,
    ) -> Result<SyncReport, SyncError> {
        let git = self.git;
        let config = self.config;

        // ---- Validating ----
        self.transition(SyncState::Validating);
        let destination_head = self.validate(range).await?;

        // ---- Planning ----
        self.transition(SyncState::Planning);
        let history = graph::history(git, &range.source.tracking_ref()).await?;
        let delta = graph::delta(git, range, &history, destination_head.as_deref()).await?;
        let batches = planner::plan(&delta.commits, config.batch.size)?;

        let mut report = SyncReport {
            source: range.source.to_string(),
            destination: range.destination.to_string(),
            commits: delta.commits.len(),
            batches: batches.len(),
            batches_pushed: 0,
            pacing_ms: 0,
            lfs_commits_fetched: 0,
            started_at,
            finished_at: started_at,
            final_destination: destination_head.clone(),
        };

        if batches.is_empty() {
            info!("destination already up to date");
            report.finished_at = Utc::now();
            return Ok(report);
        }

        info!(
            commits = report.commits,
            batches = report.batches,
            batch_size = config.batch.size,
            "sync plan ready"
        );

        let mut verifier =
            HistoryVerifier::new(config.verify.enabled, config.verify.capture_dir.as_deref())?;
        if verifier.enabled() {
            verifier
                .set_source(LogProjection::from_commits(&history))
                .await?;
            self.verify_before_push(&verifier, range, &history, &delta.base)
                .await?;
        }

        let classifier = PushClassifier::new(&config.push.patterns)
            .map_err(|e| SyncError::Configuration(format!("{e:#}")))?;
        let executor = PushExecutor::new(classifier, config.push.force_with_lease);
        let lfs = LargeObjectCoordinator::detect(git, &range.source.remote).await;

        // Lease expectation: the last value we observed or pushed.
        let mut expected = delta.base.head().map(str::to_string);
        let mut last_verified = match &delta.base {
            DeltaBase::Ancestor { head } => Some(head.clone()),
            _ => None,
        };
        let mut lfs_base = last_verified.clone();
        let total = batches.len();

        // ---- Batch loop ----
        for batch in &batches {
            let n = batch.index + 1;
            if batch.carried {
                info!(batch = n, total, "batch already carried by the previous frontier");
                continue;
            }
            if self.abort.load(Ordering::SeqCst) {
                return Err(SyncError::Interrupted(format!(
                    "abort requested before batch {n}/{total}"
                )));
            }

            self.transition(SyncState::Preparing);
            let lfs_range = lfs::batch_range(lfs_base.as_deref(), &batch.frontier.id);
            report.lfs_commits_fetched += lfs.prepare(git, &lfs_range).await;

            if config.batch.preview {
                self.preview(batch, total, &executor, &range.destination, expected.as_deref())
                    .await?;
            }

            self.transition(SyncState::Pushing);
            info!(
                batch = n,
                total,
                commits = batch.len(),
                frontier = %batch.frontier.short_id(),
                "pushing batch"
            );
            match executor
                .push(git, batch, &range.destination, expected.as_deref())
                .await?
            {
                PushOutcome::Success(pushed) => expected = Some(pushed),
                PushOutcome::Rejected(reason) => {
                    return Err(SyncError::Divergence(format!(
                        "batch {n}/{total} rejected by {}: {reason}",
                        range.destination
                    )));
                }
                PushOutcome::ToolError(diagnostic) => {
                    return Err(SyncError::ToolFailure {
                        diagnostic: format!("batch {n}/{total}: {diagnostic}"),
                    });
                }
            }
            report.batches_pushed += 1;
            lfs_base = Some(batch.frontier.id.clone());

            self.transition(SyncState::Verifying);
            if verifier.enabled() {
                if let Some(mismatch) = verifier
                    .verify(git, &range.destination, &format!("batch-{n:03}"))
                    .await?
                {
                    return Err(SyncError::VerificationMismatch {
                        context: format!("after batch {n}/{total}"),
                        detail: Box::new(mismatch),
                        pushed: expected.clone(),
                        last_verified: last_verified.clone(),
                    });
                }
                last_verified = expected.clone();
            } else {
                git.fetch(&range.destination.remote, Some(&range.destination.branch), true)
                    .await?;
            }
            info!(batch = n, total, "batch complete");

            let more_to_push = batches[batch.index + 1..].iter().any(|b| !b.carried);
            if more_to_push && config.batch.pacing_ms > 0 {
                tokio::time::sleep(config.batch.pacing()).await;
                report.pacing_ms += config.batch.pacing_ms;
            }
        }

        report.final_destination = git.resolve_ref(&range.destination.tracking_ref()).await?;
        report.finished_at = Utc::now();
        info!(
            commits = report.commits,
            batches_pushed = report.batches_pushed,
            pacing_ms = report.pacing_ms,
            "sync complete"
        );
        Ok(report)
    }

    /// Pre-flight checks.  Returns the destination head, if the branch exists.
    async fn validate(&self, range: &SyncRange) -> Result<Option<String>, SyncError> {
        let git = self.git;

        if !git.is_repository().await? {
            return Err(SyncError::Configuration(
                "workspace is not a git repository".to_string(),
            ));
        }

        for remote in [&range.source.remote, &range.destination.remote] {
            let url = git.remote_url(remote).await?.ok_or_else(|| {
                SyncError::Configuration(format!("remote '{remote}' is not configured"))
            })?;
            info!(%remote, url = %sanitize_remote_url(&url), "remote configured");
        }

        let protected = &self.config.remotes.protected;
        if &range.destination.remote == protected {
            let prompt = format!(
                "Destination remote '{protected}' is protected. Pushing {} to it rewrites {}.",
                range.source, range.destination
            );
            if !self.confirm.confirm(&prompt).await? {
                return Err(SyncError::Cancelled(format!(
                    "push to protected remote '{protected}' declined"
                )));
            }
        }

        git.fetch(&range.destination.remote, None, true).await?;
        if self.config.remotes.fetch_source {
            git.fetch(&range.source.remote, None, true).await?;
        }

        let source_ref = range.source.tracking_ref();
        let source_head = git
            .resolve_ref(&source_ref)
            .await?
            .ok_or_else(|| SyncError::RefNotFound(format!("{} ({source_ref})", range.source)))?;
        let destination_head = git.resolve_ref(&range.destination.tracking_ref()).await?;

        info!(
            source_head = short(&source_head),
            destination_head = destination_head.as_deref().map(short).unwrap_or("<absent>"),
            "refs resolved"
        );
        Ok(destination_head)
    }

    /// Refuse to push on top of a destination that already disagrees with the
    /// source.
    async fn verify_before_push(
        &mut self,
        verifier: &HistoryVerifier,
        range: &SyncRange,
        history: &[Commit],
        base: &DeltaBase,
    ) -> Result<(), SyncError> {
        let DeltaBase::Ancestor { head } = base else {
            return Ok(());
        };

        // Only first-parent commits have a projection that is a prefix of the
        // source's.
        let on_line = graph::first_parent_positions(history)
            .into_iter()
            .any(|pos| history[pos].id == *head);
        if !on_line {
            debug!(
                destination_head = short(head),
                "destination head is off the first-parent line; skipping pre-push check"
            );
            return Ok(());
        }

        self.transition(SyncState::Verifying);
        match verifier.verify(self.git, &range.destination, "before").await? {
            None => Ok(()),
            Some(mismatch) => Err(SyncError::VerificationMismatch {
                context: "before the first push".to_string(),
                detail: Box::new(mismatch),
                pushed: None,
                last_verified: None,
            }),
        }
    }

    async fn preview(
        &self,
        batch: &Batch,
        total: usize,
        executor: &PushExecutor,
        destination: &RemoteRef,
        expected: Option<&str>,
    ) -> Result<(), SyncError> {
        let mut prompt = format!(
            "Batch {}/{total}: {} commits\n",
            batch.index + 1,
            batch.len()
        );
        for commit in &batch.commits {
            prompt.push_str(&format!("  {} {}\n", commit.short_id(), commit.summary));
        }
        prompt.push_str(&format!(
            "Frontier: {} {}\nCommand: {}",
            batch.frontier.id,
            batch.frontier.summary,
            executor.command_line(batch, destination, expected)
        ));

        if self.confirm.confirm(&prompt).await? {
            Ok(())
        } else {
            Err(SyncError::Cancelled(format!(
                "batch {}/{total} push declined",
                batch.index + 1
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
