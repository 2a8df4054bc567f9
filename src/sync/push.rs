//! Pushing one batch frontier and classifying what git said about it.

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use tracing::{debug, instrument, warn};

use super::model::{Batch, PushOutcome, RemoteRef};
use crate::config::{PatternKind, PatternRule};
use crate::credentials::sanitize_text;
use crate::git::{GitTool, PushMode, PushRun};

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

struct CompiledRule {
    name: String,
    kind: PatternKind,
    regex: Regex,
}

/// Ordered, case-insensitive pattern list; the first match decides.
pub struct PushClassifier {
    rules: Vec<CompiledRule>,
}

impl PushClassifier {
    pub fn new(rules: &[PatternRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let regex = RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("invalid pattern {:?} ({})", rule.name, rule.pattern))?;
                Ok(CompiledRule {
                    name: rule.name.clone(),
                    kind: rule.kind,
                    regex,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Classify a finished push that tried to move the destination to `pushed`.
    pub fn classify(&self, run: &PushRun, pushed: &str) -> PushOutcome {
        let output = sanitize_text(run.output.trim());

        if let Some(rule) = self.rules.iter().find(|r| r.regex.is_match(&output)) {
            debug!(rule = %rule.name, "push output matched pattern");
            let message = format!("[{}] {}", rule.name, diagnostic_lines(&output));
            return match rule.kind {
                PatternKind::Divergence => PushOutcome::Rejected(message),
                PatternKind::ToolError => PushOutcome::ToolError(message),
            };
        }

        if run.success {
            PushOutcome::Success(pushed.to_string())
        } else {
            PushOutcome::ToolError(if output.is_empty() {
                "git push failed without output".to_string()
            } else {
                output
            })
        }
    }
}

/// The lines worth showing to an operator: rejections, errors and hints.
fn diagnostic_lines(output: &str) -> String {
    let interesting: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| {
            line.starts_with('!')
                || line.starts_with("error")
                || line.starts_with("fatal")
                || line.starts_with("remote:")
                || line.starts_with("hint")
        })
        .collect();

    if interesting.is_empty() {
        output.to_string()
    } else {
        interesting.join("\n")
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Pushes batch frontiers to the destination branch.
pub struct PushExecutor {
    classifier: PushClassifier,
    force_with_lease: bool,
}

impl PushExecutor {
    pub fn new(classifier: PushClassifier, force_with_lease: bool) -> Self {
        Self {
            classifier,
            force_with_lease,
        }
    }

    fn refspec(batch: &Batch, destination: &RemoteRef) -> String {
        format!("{}:{}", batch.frontier.id, destination.head_ref())
    }

    fn mode(&self, destination: &RemoteRef, expected: Option<&str>) -> PushMode {
        if self.force_with_lease {
            PushMode::ForceWithLease {
                refname: destination.head_ref(),
                expected: expected.map(str::to_string),
            }
        } else {
            PushMode::Plain
        }
    }

    /// The equivalent command line, for previews and logs.
    pub fn command_line(
        &self,
        batch: &Batch,
        destination: &RemoteRef,
        expected: Option<&str>,
    ) -> String {
        let lease = self
            .mode(destination, expected)
            .lease_arg()
            .map(|arg| format!(" --force-with-lease={arg}"))
            .unwrap_or_default();
        format!(
            "git push{lease} {} {}",
            destination.remote,
            Self::refspec(batch, destination)
        )
    }

    /// Push `batch`'s frontier.  `expected` is the last destination value we
    /// observed or pushed (`None` when the branch does not exist yet).
    #[instrument(skip(self, git, batch), fields(batch = batch.index + 1, frontier = %batch.frontier.short_id(), %destination))]
    pub async fn push(
        &self,
        git: &dyn GitTool,
        batch: &Batch,
        destination: &RemoteRef,
        expected: Option<&str>,
    ) -> Result<PushOutcome> {
        let refspec = Self::refspec(batch, destination);
        let mode = self.mode(destination, expected);

        let run = git.push(&destination.remote, &refspec, &mode).await?;
        let outcome = self.classifier.classify(&run, &batch.frontier.id);

        if !matches!(outcome, PushOutcome::Success(_)) {
            warn!(outcome = ?outcome, "push did not succeed");
        }
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
