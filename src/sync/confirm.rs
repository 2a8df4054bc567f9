//! Operator confirmation.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};

/// Asks the operator to approve a risky step.
#[async_trait::async_trait]
pub trait Confirm: Send + Sync {
    /// `true` when the operator approved.
    async fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Prompts on stderr and reads the answer from stdin.  Only `yes` approves.
pub struct ConsoleConfirm;

#[async_trait::async_trait]
impl Confirm for ConsoleConfirm {
    async fn confirm(&self, prompt: &str) -> Result<bool> {
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut stderr = std::io::stderr().lock();
            write!(stderr, "{prompt}\nType 'yes' to continue: ")?;
            stderr.flush()?;

            let mut answer = String::new();
            std::io::stdin().lock().read_line(&mut answer)?;
            Ok(is_yes(&answer))
        })
        .await
        .context("confirmation prompt panicked")?
    }
}

/// Approves everything; for `--yes` and unattended runs.
pub struct AutoApprove;

#[async_trait::async_trait]
impl Confirm for AutoApprove {
    async fn confirm(&self, prompt: &str) -> Result<bool> {
        tracing::info!(prompt, "auto-approved");
        Ok(true)
    }
}

fn is_yes(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("yes")
}
