//! Error taxonomy surfaced by a sync run.
//!
//! The command layer speaks `anyhow`; everything that reaches the CLI is
//! folded into [`SyncError`] so the exit code can be derived from the kind.

use thiserror::Error;

use crate::sync::verify::Mismatch;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid input detected before anything was mutated.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A required ref could not be resolved, even after fetching.
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// The destination moved (or never shared history with the source).
    #[error("destination diverged: {0}")]
    Divergence(String),

    /// The push tool or the server failed; the diagnostic is already sanitized.
    #[error("git tool failure: {diagnostic}")]
    ToolFailure { diagnostic: String },

    /// Destination history does not match the source over the shared prefix.
    #[error(
        "history verification failed {context}: {detail}{}",
        left_at(.pushed.as_deref(), .last_verified.as_deref())
    )]
    VerificationMismatch {
        context: String,
        detail: Box<Mismatch>,
        /// Unverified value the destination was left at, when a push happened.
        pushed: Option<String>,
        /// Last destination value that passed verification.
        last_verified: Option<String>,
    },

    /// The operator declined a confirmation prompt.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The run was stopped between batches (Ctrl-C).  Earlier batches may
    /// already be on the destination.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// Spawn or I/O failure from the git command layer.
    #[error(transparent)]
    Git(#[from] anyhow::Error),
}

impl SyncError {
    /// Process exit code for this error.  Declining a prompt is not a failure;
    /// an interrupted run uses the shell's SIGINT convention.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Cancelled(_) => 0,
            SyncError::Interrupted(_) => 130,
            _ => 1,
        }
    }
}

fn left_at(pushed: Option<&str>, last_verified: Option<&str>) -> String {
    match (pushed, last_verified) {
        (Some(pushed), Some(verified)) => format!(
            "; destination left at unverified {pushed}, last verified value {verified}"
        ),
        (Some(pushed), None) => format!(
            "; destination left at unverified {pushed}, no earlier value was verified"
        ),
        _ => String::new(),
    }
}
