use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sync::push::PushClassifier;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Everything a sync run needs to know, passed explicitly into the
/// orchestrator.
///
/// Every section is optional in the YAML file; CLI flags override whatever the
/// file provides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remotes: RemotesConfig,
    /// Branch mirrored from `remotes.source` to `remotes.destination`.
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remotes: RemotesConfig::default(),
            branch: default_branch(),
            batch: BatchConfig::default(),
            push: PushConfig::default(),
            verify: VerifyConfig::default(),
        }
    }
}

fn default_branch() -> String {
    "develop".to_string()
}

// ---------------------------------------------------------------------------
// Remotes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotesConfig {
    /// Remote the history is read from.
    #[serde(default = "default_source_remote")]
    pub source: String,
    /// Remote the history is pushed to.
    #[serde(default = "default_destination_remote")]
    pub destination: String,
    /// Pushing to this remote requires an explicit confirmation.
    #[serde(default = "default_source_remote")]
    pub protected: String,
    /// Force-fetch the source remote during validation.  Off by default: the
    /// source is usually refreshed by whatever scheduled the run.
    #[serde(default)]
    pub fetch_source: bool,
}

impl Default for RemotesConfig {
    fn default() -> Self {
        Self {
            source: default_source_remote(),
            destination: default_destination_remote(),
            protected: default_source_remote(),
            fetch_source: false,
        }
    }
}

fn default_source_remote() -> String {
    "origin".to_string()
}

fn default_destination_remote() -> String {
    "destination".to_string()
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum number of commits per batch.
    #[serde(default = "default_batch_size")]
    pub size: usize,
    /// Delay (milliseconds) between successfully verified batches.
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    /// Show every batch and wait for confirmation before pushing it.
    #[serde(default)]
    pub preview: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            pacing_ms: default_pacing_ms(),
            preview: false,
        }
    }
}

impl BatchConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_pacing_ms() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Push with `--force-with-lease` against the last observed destination
    /// value.  When disabled a plain push is used and any divergence fails.
    #[serde(default = "bool_true")]
    pub force_with_lease: bool,
    /// Ordered output classifiers; the first match wins.
    #[serde(default = "default_push_patterns")]
    pub patterns: Vec<PatternRule>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            force_with_lease: true,
            patterns: default_push_patterns(),
        }
    }
}

/// How a matched push-output pattern is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternKind {
    /// The destination moved underneath us (lease or fast-forward rejection).
    Divergence,
    /// The server or the tool failed (unpacker, size limits, transport).
    ToolError,
}

/// A named, case-insensitive regex applied to combined push output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub name: String,
    pub pattern: String,
    pub kind: PatternKind,
}

impl PatternRule {
    pub fn new(name: &str, kind: PatternKind, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            kind,
        }
    }
}

/// Known-bad push output, most specific first.
pub fn default_push_patterns() -> Vec<PatternRule> {
    use PatternKind::{Divergence, ToolError};
    vec![
        PatternRule::new("stale-lease", Divergence, r"stale info"),
        PatternRule::new("non-fast-forward", Divergence, r"non-fast-forward"),
        PatternRule::new("fetch-first", Divergence, r"\(fetch first\)"),
        PatternRule::new("unpacker", ToolError, r"unpack(er)? (failed|error)"),
        PatternRule::new(
            "pack-size",
            ToolError,
            r"pack exceeds maximum allowed size|too large",
        ),
        PatternRule::new("remote-rejected", ToolError, r"remote rejected"),
        PatternRule::new("rpc-failed", ToolError, r"RPC failed"),
        PatternRule::new("error", ToolError, r"\berror\b"),
    ]
}

fn bool_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Compare history projections before the first push and after each batch.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Directory that keeps the projection captures after the run.  When unset
    /// they live in a temporary directory removed at exit.
    #[serde(default)]
    pub capture_dir: Option<PathBuf>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capture_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed with serde alone.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.batch.size > 0, "batch.size must be at least 1");
    anyhow::ensure!(!config.branch.trim().is_empty(), "branch must not be empty");
    anyhow::ensure!(
        !config.remotes.source.trim().is_empty(),
        "remotes.source must not be empty"
    );
    anyhow::ensure!(
        !config.remotes.destination.trim().is_empty(),
        "remotes.destination must not be empty"
    );
    anyhow::ensure!(
        config.remotes.source != config.remotes.destination,
        "remotes.source and remotes.destination must differ (both are {:?})",
        config.remotes.source
    );
    PushClassifier::new(&config.push.patterns).context("invalid push.patterns")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
