mod config;
mod credentials;
mod error;
mod git;
mod init;
mod remote_check;
mod sync;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::SyncError;
use crate::git::SystemGit;
use crate::sync::{AutoApprove, Confirm, ConsoleConfirm, SyncOrchestrator, SyncReport};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "git-batch-sync",
    about = "Mirror a branch into another remote in bounded, verified batches"
)]
struct Cli {
    /// Path to a YAML configuration file.  Flags override its values.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Push the source branch to the destination remote batch by batch.
    Sync(SyncArgs),
    /// Report branches that moved on a remote since the last fetch.
    Check(CheckArgs),
    /// Create or update a bare sync workspace.
    Init(InitArgs),
}

#[derive(Args, Debug)]
struct SyncArgs {
    /// Bare workspace holding both remotes.
    workspace: PathBuf,
    /// Remote to push to [default: destination].
    destination_remote: Option<String>,
    /// Branch to mirror [default: develop].
    branch: Option<String>,
    /// Show each batch and ask before pushing it.
    #[arg(long)]
    debug: bool,
    /// Skip history verification.
    #[arg(long)]
    no_verify: bool,
    /// Push without --force-with-lease.
    #[arg(long)]
    no_force: bool,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    source_remote: Option<String>,
    /// Fetch the source remote before planning.
    #[arg(long)]
    fetch_source: bool,
    /// Delay between batches, in milliseconds.
    #[arg(long)]
    pacing_ms: Option<u64>,
    /// Answer every confirmation with yes.
    #[arg(long)]
    yes: bool,
    /// Print the final report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct CheckArgs {
    workspace: PathBuf,
    #[arg(long)]
    remote: String,
    /// Also compare `--remote` against this remote.
    #[arg(long)]
    second_remote: Option<String>,
    /// `;`-separated branches to limit the check to.
    #[arg(long)]
    branches: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct InitArgs {
    #[arg(long)]
    repo_path: PathBuf,
    #[arg(long)]
    remote_url: String,
    #[arg(long, default_value = "origin")]
    remote_name: String,
    #[arg(long, num_args = 1.., default_values_t = [String::from("master")])]
    branches: Vec<String>,
    #[arg(long, alias = "dru")]
    destination_remote_url: Option<String>,
    #[arg(long, alias = "drn", default_value = "destination")]
    destination_remote_name: String,
    #[arg(long)]
    no_fetch: bool,
    /// Only print the verification report.
    #[arg(long)]
    verify_only: bool,
    #[arg(long)]
    yes: bool,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn load_config(path: Option<&PathBuf>) -> Result<Config, SyncError> {
    match path {
        Some(path) => config::load_config(path).map_err(|e| SyncError::Configuration(format!("{e:#}"))),
        None => Ok(Config::default()),
    }
}

/// Apply `sync` flags on top of the file configuration.
fn apply_sync_overrides(config: &mut Config, args: &SyncArgs) -> Result<(), SyncError> {
    if let Some(dest) = &args.destination_remote {
        config.remotes.destination = dest.clone();
    }
    if let Some(branch) = &args.branch {
        config.branch = branch.clone();
    }
    if let Some(source) = &args.source_remote {
        config.remotes.source = source.clone();
    }
    if let Some(size) = args.batch_size {
        config.batch.size = size;
    }
    if let Some(pacing) = args.pacing_ms {
        config.batch.pacing_ms = pacing;
    }
    config.batch.preview |= args.debug;
    config.remotes.fetch_source |= args.fetch_source;
    if args.no_verify {
        config.verify.enabled = false;
    }
    if args.no_force {
        config.push.force_with_lease = false;
    }
    config::validate_config(config).map_err(|e| SyncError::Configuration(format!("{e:#}")))
}

fn confirmer(yes: bool) -> Box<dyn Confirm> {
    if yes {
        Box::new(AutoApprove)
    } else {
        Box::new(ConsoleConfirm)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn print_sync_report(report: &SyncReport, json: bool) -> Result<(), SyncError> {
    if json {
        let text = serde_json::to_string_pretty(report).map_err(anyhow::Error::from)?;
        println!("{text}");
    } else if report.up_to_date() {
        println!("{} is up to date with {}", report.destination, report.source);
    } else {
        println!(
            "{} -> {}: {} commits in {} batches ({} pushed), destination now at {}",
            report.source,
            report.destination,
            report.commits,
            report.batches,
            report.batches_pushed,
            report.final_destination.as_deref().unwrap_or("(unknown)"),
        );
    }
    Ok(())
}

async fn run_sync(cli_config: Option<&PathBuf>, args: SyncArgs) -> Result<(), SyncError> {
    let mut config = load_config(cli_config)?;
    apply_sync_overrides(&mut config, &args)?;

    let git = SystemGit::new(&args.workspace);
    let confirm = confirmer(args.yes);

    let abort = Arc::new(AtomicBool::new(false));
    tokio::spawn({
        let abort = Arc::clone(&abort);
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("received SIGINT; stopping after the current batch");
                abort.store(true, Ordering::SeqCst);
            }
        }
    });

    let report = SyncOrchestrator::new(&git, confirm.as_ref(), &config)
        .with_abort_flag(abort)
        .run()
        .await?;
    print_sync_report(&report, args.json)
}

async fn run_check(args: CheckArgs) -> Result<(), SyncError> {
    let filter = args
        .branches
        .as_deref()
        .and_then(remote_check::parse_branch_filter);
    let report = remote_check::check(
        &args.workspace,
        &args.remote,
        args.second_remote.as_deref(),
        filter.as_ref(),
    )
    .await?;

    if args.json {
        let text = serde_json::to_string_pretty(&report).map_err(anyhow::Error::from)?;
        println!("{text}");
    } else {
        print!("{}", remote_check::render(&report));
    }
    Ok(())
}

async fn run_init(args: InitArgs) -> Result<(), SyncError> {
    let repo_path = std::path::absolute(&args.repo_path)
        .map_err(|e| SyncError::Configuration(format!("invalid --repo-path: {e}")))?;
    let options = init::InitOptions {
        repo_path,
        remote_name: args.remote_name,
        remote_url: args.remote_url,
        branches: args.branches,
        destination: args
            .destination_remote_url
            .map(|url| (args.destination_remote_name, url)),
        fetch: !args.no_fetch,
        verify_only: args.verify_only,
    };

    if options.verify_only {
        print!("{}", options.summary());
    }
    let confirm = confirmer(args.yes);
    let report = init::run(&options, confirm.as_ref()).await?;
    print!("{}", report.render());
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let result = match cli.command {
        Command::Sync(args) => run_sync(cli.config.as_ref(), args).await,
        Command::Check(args) => run_check(args).await,
        Command::Init(args) => run_init(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match &err {
                SyncError::Cancelled(reason) => tracing::info!(%reason, "cancelled"),
                SyncError::Interrupted(reason) => tracing::warn!(%reason, "interrupted"),
                SyncError::VerificationMismatch { detail, .. } => {
                    tracing::error!(error = %err, "sync failed");
                    eprintln!("{}", detail.window_report());
                }
                _ => tracing::error!(error = %err, "command failed"),
            }
            ExitCode::from(err.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("git-batch-sync").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn sync_flags_override_config() {
        let cli = parse(&[
            "sync", "/srv/mirror", "gitlab", "main", "--debug", "--no-verify", "--no-force",
            "--batch-size", "20", "--pacing-ms", "0",
        ]);
        let Command::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        let mut config = Config::default();
        apply_sync_overrides(&mut config, &args).unwrap();

        assert_eq!(config.remotes.destination, "gitlab");
        assert_eq!(config.branch, "main");
        assert!(config.batch.preview);
        assert!(!config.verify.enabled);
        assert!(!config.push.force_with_lease);
        assert_eq!(config.batch.size, 20);
        assert_eq!(config.batch.pacing_ms, 0);
    }

    #[test]
    fn sync_defaults_come_from_config() {
        let cli = parse(&["sync", "/srv/mirror"]);
        let Command::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        let mut config = Config::default();
        apply_sync_overrides(&mut config, &args).unwrap();
        assert_eq!(config.remotes.destination, "destination");
        assert_eq!(config.branch, "develop");
        assert!(config.verify.enabled);
    }

    #[test]
    fn invalid_override_is_a_configuration_error() {
        let cli = parse(&["sync", "/srv/mirror", "origin"]);
        let Command::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        let mut config = Config::default();
        let err = apply_sync_overrides(&mut config, &args).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[test]
    fn init_arguments() {
        let cli = parse(&[
            "--log-format", "json", "init", "--repo-path", "/srv/mirror", "--remote-url",
            "https://example.com/r.git", "--branches", "master", "develop", "--drn", "mirror",
        ]);
        assert_eq!(cli.log_format, LogFormat::Json);
        let Command::Init(args) = cli.command else {
            panic!("expected init");
        };
        assert_eq!(args.branches, vec!["master", "develop"]);
        assert_eq!(args.destination_remote_name, "mirror");
        assert_eq!(args.remote_name, "origin");
    }
}
