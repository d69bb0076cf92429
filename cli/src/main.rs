//! `hyaline-merge` entry point.
//!
//! ## Commands
//!
//! - `hyaline-merge run`: fold new extractions into the current snapshot
//!   and publish it with a new checkpoint
//! - `hyaline-merge current --output <FILE>`: download the current snapshot
//! - `hyaline-merge upload-extraction --snapshot <FILE>`: publish one
//!   extraction (producer side)
//! - `hyaline-merge checkpoint`: show the current checkpoint
//!
//! Exit status: 0 success, 2 configuration error, 3 transient I/O error,
//! 4 fold error, 1 anything else.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use hyaline_artifact_store::artifact::format_timestamp;
use hyaline_artifact_store::{ArtifactStore, GitHubArtifactStore, LocalArtifactStore};
use hyaline_merge::{
    CheckpointStore, CommandFold, MergeConfig, MergeEngine, MergeError, StoreBackend,
    upload_extraction,
};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(
    name = "hyaline-merge",
    version,
    about = "Incrementally merge extracted documentation snapshots"
)]
struct Cli {
    /// Config file (defaults to $HYALINE_MERGE_CONFIG, then ./hyaline-merge.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging; also passes --debug to the fold command.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one incremental merge.
    Run(RunArgs),
    /// Download the currently published snapshot.
    Current(CurrentArgs),
    /// Upload a snapshot as a new extraction artifact.
    UploadExtraction(UploadArgs),
    /// Show the current checkpoint.
    Checkpoint(CheckpointArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// Print the outcome as JSON.
    #[arg(long = "json", short = 'j')]
    json: bool,
}

#[derive(Debug, Parser)]
struct CurrentArgs {
    /// Where to write the snapshot.
    #[arg(long = "output", short = 'o')]
    output: PathBuf,
}

#[derive(Debug, Parser)]
struct UploadArgs {
    /// Snapshot file produced by an extraction.
    #[arg(long = "snapshot", short = 's')]
    snapshot: PathBuf,
}

#[derive(Debug, Parser)]
struct CheckpointArgs {
    /// Print as JSON.
    #[arg(long = "json", short = 'j')]
    json: bool,
}

#[derive(Debug, Serialize)]
struct CheckpointReport {
    checkpoint: Option<DateTime<Utc>>,
    artifact_id: Option<u64>,
    run_id: Option<u64>,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let (code, kind) = match err.downcast_ref::<MergeError>() {
                Some(merge_err) => {
                    let kind = merge_err.kind();
                    (kind.exit_code(), kind.as_str())
                }
                None => (1, "ERROR"),
            };
            tracing::error!(error_code = kind, "{err:#}");
            eprintln!("Error: {err:#}");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let mut config = MergeConfig::load(cli.config.as_deref())?;
    if cli.debug {
        config.fold.debug = true;
    }
    let store = open_store(&config)?;

    match cli.command {
        Command::Run(args) => run(store, &config, args).await,
        Command::Current(args) => current(store, &config, args).await,
        Command::UploadExtraction(args) => upload(store, &config, args).await,
        Command::Checkpoint(args) => checkpoint(store, &config, args).await,
    }
}

fn open_store(config: &MergeConfig) -> Result<Arc<dyn ArtifactStore>, MergeError> {
    match config.store.backend {
        StoreBackend::Github => {
            let github = config.store.github_config()?;
            tracing::debug!(
                owner = %github.owner,
                repo = %github.repo,
                "using GitHub artifact store"
            );
            let store = GitHubArtifactStore::new(github)
                .map_err(|e| MergeError::from_store("creating GitHub client", e))?;
            Ok(Arc::new(store))
        }
        StoreBackend::Local => {
            let root = &config.store.local_root;
            tracing::debug!(root = %root.display(), "using local artifact store");
            let store = LocalArtifactStore::open(root)
                .map_err(|e| MergeError::from_store("opening local artifact store", e))?;
            Ok(Arc::new(store))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subcommands
// ─────────────────────────────────────────────────────────────────────────────

async fn run(
    store: Arc<dyn ArtifactStore>,
    config: &MergeConfig,
    args: RunArgs,
) -> anyhow::Result<()> {
    tracing::info!("hyaline-merge v{} starting", env!("CARGO_PKG_VERSION"));

    let fold = CommandFold::from_settings(&config.fold);
    match fold.version().await {
        Ok(version) => tracing::info!(program = fold.program(), %version, "fold tool"),
        Err(err) => tracing::warn!(
            program = fold.program(),
            "could not determine fold tool version: {err}"
        ),
    }

    let engine = MergeEngine::new(store, fold, config.merge.clone());
    let outcome = engine.run_merge().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if let Some(checkpoint) = outcome.checkpoint.filter(|_| outcome.published) {
        println!(
            "published {} ({}, {} new extractions, checkpoint {})",
            config.merge.current_artifact_name,
            outcome.mode.as_str(),
            outcome.candidates,
            format_timestamp(&checkpoint)
        );
    } else {
        println!("nothing to publish");
    }
    Ok(())
}

async fn current(
    store: Arc<dyn ArtifactStore>,
    config: &MergeConfig,
    args: CurrentArgs,
) -> anyhow::Result<()> {
    let settings = &config.merge;
    let checkpoints = CheckpointStore::new(
        store.as_ref(),
        &settings.current_artifact_name,
        &settings.snapshot_file,
    );

    match checkpoints.fetch_current(&settings.work_dir, &args.output).await? {
        Some(checkpoint) => println!(
            "wrote {} (checkpoint {})",
            args.output.display(),
            format_timestamp(&checkpoint.timestamp)
        ),
        None => eprintln!("no current documentation has been published"),
    }
    Ok(())
}

async fn upload(
    store: Arc<dyn ArtifactStore>,
    config: &MergeConfig,
    args: UploadArgs,
) -> anyhow::Result<()> {
    let artifact = upload_extraction(store.as_ref(), &config.merge, &args.snapshot)
        .await
        .with_context(|| format!("uploading {}", args.snapshot.display()))?;
    println!(
        "uploaded {} id {} created {}",
        artifact.name,
        artifact.id,
        artifact.created_at_string()
    );
    Ok(())
}

async fn checkpoint(
    store: Arc<dyn ArtifactStore>,
    config: &MergeConfig,
    args: CheckpointArgs,
) -> anyhow::Result<()> {
    let settings = &config.merge;
    let loaded = CheckpointStore::new(
        store.as_ref(),
        &settings.current_artifact_name,
        &settings.snapshot_file,
    )
    .load(&settings.work_dir)
    .await?;

    let report = CheckpointReport {
        checkpoint: loaded.as_ref().map(|c| c.timestamp),
        artifact_id: loaded.as_ref().map(|c| c.artifact.id),
        run_id: loaded.as_ref().map(|c| c.artifact.run_id),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        match &report.checkpoint {
            Some(ts) => println!("{}", format_timestamp(ts)),
            None => println!("no checkpoint"),
        }
    }
    Ok(())
}
