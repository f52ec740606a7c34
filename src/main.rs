// SPDX-License-Identifier: MIT
//! logtriage CLI — scan a build log against the stored cause set.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use logtriage::config::TriageConfig;
use logtriage::knowledge::{KnowledgeStore, LocalFileStore};
use logtriage::scan::FileLogSource;
use logtriage::AppContext;

#[derive(Parser)]
#[command(
    name = "logtriage",
    about = "logtriage — build-failure cause scanner for CI console logs",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config directory holding config.toml and causes.json
    #[arg(long, env = "LOGTRIAGE_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, env = "LOGTRIAGE_LOG", global = true)]
    log: Option<String>,

    /// Worker pool size for scan tasks
    #[arg(long, env = "LOGTRIAGE_THREADS", global = true)]
    threads: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Scan one build log and print the outcome as JSON.
    ///
    /// Exits 0 even when no cause matched — "no cause found" is a recorded
    /// outcome, and scan failures are absorbed into the outcome record.
    ///
    /// Examples:
    ///   logtriage scan build.log
    ///   logtriage scan build.log --build-id nightly-1234
    Scan {
        /// Path to the build's console log
        log_file: PathBuf,

        /// Build identifier recorded in the outcome
        #[arg(long, default_value = "local")]
        build_id: String,
    },
    /// Print the stored causes as JSON.
    Causes,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = TriageConfig::new(args.config_dir, args.log, args.threads);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Scan { log_file, build_id } => scan(config, log_file, build_id).await,
        Command::Causes => list_causes(config).await,
    }
}

async fn scan(config: TriageConfig, log_file: PathBuf, build_id: String) -> Result<()> {
    let ctx = AppContext::new(config);
    ctx.cache.start().await;
    ctx.cache.invalidate();

    // One-shot run: give the first refresh a moment to publish.
    let loaded = wait_for_snapshot(&ctx, Duration::from_secs(5)).await;
    if !loaded {
        info!("knowledge base empty or store unavailable — scanning with no causes");
    }

    let causes = ctx.cache.causes();
    info!(
        build_id,
        causes = causes.len(),
        log = %log_file.display(),
        "scanning build log"
    );
    let source = Arc::new(FileLogSource::new(log_file));
    let outcome = ctx.orchestrator.scan(&causes, source, &build_id).await;
    ctx.cache.stop().await;

    println!(
        "{}",
        serde_json::to_string_pretty(&outcome).context("serializing scan outcome")?
    );
    Ok(())
}

async fn wait_for_snapshot(ctx: &AppContext, budget: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if ctx.cache.snapshot().refreshed_at.is_some() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

async fn list_causes(config: TriageConfig) -> Result<()> {
    let store = LocalFileStore::new(config.cause_file());
    let causes = store.list().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&causes).context("serializing causes")?
    );
    Ok(())
}
