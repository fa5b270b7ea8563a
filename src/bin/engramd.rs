//! Engram maintenance daemon
//!
//! Opens the memory stores and runs the maintenance scheduler until
//! interrupted: hourly project-index refresh, daily reclustering and
//! pruning, vector TTL cleanup, weekly compaction.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use engram::{EngramConfig, HashingEmbedder, MemoryEngine};

#[derive(Debug, Parser)]
#[command(name = "engramd", about = "Engram memory maintenance daemon")]
struct Args {
    /// Data directory override (defaults to the configured location)
    #[arg(long, env = "ENGRAM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Project directory to read engram.toml from
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Embedding dimension for the fallback hashing embedder
    #[arg(long, default_value_t = 384)]
    dimension: usize,

    /// Run one named task immediately and exit
    #[arg(long)]
    run_task: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = EngramConfig::load(args.project_dir.as_deref());
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }
    let problems = config.validate();
    if !problems.is_empty() {
        anyhow::bail!("configuration problems:\n  {}", problems.join("\n  "));
    }

    // The daemon only maintains stored state; the hashing embedder fixes
    // the vector-file dimension without loading a model runtime.
    let embedder = Arc::new(HashingEmbedder::new(args.dimension).context("embedder")?);
    let engine = MemoryEngine::init(config, embedder)
        .await
        .context("opening memory engine")?;

    let stats = engine.stats().await?;
    info!(
        "store: {} chunks, {} edges, {} clusters",
        stats.chunk_count, stats.edge_count, stats.cluster_count
    );

    let scheduler = engine.scheduler();

    if let Some(task) = args.run_task {
        let outcome = scheduler.run_task(&task).await?;
        info!(
            "{}: success={} ({})",
            task, outcome.success, outcome.message
        );
        engine.close().await;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    scheduler.run_daemon(shutdown_rx).await;
    engine.close().await;
    Ok(())
}
