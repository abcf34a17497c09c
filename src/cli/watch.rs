// src/cli/watch.rs
// `agenr watch` (spec.md §4.I): thin CLI argument surface over the watch
// loop, wired with a shutdown channel that fires on ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch as shutdown_watch;
use tracing::info;

use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::extract::Extractor;
use crate::queue::WriteQueue;
use crate::storage::AgenrPool;
use crate::types::Platform;
use crate::watch::{WatchOptions, run as run_watch};

#[derive(Debug, Clone)]
pub struct WatchArgs {
    pub once: bool,
    pub dry_run: bool,
    pub verbose: bool,
    pub context: Option<PathBuf>,
    pub min_chunk: u64,
    pub interval_secs: u64,
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    platform: Platform,
    pool: AgenrPool,
    embedder: Arc<dyn EmbeddingClient>,
    extractor: Arc<Extractor>,
    queue: WriteQueue,
    args: &WatchArgs,
) -> Result<()> {
    let options = WatchOptions {
        once: args.once,
        dry_run: args.dry_run,
        verbose: args.verbose,
        context_path: args.context.clone(),
        min_chunk_bytes: args.min_chunk,
        poll_interval: Duration::from_secs(args.interval_secs),
    };

    let (shutdown_tx, shutdown_rx) = shutdown_watch::channel(false);
    if !args.once && !args.dry_run {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c, shutting down watcher");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    run_watch(platform, pool, embedder, extractor, queue, options, shutdown_rx).await
}
