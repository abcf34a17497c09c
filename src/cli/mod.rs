// src/cli/mod.rs
// Command surface (spec.md §6): one module per subcommand, grounded on the
// teacher's `cli::mod` layout (`pub mod x; pub use x::*;` per subcommand,
// dispatch from `main.rs` on the parsed `Commands` enum).

pub mod clients;
pub mod config;
pub mod consolidate;
pub mod ingest;
pub mod recall;
pub mod watch;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::{AgenrError, Result};
use crate::types::Platform;

#[derive(Debug, Parser)]
#[command(name = "agenr", version, about = "Personal knowledge engine: watch, ingest, recall.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Tail a platform's active session file and extract knowledge as it grows.
    Watch {
        /// Platform to watch: openclaw, claude-code, codex.
        #[arg(long)]
        platform: String,
        /// Process one tick and exit instead of looping forever.
        #[arg(long)]
        once: bool,
        /// Resolve and report what would happen without writing anything.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        verbose: bool,
        /// Write a CONTEXT.md snapshot to this path after every tick.
        #[arg(long)]
        context: Option<PathBuf>,
        /// Minimum bytes a file must grow before a tick re-parses it.
        #[arg(long, default_value_t = 2000)]
        min_chunk: u64,
        #[arg(long, default_value_t = 2)]
        interval_secs: u64,
    },
    /// Ingest a transcript file or directory once, outside the watch loop.
    Ingest {
        path: PathBuf,
        /// Re-ingest even if this (file_path, content_hash) pair was seen before.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
        /// Skip embeddings and the online dedup judge; defer to the consolidator.
        #[arg(long)]
        bulk: bool,
        #[arg(long)]
        verbose: bool,
    },
    /// Query stored knowledge.
    Recall {
        text: Option<String>,
        #[arg(long, default_value_t = 0)]
        limit: usize,
        #[arg(long = "type", value_delimiter = ',')]
        types: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        min_importance: Option<u8>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        expiry: Option<String>,
        #[arg(long)]
        scope: Option<String>,
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        budget: Option<u32>,
        #[arg(long)]
        platform: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        exclude_project: Option<String>,
        #[arg(long)]
        project_strict: bool,
        #[arg(long)]
        browse: bool,
        #[arg(long)]
        no_boost: bool,
        #[arg(long)]
        no_update: bool,
    },
    /// Run rule-based pruning and LLM cluster merging once over the whole store.
    Consolidate {},
    /// Inspect or change ~/.agenr/config.json.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    Show,
    Set { key: String, value: String },
}

/// Parse a `--platform` string into the domain `Platform`, producing the
/// same `Validation` error shape bad CLI input gets everywhere else.
pub fn parse_platform(s: &str) -> Result<Platform> {
    Platform::parse(s).ok_or_else(|| AgenrError::Validation {
        file: "cli".to_string(),
        reason: format!("unknown platform '{s}' (expected openclaw, claude-code, or codex)"),
    })
}
