// src/main.rs
// Entry point: load config, load env, set up logging per subcommand,
// dispatch, map errors to exit codes. Grounded on the teacher's `main.rs`
// (per-subcommand log level, `.env` loaded only from the state dir, never
// CWD — a malicious repo could override API keys).

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{Level, error};
use tracing_subscriber::FmtSubscriber;

use agenr::cli::{self, Cli, Commands, ConfigAction, parse_platform};
use agenr::config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = dotenvy::from_path(Config::state_dir().join(".env")) {
        tracing::debug!("no global .env file loaded: {e}");
    }

    let cli_args = Cli::parse();

    let log_level = match &cli_args.command {
        Commands::Watch { verbose, .. } if *verbose => Level::DEBUG,
        Commands::Watch { .. } => Level::INFO,
        Commands::Ingest { verbose, .. } if *verbose => Level::DEBUG,
        Commands::Recall { .. } => Level::WARN,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match run(cli_args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(cli_args: Cli) -> agenr::error::Result<()> {
    let config = Config::load();

    match cli_args.command {
        Commands::Watch {
            platform,
            once,
            dry_run,
            verbose,
            context,
            min_chunk,
            interval_secs,
        } => {
            let platform = parse_platform(&platform)?;
            let pool = cli::clients::open_pool(&config).await?;
            let embedder = cli::clients::build_embedder(&config);
            let llm = cli::clients::build_llm(&config);
            let extractor = Arc::new(cli::clients::build_extractor(&config, llm.clone(), verbose));
            let queue = cli::clients::spawn_write_queue(pool.clone(), embedder.clone(), llm, &config);

            let args = cli::watch::WatchArgs { once, dry_run, verbose, context, min_chunk, interval_secs };
            cli::watch::run(platform, pool, embedder, extractor, queue, &args).await
        }
        Commands::Ingest { path, force, dry_run, bulk, verbose } => {
            let pool = cli::clients::open_pool(&config).await?;
            let embedder = cli::clients::build_embedder(&config);
            let llm = cli::clients::build_llm(&config);
            let extractor = cli::clients::build_extractor(&config, llm.clone(), verbose);
            let queue = cli::clients::spawn_write_queue(pool.clone(), embedder, llm, &config);

            let options = cli::ingest::IngestOptions { force, dry_run, bulk, verbose };
            let stored = cli::ingest::run(&path, &pool, &extractor, &queue, &options).await?;
            queue.drain().await;
            println!("{{\"stored\":{stored}}}");
            Ok(())
        }
        Commands::Recall {
            text, limit, types, tags, min_importance, since, until, expiry, scope,
            context, budget, platform, project, exclude_project, project_strict,
            browse, no_boost, no_update,
        } => {
            let pool = cli::clients::open_pool(&config).await?;
            let embedder = cli::clients::build_embedder(&config);
            let args = cli::recall::RecallArgs {
                text, limit, types, tags, min_importance, since, until, expiry, scope,
                context, budget, platform, project, exclude_project, project_strict,
                browse, no_boost, no_update,
            };
            let envelope = cli::recall::run(&pool, embedder.as_ref(), &args).await?;
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            Ok(())
        }
        Commands::Consolidate {} => {
            let pool = cli::clients::open_pool(&config).await?;
            let embedder = cli::clients::build_embedder(&config);
            let llm = cli::clients::build_llm(&config);
            let queue = cli::clients::spawn_write_queue(pool.clone(), embedder.clone(), llm.clone(), &config);
            let result = cli::consolidate::run(&pool, embedder.as_ref(), Some(llm.as_ref()), &queue, &config).await?;
            queue.drain().await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Config { action } => {
            let mut config = config;
            match action {
                ConfigAction::Show => {
                    println!("{}", cli::config::show(&config)?);
                }
                ConfigAction::Set { key, value } => {
                    cli::config::set(&mut config, &key, &value)?;
                    println!("set {key} = {value}");
                }
            }
            Ok(())
        }
    }
}
