mod cli;
mod commands;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use strata_cache::config::loader::load_config;
use strata_cache::observability::init_tracing_from_config;
use strata_cache::{Invalidator, create_cache_store};

use cli::{Cli, Commands};
use output::print_error;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let format = cli.format.unwrap_or_default();

    let settings = load_config(cli.config.as_deref())
        .map_err(anyhow::Error::msg)
        .context("Failed to load configuration")?;
    if cli.verbose {
        init_tracing_from_config(&settings.logging);
    } else {
        init_tracing_from_config(&settings.logging.quiet());
    }
    tracing::debug!(prefix = %settings.store.key_prefix, redis = settings.redis.enabled, "configuration loaded");

    let store = create_cache_store(&settings).await;

    let outcome = match &cli.command {
        Commands::Ping => commands::admin::ping(&store).await,
        Commands::Get(args) => commands::keys::get(&store, &args.key, args.entry, format).await,
        Commands::Set(args) => commands::keys::set(&store, args).await,
        Commands::Del(args) => commands::keys::delete(&store, &args.keys).await,
        Commands::Invalidate(args) => {
            let invalidator = Invalidator::new(store.clone(), settings.invalidator.clone());
            commands::admin::invalidate(&invalidator, &args.pattern, args.dry_run).await
        }
        Commands::Clear => commands::admin::clear(&store).await,
        Commands::Stats => commands::admin::stats(&store, format),
    };

    store.close().await;
    outcome
}
