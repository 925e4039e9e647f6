use anyhow::Result;
use colored::Colorize;
use strata_cache::{CacheStore, Invalidator};

use crate::cli::OutputFormat;
use crate::output::{print_success, print_value};

pub async fn ping(store: &CacheStore) -> Result<()> {
    let stats = store.stats();
    let Some(backend) = stats.shared_backend else {
        println!(
            "{} no shared tier configured ({} only)",
            "✗".red(),
            "local".cyan()
        );
        return Ok(());
    };
    match store.ping().await {
        Ok(()) => println!("{} {} is {}", "✓".green(), backend.cyan(), "reachable".green()),
        Err(e) => println!("{} {} {}: {e}", "✗".red(), backend.cyan(), "unreachable".red()),
    }
    Ok(())
}

pub async fn invalidate(invalidator: &Invalidator, pattern: &str, dry_run: bool) -> Result<()> {
    if dry_run {
        let keys = invalidator.matching_keys(pattern).await?;
        for key in &keys {
            println!("  {key}");
        }
        println!("{} key(s) match {}", keys.len(), pattern.cyan());
        return Ok(());
    }
    let deleted = invalidator.invalidate_by_pattern(pattern).await?;
    print_success(&format!("Invalidated {deleted} key(s) matching {}", pattern.cyan()));
    Ok(())
}

pub async fn clear(store: &CacheStore) -> Result<()> {
    let removed = store.clear_all().await?;
    print_success(&format!(
        "Cleared {removed} key(s) under prefix {}",
        store.config().key_prefix.cyan()
    ));
    Ok(())
}

pub fn stats(store: &CacheStore, format: OutputFormat) -> Result<()> {
    print_value(&store.stats(), format)
}
