use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::Value;
use strata_cache::{CacheStore, SetOptions};

use crate::cli::{OutputFormat, SetArgs};
use crate::output::{print_success, print_value, print_warning};

pub async fn get(store: &CacheStore, key: &str, full_entry: bool, format: OutputFormat) -> Result<()> {
    match store.get_entry(key).await? {
        Some(entry) if full_entry => print_value(entry.as_ref(), format)?,
        Some(entry) => print_value(&entry.value, format)?,
        None => print_warning(&format!("{} is not cached", key.cyan())),
    }
    Ok(())
}

pub async fn set(store: &CacheStore, args: &SetArgs) -> Result<()> {
    let value: Value = serde_json::from_str(&args.value).context("Invalid JSON value")?;
    let mut opts = SetOptions::default();
    if let Some(ms) = args.ttl_ms {
        opts.ttl = Some(Duration::from_millis(ms));
    }
    if !args.tags.is_empty() {
        opts = opts.with_tags(args.tags.iter().cloned());
    }
    store.set(&args.key, &value, opts).await?;

    let ttl = args.ttl_ms.unwrap_or(store.config().default_ttl_ms);
    print_success(&format!("Set {} (ttl {ttl} ms)", args.key.cyan()));
    Ok(())
}

pub async fn delete(store: &CacheStore, keys: &[String]) -> Result<()> {
    let removed = if let [key] = keys {
        u64::from(store.delete(key).await?)
    } else {
        store.delete_many(keys).await?
    };
    print_success(&format!("Deleted {removed} of {} key(s)", keys.len()));
    Ok(())
}
