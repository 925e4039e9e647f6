//! Tracing setup for processes embedding the cache.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from [`LoggingConfig`].
//! Output goes to stderr so that command output on stdout stays machine-readable.
//! The filter layer is reloadable, so the level can be raised on a running
//! process without reinstalling the subscriber.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::LoggingConfig;

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Install the global subscriber. Later calls leave the first one in place.
pub fn init_tracing_from_config(logging: &LoggingConfig) {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| config_filter(logging));

    let (filter_layer, handle) = reload::Layer::new(filter);
    let _ = FILTER_HANDLE.set(handle);

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(logging.targets),
        )
        .try_init();
}

/// Swap the active filter for the one `logging` describes.
///
/// Returns `false` when no subscriber was installed through this module.
pub fn apply_logging_config(logging: &LoggingConfig) -> bool {
    let Some(handle) = FILTER_HANDLE.get() else {
        return false;
    };
    let filter = config_filter(logging);
    let applied = handle.modify(|active| *active = filter).is_ok();
    if applied {
        tracing::info!(filter = %logging.filter(), "log filter updated");
    }
    applied
}

fn config_filter(logging: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_new(logging.filter()).unwrap_or_else(|e| {
        eprintln!("invalid log filter {:?} ({e}), falling back to info", logging.filter());
        EnvFilter::new("info")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_joins_level_and_directives() {
        let logging = LoggingConfig {
            level: "warn".into(),
            directives: vec!["strata_cache::shared=debug".into(), " ".into()],
            ..LoggingConfig::default()
        };
        assert_eq!(logging.filter(), "warn,strata_cache::shared=debug");
        assert_eq!(logging.quiet().filter(), "warn");
    }

    #[test]
    fn test_init_is_idempotent_and_reloadable() {
        let logging = LoggingConfig::default();
        init_tracing_from_config(&logging.quiet());
        init_tracing_from_config(&logging);
        assert!(apply_logging_config(&LoggingConfig {
            directives: vec!["strata_cache::store=trace".into()],
            ..LoggingConfig::default()
        }));
    }
}
