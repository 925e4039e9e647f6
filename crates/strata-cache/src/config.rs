use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Highest integer a JSON consumer using IEEE-754 doubles can represent exactly.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheSettings {
    /// Redis (shared tier) configuration
    #[serde(default)]
    pub redis: RedisConfig,
    /// Cache store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Query result cache configuration
    #[serde(default)]
    pub query: QueryCacheConfig,
    /// Invalidator configuration
    #[serde(default)]
    pub invalidator: InvalidatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CacheSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.redis.enabled {
            if self.redis.url.is_empty() {
                return Err("redis.url must be set when redis is enabled".into());
            }
            if self.redis.pool_size == 0 {
                return Err("redis.pool_size must be > 0".into());
            }
            if self.redis.timeout_ms == 0 {
                return Err("redis.timeout_ms must be > 0".into());
            }
        }
        // Store validations
        if self.store.key_prefix.is_empty() {
            return Err("store.key_prefix must not be empty".into());
        }
        if self.store.default_ttl_ms == 0 {
            return Err("store.default_ttl_ms must be > 0".into());
        }
        if self.store.local_max_entries == 0 {
            return Err("store.local_max_entries must be > 0".into());
        }
        if self.store.inflight_max_entries == 0 {
            return Err("store.inflight_max_entries must be > 0".into());
        }
        if self.store.inflight_grace_ms == 0 || self.store.compute_timeout_ms == 0 {
            return Err("store in-flight timeouts must be > 0".into());
        }
        if self.store.sweep_interval_ms == 0 {
            return Err("store.sweep_interval_ms must be > 0".into());
        }
        if self.store.delete_batch_size == 0 || self.store.scan_count == 0 {
            return Err("store batch sizes must be > 0".into());
        }
        // Query cache validations
        if self.query.max_version_groups == 0 {
            return Err("query.max_version_groups must be > 0".into());
        }
        if self.query.version_sweep_interval_ms == 0 || self.query.version_idle_ms == 0 {
            return Err("query version sweep intervals must be > 0".into());
        }
        if self.query.max_version < 2 || self.query.max_version > MAX_SAFE_INTEGER {
            return Err(format!(
                "query.max_version must be in 2..={MAX_SAFE_INTEGER}"
            ));
        }
        // Invalidator validations
        if self.invalidator.max_rules == 0 {
            return Err("invalidator.max_rules must be > 0".into());
        }
        if self.invalidator.queue_capacity == 0 {
            return Err("invalidator.queue_capacity must be > 0".into());
        }
        // Logging validations
        if let Err(e) = tracing_subscriber::EnvFilter::try_new(self.logging.filter()) {
            return Err(format!("logging filter is invalid: {e}"));
        }
        Ok(())
    }
}

/// Redis configuration for the shared (L2) tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades without it)
    /// Default: false (local tier only)
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Broadcast deletions so other instances drop their local copies
    #[serde(default)]
    pub pubsub: bool,

    /// Pub/sub channel used for cross-instance invalidation
    #[serde(default = "default_redis_channel")]
    pub channel: String,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

fn default_redis_channel() -> String {
    "strata:invalidate".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            pubsub: false,
            channel: default_redis_channel(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Cache store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Prefix applied to every key written to the shared tier
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// TTL used when a write does not specify one
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Local (L1) cache max entries
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: u64,

    /// Local TTL for values promoted from the shared tier
    #[serde(default = "default_promotion_ttl_ms")]
    pub promotion_ttl_ms: u64,

    /// Maximum number of concurrent in-flight computations
    #[serde(default = "default_inflight_max_entries")]
    pub inflight_max_entries: usize,

    /// Age after which an in-flight computation is no longer joined
    #[serde(default = "default_inflight_grace_ms")]
    pub inflight_grace_ms: u64,

    /// Default timeout for a single computation
    #[serde(default = "default_compute_timeout_ms")]
    pub compute_timeout_ms: u64,

    /// Interval of the stale in-flight sweep
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Maximum keys per multi-key delete against the shared tier
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,

    /// COUNT hint for each cursor step when scanning the shared tier
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
}

fn default_key_prefix() -> String {
    "cache:".to_string()
}

fn default_ttl_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_local_max_entries() -> u64 {
    10_000
}

fn default_promotion_ttl_ms() -> u64 {
    60_000
}

fn default_inflight_max_entries() -> usize {
    10_000
}

fn default_inflight_grace_ms() -> u64 {
    30_000
}

fn default_compute_timeout_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_delete_batch_size() -> usize {
    100
}

fn default_scan_count() -> usize {
    100
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            default_ttl_ms: default_ttl_ms(),
            local_max_entries: default_local_max_entries(),
            promotion_ttl_ms: default_promotion_ttl_ms(),
            inflight_max_entries: default_inflight_max_entries(),
            inflight_grace_ms: default_inflight_grace_ms(),
            compute_timeout_ms: default_compute_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            delete_batch_size: default_delete_batch_size(),
            scan_count: default_scan_count(),
        }
    }
}

impl StoreConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn promotion_ttl(&self) -> Duration {
        Duration::from_millis(self.promotion_ttl_ms)
    }

    pub fn inflight_grace(&self) -> Duration {
        Duration::from_millis(self.inflight_grace_ms)
    }

    pub fn compute_timeout(&self) -> Duration {
        Duration::from_millis(self.compute_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Query result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCacheConfig {
    /// TTL used when `execute` does not specify one
    #[serde(default = "default_query_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Maximum number of tracked dependency groups
    #[serde(default = "default_max_version_groups")]
    pub max_version_groups: usize,

    /// Groups untouched for this long are dropped by the sweep
    #[serde(default = "default_version_idle_ms")]
    pub version_idle_ms: u64,

    /// Interval of the version group sweep
    #[serde(default = "default_version_sweep_interval_ms")]
    pub version_sweep_interval_ms: u64,

    /// Generation ceiling; reaching it wraps the version counter back to 1
    #[serde(default = "default_max_version")]
    pub max_version: u64,
}

fn default_query_ttl_ms() -> u64 {
    60_000
}

fn default_max_version_groups() -> usize {
    10_000
}

fn default_version_idle_ms() -> u64 {
    3_600_000 // 1 hour
}

fn default_version_sweep_interval_ms() -> u64 {
    300_000
}

fn default_max_version() -> u64 {
    1_000_000_000_000
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_query_ttl_ms(),
            max_version_groups: default_max_version_groups(),
            version_idle_ms: default_version_idle_ms(),
            version_sweep_interval_ms: default_version_sweep_interval_ms(),
            max_version: default_max_version(),
        }
    }
}

impl QueryCacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn version_idle(&self) -> Duration {
        Duration::from_millis(self.version_idle_ms)
    }

    pub fn version_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.version_sweep_interval_ms)
    }
}

/// What to discard when the invalidation event queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    DropOldest,
    DropNewest,
}

/// Invalidator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidatorConfig {
    /// Evaluate events as they arrive instead of queueing them
    #[serde(default = "default_auto_invalidate")]
    pub auto_invalidate: bool,

    #[serde(default = "default_max_rules")]
    pub max_rules: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Also scan the shared tier when evaluating key patterns
    #[serde(default = "default_include_shared")]
    pub include_shared: bool,
}

fn default_auto_invalidate() -> bool {
    true
}

fn default_max_rules() -> usize {
    1000
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_include_shared() -> bool {
    true
}

impl Default for InvalidatorConfig {
    fn default() -> Self {
        Self {
            auto_invalidate: default_auto_invalidate(),
            max_rules: default_max_rules(),
            queue_capacity: default_queue_capacity(),
            overflow_policy: OverflowPolicy::default(),
            include_shared: default_include_shared(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level for every target
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Per-target overrides, e.g. "strata_cache::shared=debug"
    #[serde(default)]
    pub directives: Vec<String>,

    /// Prefix each line with the emitting module
    #[serde(default = "default_log_targets")]
    pub targets: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_targets() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directives: Vec::new(),
            targets: default_log_targets(),
        }
    }
}

impl LoggingConfig {
    /// Warnings only, whatever the configured level.
    pub fn quiet(&self) -> Self {
        Self {
            level: "warn".to_string(),
            directives: Vec::new(),
            targets: self.targets,
        }
    }

    /// The filter string: the level followed by the per-target directives.
    pub fn filter(&self) -> String {
        std::iter::once(self.level.trim())
            .chain(self.directives.iter().map(|d| d.trim()))
            .filter(|d| !d.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub mod loader {
    use super::CacheSettings;
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    pub fn load_config(path: Option<&str>) -> Result<CacheSettings, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                // Try default root-level file
                let default_path = PathBuf::from("strata.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., STRATA__STORE__DEFAULT_TTL_MS=5000
        builder = builder.add_source(
            Environment::with_prefix("STRATA")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: CacheSettings = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn load_config_with_default_path<P: AsRef<Path>>(
        path: Option<P>,
    ) -> Result<CacheSettings, String> {
        let p = path
            .as_ref()
            .map(|p| p.as_ref().to_string_lossy().to_string());
        load_config(p.as_deref())
    }
}
