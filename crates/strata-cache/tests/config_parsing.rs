use std::{env, fs};

use strata_cache::OverflowPolicy;
use strata_cache::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("strata.toml");

    let toml_content = r#"
[redis]
enabled = false
url = "redis://cache.internal:6380"
pubsub = true

[store]
key_prefix = "billing:"
default_ttl_ms = 120000
local_max_entries = 500
inflight_max_entries = 64

[query]
max_version_groups = 128

[invalidator]
auto_invalidate = false
overflow_policy = "drop_newest"

[logging]
level = "debug"
directives = ["strata_cache::shared=trace"]
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses, unspecified fields keep defaults
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.redis.url, "redis://cache.internal:6380");
    assert!(cfg.redis.pubsub);
    assert_eq!(cfg.redis.channel, "strata:invalidate");
    assert_eq!(cfg.store.key_prefix, "billing:");
    assert_eq!(cfg.store.default_ttl_ms, 120_000);
    assert_eq!(cfg.store.local_max_entries, 500);
    assert_eq!(cfg.store.inflight_max_entries, 64);
    assert_eq!(cfg.store.delete_batch_size, 100);
    assert_eq!(cfg.query.max_version_groups, 128);
    assert!(!cfg.invalidator.auto_invalidate);
    assert_eq!(cfg.invalidator.overflow_policy, OverflowPolicy::DropNewest);
    assert_eq!(cfg.logging.level.to_ascii_lowercase(), "debug");
    assert_eq!(cfg.logging.filter(), "debug,strata_cache::shared=trace");
    assert!(cfg.logging.targets);

    // 2) Env override should win over file
    unsafe {
        env::set_var("STRATA__STORE__DEFAULT_TTL_MS", "5000");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.store.default_ttl_ms, 5000);
    unsafe {
        env::remove_var("STRATA__STORE__DEFAULT_TTL_MS");
    }

    // 3) Invalid config should error
    let invalid_path = dir.path().join("invalid.toml");
    let invalid_toml = r#"
[store]
inflight_max_entries = 0
"#;
    fs::write(&invalid_path, invalid_toml).expect("write invalid toml");
    let err = load_config(invalid_path.to_str()).expect_err("expected validation error");
    assert!(err.contains("inflight_max_entries must be > 0"));

    let unsafe_ceiling = dir.path().join("ceiling.toml");
    fs::write(&unsafe_ceiling, "[query]\nmax_version = 9007199254740992\n").expect("write toml");
    let err = load_config(unsafe_ceiling.to_str()).expect_err("expected validation error");
    assert!(err.contains("max_version"));

    let bad_filter = dir.path().join("filter.toml");
    fs::write(&bad_filter, "[logging]\nlevel = \"strata_cache=loudest\"\n").expect("write toml");
    let err = load_config(bad_filter.to_str()).expect_err("expected validation error");
    assert!(err.contains("logging filter"));
}
