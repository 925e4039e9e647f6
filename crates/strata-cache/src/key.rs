//! Cache key validation.
//!
//! Keys are opaque strings, conventionally `:`-separated (`org:42:plan`).
//! A key is rejected when it is empty, oversized, carries control characters,
//! or contains a segment that is known to poison object-backed key/value
//! structures in other runtimes sharing the same store (`__proto__`,
//! `constructor`, `prototype`).

use crate::error::{CacheError, Result};

/// Upper bound on key length in bytes.
pub const MAX_KEY_LEN: usize = 1024;

const FORBIDDEN_SEGMENTS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Validate a key before it touches any tier.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::invalid_key(key, "key must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(CacheError::invalid_key(
            truncate(key),
            "key exceeds maximum length",
        ));
    }
    if key.chars().any(char::is_control) {
        return Err(CacheError::invalid_key(
            key,
            "key must not contain control characters",
        ));
    }
    if key
        .split([':', '.', '/'])
        .any(|segment| FORBIDDEN_SEGMENTS.contains(&segment))
    {
        return Err(CacheError::invalid_key(key, "key contains a reserved segment"));
    }
    Ok(())
}

/// Validate every key of a batch, failing on the first bad one.
pub fn validate_keys<S: AsRef<str>>(keys: &[S]) -> Result<()> {
    keys.iter().try_for_each(|k| validate_key(k.as_ref()))
}

fn truncate(key: &str) -> String {
    let mut end = 64.min(key.len());
    while !key.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &key[..end])
}
