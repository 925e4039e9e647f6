//! Wire format shared by both tiers.
//!
//! An entry is a JSON object `{value, timestamp, expiresAt?, etag?, tags?}`. Integers outside
//! the IEEE-754 safe range are written as `{"__bigint": "<decimal>"}` so that
//! consumers using doubles (other services reading the same store) never lose
//! precision, and are restored to plain JSON integers on read.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use time::OffsetDateTime;

use crate::config::MAX_SAFE_INTEGER;
use crate::error::{CacheError, Result};

/// Marker key of an encoded big integer.
pub const BIGINT_TAG: &str = "__bigint";

/// A stored cache entry.
///
/// Entries are never mutated in place: a write replaces the whole entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    /// Milliseconds since the Unix epoch at write time.
    pub timestamp: u64,
    /// Milliseconds since the Unix epoch after which the entry is dead.
    #[serde(
        default,
        rename = "expiresAt",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            timestamp: now_millis(),
            expires_at: None,
            etag: None,
            tags: None,
        }
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn with_tags(mut self, tags: Option<BTreeSet<String>>) -> Self {
        self.tags = tags.filter(|t| !t.is_empty());
        self
    }

    /// Stamp the expiry as `timestamp + ttl`.
    pub fn expiring_after(mut self, ttl: Duration) -> Self {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.expires_at = Some(self.timestamp.saturating_add(ttl_ms));
        self
    }

    /// Lifetime left at `now` (epoch millis). `None` means the entry carries no
    /// expiry; `Some(ZERO)` means it is already dead.
    pub fn remaining_at(&self, now: u64) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| Duration::from_millis(expires_at.saturating_sub(now)))
    }
}

impl CacheEntry<Value> {
    /// Build an untyped entry from any serializable value.
    pub fn from_typed<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// Deserialize the stored value into a concrete type.
    pub fn decode_value<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.value).map_err(CacheError::from)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}

/// Serialize an entry into its wire representation.
pub fn encode(entry: &CacheEntry<Value>) -> Result<String> {
    let mut raw = serde_json::to_value(entry)?;
    encode_bigints(&mut raw);
    Ok(serde_json::to_string(&raw)?)
}

/// Parse a wire payload. Any failure means the payload is corrupted.
pub fn decode(payload: &str) -> Result<CacheEntry<Value>> {
    let mut raw: Value = serde_json::from_str(payload)?;
    if !raw.is_object() {
        return Err(CacheError::serialization("cache entry is not a JSON object"));
    }
    decode_bigints(&mut raw);
    Ok(serde_json::from_value(raw)?)
}

fn encode_bigints(value: &mut Value) {
    match value {
        Value::Number(n) if is_unsafe_integer(n) => {
            let mut tagged = Map::with_capacity(1);
            tagged.insert(BIGINT_TAG.to_string(), Value::String(n.to_string()));
            *value = Value::Object(tagged);
        }
        Value::Array(items) => items.iter_mut().for_each(encode_bigints),
        Value::Object(map) => map.values_mut().for_each(encode_bigints),
        _ => {}
    }
}

fn decode_bigints(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if let Some(restored) = restore_bigint(map) {
                *value = Value::Number(restored);
            } else {
                map.values_mut().for_each(decode_bigints);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(decode_bigints),
        _ => {}
    }
}

fn restore_bigint(map: &Map<String, Value>) -> Option<Number> {
    if map.len() != 1 {
        return None;
    }
    let digits = map.get(BIGINT_TAG)?.as_str()?;
    if let Ok(n) = digits.parse::<u64>() {
        return Some(Number::from(n));
    }
    digits.parse::<i64>().ok().map(Number::from)
}

fn is_unsafe_integer(n: &Number) -> bool {
    if let Some(u) = n.as_u64() {
        return u > MAX_SAFE_INTEGER;
    }
    if let Some(i) = n.as_i64() {
        return i.unsigned_abs() > MAX_SAFE_INTEGER;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_big_integers_are_tagged_on_the_wire() {
        let entry = CacheEntry::new(json!({
            "small": 42,
            "big": u64::MAX,
            "negative": i64::MIN,
            "nested": [1, 9_007_199_254_740_993u64]
        }));
        let wire = encode(&entry).unwrap();
        let raw: Value = serde_json::from_str(&wire).unwrap();

        assert_eq!(raw["value"]["small"], json!(42));
        assert_eq!(raw["value"]["big"], json!({"__bigint": u64::MAX.to_string()}));
        assert_eq!(raw["value"]["negative"], json!({"__bigint": i64::MIN.to_string()}));
        assert_eq!(raw["value"]["nested"][1], json!({"__bigint": "9007199254740993"}));

        let back = decode(&wire).unwrap();
        assert_eq!(back.value, entry.value);
        assert_eq!(back.timestamp, entry.timestamp);
    }

    #[test]
    fn test_safe_boundary_is_not_tagged() {
        let entry = CacheEntry::new(json!(MAX_SAFE_INTEGER));
        let wire = encode(&entry).unwrap();
        assert!(!wire.contains(BIGINT_TAG));
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let entry = CacheEntry::new(json!("v")).with_tags(Some(BTreeSet::new()));
        let wire = encode(&entry).unwrap();
        assert!(!wire.contains("etag"));
        assert!(!wire.contains("tags"));

        let tagged = CacheEntry::new(json!("v"))
            .with_etag(Some("W/\"1\"".into()))
            .with_tags(Some(BTreeSet::from(["org:42".to_string()])));
        let back = decode(&encode(&tagged).unwrap()).unwrap();
        assert_eq!(back.etag.as_deref(), Some("W/\"1\""));
        assert!(back.tags.unwrap().contains("org:42"));
    }

    #[test]
    fn test_expiry_travels_with_the_entry() {
        let entry = CacheEntry::new(json!("v")).expiring_after(Duration::from_millis(250));
        assert_eq!(entry.expires_at, Some(entry.timestamp + 250));

        let wire = encode(&entry).unwrap();
        assert!(wire.contains("expiresAt"));
        let back = decode(&wire).unwrap();
        assert_eq!(back.remaining_at(entry.timestamp + 100), Some(Duration::from_millis(150)));
        assert_eq!(back.remaining_at(entry.timestamp + 300), Some(Duration::ZERO));
        assert_eq!(CacheEntry::new(json!("v")).remaining_at(0), None);
    }

    #[test]
    fn test_corrupted_payloads_fail_to_decode() {
        assert!(decode("not json").is_err());
        assert!(decode("[1,2,3]").is_err());
        assert!(decode(r#"{"value": 1}"#).is_err());
        assert!(decode(r#"{"timestamp": "yesterday", "value": 1}"#).is_err());
    }

    #[test]
    fn test_decode_value_into_concrete_type() {
        #[derive(Debug, PartialEq, Deserialize, Serialize)]
        struct Plan {
            tier: String,
        }
        let entry = CacheEntry::from_typed(&Plan { tier: "pro".into() }).unwrap();
        let plan: Plan = entry.decode_value().unwrap();
        assert_eq!(plan, Plan { tier: "pro".into() });
        assert!(entry.decode_value::<Vec<u8>>().is_err());
    }
}
