//! Function-result caching.
//!
//! ```no_run
//! # use strata_cache::{CacheStore, ComputeOptions, cached};
//! # async fn fetch_plan(org: u64) -> anyhow::Result<String> { Ok(format!("plan-{org}")) }
//! # async fn demo(store: CacheStore) -> strata_cache::Result<()> {
//! let plan: String = cached(&store, "billing.plan", &(42u64,), ComputeOptions::default(), || {
//!     fetch_plan(42)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::store::{CacheStore, ComputeOptions};

/// Key under which `cached` stores the result of `name(args)`.
pub fn function_key<A: Serialize + ?Sized>(name: &str, args: &A) -> Result<String> {
    let args = serde_json::to_string(&serde_json::to_value(args)?)?;
    let digest = Sha256::digest(args.as_bytes());
    Ok(format!("fn:{name}:{}", hex::encode(digest)))
}

/// Cache the result of `f` under a key derived from a stable `name` and the
/// serialized arguments. Concurrent calls with the same arguments are coalesced.
pub async fn cached<A, T, F, Fut, E>(
    store: &CacheStore,
    name: &str,
    args: &A,
    opts: ComputeOptions,
    f: F,
) -> Result<T>
where
    A: Serialize + ?Sized,
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    let key = function_key(name, args)?;
    store.get_or_compute(&key, f, opts).await
}
