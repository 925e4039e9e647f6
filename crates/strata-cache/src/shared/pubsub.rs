//! Redis Pub/Sub for cross-instance local-tier invalidation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::local::LocalTier;

/// Payload published on the invalidation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    /// Origin id of the publishing store.
    pub origin: String,
    /// Logical keys that were removed.
    pub keys: Vec<String>,
}

/// Listener that keeps this instance's local tier in step with deletions made
/// by other instances.
///
/// ## Example Flow
///
/// ```text
/// Instance 1: store.delete("org:42:plan")
///   ↓
/// Redis Pub/Sub: PUBLISH strata:invalidate {"origin":"..","keys":["org:42:plan"]}
///   ↓
/// Instance 2: listener receives message → evicts "org:42:plan" from its local tier
/// ```
pub struct PubSubInvalidationListener {
    pub redis_url: String,
    pub channel: String,
    /// Messages carrying this origin were sent by the local store and are skipped.
    pub origin: String,
    pub local: LocalTier,
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

impl PubSubInvalidationListener {
    /// Spawn the listener task.
    ///
    /// The task reconnects with exponential backoff (1s doubling up to 5 minutes)
    /// until it is aborted.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;

            loop {
                match self.run().await {
                    Ok(()) => {
                        backoff = INITIAL_BACKOFF;
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "Cache invalidation listener error, reconnecting..."
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        })
    }

    async fn run(&self) -> Result<(), String> {
        use futures_util::StreamExt;

        let client = redis::Client::open(self.redis_url.clone())
            .map_err(|e| format!("failed to create Redis client: {e}"))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| format!("failed to get pub/sub connection: {e}"))?;

        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| format!("failed to subscribe: {e}"))?;

        tracing::info!(channel = %self.channel, "Subscribed to invalidation channel");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            match msg.get_payload::<String>() {
                Ok(payload) => {
                    self.apply(&payload).await;
                }
                Err(e) => tracing::warn!(error = %e, "failed to read invalidation payload"),
            }
        }
        Err("pub/sub connection closed".to_string())
    }

    /// Apply one raw message to the local tier. Returns the number of keys evicted.
    pub async fn apply(&self, payload: &str) -> usize {
        let message: InvalidationMessage = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse invalidation message");
                return 0;
            }
        };
        if message.origin == self.origin {
            return 0;
        }

        let mut evicted = 0;
        for key in &message.keys {
            if self.local.remove(key).await {
                evicted += 1;
            }
        }
        tracing::debug!(
            received = message.keys.len(),
            evicted,
            "applied remote cache invalidation"
        );
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CacheEntry;
    use serde_json::json;
    use std::sync::Arc;

    fn listener(local: LocalTier) -> PubSubInvalidationListener {
        PubSubInvalidationListener {
            redis_url: "redis://localhost:6379".into(),
            channel: "strata:invalidate".into(),
            origin: "self".into(),
            local,
        }
    }

    #[tokio::test]
    async fn test_remote_message_evicts_local_keys() {
        let local = LocalTier::new(10);
        local
            .insert("a", Arc::new(CacheEntry::new(json!(1))), Duration::from_secs(60))
            .await;
        let listener = listener(local.clone());

        let payload = serde_json::to_string(&InvalidationMessage {
            origin: "other".into(),
            keys: vec!["a".into(), "missing".into()],
        })
        .unwrap();

        assert_eq!(listener.apply(&payload).await, 1);
        assert!(local.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_own_and_malformed_messages_are_ignored() {
        let local = LocalTier::new(10);
        local
            .insert("a", Arc::new(CacheEntry::new(json!(1))), Duration::from_secs(60))
            .await;
        let listener = listener(local.clone());

        let own = r#"{"origin":"self","keys":["a"]}"#;
        assert_eq!(listener.apply(own).await, 0);
        assert_eq!(listener.apply("garbage").await, 0);
        assert!(local.get("a").await.is_some());
    }
}
