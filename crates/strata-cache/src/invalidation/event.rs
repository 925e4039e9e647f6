use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::now_millis;

/// A domain event that may trigger invalidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    /// What happened (`"updated"`, `"deleted"`, `"table_changed"`, ...).
    #[serde(rename = "type")]
    pub event_type: String,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_tags: Vec<String>,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl InvalidationEvent {
    pub fn new(event_type: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            entity_type: entity_type.into(),
            entity_id: None,
            related_tags: Vec::new(),
            timestamp: now_millis(),
            metadata: None,
        }
    }

    pub fn with_entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.related_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Effective tags: related tags, the entity type and `type:id`.
    pub fn tags(&self) -> BTreeSet<String> {
        let mut tags: BTreeSet<String> = self.related_tags.iter().cloned().collect();
        if !self.entity_type.is_empty() {
            tags.insert(self.entity_type.clone());
            if let Some(id) = &self.entity_id {
                tags.insert(format!("{}:{}", self.entity_type, id));
            }
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_effective_tags() {
        let event = InvalidationEvent::new("updated", "org")
            .with_entity_id("42")
            .with_tags(["billing"]);
        let tags = event.tags();
        assert!(tags.contains("org"));
        assert!(tags.contains("org:42"));
        assert!(tags.contains("billing"));
        assert_eq!(tags.len(), 3);
    }

    #[test]
    fn test_wire_shape() {
        let event: InvalidationEvent = serde_json::from_value(json!({
            "type": "deleted",
            "entityType": "user",
            "entityId": "7",
            "timestamp": 1
        }))
        .unwrap();
        assert_eq!(event.event_type, "deleted");
        assert_eq!(event.entity_id.as_deref(), Some("7"));
        assert!(event.related_tags.is_empty());
    }
}
