use std::collections::BTreeSet;
use std::sync::Arc;

use super::event::InvalidationEvent;

/// Predicate deciding whether a rule fires for an event.
pub type RuleCondition = Arc<dyn Fn(&InvalidationEvent) -> bool + Send + Sync>;

const ENTITY_TYPE: &str = "{entityType}";
const ENTITY_ID: &str = "{entityId}";

/// Declarative mapping from tags to the key patterns they invalidate.
///
/// ```
/// use strata_cache::InvalidationRule;
///
/// let rule = InvalidationRule::new("org-plan")
///     .tags(["org:42"])
///     .patterns(["org:42:*"])
///     .priority(10);
/// assert_eq!(rule.priority, 10);
/// ```
#[derive(Clone)]
pub struct InvalidationRule {
    pub id: String,
    pub tags: BTreeSet<String>,
    /// Key globs; may contain `{entityType}` and `{entityId}` placeholders.
    pub key_patterns: Vec<String>,
    pub condition: Option<RuleCondition>,
    /// Higher runs first.
    pub priority: i32,
}

impl std::fmt::Debug for InvalidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationRule")
            .field("id", &self.id)
            .field("tags", &self.tags)
            .field("key_patterns", &self.key_patterns)
            .field("condition", &self.condition.is_some())
            .field("priority", &self.priority)
            .finish()
    }
}

impl InvalidationRule {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tags: BTreeSet::new(),
            key_patterns: Vec::new(),
            condition: None,
            priority: 0,
        }
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&InvalidationEvent) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn matches_tags(&self, tags: &BTreeSet<String>) -> bool {
        !self.tags.is_disjoint(tags)
    }

    /// Key patterns with the event's placeholders filled in.
    ///
    /// Patterns that need an entity id the event does not carry are skipped.
    pub fn resolve_patterns(&self, event: &InvalidationEvent) -> Vec<String> {
        self.key_patterns
            .iter()
            .filter_map(|pattern| {
                let mut resolved = pattern.replace(ENTITY_TYPE, &event.entity_type);
                if resolved.contains(ENTITY_ID) {
                    let id = event.entity_id.as_deref()?;
                    resolved = resolved.replace(ENTITY_ID, id);
                }
                Some(resolved)
            })
            .collect()
    }
}
