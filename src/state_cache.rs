//! In-memory snapshot of each watched item's last-known status.
//!
//! Mutated only by event ingest; read by the detector, healers, and
//! orchestrator. Items are superseded, never deleted. Because the cache
//! always holds the most recent value, rapid repeated state changes during
//! a validation window are naturally coalesced at the deadline check.

use crate::events::{category_of, StateEvent};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// One addressable entity or automation in the managed platform.
#[derive(Debug, Clone)]
pub struct WatchedItem {
    pub id: String,
    pub category: String,
    pub status: String,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub last_update: DateTime<Utc>,
}

#[derive(Default)]
pub struct StateCache {
    items: RwLock<HashMap<String, WatchedItem>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a state event. Returns false when the event is older than the
    /// cached snapshot for the same subject (out-of-order delivery).
    pub fn apply(&self, event: &StateEvent) -> bool {
        let mut items = self.items.write();
        if let Some(existing) = items.get(&event.subject_id) {
            if event.timestamp < existing.last_update {
                return false;
            }
        }
        items.insert(
            event.subject_id.clone(),
            WatchedItem {
                id: event.subject_id.clone(),
                category: category_of(&event.subject_id),
                status: event.new_state.clone(),
                attributes: event.attributes.clone(),
                last_update: event.timestamp,
            },
        );
        true
    }

    pub fn get(&self, subject_id: &str) -> Option<WatchedItem> {
        self.items.read().get(subject_id).cloned()
    }

    /// Last-known status string, if the subject has ever been seen.
    pub fn current_state(&self, subject_id: &str) -> Option<String> {
        self.items.read().get(subject_id).map(|i| i.status.clone())
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(subject: &str, state: &str, at: DateTime<Utc>) -> StateEvent {
        StateEvent {
            subject_id: subject.to_string(),
            timestamp: at,
            new_state: state.to_string(),
            attributes: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_apply_and_read_back() {
        let cache = StateCache::new();
        assert!(cache.apply(&event("light.lr", "on", Utc::now())));

        let item = cache.get("light.lr").unwrap();
        assert_eq!(item.status, "on");
        assert_eq!(item.category, "light");
        assert_eq!(cache.current_state("light.lr"), Some("on".into()));
    }

    #[test]
    fn test_stale_event_is_rejected() {
        let cache = StateCache::new();
        let now = Utc::now();
        assert!(cache.apply(&event("light.lr", "on", now)));
        assert!(!cache.apply(&event("light.lr", "off", now - Duration::seconds(5))));
        assert_eq!(cache.current_state("light.lr"), Some("on".into()));
    }

    #[test]
    fn test_items_are_superseded_not_duplicated() {
        let cache = StateCache::new();
        let now = Utc::now();
        cache.apply(&event("light.lr", "on", now));
        cache.apply(&event("light.lr", "off", now + Duration::seconds(1)));
        cache.apply(&event("light.lr", "on", now + Duration::seconds(2)));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_state("light.lr"), Some("on".into()));
    }

    #[test]
    fn test_unknown_subject() {
        let cache = StateCache::new();
        assert!(cache.get("sensor.nope").is_none());
        assert!(cache.current_state("sensor.nope").is_none());
        assert!(cache.is_empty());
    }
}
