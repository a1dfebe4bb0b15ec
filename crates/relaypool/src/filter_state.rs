//! Per-filter, per-relay record of the time range already fetched.
//!
//! Fed from EOSE continuation data (`update_filter`) and from observed events
//! (`update_filters`), so a later session can resume where this one stopped.

use std::collections::{HashMap, HashSet};

use crate::event::Event;
use crate::filter::Filter;

/// Fetched interval. `None` is unbounded on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl TimeRange {
    fn below_start(&self, timestamp: u64) -> bool {
        self.start.is_some_and(|start| timestamp < start)
    }

    fn above_start(&self, timestamp: u64) -> bool {
        self.start.is_none_or(|start| timestamp > start)
    }

    fn below_end(&self, timestamp: u64) -> bool {
        self.end.is_none_or(|end| timestamp < end)
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionFilterStateCache {
    filters: HashMap<String, Filter>,
    /// filter key -> relay -> range
    ranges: HashMap<String, HashMap<String, TimeRange>>,
    /// event id -> keys of the filters it matched
    filters_by_event: HashMap<String, HashSet<String>>,
}

impl SubscriptionFilterStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a filter.
    pub fn add_filter(&mut self, filter: &Filter) {
        let key = filter.stable_json();
        self.ranges.entry(key.clone()).or_default();
        self.filters.entry(key).or_insert_with(|| filter.clone());
    }

    /// Record that `[start, end]` was fetched from `relay`. Call from EOSE.
    ///
    /// A range entirely before the known one replaces it; otherwise the known
    /// range is narrowed to the overlap.
    pub fn update_filter(&mut self, filter: &Filter, start: u64, end: u64, relay: &str) {
        self.add_filter(filter);
        let key = filter.stable_json();
        let range = self
            .ranges
            .entry(key)
            .or_default()
            .entry(relay.to_string())
            .or_default();

        if range.below_start(end) {
            *range = TimeRange {
                start: Some(start),
                end: Some(end),
            };
            return;
        }
        if range.above_start(start) {
            range.start = Some(start);
        }
        if range.below_end(end) {
            range.end = Some(end);
        }
    }

    /// Widen the ranges of every tracked filter matching `event` on `relay`.
    pub fn update_filters(&mut self, event: &Event, relay: &str) {
        let keys = match self.filters_by_event.get(&event.id) {
            Some(keys) => keys.clone(),
            None => {
                let keys: HashSet<String> = self
                    .filters
                    .iter()
                    .filter(|(_, filter)| filter.matches(event))
                    .map(|(key, _)| key.clone())
                    .collect();
                self.filters_by_event.insert(event.id.clone(), keys.clone());
                keys
            }
        };

        for key in keys {
            let range = self
                .ranges
                .entry(key)
                .or_default()
                .entry(relay.to_string())
                .or_default();
            if range.below_end(event.created_at) {
                range.end = Some(event.created_at);
            }
            if range.above_start(event.created_at) {
                range.start = Some(event.created_at);
            }
        }
    }

    pub fn range(&self, filter: &Filter, relay: &str) -> Option<TimeRange> {
        self.ranges
            .get(&filter.stable_json())
            .and_then(|relays| relays.get(relay))
            .copied()
    }

    pub fn filters(&self) -> impl Iterator<Item = &Filter> {
        self.filters.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELAY: &str = "wss://relay.example.com";

    fn note(id: &str, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "alice".to_string(),
            created_at,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn test_first_update_sets_range() {
        let mut cache = SubscriptionFilterStateCache::new();
        let filter = Filter::new().kinds(vec![1]);
        cache.update_filter(&filter, 100, 200, RELAY);

        assert_eq!(
            cache.range(&filter, RELAY),
            Some(TimeRange {
                start: Some(100),
                end: Some(200)
            })
        );
        assert_eq!(cache.range(&filter, "wss://other"), None);
    }

    #[test]
    fn test_overlapping_update_narrows() {
        let mut cache = SubscriptionFilterStateCache::new();
        let filter = Filter::new().kinds(vec![1]);
        cache.update_filter(&filter, 100, 200, RELAY);
        cache.update_filter(&filter, 150, 180, RELAY);

        let range = cache.range(&filter, RELAY).unwrap();
        assert_eq!(range.start, Some(150));
        assert_eq!(range.end, Some(180));
    }

    #[test]
    fn test_disjoint_earlier_update_replaces() {
        let mut cache = SubscriptionFilterStateCache::new();
        let filter = Filter::new().kinds(vec![1]);
        cache.update_filter(&filter, 100, 200, RELAY);
        cache.update_filter(&filter, 10, 50, RELAY);

        let range = cache.range(&filter, RELAY).unwrap();
        assert_eq!(range.start, Some(10));
        assert_eq!(range.end, Some(50));
    }

    #[test]
    fn test_events_update_matching_filters_only() {
        let mut cache = SubscriptionFilterStateCache::new();
        let notes = Filter::new().kinds(vec![1]);
        let reactions = Filter::new().kinds(vec![7]);
        cache.add_filter(&notes);
        cache.add_filter(&reactions);

        cache.update_filters(&note("a", 300), RELAY);
        cache.update_filters(&note("b", 100), RELAY);

        let range = cache.range(&notes, RELAY).unwrap();
        assert_eq!(range.end, Some(100));
        assert_eq!(range.start, Some(300));
        assert_eq!(cache.range(&reactions, RELAY), None);
        assert_eq!(cache.filters().count(), 2);
    }
}
