//! Inverted index from filter fields to subscribers.
//!
//! Each filter is registered under the values of its first list field, in the
//! priority order ids, authors, tag constraints, kinds. Filters with none of
//! those go into a catch-all bucket. An event only visits the buckets it could
//! match and every candidate filter is still fully evaluated.

use std::collections::HashMap;

use crate::event::Event;
use crate::filter::{Filter, GroupField};
use crate::on_event::{OnEvent, guarded};

/// Dispatches events to the subscribers whose filters match.
pub struct EventDemultiplexer<S> {
    buckets: HashMap<String, Vec<usize>>,
    /// (filter, index into `subscribers`)
    filters: Vec<(Filter, usize)>,
    subscribers: Vec<S>,
}

impl<S> Default for EventDemultiplexer<S> {
    fn default() -> Self {
        Self {
            buckets: HashMap::new(),
            filters: Vec::new(),
            subscribers: Vec::new(),
        }
    }
}

fn bucket_key(field: &GroupField, value: &str) -> String {
    format!("{}:{}", field, value)
}

fn index_field(filter: &Filter) -> Option<GroupField> {
    if filter.ids.is_some() {
        return Some(GroupField::Ids);
    }
    if filter.authors.is_some() {
        return Some(GroupField::Authors);
    }
    if let Some(key) = filter.tags.keys().next() {
        return Some(GroupField::Tag(key.clone()));
    }
    if filter.kinds.is_some() {
        return Some(GroupField::Kinds);
    }
    None
}

impl<S> EventDemultiplexer<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for a set of filters. Returns its index.
    pub fn subscribe(&mut self, filters: &[Filter], subscriber: S) -> usize {
        let subscriber_index = self.subscribers.len();
        self.subscribers.push(subscriber);

        for filter in filters {
            let filter_index = self.filters.len();
            self.filters.push((filter.clone(), subscriber_index));

            let keys: Vec<String> = match index_field(filter) {
                Some(field) => filter
                    .field_values(&field)
                    .iter()
                    .map(|value| bucket_key(&field, value))
                    .collect(),
                None => vec![String::new()],
            };
            for key in keys {
                self.buckets.entry(key).or_default().push(filter_index);
            }
        }

        subscriber_index
    }

    pub fn subscriber(&self, index: usize) -> Option<&S> {
        self.subscribers.get(index)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Indices of subscribers with at least one filter matching the event,
    /// each listed once, in registration order.
    pub fn matching(&self, event: &Event) -> Vec<usize> {
        let mut keys = vec![
            bucket_key(&GroupField::Ids, &event.id),
            bucket_key(&GroupField::Authors, &event.pubkey),
        ];
        for tag in &event.tags {
            if let [name, value, ..] = tag.as_slice() {
                keys.push(bucket_key(&GroupField::Tag(format!("#{}", name)), value));
            }
        }
        keys.push(bucket_key(&GroupField::Kinds, &event.kind.to_string()));
        keys.push(String::new());

        let mut hits: Vec<usize> = Vec::new();
        for key in keys {
            let Some(candidates) = self.buckets.get(&key) else {
                continue;
            };
            for &filter_index in candidates {
                let (filter, subscriber) = &self.filters[filter_index];
                if !hits.contains(subscriber) && filter.matches(event) {
                    hits.push(*subscriber);
                }
            }
        }

        hits.sort_unstable();
        hits
    }
}

impl EventDemultiplexer<OnEvent> {
    /// Deliver an event to every matching callback.
    pub fn on_event(&self, event: &Event, after_eose: bool, url: Option<&str>) {
        for index in self.matching(event) {
            let callback = &self.subscribers[index];
            guarded("event", || callback(event, after_eose, url));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::on_event::on_event;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn event(id: &str, pubkey: &str, kind: u16, tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at: 1000,
            kind,
            tags: tags
                .into_iter()
                .map(|tag| tag.into_iter().map(String::from).collect())
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn test_routes_by_first_group_field() {
        let mut demux = EventDemultiplexer::new();
        let by_id = demux.subscribe(&[Filter::new().ids(vec!["e1".to_string()])], "ids");
        let by_author = demux.subscribe(
            &[Filter::new()
                .authors(vec!["alice".to_string()])
                .kinds(vec![1])],
            "authors",
        );
        let by_tag = demux.subscribe(&[Filter::new().pubkey_refs(vec!["bob".to_string()])], "tag");
        let by_kind = demux.subscribe(&[Filter::new().kinds(vec![7])], "kinds");
        let catch_all = demux.subscribe(&[Filter::new().since(500)], "all");

        let e = event("e1", "alice", 1, vec![vec!["p", "bob"]]);
        assert_eq!(
            demux.matching(&e),
            vec![by_id, by_author, by_tag, catch_all]
        );

        let reaction = event("e2", "carol", 7, vec![]);
        assert_eq!(demux.matching(&reaction), vec![by_kind, catch_all]);
    }

    #[test]
    fn test_index_only_narrows_candidates() {
        let mut demux = EventDemultiplexer::new();
        demux.subscribe(
            &[Filter::new()
                .authors(vec!["alice".to_string()])
                .kinds(vec![0])],
            (),
        );

        // Same author bucket, wrong kind.
        assert!(demux.matching(&event("x", "alice", 1, vec![])).is_empty());
        assert_eq!(demux.matching(&event("y", "alice", 0, vec![])), vec![0]);
    }

    #[test]
    fn test_subscriber_listed_once_for_multiple_filters() {
        let mut demux = EventDemultiplexer::new();
        demux.subscribe(
            &[
                Filter::new().ids(vec!["e1".to_string()]),
                Filter::new().kinds(vec![1]),
            ],
            (),
        );

        assert_eq!(demux.matching(&event("e1", "alice", 1, vec![])), vec![0]);
    }

    #[test]
    fn test_matches_reported_in_registration_order() {
        let mut demux = EventDemultiplexer::new();
        let by_kind = demux.subscribe(&[Filter::new().kinds(vec![1])], "kind");
        for n in 0..100 {
            demux.subscribe(&[Filter::new().authors(vec![format!("other{}", n)])], "other");
        }
        let by_author = demux.subscribe(&[Filter::new().authors(vec!["alice".to_string()])], "author");

        // The author bucket is visited before the kind bucket.
        assert_eq!(
            demux.matching(&event("e1", "alice", 1, vec![])),
            vec![by_kind, by_author]
        );
        assert_eq!(demux.matching(&event("e2", "other7", 1, vec![])), vec![by_kind, 8]);
    }

    #[test]
    fn test_on_event_invokes_matching_callbacks() {
        let delivered: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut demux: EventDemultiplexer<OnEvent> = EventDemultiplexer::new();

        for name in ["notes", "reactions"] {
            let sink = Arc::clone(&delivered);
            let kind = if name == "notes" { 1 } else { 7 };
            demux.subscribe(
                &[Filter::new().kinds(vec![kind])],
                on_event(move |e, _, _| sink.lock().push(format!("{}:{}", name, e.id))),
            );
        }

        demux.on_event(&event("n1", "alice", 1, vec![]), false, Some("wss://r"));
        demux.on_event(&event("r1", "alice", 7, vec![]), true, Some("wss://r"));

        assert_eq!(*delivered.lock(), vec!["notes:n1", "reactions:r1"]);
    }
}
