//! Local event cache used to answer queries without a network round trip
//! and to narrow the filters that still have to go out to relays.

use std::collections::{HashMap, HashSet};

use crate::event::{Event, KIND_CONTACTS, KIND_METADATA, is_replaceable_kind};
use crate::filter::Filter;

/// Events answered from the cache and the filters still to send.
#[derive(Debug, Clone, Default)]
pub struct CacheResolution {
    pub filters: Vec<Filter>,
    pub events: Vec<Event>,
}

/// Multi-index store of events seen so far.
///
/// Every event is kept by id. Events are also indexed by author and kind and by
/// each `(tag name, first tag value)` pair. For replaceable kinds only the
/// newest event per author is reachable through the author index.
#[derive(Debug, Default)]
pub struct EventCache {
    /// Events by ID
    events: HashMap<String, Event>,
    /// pubkey -> kind -> event IDs (a single newest ID for replaceable kinds)
    by_author_kind: HashMap<String, HashMap<u16, Vec<String>>>,
    /// "name:value" -> event IDs
    by_tag: HashMap<String, Vec<String>>,
}

fn tag_key(name: &str, value: &str) -> String {
    format!("{}:{}", name, value)
}

impl EventCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event. Returns false if an event with the same id was already cached.
    pub fn add(&mut self, event: Event) -> bool {
        if self.events.contains_key(&event.id) {
            return false;
        }

        let ids = self
            .by_author_kind
            .entry(event.pubkey.clone())
            .or_default()
            .entry(event.kind)
            .or_default();

        if is_replaceable_kind(event.kind) {
            let newer = match ids.first().and_then(|id| self.events.get(id)) {
                Some(current) => event.created_at > current.created_at,
                None => true,
            };
            if newer {
                ids.clear();
                ids.push(event.id.clone());
            }
        } else {
            ids.push(event.id.clone());
        }

        for tag in &event.tags {
            if let [name, value, ..] = tag.as_slice() {
                self.by_tag
                    .entry(tag_key(name, value))
                    .or_default()
                    .push(event.id.clone());
            }
        }

        self.events.insert(event.id.clone(), event);
        true
    }

    pub fn get(&self, event_id: &str) -> Option<&Event> {
        self.events.get(event_id)
    }

    /// Newest cached event of a replaceable kind, or every cached event of a regular kind.
    pub fn get_by_author_kind(&self, pubkey: &str, kind: u16) -> Vec<&Event> {
        self.by_author_kind
            .get(pubkey)
            .and_then(|kinds| kinds.get(&kind))
            .map(|ids| self.resolve_ids(ids))
            .unwrap_or_default()
    }

    pub fn get_by_author(&self, pubkey: &str) -> Vec<&Event> {
        self.by_author_kind
            .get(pubkey)
            .map(|kinds| {
                kinds
                    .values()
                    .flat_map(|ids| self.resolve_ids(ids))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_by_tag(&self, name: &str, value: &str) -> Vec<&Event> {
        self.by_tag
            .get(&tag_key(name, value))
            .map(|ids| self.resolve_ids(ids))
            .unwrap_or_default()
    }

    /// Newest profile metadata of an author.
    pub fn metadata(&self, pubkey: &str) -> Option<&Event> {
        self.get_by_author_kind(pubkey, KIND_METADATA).into_iter().next()
    }

    /// Newest contact list of an author.
    pub fn contact_list(&self, pubkey: &str) -> Option<&Event> {
        self.get_by_author_kind(pubkey, KIND_CONTACTS).into_iter().next()
    }

    fn resolve_ids<'a>(&'a self, ids: &[String]) -> Vec<&'a Event> {
        ids.iter().filter_map(|id| self.events.get(id)).collect()
    }

    /// Answer what the cache can and rewrite the filters that still need relays.
    ///
    /// Filters with `ids` lose every id the cache can answer. Filters with
    /// `authors` are answered from the author index but sent unchanged, since
    /// authors may publish newer events. Filters with tag constraints are
    /// answered from the tag index and also sent unchanged. `no_cache` filters
    /// pass straight through.
    pub fn resolve(&self, filters: &[Filter]) -> CacheResolution {
        let mut seen: HashSet<String> = HashSet::new();
        let mut resolution = CacheResolution::default();

        for filter in filters {
            let mut found: Vec<&Event> = Vec::new();
            let mut rewritten = filter.clone();

            if filter.no_cache {
                // passthrough
            } else if let Some(ids) = &filter.ids {
                let mut missing = Vec::new();
                for id in ids {
                    match self.events.get(id) {
                        Some(event) if filter.matches(event) => found.push(event),
                        // Ids are unique, so a cached event that fails the rest of the filter rules the id out.
                        Some(_) => {}
                        None => missing.push(id.clone()),
                    }
                }
                rewritten.ids = Some(missing);
            } else if let Some(authors) = &filter.authors {
                for author in authors {
                    let candidates = match &filter.kinds {
                        Some(kinds) => kinds
                            .iter()
                            .flat_map(|kind| self.get_by_author_kind(author, *kind))
                            .collect(),
                        None => self.get_by_author(author),
                    };
                    found.extend(candidates.into_iter().filter(|e| filter.matches(e)));
                }
            } else if !filter.tags.is_empty() {
                for (key, values) in &filter.tags {
                    let Some(name) = key.strip_prefix('#') else {
                        continue;
                    };
                    for value in values {
                        found.extend(
                            self.get_by_tag(name, value)
                                .into_iter()
                                .filter(|e| filter.matches(e)),
                        );
                    }
                }
            }

            for event in found {
                if seen.insert(event.id.clone()) {
                    resolution.events.push(event.clone());
                }
            }
            resolution.filters.push(rewritten);
        }

        resolution
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.by_author_kind.clear();
        self.by_tag.clear();
    }
}
