//! Subscription filters.
//!
//! A [`Filter`] serializes to the NIP-01 wire form. Two fields are local to the
//! pool and never leave the process: `relay` pins a filter to a single relay and
//! `no_cache` bypasses the local event cache.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Event;

/// Filter for subscription requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs (exact or prefix)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (exact or prefix)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events at or after this timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events at or before this timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of stored events to return
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Tag constraints keyed by `#<tag name>`
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,

    /// Send this filter only to this relay
    #[serde(skip)]
    pub relay: Option<String>,

    /// Never answer this filter from the local cache
    #[serde(skip)]
    pub no_cache: bool,
}

/// A list-valued field that similar filters can be merged on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupField {
    Ids,
    Authors,
    Kinds,
    /// Tag constraint, holding the key with its `#` prefix
    Tag(String),
}

impl fmt::Display for GroupField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupField::Ids => f.write_str("ids"),
            GroupField::Authors => f.write_str("authors"),
            GroupField::Kinds => f.write_str("kinds"),
            GroupField::Tag(key) => f.write_str(key),
        }
    }
}

impl Filter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event IDs.
    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Filter by authors.
    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    /// Filter by kinds.
    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag filter. The key is the tag name without `#` (e.g. "e", "p").
    pub fn tag(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", key.into()), values);
        self
    }

    /// Filter by #e (event reference) tags.
    pub fn event_refs(self, event_ids: Vec<String>) -> Self {
        self.tag("e", event_ids)
    }

    /// Filter by #p (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: Vec<String>) -> Self {
        self.tag("p", pubkeys)
    }

    /// Pin this filter to one relay.
    pub fn relay(mut self, url: impl Into<String>) -> Self {
        self.relay = Some(url.into());
        self
    }

    /// Skip the local cache for this filter.
    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    /// Present list-valued fields in the order ids, authors, kinds, tags.
    pub fn group_fields(&self) -> Vec<GroupField> {
        let mut fields = Vec::new();
        if self.ids.is_some() {
            fields.push(GroupField::Ids);
        }
        if self.authors.is_some() {
            fields.push(GroupField::Authors);
        }
        if self.kinds.is_some() {
            fields.push(GroupField::Kinds);
        }
        fields.extend(self.tags.keys().cloned().map(GroupField::Tag));
        fields
    }

    /// String form of every value of `field`, in order.
    pub fn field_values(&self, field: &GroupField) -> Vec<String> {
        match field {
            GroupField::Ids => self.ids.clone().unwrap_or_default(),
            GroupField::Authors => self.authors.clone().unwrap_or_default(),
            GroupField::Kinds => self
                .kinds
                .iter()
                .flatten()
                .map(|kind| kind.to_string())
                .collect(),
            GroupField::Tag(key) => self.tags.get(key).cloned().unwrap_or_default(),
        }
    }

    /// True if any list-valued field is present but empty. Such a filter matches nothing.
    pub fn is_empty_match(&self) -> bool {
        self.ids.as_ref().is_some_and(Vec::is_empty)
            || self.authors.as_ref().is_some_and(Vec::is_empty)
            || self.kinds.as_ref().is_some_and(Vec::is_empty)
            || self.tags.values().any(Vec::is_empty)
    }

    /// Append the values of `field` from `other` that this filter lacks.
    pub fn union_field(&mut self, field: &GroupField, other: &Filter) {
        fn extend_unique<T: PartialEq + Clone>(into: &mut Option<Vec<T>>, from: Option<&Vec<T>>) {
            let target = into.get_or_insert_with(Vec::new);
            for value in from.into_iter().flatten() {
                if !target.contains(value) {
                    target.push(value.clone());
                }
            }
        }

        match field {
            GroupField::Ids => extend_unique(&mut self.ids, other.ids.as_ref()),
            GroupField::Authors => extend_unique(&mut self.authors, other.authors.as_ref()),
            GroupField::Kinds => extend_unique(&mut self.kinds, other.kinds.as_ref()),
            GroupField::Tag(key) => {
                let mut values = self.tags.remove(key);
                extend_unique(&mut values, other.tags.get(key));
                if let Some(values) = values {
                    self.tags.insert(key.clone(), values);
                }
            }
        }
    }

    /// Key-sorted JSON of everything in the filter, pool-local fields included.
    pub fn stable_json(&self) -> String {
        self.stable_json_without(None)
    }

    /// Key-sorted JSON of the filter with one list field left out.
    ///
    /// Two filters with equal output differ at most in the values of `field`.
    pub fn stable_json_without(&self, field: Option<&GroupField>) -> String {
        let mut map: BTreeMap<String, Value> = BTreeMap::new();
        let keep = |candidate: GroupField| field != Some(&candidate);

        if let Some(ids) = &self.ids
            && keep(GroupField::Ids)
        {
            map.insert("ids".into(), Value::from(ids.clone()));
        }
        if let Some(authors) = &self.authors
            && keep(GroupField::Authors)
        {
            map.insert("authors".into(), Value::from(authors.clone()));
        }
        if let Some(kinds) = &self.kinds
            && keep(GroupField::Kinds)
        {
            map.insert("kinds".into(), Value::from(kinds.clone()));
        }
        for (key, values) in &self.tags {
            if keep(GroupField::Tag(key.clone())) {
                map.insert(key.clone(), Value::from(values.clone()));
            }
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::from(since));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::from(until));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::from(limit));
        }
        if let Some(relay) = &self.relay {
            map.insert("relay".into(), Value::from(relay.clone()));
        }
        if self.no_cache {
            map.insert("noCache".into(), Value::Bool(true));
        }

        let mut out = String::from("{");
        for (i, (key, value)) in map.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&Value::from(key.as_str()).to_string());
            out.push(':');
            out.push_str(&value.to_string());
        }
        out.push('}');
        out
    }

    /// NIP-01 matching.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids
            && !ids.iter().any(|id| event.id.starts_with(id.as_str()))
        {
            return false;
        }

        if let Some(authors) = &self.authors
            && !authors
                .iter()
                .any(|author| event.pubkey.starts_with(author.as_str()))
        {
            return false;
        }

        if let Some(kinds) = &self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }

        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }

        if let Some(until) = self.until
            && event.created_at > until
        {
            return false;
        }

        for (key, values) in &self.tags {
            let Some(name) = key.strip_prefix('#') else {
                continue;
            };
            let found = event
                .tag_values(name)
                .any(|value| values.iter().any(|wanted| wanted == value));
            if !found {
                return false;
            }
        }

        true
    }
}

/// True if any filter accepts the event.
pub fn match_filters(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|filter| filter.matches(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, pubkey: &str, kind: u16, created_at: u64, tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at,
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
    fn test_filter_builder() {
        let filter = Filter::new()
            .kinds(vec![1, 4])
            .authors(vec!["author1".to_string()])
            .since(1000)
            .until(2000)
            .limit(100)
            .event_refs(vec!["event1".to_string()]);

        assert_eq!(filter.kinds, Some(vec![1, 4]));
        assert_eq!(filter.since, Some(1000));
        assert_eq!(filter.tags.get("#e"), Some(&vec!["event1".to_string()]));
    }

    #[test]
    fn test_pool_local_fields_not_serialized() {
        let filter = Filter::new()
            .ids(vec!["abc".to_string()])
            .relay("wss://relay.example.com")
            .no_cache();

        let json = serde_json::to_string(&filter).unwrap();
        assert_eq!(json, r##"{"ids":["abc"]}"##);
    }

    #[test]
    fn test_tag_constraints_serialize_flat() {
        let filter = Filter::new().kinds(vec![1]).pubkey_refs(vec!["p1".to_string()]);
        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(value["#p"], serde_json::json!(["p1"]));
        assert_eq!(value["kinds"], serde_json::json!([1]));
    }

    #[test]
    fn test_deserialize_tag_constraints() {
        let filter: Filter = serde_json::from_str(r##"{"kinds":[1],"#e":["x","y"]}"##).unwrap();
        assert_eq!(filter.tags.get("#e").unwrap().len(), 2);
        assert_eq!(filter.relay, None);
    }

    #[test]
    fn test_stable_json_is_key_sorted() {
        let a = Filter::new().kinds(vec![1]).authors(vec!["x".to_string()]);
        let b = Filter::new().authors(vec!["x".to_string()]).kinds(vec![1]);
        assert_eq!(a.stable_json(), b.stable_json());
        assert_eq!(a.stable_json(), r#"{"authors":["x"],"kinds":[1]}"#);
        assert_eq!(
            a.stable_json_without(Some(&GroupField::Authors)),
            r#"{"kinds":[1]}"#
        );
    }

    #[test]
    fn test_stable_json_includes_relay_pin() {
        let pinned = Filter::new().ids(vec!["1".to_string()]).relay("wss://a");
        let plain = Filter::new().ids(vec!["2".to_string()]);
        assert_ne!(
            pinned.stable_json_without(Some(&GroupField::Ids)),
            plain.stable_json_without(Some(&GroupField::Ids))
        );
    }

    #[test]
    fn test_matches_ids_and_prefixes() {
        let e = event("abcdef", "pk1", 1, 100, vec![]);
        assert!(Filter::new().ids(vec!["abcdef".to_string()]).matches(&e));
        assert!(Filter::new().ids(vec!["abc".to_string()]).matches(&e));
        assert!(!Filter::new().ids(vec!["xyz".to_string()]).matches(&e));
        assert!(Filter::new().authors(vec!["pk".to_string()]).matches(&e));
    }

    #[test]
    fn test_matches_time_bounds_inclusive() {
        let e = event("id", "pk", 1, 100, vec![]);
        assert!(Filter::new().since(100).matches(&e));
        assert!(Filter::new().until(100).matches(&e));
        assert!(!Filter::new().since(101).matches(&e));
        assert!(!Filter::new().until(99).matches(&e));
    }

    #[test]
    fn test_matches_tags() {
        let e = event("id", "pk", 1, 100, vec![vec!["p", "alice"], vec!["e", "root"]]);
        assert!(Filter::new().pubkey_refs(vec!["alice".to_string()]).matches(&e));
        assert!(
            Filter::new()
                .pubkey_refs(vec!["bob".to_string(), "alice".to_string()])
                .event_refs(vec!["root".to_string()])
                .matches(&e)
        );
        assert!(!Filter::new().pubkey_refs(vec!["bob".to_string()]).matches(&e));
        assert!(!Filter::new().tag("t", vec!["nostr".to_string()]).matches(&e));
    }

    #[test]
    fn test_empty_list_matches_nothing() {
        assert!(Filter::new().ids(vec![]).is_empty_match());
        assert!(Filter::new().tag("p", vec![]).is_empty_match());
        assert!(!Filter::new().kinds(vec![1]).is_empty_match());
        assert!(!Filter::new().is_empty_match());
    }

    #[test]
    fn test_union_field_keeps_order_and_dedups() {
        let mut a = Filter::new().kinds(vec![0, 2]);
        let b = Filter::new().kinds(vec![2, 3]);
        a.union_field(&GroupField::Kinds, &b);
        assert_eq!(a.kinds, Some(vec![0, 2, 3]));

        let mut c = Filter::new().tag("p", vec!["p1".to_string(), "p2".to_string()]);
        let d = Filter::new().tag("p", vec!["p2".to_string(), "p3".to_string()]);
        c.union_field(&GroupField::Tag("#p".to_string()), &d);
        assert_eq!(
            c.tags.get("#p"),
            Some(&vec!["p1".to_string(), "p2".to_string(), "p3".to_string()])
        );
    }
}
