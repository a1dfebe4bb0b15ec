//! Subscription ids and filter builders.

use uuid::Uuid;

use crate::event::{KIND_CONTACTS, KIND_METADATA, KIND_WRITE_RELAYS};
use crate::filter::Filter;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Builder for the filter list of one subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionBuilder {
    filters: Vec<Filter>,
}

impl SubscriptionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter to the subscription.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn kinds(self, kinds: Vec<u16>) -> Self {
        self.filter(Filter::new().kinds(kinds))
    }

    pub fn authors(self, authors: Vec<String>) -> Self {
        self.filter(Filter::new().authors(authors))
    }

    pub fn ids(self, ids: Vec<String>) -> Self {
        self.filter(Filter::new().ids(ids))
    }

    /// Profile metadata (kind 0) of the given authors.
    pub fn metadata(self, authors: Vec<String>) -> Self {
        self.filter(Filter::new().authors(authors).kinds(vec![KIND_METADATA]))
    }

    /// Contact lists (kind 3) of the given authors.
    pub fn contact_lists(self, authors: Vec<String>) -> Self {
        self.filter(Filter::new().authors(authors).kinds(vec![KIND_CONTACTS]))
    }

    /// Write relay lists tagged with the given pubkeys.
    pub fn write_relays(self, pubkeys: Vec<String>) -> Self {
        self.filter(
            Filter::new()
                .kinds(vec![KIND_WRITE_RELAYS])
                .pubkey_refs(pubkeys),
        )
    }

    /// Events referencing an event id through an `e` tag.
    pub fn replies(self, event_id: String) -> Self {
        self.filter(Filter::new().event_refs(vec![event_id]))
    }

    /// Events mentioning a pubkey through a `p` tag.
    pub fn mentions(self, pubkey: String) -> Self {
        self.filter(Filter::new().pubkey_refs(vec![pubkey]))
    }

    /// Pin the most recently added filter to one relay.
    pub fn on_relay(mut self, relay: impl Into<String>) -> Self {
        if let Some(last) = self.filters.pop() {
            self.filters.push(last.relay(relay));
        }
        self
    }

    pub fn build(self) -> Vec<Filter> {
        self.filters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_subscription_id() {
        let id1 = generate_subscription_id();
        let id2 = generate_subscription_id();
        assert_eq!(id1.len(), 8);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_builder() {
        let filters = SubscriptionBuilder::new()
            .metadata(vec!["alice".to_string()])
            .replies("e1".to_string())
            .on_relay("wss://relay.example.com")
            .build();

        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].kinds, Some(vec![KIND_METADATA]));
        assert_eq!(filters[0].relay, None);
        assert_eq!(filters[1].relay.as_deref(), Some("wss://relay.example.com"));
    }

    #[test]
    fn test_on_relay_without_filters_is_noop() {
        assert!(SubscriptionBuilder::new().on_relay("wss://r").build().is_empty());
    }
}
