//! Newest-event lookups on the info relays, and author write relay resolution.
//!
//! A [`NewestEventCache`] remembers the newest event of one kind per pubkey:
//! write relay lists (found through `#p`), profile metadata and contact lists.
//! Missing entries are fetched from the info relays; concurrent lookups for the
//! same pubkey share one request.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::SubscriptionOptions;
use crate::error::{ClientError, Result};
use crate::event::{Event, get_event_hash};
use crate::filter::Filter;
use crate::on_event::{on_eose, on_event};
use crate::pool::RelayPool;

/// Looks up the relays an author publishes to.
#[async_trait]
pub trait WriteRelayResolver: Send + Sync {
    async fn write_relays(&self, pool: &RelayPool, pubkey: &str) -> Result<Vec<String>>;
}

/// Resolves write relays from the pool's write relay cache, fetching the
/// list from the info relays when it is not cached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewestEventWriteRelays;

#[async_trait]
impl WriteRelayResolver for NewestEventWriteRelays {
    async fn write_relays(&self, pool: &RelayPool, pubkey: &str) -> Result<Vec<String>> {
        let lookup_failed = |reason: String| ClientError::WriteRelayLookup {
            pubkey: pubkey.to_string(),
            reason,
        };
        let event = pool
            .fetch_write_relays_event(pubkey)
            .await
            .map_err(|e| lookup_failed(e.to_string()))?;
        parse_relay_list(&event.content).map_err(lookup_failed)
    }
}

/// Fixed pubkey to relays table.
#[derive(Debug, Clone, Default)]
pub struct StaticWriteRelays {
    relays: HashMap<String, Vec<String>>,
}

impl StaticWriteRelays {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, pubkey: impl Into<String>, relays: Vec<String>) -> Self {
        self.relays.insert(pubkey.into(), relays);
        self
    }
}

#[async_trait]
impl WriteRelayResolver for StaticWriteRelays {
    async fn write_relays(&self, _pool: &RelayPool, pubkey: &str) -> Result<Vec<String>> {
        self.relays
            .get(pubkey)
            .cloned()
            .ok_or_else(|| ClientError::WriteRelayLookup {
                pubkey: pubkey.to_string(),
                reason: "unknown author".to_string(),
            })
    }
}

/// Parse write relay list content: a JSON array of relay URLs.
pub fn parse_relay_list(content: &str) -> std::result::Result<Vec<String>, String> {
    serde_json::from_str::<Vec<String>>(content)
        .map_err(|e| format!("malformed relay list: {}", e))
}

type Lookup = Shared<BoxFuture<'static, Option<Event>>>;

struct Inner {
    kind: u16,
    info_relays: Vec<String>,
    use_p_tags: bool,
    lookup_timeout: Duration,
    data: Mutex<HashMap<String, Event>>,
    in_flight: Mutex<HashMap<String, Lookup>>,
}

/// Newest event of one kind per pubkey.
#[derive(Clone)]
pub struct NewestEventCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for NewestEventCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewestEventCache")
            .field("kind", &self.inner.kind)
            .field("cached", &self.inner.data.lock().len())
            .finish()
    }
}

impl NewestEventCache {
    /// With `use_p_tags` the event is looked up by a `p` tag naming the pubkey
    /// instead of by author.
    pub fn new(kind: u16, info_relays: Vec<String>, use_p_tags: bool, lookup_timeout: Duration) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(info_relays.len());
        for relay in info_relays {
            if !unique.contains(&relay) {
                unique.push(relay);
            }
        }
        Self {
            inner: Arc::new(Inner {
                kind,
                info_relays: unique,
                use_p_tags,
                lookup_timeout,
                data: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn kind(&self) -> u16 {
        self.inner.kind
    }

    pub fn cached(&self, pubkey: &str) -> Option<Event> {
        self.inner.data.lock().get(pubkey).cloned()
    }

    /// Store an event unless a newer one is already cached.
    pub fn set(&self, pubkey: &str, event: Event) {
        let mut data = self.inner.data.lock();
        match data.get(pubkey) {
            Some(current) if current.created_at >= event.created_at => {}
            _ => {
                data.insert(pubkey.to_string(), event);
            }
        }
    }

    /// Store a write relay list for `pubkey` as an unsigned event.
    pub fn set_write_relays(&self, pubkey: &str, relays: &[String], created_at: u64) {
        let content = serde_json::Value::from(relays.to_vec()).to_string();
        let tags = vec![vec!["p".to_string(), pubkey.to_string()]];
        let id = get_event_hash(pubkey, created_at, self.inner.kind, &tags, &content)
            .unwrap_or_default();
        self.set(
            pubkey,
            Event {
                id,
                pubkey: pubkey.to_string(),
                created_at,
                kind: self.inner.kind,
                tags,
                content,
                sig: String::new(),
            },
        );
    }

    pub fn filter(&self, pubkey: &str) -> Filter {
        let filter = Filter::new().kinds(vec![self.inner.kind]);
        if self.inner.use_p_tags {
            filter.pubkey_refs(vec![pubkey.to_string()])
        } else {
            filter.authors(vec![pubkey.to_string()])
        }
    }

    /// Cached event for `pubkey`, or the newest one the info relays return.
    pub async fn get(&self, pubkey: &str, pool: &RelayPool) -> Result<Event> {
        if let Some(event) = self.cached(pubkey) {
            return Ok(event);
        }

        let lookup = self
            .inner
            .in_flight
            .lock()
            .entry(pubkey.to_string())
            .or_insert_with(|| self.lookup(pubkey, pool.clone()).boxed().shared())
            .clone();
        let found = lookup.await;
        self.inner.in_flight.lock().remove(pubkey);

        match found {
            Some(event) => {
                self.set(pubkey, event.clone());
                Ok(self.cached(pubkey).unwrap_or(event))
            }
            None => Err(ClientError::NotFound(format!(
                "kind {} for {} on info relays {}",
                self.inner.kind,
                pubkey,
                self.inner.info_relays.join(",")
            ))),
        }
    }

    /// Query the info relays until each sent EOSE or the lookup times out.
    fn lookup(&self, pubkey: &str, pool: RelayPool) -> impl Future<Output = Option<Event>> + Send + 'static {
        let filter = self.filter(pubkey);
        let relays = self.inner.info_relays.clone();
        let lookup_timeout = self.inner.lookup_timeout;
        let pubkey = pubkey.to_string();

        async move {
            debug!("Looking up {} on {:?}", pubkey, relays);
            let newest: Arc<Mutex<Option<Event>>> = Arc::new(Mutex::new(None));
            let sink = Arc::clone(&newest);
            let record = on_event(move |event, _, _| {
                let mut newest = sink.lock();
                if newest
                    .as_ref()
                    .is_none_or(|current| event.created_at > current.created_at)
                {
                    *newest = Some(event.clone());
                }
            });

            let (done_tx, done) = oneshot::channel::<()>();
            let done_tx = Mutex::new(Some(done_tx));
            let eosed: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
            let expected = relays.len();
            let finish = on_eose(move |relay, _| {
                let mut eosed = eosed.lock();
                eosed.insert(relay.to_string());
                if eosed.len() >= expected
                    && let Some(tx) = done_tx.lock().take()
                {
                    let _ = tx.send(());
                }
            });

            let handle = match pool
                .subscribe(
                    vec![filter],
                    Some(relays),
                    record,
                    None,
                    Some(finish),
                    SubscriptionOptions::default(),
                )
                .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Lookup for {} failed: {}", pubkey, e);
                    return None;
                }
            };

            if timeout(lookup_timeout, done).await.is_err() {
                debug!("Lookup for {} timed out", pubkey);
            }
            handle.cancel();
            newest.lock().take()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KIND_WRITE_RELAYS;

    fn cache() -> NewestEventCache {
        NewestEventCache::new(
            KIND_WRITE_RELAYS,
            vec!["wss://a".to_string(), "wss://a".to_string()],
            true,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_parse_relay_list() {
        assert_eq!(
            parse_relay_list(r#"["wss://a","wss://b"]"#).unwrap(),
            vec!["wss://a", "wss://b"]
        );
        assert!(parse_relay_list("wss://a").is_err());
        assert!(parse_relay_list(r#"{"wss://a":{}}"#).is_err());
    }

    #[test]
    fn test_set_write_relays_keeps_newest() {
        let cache = cache();
        let pubkey = "f".repeat(64);
        cache.set_write_relays(&pubkey, &["wss://new".to_string()], 200);
        cache.set_write_relays(&pubkey, &["wss://old".to_string()], 100);

        let event = cache.cached(&pubkey).unwrap();
        assert_eq!(event.created_at, 200);
        assert_eq!(parse_relay_list(&event.content).unwrap(), vec!["wss://new"]);
        assert_eq!(event.tag_values("p").collect::<Vec<_>>(), vec![pubkey.as_str()]);
        assert_eq!(event.id.len(), 64);
    }

    #[test]
    fn test_filter_by_p_tag_or_author() {
        let by_tag = cache().filter("abc");
        assert_eq!(by_tag.tags.get("#p"), Some(&vec!["abc".to_string()]));
        assert_eq!(by_tag.authors, None);

        let by_author =
            NewestEventCache::new(0, vec![], false, Duration::from_secs(1)).filter("abc");
        assert_eq!(by_author.authors, Some(vec!["abc".to_string()]));
    }

    #[tokio::test]
    async fn test_seeded_entries_skip_lookup() {
        let pool = RelayPool::new(crate::config::PoolOptions::default()).unwrap();
        let pubkey = "a".repeat(64);
        pool.set_write_relays_for_pubkey(&pubkey, &["wss://relay.example.com".to_string()], 10);

        let relays = NewestEventWriteRelays.write_relays(&pool, &pubkey).await.unwrap();
        assert_eq!(relays, vec!["wss://relay.example.com"]);
        assert!(pool.relay_urls().is_empty());
        pool.close().await;
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let pool = RelayPool::new(crate::config::PoolOptions::default()).unwrap();
        let resolver = StaticWriteRelays::new().with("alice", vec!["wss://a".to_string()]);

        assert_eq!(resolver.write_relays(&pool, "alice").await.unwrap(), vec!["wss://a"]);
        assert!(matches!(
            resolver.write_relays(&pool, "bob").await,
            Err(ClientError::WriteRelayLookup { .. })
        ));
        pool.close().await;
    }
}
