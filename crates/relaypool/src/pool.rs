//! Relay pool for subscribing across many Nostr relays at once.
//!
//! [`RelayPool`] is a cheap, cloneable handle. All batching state lives in one
//! background task, so subscribe, cancel, incoming events and the debounce
//! timer are handled one at a time in the order they arrive.
//!
//! A logical subscription goes through these steps:
//!
//! 1. Author write relays are resolved when no relay list is given.
//! 2. `unsubscribe_on_eose` calls with identical filters and relays attach to
//!    one shared live subscription and get its buffered events replayed.
//! 3. Events the local cache already holds are delivered right away and the
//!    filters are narrowed.
//! 4. Filters are merged and queued. The queue is flushed immediately, or
//!    after the smallest requested delay, into one wire subscription per relay.
//! 5. Incoming events are cached and routed to every matching, still active
//!    subscription of the batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use crate::cache::EventCache;
use crate::config::{PoolOptions, SubscriptionOptions};
use crate::demux::EventDemultiplexer;
use crate::error::{ClientError, Result};
use crate::event::{Event, KIND_CONTACTS, KIND_METADATA, KIND_WRITE_RELAYS};
use crate::filter::Filter;
use crate::merge::merge_similar_filters;
use crate::newest::{NewestEventCache, NewestEventWriteRelays, WriteRelayResolver};
use crate::on_event::{
    OnEose, OnEvent, dedup_events, drop_older_events, guarded, log_events,
};
use crate::relay::{
    ConnectionState, KnownEventLookup, PublishHandle, RelayConnection, RelayNotification,
    SubscriptionMessage,
};
use crate::replay::{AttachId, ReplayCallback, SharedId, SharedSubscriptions};

/// Events emitted by the relay pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A relay connected
    Connected { relay_url: String },
    /// A relay disconnected
    Disconnected { relay_url: String },
    /// Notice from a relay
    Notice { relay_url: String, message: String },
    /// Connection error
    Error { relay_url: String, error: String },
    /// NIP-42 authentication challenge
    Auth { relay_url: String, challenge: String },
}

/// Connection-level listener, called with the relay URL and the message.
pub type RelayCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    notice: Vec<RelayCallback>,
    error: Vec<RelayCallback>,
    disconnect: Vec<RelayCallback>,
    auth: Vec<RelayCallback>,
}

type SubId = u64;
type BatchId = u64;

/// Cancels one logical subscription.
///
/// Cancellation is immediate for this subscriber. The wire subscriptions it
/// shares with others are closed once every sharer has cancelled.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: SubId,
    cancelled: Arc<AtomicBool>,
    commands: Option<mpsc::WeakUnboundedSender<PoolCommand>>,
}

impl SubscriptionHandle {
    /// A handle with nothing behind it.
    pub fn inert() -> Self {
        Self {
            id: 0,
            cancelled: Arc::new(AtomicBool::new(true)),
            commands: None,
        }
    }

    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(commands) = self.commands.as_ref().and_then(|weak| weak.upgrade()) {
            let _ = commands.send(PoolCommand::Cancel { id: self.id });
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct SubscribeRequest {
    id: SubId,
    filters: Vec<Filter>,
    relays: Vec<String>,
    on_event: OnEvent,
    max_delay: Option<Duration>,
    on_eose: Option<OnEose>,
    options: SubscriptionOptions,
    registered: oneshot::Sender<()>,
}

#[derive(Debug)]
enum PoolCommand {
    Subscribe(Box<SubscribeRequest>),
    Cancel {
        id: SubId,
    },
    Flush,
    Wire {
        batch: BatchId,
        relay: String,
        message: SubscriptionMessage,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

impl std::fmt::Debug for SubscribeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeRequest")
            .field("id", &self.id)
            .field("filters", &self.filters)
            .field("relays", &self.relays)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

/// State shared by pool handles and the pool task.
struct PoolShared {
    options: PoolOptions,
    relays: Mutex<HashMap<String, RelayConnection>>,
    cache: Option<Arc<RwLock<EventCache>>>,
    listeners: Arc<RwLock<Listeners>>,
    events_tx: broadcast::Sender<PoolEvent>,
}

impl PoolShared {
    /// Existing connection for `url`, or a new one.
    fn relay(&self, url: &str) -> Result<RelayConnection> {
        let mut relays = self.relays.lock();
        if let Some(relay) = relays.get(url) {
            return Ok(relay.clone());
        }

        let known_event: Option<KnownEventLookup> = self.cache.as_ref().map(|cache| {
            let cache = Arc::clone(cache);
            Arc::new(move |id: &str| cache.read().get(id).cloned()) as KnownEventLookup
        });
        let relay = RelayConnection::with_config(url, self.options.relay.clone(), known_event)?;
        info!("Adding relay to pool: {}", url);

        tokio::spawn(forward_notifications(
            relay.notifications(),
            url.to_string(),
            Arc::clone(&self.listeners),
            self.events_tx.clone(),
        ));
        relays.insert(url.to_string(), relay.clone());
        Ok(relay)
    }
}

async fn forward_notifications(
    mut notifications: broadcast::Receiver<RelayNotification>,
    relay_url: String,
    listeners: Arc<RwLock<Listeners>>,
    events_tx: broadcast::Sender<PoolEvent>,
) {
    loop {
        let notification = match notifications.recv().await {
            Ok(notification) => notification,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Dropped {} notifications from {}", skipped, relay_url);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let (callbacks, event) = {
            let listeners = listeners.read();
            match &notification {
                RelayNotification::Connected => (
                    Vec::new(),
                    PoolEvent::Connected {
                        relay_url: relay_url.clone(),
                    },
                ),
                RelayNotification::Disconnected => (
                    listeners.disconnect.clone(),
                    PoolEvent::Disconnected {
                        relay_url: relay_url.clone(),
                    },
                ),
                RelayNotification::Notice(message) => (
                    listeners.notice.clone(),
                    PoolEvent::Notice {
                        relay_url: relay_url.clone(),
                        message: message.clone(),
                    },
                ),
                RelayNotification::Error(error) => (
                    listeners.error.clone(),
                    PoolEvent::Error {
                        relay_url: relay_url.clone(),
                        error: error.clone(),
                    },
                ),
                RelayNotification::Auth(challenge) => (
                    listeners.auth.clone(),
                    PoolEvent::Auth {
                        relay_url: relay_url.clone(),
                        challenge: challenge.clone(),
                    },
                ),
            }
        };

        let message = match &notification {
            RelayNotification::Notice(text)
            | RelayNotification::Error(text)
            | RelayNotification::Auth(text) => text.as_str(),
            RelayNotification::Disconnected => "disconnected",
            RelayNotification::Connected => "connected",
        };
        for callback in callbacks {
            guarded("relay listener", || callback(&relay_url, message));
        }
        let _ = events_tx.send(event);
    }
}

/// A pool of Nostr relay connections.
#[derive(Clone)]
pub struct RelayPool {
    shared: Arc<PoolShared>,
    commands: mpsc::UnboundedSender<PoolCommand>,
    next_sub: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    resolver: Arc<RwLock<Arc<dyn WriteRelayResolver>>>,
    write_relays: NewestEventCache,
    metadata: NewestEventCache,
    contacts: NewestEventCache,
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.relay_urls())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl RelayPool {
    /// Create a pool and connect to `options.relays`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(options: PoolOptions) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ClientError::Connection(format!("no Tokio runtime: {}", e)))?;

        let (events_tx, _) = broadcast::channel(1000);
        let shared = Arc::new(PoolShared {
            cache: options
                .use_event_cache
                .then(|| Arc::new(RwLock::new(EventCache::new()))),
            relays: Mutex::new(HashMap::new()),
            listeners: Arc::new(RwLock::new(Listeners::default())),
            events_tx,
            options,
        });

        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = PoolTask {
            shared: Arc::clone(&shared),
            commands: commands.downgrade(),
            pending: Vec::new(),
            deadline: None,
            batches: HashMap::new(),
            next_batch: 0,
            locations: HashMap::new(),
            attachments: HashMap::new(),
            shared_subs: SharedSubscriptions::new(),
        };
        runtime.spawn(task.run(command_rx));

        let info_relays = shared.options.info_relays.clone();
        let lookup_timeout = shared.options.lookup_timeout;
        let pool = Self {
            commands,
            next_sub: Arc::new(AtomicU64::new(1)),
            closed: Arc::new(AtomicBool::new(false)),
            resolver: Arc::new(RwLock::new(Arc::new(NewestEventWriteRelays))),
            write_relays: NewestEventCache::new(
                KIND_WRITE_RELAYS,
                info_relays.clone(),
                true,
                lookup_timeout,
            ),
            metadata: NewestEventCache::new(
                KIND_METADATA,
                info_relays.clone(),
                false,
                lookup_timeout,
            ),
            contacts: NewestEventCache::new(KIND_CONTACTS, info_relays, false, lookup_timeout),
            shared,
        };

        for url in pool.shared.options.relays.clone() {
            pool.add_relay(&url)?;
        }
        Ok(pool)
    }

    /// Create a pool with default options connected to `relays`.
    pub fn with_relays(relays: Vec<String>) -> Result<Self> {
        Self::new(PoolOptions {
            relays,
            ..PoolOptions::default()
        })
    }

    pub fn options(&self) -> &PoolOptions {
        &self.shared.options
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    /// Add a relay to the pool and start connecting to it.
    pub fn add_relay(&self, url: &str) -> Result<()> {
        self.ensure_open()?;
        self.shared.relay(url).map(|_| ())
    }

    /// Close one relay connection and forget it.
    pub async fn remove_relay(&self, url: &str) {
        info!("Removing relay from pool: {}", url);
        let relay = self.shared.relays.lock().remove(url);
        if let Some(relay) = relay {
            relay.close().await;
        }
    }

    pub fn relay_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.shared.relays.lock().keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Connection state of every relay, sorted by URL.
    pub fn get_relay_statuses(&self) -> Vec<(String, ConnectionState)> {
        let mut statuses: Vec<(String, ConnectionState)> = self
            .shared
            .relays
            .lock()
            .iter()
            .map(|(url, relay)| (url.clone(), relay.state()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    /// Pool events: connects, disconnects, notices, errors and auth challenges.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn on_notice<F>(&self, callback: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.shared.listeners.write().notice.push(Arc::new(callback));
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.shared.listeners.write().error.push(Arc::new(callback));
    }

    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.shared.listeners.write().disconnect.push(Arc::new(callback));
    }

    pub fn on_auth<F>(&self, callback: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.shared.listeners.write().auth.push(Arc::new(callback));
    }

    /// Replace how author write relays are looked up.
    pub fn set_write_relay_resolver(&self, resolver: Arc<dyn WriteRelayResolver>) {
        *self.resolver.write() = resolver;
    }

    /// Number of events in the local cache, if caching is enabled.
    pub fn cached_event_count(&self) -> Option<usize> {
        self.shared.cache.as_ref().map(|cache| cache.read().len())
    }

    /// Cached event by id.
    pub fn cached_event(&self, id: &str) -> Option<Event> {
        self.shared
            .cache
            .as_ref()
            .and_then(|cache| cache.read().get(id).cloned())
    }

    /// Add events to the local cache.
    pub fn add_to_cache(&self, events: impl IntoIterator<Item = Event>) {
        if let Some(cache) = &self.shared.cache {
            let mut cache = cache.write();
            for event in events {
                cache.add(event);
            }
        }
    }

    /// Subscribe to events.
    ///
    /// With `relays` set to `None` the relays are looked up from the authors in
    /// `filters`, falling back to `options.default_relays`. `max_delay` batches
    /// this request with others issued within the delay and cannot be combined
    /// with `on_eose`. Events already in the cache are delivered before this
    /// returns.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        relays: Option<Vec<String>>,
        on_event: OnEvent,
        max_delay: Option<Duration>,
        on_eose: Option<OnEose>,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle> {
        self.ensure_open()?;
        if max_delay.is_some() && on_eose.is_some() {
            return Err(ClientError::InvalidRequest(
                "max_delay and on_eose cannot be used together".to_string(),
            ));
        }

        let relays = match relays {
            Some(relays) => relays,
            None => self.relays_for_authors(&filters, &options).await?,
        };
        if relays.is_empty() && filters.iter().all(|filter| filter.relay.is_none()) {
            return Err(ClientError::InvalidRequest(
                "no relays to subscribe to".to_string(),
            ));
        }

        let id = self.next_sub.fetch_add(1, Ordering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&cancelled);
        let gated: OnEvent = Arc::new(move |event: &Event, after_eose: bool, url: Option<&str>| {
            if !gate.load(Ordering::SeqCst) {
                on_event(event, after_eose, url);
            }
        });

        let (registered, done) = oneshot::channel();
        self.commands
            .send(PoolCommand::Subscribe(Box::new(SubscribeRequest {
                id,
                filters,
                relays,
                on_event: gated,
                max_delay,
                on_eose,
                options,
                registered,
            })))
            .map_err(|_| ClientError::Closed)?;
        done.await.map_err(|_| ClientError::Closed)?;

        Ok(SubscriptionHandle {
            id,
            cancelled,
            commands: Some(self.commands.downgrade()),
        })
    }

    async fn relays_for_authors(
        &self,
        filters: &[Filter],
        options: &SubscriptionOptions,
    ) -> Result<Vec<String>> {
        let mut authors: Vec<String> = Vec::new();
        for author in filters.iter().flat_map(|f| f.authors.iter().flatten()) {
            if !authors.contains(author) {
                authors.push(author.clone());
            }
        }

        if authors.is_empty() {
            return options.default_relays.clone().ok_or_else(|| {
                ClientError::InvalidRequest(
                    "relays omitted, no filter names an author and no default relays set"
                        .to_string(),
                )
            });
        }

        let relays = self.write_relays_for_authors(&authors).await;
        if !relays.is_empty() {
            return Ok(relays);
        }
        options.default_relays.clone().ok_or_else(|| {
            ClientError::InvalidRequest(format!(
                "no write relays found for {} authors and no default relays set",
                authors.len()
            ))
        })
    }

    /// Union of the write relays of `authors`. Authors whose lookup fails are skipped.
    pub async fn write_relays_for_authors(&self, authors: &[String]) -> Vec<String> {
        let resolver = Arc::clone(&*self.resolver.read());
        let lookups = authors.iter().map(|author| {
            let resolver = Arc::clone(&resolver);
            async move { (author, resolver.write_relays(self, author).await) }
        });

        let mut relays: Vec<String> = Vec::new();
        for (author, result) in join_all(lookups).await {
            match result {
                Ok(found) => {
                    for relay in found {
                        if !relays.contains(&relay) {
                            relays.push(relay);
                        }
                    }
                }
                Err(e) => warn!("Skipping author {}: {}", author, e),
            }
        }
        relays
    }

    /// Subscribe to the events referenced by `e` tags of `event`, on the write
    /// relays of the authors in its `p` tags.
    pub async fn subscribe_referenced_events(
        &self,
        event: &Event,
        on_event: OnEvent,
        max_delay: Option<Duration>,
        on_eose: Option<OnEose>,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle> {
        let mut ids: Vec<String> = Vec::new();
        for id in event.tag_values("e") {
            if !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        }
        if ids.is_empty() {
            return Ok(SubscriptionHandle::inert());
        }

        let mut authors: Vec<String> = Vec::new();
        for pubkey in event.tag_values("p") {
            if pubkey.len() != 64 {
                info!("Skipping malformed pubkey in p tag of {}: {}", event.id, pubkey);
                continue;
            }
            if !authors.iter().any(|known| known == pubkey) {
                authors.push(pubkey.to_string());
            }
        }

        let mut relays = if authors.is_empty() {
            Vec::new()
        } else {
            self.write_relays_for_authors(&authors).await
        };
        if relays.is_empty() {
            match &options.default_relays {
                Some(defaults) => relays = defaults.clone(),
                None => {
                    error!(
                        "No relays found for events referenced by {}",
                        event.id
                    );
                    return Ok(SubscriptionHandle::inert());
                }
            }
        }

        self.subscribe(
            vec![Filter::new().ids(ids)],
            Some(relays),
            on_event,
            max_delay,
            on_eose,
            options,
        )
        .await
    }

    /// [`subscribe_referenced_events`](Self::subscribe_referenced_events) that
    /// also starts loading the metadata of every `p` tagged author in the
    /// background.
    pub async fn subscribe_referenced_events_and_prefetch_metadata(
        &self,
        event: &Event,
        on_event: OnEvent,
        max_delay: Option<Duration>,
        on_eose: Option<OnEose>,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle> {
        self.ensure_open()?;
        for pubkey in event.tag_values("p") {
            if pubkey.len() != 64 {
                continue;
            }
            let pool = self.clone();
            let pubkey = pubkey.to_string();
            tokio::spawn(async move {
                if let Err(e) = pool.fetch_and_cache_metadata(&pubkey).await {
                    debug!("Metadata prefetch for {} failed: {}", pubkey, e);
                }
            });
        }

        self.subscribe_referenced_events(event, on_event, max_delay, on_eose, options)
            .await
    }

    /// Fetch one event by id. Fails with `NotFound` after the event timeout.
    ///
    /// With `relays` set to `None` the pool's configured relays are queried.
    pub async fn get_event_by_id(
        &self,
        id: &str,
        relays: Option<Vec<String>>,
        max_delay: Option<Duration>,
    ) -> Result<Event> {
        if let Some(event) = self.cached_event(id) {
            return Ok(event);
        }

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let on_found: OnEvent = Arc::new(move |event: &Event, _: bool, _: Option<&str>| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(event.clone());
            }
        });

        let options = SubscriptionOptions {
            default_relays: Some(self.shared.options.relays.clone())
                .filter(|relays| !relays.is_empty()),
            ..SubscriptionOptions::default()
        };
        let handle = self
            .subscribe(
                vec![Filter::new().ids(vec![id.to_string()])],
                relays,
                on_found,
                max_delay,
                None,
                options,
            )
            .await?;

        let found = timeout(self.shared.options.event_timeout, rx).await;
        handle.cancel();
        match found {
            Ok(Ok(event)) => Ok(event),
            _ => Err(ClientError::NotFound(id.to_string())),
        }
    }

    /// Publish an event to every relay in `relays`, once per unique URL.
    pub fn publish(&self, event: &Event, relays: &[String]) -> Result<Vec<PublishHandle>> {
        self.ensure_open()?;
        let mut seen: HashSet<&str> = HashSet::new();
        let mut handles = Vec::new();
        for url in relays {
            if !seen.insert(url.as_str()) {
                continue;
            }
            let relay = self.shared.relay(url)?;
            debug!("Publishing event {} to {}", event.id, url);
            handles.push(relay.publish(event)?);
        }
        Ok(handles)
    }

    /// Send every queued subscription now instead of waiting for its delay.
    pub fn send_subscriptions(&self) {
        let _ = self.commands.send(PoolCommand::Flush);
    }

    /// Seed the write relays of `pubkey`.
    pub fn set_write_relays_for_pubkey(&self, pubkey: &str, relays: &[String], created_at: u64) {
        self.write_relays
            .set_write_relays(pubkey, relays, created_at);
    }

    /// Seed the profile metadata of `pubkey`.
    pub fn set_cached_metadata(&self, pubkey: &str, event: Event) {
        self.add_to_cache([event.clone()]);
        self.metadata.set(pubkey, event);
    }

    /// Seed the contact list of `pubkey`.
    pub fn set_cached_contact_list(&self, pubkey: &str, event: Event) {
        self.add_to_cache([event.clone()]);
        self.contacts.set(pubkey, event);
    }

    /// Newest write relay list event of `pubkey`, from cache or the info relays.
    pub async fn fetch_write_relays_event(&self, pubkey: &str) -> Result<Event> {
        self.write_relays.get(pubkey, self).await
    }

    /// Newest profile metadata of `pubkey`, from cache or the info relays.
    pub async fn fetch_and_cache_metadata(&self, pubkey: &str) -> Result<Event> {
        self.metadata.get(pubkey, self).await
    }

    /// Newest contact list of `pubkey`, from cache or the info relays.
    pub async fn fetch_and_cache_contact_list(&self, pubkey: &str) -> Result<Event> {
        self.contacts.get(pubkey, self).await
    }

    /// Close every relay connection and stop the pool. Later calls fail with `Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing relay pool");

        let (done, stopped) = oneshot::channel();
        if self.commands.send(PoolCommand::Close { done }).is_ok() {
            let _ = stopped.await;
        }

        let relays: Vec<RelayConnection> = self
            .shared
            .relays
            .lock()
            .drain()
            .map(|(_, relay)| relay)
            .collect();
        join_all(relays.iter().map(|relay| relay.close())).await;
    }
}

/// An event as buffered for shared subscriptions.
#[derive(Debug, Clone)]
struct Delivery {
    event: Event,
    after_eose: bool,
    relay: Option<String>,
}

fn replay_callback(on_event: OnEvent) -> ReplayCallback<Delivery> {
    Arc::new(move |delivery: &Delivery| {
        on_event(&delivery.event, delivery.after_eose, delivery.relay.as_deref())
    })
}

/// Key of the shared subscription table.
fn shared_key(filters: &[Filter], relays: &[String]) -> String {
    let filters: Vec<String> = filters.iter().map(Filter::stable_json).collect();
    let mut relays = relays.to_vec();
    relays.sort();
    relays.dedup();
    format!("[{}]|{}", filters.join(","), relays.join(","))
}

fn unique(relays: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(relays.len());
    for relay in relays {
        if !out.contains(&relay) {
            out.push(relay);
        }
    }
    out
}

struct PendingEntry {
    sub: SubId,
    on_event: OnEvent,
    filters: Vec<Filter>,
    relays: Vec<String>,
    on_eose: Option<OnEose>,
    unsubscribe_on_eose: bool,
    shared_key: Option<String>,
    max_delay: Option<Duration>,
}

enum Target {
    Direct(OnEvent),
    Shared(SharedId),
}

struct BatchEntry {
    target: Target,
    relays: Vec<String>,
    on_eose: Option<OnEose>,
    unsubscribe_on_eose: bool,
    active: bool,
    sub: SubId,
}

struct WireState {
    relay: RelayConnection,
    wire_id: String,
    eosed: bool,
    closed: bool,
    min_created_at: Option<u64>,
}

/// One flushed group of logical subscriptions sharing wire subscriptions.
struct Batch {
    entries: Vec<BatchEntry>,
    demux: EventDemultiplexer<usize>,
    wires: IndexMap<String, WireState>,
    active: usize,
    /// Active entries that stay open past EOSE
    keep_open: usize,
    close_on_eose: bool,
}

impl Batch {
    fn close_wire(wire: &mut WireState) {
        if !wire.closed {
            wire.closed = true;
            wire.relay.unsubscribe(&wire.wire_id);
        }
    }

    fn close_all(&mut self) {
        for wire in self.wires.values_mut() {
            Self::close_wire(wire);
        }
    }

    fn finished(&self) -> bool {
        self.wires.values().all(|wire| wire.closed)
    }
}

/// Owner of all batching state. Runs as a single task.
struct PoolTask {
    shared: Arc<PoolShared>,
    commands: mpsc::WeakUnboundedSender<PoolCommand>,
    pending: Vec<PendingEntry>,
    deadline: Option<Instant>,
    batches: HashMap<BatchId, Batch>,
    next_batch: BatchId,
    /// Subscriptions delivered directly by a batch entry
    locations: HashMap<SubId, (BatchId, usize)>,
    /// Subscriptions attached to a shared subscription
    attachments: HashMap<SubId, (SharedId, AttachId)>,
    shared_subs: SharedSubscriptions<Delivery, (BatchId, usize)>,
}

impl PoolTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PoolCommand>) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    None => break,
                    Some(PoolCommand::Close { done }) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush();
                }
            }
        }
        debug!("Relay pool task stopped");
    }

    fn handle(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Subscribe(request) => self.subscribe(*request),
            PoolCommand::Cancel { id } => self.cancel(id),
            PoolCommand::Flush => self.flush(),
            PoolCommand::Wire {
                batch,
                relay,
                message,
            } => match message {
                SubscriptionMessage::Event(event) => self.on_wire_event(batch, &relay, event),
                SubscriptionMessage::Eose => self.on_wire_eose(batch, &relay),
                SubscriptionMessage::Closed(reason) => {
                    self.on_wire_closed(batch, &relay, &reason)
                }
            },
            PoolCommand::Close { done } => {
                let _ = done.send(());
            }
        }
    }

    fn subscribe(&mut self, request: SubscribeRequest) {
        let SubscribeRequest {
            id,
            filters,
            relays,
            on_event,
            max_delay,
            on_eose,
            options,
            registered,
        } = request;
        let relays = unique(relays);

        let key = (options.unsubscribe_on_eose
            && on_eose.is_none()
            && self.shared.options.subscription_cache)
            .then(|| shared_key(&filters, &relays));

        if let Some(key) = &key
            && let Some(shared_id) = self.shared_subs.find(key)
            && let Some(attach) = self
                .shared_subs
                .attach(shared_id, replay_callback(on_event.clone()))
        {
            debug!("Attached subscription {} to shared subscription", id);
            self.attachments.insert(id, (shared_id, attach));
            let _ = registered.send(());
            return;
        }

        let (filters, cached) = match &self.shared.cache {
            Some(cache) => {
                let resolution = cache.read().resolve(&filters);
                (resolution.filters, resolution.events)
            }
            None => (filters, Vec::new()),
        };

        let mut on_event = on_event;
        if options.log_all_events {
            on_event = log_events(on_event);
        }
        if !options.allow_older_events {
            on_event = drop_older_events(on_event);
        }
        if !options.allow_duplicate_events {
            on_event = dedup_events(on_event);
        }

        for event in &cached {
            guarded("event", || on_event(event, false, None));
        }

        let filters = merge_similar_filters(&filters);
        if filters.is_empty() {
            // Fully answered from the cache.
            if let Some(on_eose) = &on_eose {
                for relay in &relays {
                    guarded("eose", || on_eose(relay, None));
                }
            }
            let _ = registered.send(());
            return;
        }

        if max_delay.is_none() && on_eose.is_some() && !self.pending.is_empty() {
            self.flush();
        }

        self.pending.push(PendingEntry {
            sub: id,
            on_event,
            filters,
            relays,
            on_eose,
            unsubscribe_on_eose: options.unsubscribe_on_eose,
            shared_key: key,
            max_delay,
        });

        match max_delay {
            None => self.flush(),
            Some(delay) => {
                let at = Instant::now() + delay;
                self.deadline = Some(match self.deadline {
                    Some(current) => current.min(at),
                    None => at,
                });
            }
        }
        let _ = registered.send(());
    }

    fn flush(&mut self) {
        self.deadline = None;
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return;
        }

        let batch_id = self.next_batch;
        self.next_batch += 1;

        let mut per_relay: IndexMap<String, Vec<Filter>> = IndexMap::new();
        let mut demux = EventDemultiplexer::new();
        let mut entries = Vec::with_capacity(pending.len());
        let mut shared_keys = Vec::with_capacity(pending.len());
        let mut callbacks = Vec::with_capacity(pending.len());
        let delay = pending.iter().filter_map(|entry| entry.max_delay).min();

        for (index, entry) in pending.into_iter().enumerate() {
            let mut entry_relays = entry.relays.clone();
            let mut plain = Vec::with_capacity(entry.filters.len());
            for filter in entry.filters {
                let mut unpinned = filter.clone();
                unpinned.relay = None;
                match filter.relay {
                    Some(pinned) => {
                        per_relay
                            .entry(pinned.clone())
                            .or_default()
                            .push(unpinned.clone());
                        if !entry_relays.contains(&pinned) {
                            entry_relays.push(pinned);
                        }
                    }
                    None => {
                        for relay in &entry.relays {
                            per_relay
                                .entry(relay.clone())
                                .or_default()
                                .push(unpinned.clone());
                        }
                    }
                }
                plain.push(unpinned);
            }
            demux.subscribe(&plain, index);

            shared_keys.push(entry.shared_key);
            callbacks.push(entry.on_event.clone());
            entries.push(BatchEntry {
                target: Target::Direct(entry.on_event),
                relays: entry_relays,
                on_eose: entry.on_eose,
                unsubscribe_on_eose: entry.unsubscribe_on_eose,
                active: true,
                sub: entry.sub,
            });
        }

        let mut wires = IndexMap::new();
        for (url, filters) in per_relay {
            let filters = merge_similar_filters(&filters);
            if filters.is_empty() {
                continue;
            }
            if self.shared.options.log_subscriptions {
                let json: Vec<String> = filters.iter().map(Filter::stable_json).collect();
                info!(
                    "Subscribing to {} (delay {:?}): [{}]",
                    url,
                    delay,
                    json.join(",")
                );
            }
            let relay = match self.shared.relay(&url) {
                Ok(relay) => relay,
                Err(e) => {
                    warn!("Skipping relay {}: {}", url, e);
                    continue;
                }
            };
            let subscription =
                match relay.subscribe(filters, self.shared.options.skip_verification) {
                    Ok(subscription) => subscription,
                    Err(e) => {
                        warn!("Failed to subscribe on {}: {}", url, e);
                        continue;
                    }
                };

            wires.insert(
                url.clone(),
                WireState {
                    relay,
                    wire_id: subscription.id().to_string(),
                    eosed: false,
                    closed: false,
                    min_created_at: None,
                },
            );
            tokio::spawn(forward_wire(
                subscription,
                batch_id,
                url,
                self.commands.clone(),
            ));
        }

        if wires.is_empty() {
            warn!("No relay accepted batch {}", batch_id);
            for entry in &entries {
                if let Some(on_eose) = &entry.on_eose {
                    for relay in &entry.relays {
                        guarded("eose", || on_eose(relay, None));
                    }
                }
            }
            return;
        }

        for (index, (entry, key)) in entries.iter_mut().zip(shared_keys).enumerate() {
            let Some(key) = key else {
                self.locations.insert(entry.sub, (batch_id, index));
                continue;
            };
            let shared_id = match self.shared_subs.find(&key) {
                Some(shared_id) => {
                    // An earlier entry already feeds this key; listen through it.
                    entry.active = false;
                    shared_id
                }
                None => self.shared_subs.insert(key, (batch_id, index)),
            };
            if let Some(attach) = self
                .shared_subs
                .attach(shared_id, replay_callback(callbacks[index].clone()))
            {
                self.attachments.insert(entry.sub, (shared_id, attach));
            }
            entry.target = Target::Shared(shared_id);
        }

        let active = entries.iter().filter(|entry| entry.active).count();
        let keep_open = entries
            .iter()
            .filter(|entry| entry.active && !entry.unsubscribe_on_eose)
            .count();
        let mut batch = Batch {
            active,
            entries,
            demux,
            wires,
            keep_open,
            close_on_eose: keep_open == 0,
        };
        if active == 0 {
            debug!("Batch {} fully served by shared subscriptions", batch_id);
            batch.close_all();
            return;
        }
        self.batches.insert(batch_id, batch);
    }

    fn on_wire_event(&mut self, batch_id: BatchId, relay: &str, mut event: Event) {
        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return;
        };
        let Some(wire) = batch.wires.get_mut(relay) else {
            return;
        };
        if wire.closed {
            return;
        }
        wire.min_created_at = Some(match wire.min_created_at {
            Some(min) => min.min(event.created_at),
            None => event.created_at,
        });
        let after_eose = wire.eosed;

        if self.shared.options.delete_signatures {
            event.sig.clear();
        }
        if let Some(cache) = &self.shared.cache {
            cache.write().add(event.clone());
        }

        for index in batch.demux.matching(&event) {
            let entry = &batch.entries[index];
            if !entry.active || !entry.relays.iter().any(|r| r == relay) {
                continue;
            }
            match &entry.target {
                Target::Direct(on_event) => {
                    guarded("event", || on_event(&event, after_eose, Some(relay)));
                }
                Target::Shared(shared_id) => self.shared_subs.emit(
                    *shared_id,
                    Delivery {
                        event: event.clone(),
                        after_eose,
                        relay: Some(relay.to_string()),
                    },
                ),
            }
        }
    }

    fn on_wire_eose(&mut self, batch_id: BatchId, relay: &str) {
        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return;
        };
        let Some(wire) = batch.wires.get_mut(relay) else {
            return;
        };
        if wire.eosed || wire.closed {
            return;
        }
        wire.eosed = true;
        let min_created_at = wire.min_created_at;

        for entry in &batch.entries {
            if !entry.active || !entry.relays.iter().any(|r| r == relay) {
                continue;
            }
            if let Some(on_eose) = &entry.on_eose {
                guarded("eose", || on_eose(relay, min_created_at));
            }
        }

        if batch.close_on_eose
            && let Some(wire) = batch.wires.get_mut(relay)
        {
            Batch::close_wire(wire);
        }
        self.remove_if_finished(batch_id);
    }

    fn on_wire_closed(&mut self, batch_id: BatchId, relay: &str, reason: &str) {
        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return;
        };
        let Some(wire) = batch.wires.get_mut(relay) else {
            return;
        };
        warn!("Relay {} closed subscription: {}", relay, reason);
        // The relay already forgot the subscription.
        wire.closed = true;
        let was_eosed = std::mem::replace(&mut wire.eosed, true);
        let min_created_at = wire.min_created_at;

        if !was_eosed {
            for entry in &batch.entries {
                if !entry.active || !entry.relays.iter().any(|r| r == relay) {
                    continue;
                }
                if let Some(on_eose) = &entry.on_eose {
                    guarded("eose", || on_eose(relay, min_created_at));
                }
            }
        }
        self.remove_if_finished(batch_id);
    }

    fn cancel(&mut self, sub: SubId) {
        if let Some(position) = self.pending.iter().position(|entry| entry.sub == sub) {
            self.pending.remove(position);
            if self.pending.is_empty() {
                self.deadline = None;
            }
            return;
        }

        if let Some((shared_id, attach)) = self.attachments.remove(&sub) {
            if let Some((batch_id, index)) = self.shared_subs.detach(shared_id, attach) {
                debug!("Last subscriber left shared subscription");
                self.cancel_entry(batch_id, index);
            }
            return;
        }

        if let Some((batch_id, index)) = self.locations.remove(&sub) {
            self.cancel_entry(batch_id, index);
        }
    }

    fn cancel_entry(&mut self, batch_id: BatchId, index: usize) {
        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return;
        };
        let Some(entry) = batch.entries.get_mut(index) else {
            return;
        };
        if !entry.active {
            return;
        }
        entry.active = false;
        if !entry.unsubscribe_on_eose {
            batch.keep_open -= 1;
        }
        batch.active -= 1;

        if batch.active == 0 {
            batch.close_all();
        } else if batch.keep_open == 0 {
            batch.close_on_eose = true;
            for wire in batch.wires.values_mut() {
                if wire.eosed {
                    Batch::close_wire(wire);
                }
            }
        }
        self.remove_if_finished(batch_id);
    }

    fn remove_if_finished(&mut self, batch_id: BatchId) {
        let finished = self
            .batches
            .get(&batch_id)
            .is_some_and(Batch::finished);
        if !finished {
            return;
        }
        if let Some(batch) = self.batches.remove(&batch_id) {
            for (index, entry) in batch.entries.iter().enumerate() {
                if self.locations.get(&entry.sub) == Some(&(batch_id, index)) {
                    self.locations.remove(&entry.sub);
                }
            }
            debug!("Batch {} finished", batch_id);
        }
    }

    fn shutdown(&mut self) {
        for batch in self.batches.values_mut() {
            batch.close_all();
        }
        self.batches.clear();
        self.pending.clear();
        self.locations.clear();
        self.attachments.clear();
        self.shared_subs.clear();
        self.deadline = None;
    }
}

/// Pump one wire subscription into the pool task.
async fn forward_wire(
    mut subscription: crate::relay::RelaySubscription,
    batch: BatchId,
    relay: String,
    commands: mpsc::WeakUnboundedSender<PoolCommand>,
) {
    while let Some(message) = subscription.next().await {
        let Some(commands) = commands.upgrade() else {
            break;
        };
        let command = PoolCommand::Wire {
            batch,
            relay: relay.clone(),
            message,
        };
        if commands.send(command).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::on_event::on_event;

    #[test]
    fn test_shared_key_ignores_relay_order() {
        let filters = vec![Filter::new().kinds(vec![0]).authors(vec!["a".to_string()])];
        let one = shared_key(&filters, &["wss://b".to_string(), "wss://a".to_string()]);
        let two = shared_key(&filters, &["wss://a".to_string(), "wss://b".to_string()]);
        assert_eq!(one, two);

        let other = shared_key(&[Filter::new().kinds(vec![1])], &["wss://a".to_string()]);
        assert_ne!(one, other);
    }

    #[test]
    fn test_unique_keeps_first_occurrence() {
        let relays = unique(vec![
            "wss://b".to_string(),
            "wss://a".to_string(),
            "wss://b".to_string(),
        ]);
        assert_eq!(relays, vec!["wss://b", "wss://a"]);
    }

    #[test]
    fn test_inert_handle() {
        let handle = SubscriptionHandle::inert();
        assert!(handle.is_cancelled());
        handle.cancel();
    }

    #[tokio::test]
    async fn test_max_delay_with_on_eose_is_rejected() {
        let pool = RelayPool::new(PoolOptions::default()).unwrap();
        let result = pool
            .subscribe(
                vec![Filter::new().kinds(vec![1])],
                Some(vec!["ws://127.0.0.1:9".to_string()]),
                on_event(|_, _, _| {}),
                Some(Duration::from_millis(10)),
                Some(crate::on_event::on_eose(|_, _| {})),
                SubscriptionOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(ClientError::InvalidRequest(_))));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_missing_relays_without_authors_is_rejected() {
        let pool = RelayPool::new(PoolOptions::default()).unwrap();
        let result = pool
            .subscribe(
                vec![Filter::new().kinds(vec![1])],
                None,
                on_event(|_, _, _| {}),
                None,
                None,
                SubscriptionOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(ClientError::InvalidRequest(_))));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_cached_events_delivered_before_subscribe_returns() {
        let pool = RelayPool::new(PoolOptions::default()).unwrap();
        let event = Event {
            id: "a".repeat(64),
            pubkey: "b".repeat(64),
            created_at: 100,
            kind: 1,
            tags: vec![],
            content: "cached".to_string(),
            sig: String::new(),
        };
        pool.add_to_cache([event.clone()]);

        let delivered: Arc<Mutex<Vec<(String, Option<String>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let handle = pool
            .subscribe(
                vec![Filter::new().ids(vec![event.id.clone()])],
                Some(vec!["ws://127.0.0.1:9".to_string()]),
                on_event(move |e, _, url| sink.lock().push((e.id.clone(), url.map(String::from)))),
                None,
                None,
                SubscriptionOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(*delivered.lock(), vec![(event.id.clone(), None)]);
        handle.cancel();
        assert_eq!(pool.get_event_by_id(&event.id, None, None).await.unwrap(), event);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_eose_reported_when_no_relay_accepts_batch() {
        let pool = RelayPool::new(PoolOptions::default()).unwrap();
        let eoses: Arc<Mutex<Vec<(String, Option<u64>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&eoses);

        pool.subscribe(
            vec![Filter::new().kinds(vec![1])],
            Some(vec!["http://example.com".to_string()]),
            on_event(|_, _, _| {}),
            None,
            Some(Arc::new(move |url: &str, min: Option<u64>| {
                sink.lock().push((url.to_string(), min));
            })),
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(*eoses.lock(), vec![("http://example.com".to_string(), None)]);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_calls() {
        let pool = RelayPool::new(PoolOptions::default()).unwrap();
        pool.close().await;

        assert!(matches!(pool.add_relay("wss://relay.example.com"), Err(ClientError::Closed)));
        let result = pool
            .subscribe(
                vec![Filter::new().kinds(vec![1])],
                Some(vec!["wss://relay.example.com".to_string()]),
                on_event(|_, _, _| {}),
                None,
                None,
                SubscriptionOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(ClientError::Closed)));
        assert!(pool.get_relay_statuses().is_empty());
    }

    #[tokio::test]
    async fn test_referenced_events_without_e_tags_is_inert() {
        let pool = RelayPool::new(PoolOptions::default()).unwrap();
        let event = Event {
            id: "c".repeat(64),
            pubkey: "d".repeat(64),
            created_at: 1,
            kind: 1,
            tags: vec![vec!["p".to_string(), "e".repeat(64)]],
            content: String::new(),
            sig: String::new(),
        };
        let handle = pool
            .subscribe_referenced_events(
                &event,
                on_event(|_, _, _| {}),
                None,
                None,
                SubscriptionOptions::default(),
            )
            .await
            .unwrap();
        assert!(handle.is_cancelled());
        pool.close().await;
    }
}
