//! Nostr relay pool.
//!
//! This crate provides:
//! - One WebSocket connection per relay with backlog replay and backoff reconnect
//! - Merging of similar filters and debounced batching of subscriptions
//! - A local event cache that answers queries and narrows outgoing filters
//! - Shared, reference-counted subscriptions with replay for late joiners
//! - Write relay, metadata and contact list lookups on info relays
//! - An in-memory relay server for tests and local use
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_relaypool::{Filter, RelayPool, SubscriptionOptions, on_eose, on_event};
//!
//! #[tokio::main]
//! async fn main() -> nostr_relaypool::Result<()> {
//!     let pool = RelayPool::with_relays(vec!["wss://relay.damus.io".to_string()])?;
//!
//!     let handle = pool
//!         .subscribe(
//!             vec![Filter::new().kinds(vec![1]).limit(10)],
//!             Some(vec!["wss://relay.damus.io".to_string()]),
//!             on_event(|event, after_eose, relay| {
//!                 println!("{} from {:?} (live: {})", event.id, relay, after_eose);
//!             }),
//!             None,
//!             Some(on_eose(|relay, _| println!("stored events done on {}", relay))),
//!             SubscriptionOptions::default(),
//!         )
//!         .await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     handle.cancel();
//!     pool.close().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod demux;
pub mod error;
pub mod event;
pub mod filter;
pub mod filter_state;
pub mod merge;
pub mod message;
pub mod newest;
pub mod on_event;
pub mod pool;
pub mod relay;
pub mod replay;
pub mod server;
pub mod subscription;

pub use cache::{CacheResolution, EventCache};
pub use config::{DEFAULT_INFO_RELAYS, PoolOptions, SubscriptionOptions};
pub use demux::EventDemultiplexer;
pub use error::{ClientError, Result};
pub use event::{
    Event, EventTemplate, KIND_CONTACTS, KIND_METADATA, KIND_WRITE_RELAYS, finalize_event,
    get_event_hash, get_public_key_hex, is_parameterized_replaceable_kind, is_replaceable_kind,
    validate_event, verify_event,
};
pub use filter::{Filter, GroupField, match_filters};
pub use filter_state::{SubscriptionFilterStateCache, TimeRange};
pub use merge::merge_similar_filters;
pub use message::{ClientMessage, MessageError, RelayMessage};
pub use newest::{
    NewestEventCache, NewestEventWriteRelays, StaticWriteRelays, WriteRelayResolver,
    parse_relay_list,
};
pub use on_event::{
    OnEose, OnEvent, collect, dedup_events, drop_older_events, log_events, match_filters_only,
    on_eose, on_event,
};
pub use pool::{PoolEvent, RelayCallback, RelayPool, SubscriptionHandle};
pub use relay::{
    Backoff, ConnectionState, PublishConfirmation, PublishHandle, RelayConfig, RelayConnection,
    RelayNotification, RelaySubscription, SubscriptionMessage,
};
pub use replay::{SharedSubscription, SharedSubscriptions};
pub use server::InMemoryRelayServer;
pub use subscription::{SubscriptionBuilder, generate_subscription_id};
