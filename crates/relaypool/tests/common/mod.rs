//! Shared helpers for the relay pool integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};

use nostr_relaypool::{
    Event, EventTemplate, InMemoryRelayServer, OnEose, OnEvent, PoolOptions, RelayConfig,
    finalize_event, get_public_key_hex, on_eose, on_event,
};
use parking_lot::Mutex;
use tokio::time::{Duration, Instant, sleep};

pub const ALICE: [u8; 32] = [7u8; 32];
pub const BOB: [u8; 32] = [8u8; 32];

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Start an in-memory relay on an ephemeral port.
pub async fn start_relay() -> InMemoryRelayServer {
    init_tracing();
    InMemoryRelayServer::bind("127.0.0.1:0")
        .await
        .expect("bind test relay")
}

/// Pool options with fast reconnects and no info relays.
pub fn test_options() -> PoolOptions {
    PoolOptions {
        info_relays: vec![],
        lookup_timeout: Duration::from_secs(2),
        event_timeout: Duration::from_secs(2),
        relay: RelayConfig {
            connect_timeout: Duration::from_secs(2),
            min_reconnect_delay: Duration::from_millis(100),
            reconnect_backoff_factor: 2,
            seen_timeout: Duration::from_secs(2),
            ..RelayConfig::default()
        },
        ..PoolOptions::default()
    }
}

pub fn pubkey(secret_key: &[u8; 32]) -> String {
    get_public_key_hex(secret_key).unwrap()
}

pub fn signed(secret_key: &[u8; 32], kind: u16, content: &str, created_at: u64) -> Event {
    signed_with_tags(secret_key, kind, content, created_at, vec![])
}

pub fn signed_with_tags(
    secret_key: &[u8; 32],
    kind: u16,
    content: &str,
    created_at: u64,
    tags: Vec<Vec<String>>,
) -> Event {
    finalize_event(
        &EventTemplate {
            created_at,
            kind,
            tags,
            content: content.to_string(),
        },
        secret_key,
    )
    .unwrap()
}

/// Callback recording every delivered event with its relay.
pub fn recorder() -> (Arc<Mutex<Vec<(Event, Option<String>)>>>, OnEvent) {
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delivered);
    let callback = on_event(move |event, _, relay| {
        sink.lock().push((event.clone(), relay.map(String::from)));
    });
    (delivered, callback)
}

pub fn ids(delivered: &Mutex<Vec<(Event, Option<String>)>>) -> Vec<String> {
    delivered.lock().iter().map(|(e, _)| e.id.clone()).collect()
}

/// EOSE callback recording `(relay, min_created_at)`.
pub fn eose_recorder() -> (Arc<Mutex<Vec<(String, Option<u64>)>>>, OnEose) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback = on_eose(move |relay, min_created_at| {
        sink.lock().push((relay.to_string(), min_created_at));
    });
    (seen, callback)
}

pub fn counter() -> (Arc<AtomicUsize>, OnEvent) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&count);
    let callback = on_event(move |_, _, _| {
        inner.fetch_add(1, Ordering::SeqCst);
    });
    (count, callback)
}

/// Poll `condition` until it holds or `within` elapses.
pub async fn wait_until(within: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}
