//! In-memory relay server.
//!
//! Speaks the relay side of NIP-01 over WebSocket and keeps every accepted
//! event in memory. Used by the integration tests and `relaypool serve`.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, Result};
use crate::event::{Event, verify_event};
use crate::filter::{Filter, match_filters};

struct ServerState {
    events: Mutex<Vec<Event>>,
    req_count: AtomicUsize,
    close_count: AtomicUsize,
    next_connection: AtomicU64,
    /// Connection id -> shutdown signal
    connections: Mutex<HashMap<u64, mpsc::UnboundedSender<()>>>,
    broadcast_tx: broadcast::Sender<Event>,
}

/// Relay server holding events in memory.
pub struct InMemoryRelayServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    accept_task: JoinHandle<()>,
}

impl InMemoryRelayServer {
    /// Bind and start accepting connections. Use port 0 for an ephemeral port.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ClientError::Connection(format!("bind {}: {}", addr, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        info!("Relay server listening on {}", addr);

        let (broadcast_tx, _) = broadcast::channel(1000);
        let state = Arc::new(ServerState {
            events: Mutex::new(Vec::new()),
            req_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            next_connection: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
            broadcast_tx,
        });

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&state)));
        Ok(Self {
            addr,
            state,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// WebSocket URL of the server.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of REQ frames received so far.
    pub fn req_count(&self) -> usize {
        self.state.req_count.load(Ordering::SeqCst)
    }

    /// Number of CLOSE frames received so far.
    pub fn close_count(&self) -> usize {
        self.state.close_count.load(Ordering::SeqCst)
    }

    /// Stored events in arrival order.
    pub fn events(&self) -> Vec<Event> {
        self.state.events.lock().clone()
    }

    /// Store an event without a client publishing it.
    pub fn insert(&self, event: Event) {
        store(&self.state, event);
    }

    /// Forget every stored event.
    pub fn clear(&self) {
        self.state.events.lock().clear();
    }

    /// Drop every open connection without a closing handshake.
    pub fn disconnect_all(&self) {
        let connections: Vec<mpsc::UnboundedSender<()>> =
            self.state.connections.lock().drain().map(|(_, tx)| tx).collect();
        info!("Dropping {} connections", connections.len());
        for shutdown in connections {
            let _ = shutdown.send(());
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.lock().len()
    }

    /// Serve until the accept loop stops.
    pub async fn run(mut self) {
        if let Err(e) = (&mut self.accept_task).await {
            error!("Relay server stopped: {}", e);
        }
    }
}

impl Drop for InMemoryRelayServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.disconnect_all();
    }
}

/// Store an event and push it to live subscriptions. Returns false for duplicates.
fn store(state: &ServerState, event: Event) -> bool {
    {
        let mut events = state.events.lock();
        if events.iter().any(|e| e.id == event.id) {
            return false;
        }
        events.push(event.clone());
    }
    let _ = state.broadcast_tx.send(event);
    true
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("New connection from {}", addr);
                let id = state.next_connection.fetch_add(1, Ordering::SeqCst);
                let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
                state.connections.lock().insert(id, shutdown_tx);

                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, addr, &state, shutdown_rx).await {
                        warn!("Error handling connection from {}: {}", addr, e);
                    }
                    state.connections.lock().remove(&id);
                });
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: &ServerState,
    mut shutdown: mpsc::UnboundedReceiver<()>,
) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| ClientError::WebSocket(e.to_string()))?;
    debug!("WebSocket connection established: {}", addr);

    let (mut write, mut read) = ws_stream.split();
    let mut broadcast_rx = state.broadcast_tx.subscribe();
    let mut subscriptions: HashMap<String, Vec<Filter>> = HashMap::new();

    loop {
        let outgoing: Vec<Value> = tokio::select! {
            _ = shutdown.recv() => {
                debug!("Dropping connection {}", addr);
                return Ok(());
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    debug!("Received message from {}: {}", addr, text.as_str());
                    handle_frame(text.as_str(), state, &mut subscriptions)
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                    Vec::new()
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Client {} disconnected", addr);
                    return Ok(());
                }
                Some(Err(e)) => return Err(ClientError::WebSocket(e.to_string())),
                Some(Ok(_)) => Vec::new(),
            },
            event = broadcast_rx.recv() => match event {
                Ok(event) => subscriptions
                    .iter()
                    .filter(|(_, filters)| match_filters(filters, &event))
                    .map(|(id, _)| json!(["EVENT", id, event]))
                    .collect(),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Broadcast receiver lagged by {} messages", n);
                    Vec::new()
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        };

        for message in outgoing {
            write
                .send(Message::Text(message.to_string().into()))
                .await
                .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        }
    }
}

fn handle_frame(
    text: &str,
    state: &ServerState,
    subscriptions: &mut HashMap<String, Vec<Filter>>,
) -> Vec<Value> {
    let notice = |message: &str| vec![json!(["NOTICE", message])];

    let Ok(Value::Array(frame)) = serde_json::from_str::<Value>(text) else {
        return notice("invalid: message must be a JSON array");
    };

    match frame.first().and_then(Value::as_str) {
        Some("REQ") => {
            let Some(id) = frame.get(1).and_then(Value::as_str) else {
                return notice("invalid: REQ without subscription id");
            };
            let filters: Vec<Filter> = match frame[2..]
                .iter()
                .map(|value| serde_json::from_value(value.clone()))
                .collect()
            {
                Ok(filters) => filters,
                Err(e) => return notice(&format!("invalid: bad filter: {}", e)),
            };
            state.req_count.fetch_add(1, Ordering::SeqCst);

            let mut responses: Vec<Value> = stored_matches(state, &filters)
                .into_iter()
                .map(|event| json!(["EVENT", id, event]))
                .collect();
            responses.push(json!(["EOSE", id]));
            subscriptions.insert(id.to_string(), filters);
            responses
        }
        Some("EVENT") => {
            let event: Event = match frame.get(1).map(|v| serde_json::from_value(v.clone())) {
                Some(Ok(event)) => event,
                _ => return notice("invalid: malformed event"),
            };
            if !verify_event(&event) {
                return vec![json!(["OK", event.id, false, "invalid: bad signature"])];
            }
            let id = event.id.clone();
            if store(state, event) {
                vec![json!(["OK", id, true, ""])]
            } else {
                vec![json!(["OK", id, true, "duplicate: already have this event"])]
            }
        }
        Some("CLOSE") => {
            state.close_count.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = frame.get(1).and_then(Value::as_str) {
                subscriptions.remove(id);
            }
            Vec::new()
        }
        _ => notice("invalid: unknown message type"),
    }
}

/// Stored events matching any filter, newest first, honoring each filter's limit.
fn stored_matches(state: &ServerState, filters: &[Filter]) -> Vec<Event> {
    let mut events = state.events.lock().clone();
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for filter in filters {
        let limit = filter.limit.map_or(usize::MAX, |limit| limit as usize);
        for event in events.iter().filter(|e| filter.matches(e)).take(limit) {
            if seen.insert(event.id.clone()) {
                out.push(event.clone());
            }
        }
    }
    out
}
