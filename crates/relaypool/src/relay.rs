//! Single relay connection management
//!
//! A [`RelayConnection`] is a cheap, cloneable handle to a background task that
//! owns the WebSocket. The task connects, replays every open subscription and
//! every buffered send once the socket is up, validates and deduplicates
//! incoming events per subscription, and reconnects with exponential backoff
//! when the transport drops.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::duration_ms;
use crate::error::{ClientError, Result};
use crate::event::{Event, validate_event, verify_event};
use crate::filter::{Filter, match_filters};
use crate::message::{ClientMessage, RelayMessage};
use crate::subscription::generate_subscription_id;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Opening the socket, or waiting to retry
    Connecting,
    /// Connected and ready
    Connected,
    /// Client-initiated close in progress
    Closing,
    /// Closed, or dropped without a retry scheduled yet
    Disconnected,
}

impl ConnectionState {
    /// WebSocket `readyState` numbering: 0 connecting, 1 open, 2 closing, 3 closed.
    pub fn ready_state(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Closing => 2,
            ConnectionState::Disconnected => 3,
        }
    }
}

/// Confirmation result for event publishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    /// Event ID that was published
    pub event_id: String,
    /// Whether the relay accepted the event
    pub accepted: bool,
    /// Message from the relay (empty if accepted, error message if rejected)
    pub message: String,
}

type ConfirmationSender = oneshot::Sender<PublishConfirmation>;

/// Relay connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Connection timeout
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Reconnect after the transport drops
    pub auto_reconnect: bool,
    /// First reconnection delay, and the floor for every later one
    #[serde(rename = "min_reconnect_delay_ms", with = "duration_ms")]
    pub min_reconnect_delay: Duration,
    /// Each reconnection delay is the previous one times this factor
    pub reconnect_backoff_factor: u32,
    /// Upper bound for the reconnection delay, unbounded when unset
    #[serde(
        rename = "max_reconnect_delay_ms",
        with = "duration_ms::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_reconnect_delay: Option<Duration>,
    /// How long a published event may take to show up in a subscription
    #[serde(rename = "seen_timeout_ms", with = "duration_ms")]
    pub seen_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            auto_reconnect: true,
            min_reconnect_delay: Duration::from_secs(2),
            reconnect_backoff_factor: 3,
            max_reconnect_delay: None,
            seen_timeout: Duration::from_secs(5),
        }
    }
}

/// Exponential reconnection delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    factor: u32,
    max: Option<Duration>,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            min: config.min_reconnect_delay,
            factor: config.reconnect_backoff_factor.max(1),
            max: config.max_reconnect_delay,
            current: None,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let grown = match self.current {
            Some(previous) => previous.saturating_mul(self.factor).max(self.min),
            None => self.min,
        };
        let delay = match self.max {
            Some(max) => grown.min(max),
            None => grown,
        };
        self.current = Some(delay);
        delay
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// What a relay-level subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionMessage {
    Event(Event),
    Eose,
    /// The relay ended the subscription with this reason
    Closed(String),
}

/// Connection-level events for listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayNotification {
    Connected,
    Disconnected,
    Notice(String),
    Error(String),
    Auth(String),
}

/// Lookup of already-known events by id, used to skip verification.
pub type KnownEventLookup = Arc<dyn Fn(&str) -> Option<Event> + Send + Sync>;

enum Command {
    Subscribe {
        id: String,
        filters: Vec<Filter>,
        skip_verification: bool,
        sink: mpsc::UnboundedSender<SubscriptionMessage>,
    },
    Unsubscribe {
        id: String,
    },
    Publish {
        event: Event,
        confirm: ConfirmationSender,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

struct Shared {
    url: String,
    config: RelayConfig,
    runtime: tokio::runtime::Handle,
    state: RwLock<ConnectionState>,
    commands: mpsc::UnboundedSender<Command>,
    notifications: broadcast::Sender<RelayNotification>,
}

/// Relay connection
#[derive(Clone)]
pub struct RelayConnection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.shared.url)
            .field("state", &self.state())
            .finish()
    }
}

impl RelayConnection {
    /// Create a connection with default config and start connecting.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default(), None)
    }

    /// Create a connection and start connecting.
    pub fn with_config(
        url: &str,
        config: RelayConfig,
        known_event: Option<KnownEventLookup>,
    ) -> Result<Self> {
        let parsed = Url::parse(url)?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed.scheme()
            )));
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ClientError::Connection(format!("no Tokio runtime: {}", e)))?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            url: url.to_string(),
            config: config.clone(),
            runtime: runtime.clone(),
            state: RwLock::new(ConnectionState::Connecting),
            commands,
            notifications,
        });

        let task = RelayTask {
            shared: Arc::clone(&shared),
            backoff: Backoff::new(&config),
            known_event,
            open_subs: IndexMap::new(),
            send_on_connect: Vec::new(),
            pending_confirmations: HashMap::new(),
        };
        runtime.spawn(task.run(command_rx));

        Ok(Self { shared })
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connection-level events: connects, disconnects, notices, errors, auth challenges.
    pub fn notifications(&self) -> broadcast::Receiver<RelayNotification> {
        self.shared.notifications.subscribe()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.shared
            .commands
            .send(command)
            .map_err(|_| ClientError::NotConnected)
    }

    /// Open a wire subscription under a generated id.
    pub fn subscribe(&self, filters: Vec<Filter>, skip_verification: bool) -> Result<RelaySubscription> {
        self.subscribe_with_id(generate_subscription_id(), filters, skip_verification)
    }

    /// Open a wire subscription. The REQ goes out now if connected, otherwise
    /// as soon as the socket opens, and again after every reconnect.
    pub fn subscribe_with_id(
        &self,
        id: impl Into<String>,
        filters: Vec<Filter>,
        skip_verification: bool,
    ) -> Result<RelaySubscription> {
        let id = id.into();
        let (sink, rx) = mpsc::unbounded_channel();
        self.send(Command::Subscribe {
            id: id.clone(),
            filters,
            skip_verification,
            sink,
        })?;
        Ok(RelaySubscription {
            id,
            relay: self.clone(),
            rx,
        })
    }

    /// Forget a wire subscription and send CLOSE if connected. No-op if already gone.
    pub fn unsubscribe(&self, id: &str) {
        if self.send(Command::Unsubscribe { id: id.to_string() }).is_err() {
            debug!("Relay task for {} already stopped", self.shared.url);
        }
    }

    /// Publish an event.
    ///
    /// The handle reports the relay's OK and, independently, whether the event
    /// shows up in a subscription for its id within the seen timeout.
    pub fn publish(&self, event: &Event) -> Result<PublishHandle> {
        if event.id.is_empty() {
            return Err(ClientError::InvalidEvent("event has no id".to_string()));
        }

        let (confirm, ack) = oneshot::channel();
        self.send(Command::Publish {
            event: event.clone(),
            confirm,
        })?;

        let monitor_id = format!("monitor-{}", generate_subscription_id());
        let mut monitor = self.subscribe_with_id(
            monitor_id,
            vec![Filter::new().ids(vec![event.id.clone()])],
            false,
        )?;
        let (seen_tx, seen) = oneshot::channel();
        let seen_timeout = self.shared.config.seen_timeout;
        let event_id = event.id.clone();
        self.shared.runtime.spawn(async move {
            let observed = timeout(seen_timeout, async {
                while let Some(message) = monitor.next().await {
                    if let SubscriptionMessage::Event(seen_event) = message
                        && seen_event.id == event_id
                    {
                        return true;
                    }
                }
                false
            })
            .await
            .unwrap_or(false);
            monitor.unsubscribe();

            let outcome = if observed {
                Ok(())
            } else {
                Err(format!(
                    "event not seen after {} seconds",
                    seen_timeout.as_secs_f64()
                ))
            };
            let _ = seen_tx.send(outcome);
        });

        Ok(PublishHandle {
            event_id: event.id.clone(),
            relay_url: self.shared.url.clone(),
            ack: Some(ack),
            seen: Some(seen),
        })
    }

    /// Close the connection without reconnecting. Resolves once the socket is closed.
    pub async fn close(&self) {
        let (done, closed) = oneshot::channel();
        if self.send(Command::Close { done }).is_err() {
            return;
        }
        let _ = closed.await;
    }
}

/// A wire subscription on one relay.
pub struct RelaySubscription {
    id: String,
    relay: RelayConnection,
    rx: mpsc::UnboundedReceiver<SubscriptionMessage>,
}

impl RelaySubscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn relay_url(&self) -> &str {
        self.relay.url()
    }

    /// Next event or EOSE. `None` once the subscription is gone.
    pub async fn next(&mut self) -> Option<SubscriptionMessage> {
        self.rx.recv().await
    }

    pub fn unsubscribe(&self) {
        self.relay.unsubscribe(&self.id);
    }
}

/// Outcome signals of one publish to one relay.
#[derive(Debug)]
pub struct PublishHandle {
    pub event_id: String,
    pub relay_url: String,
    ack: Option<oneshot::Receiver<PublishConfirmation>>,
    seen: Option<oneshot::Receiver<std::result::Result<(), String>>>,
}

impl PublishHandle {
    /// Wait for the relay's OK. A rejection is returned as `PublishFailed` with the relay's reason.
    pub async fn acknowledged(&mut self) -> Result<PublishConfirmation> {
        let ack = self
            .ack
            .take()
            .ok_or_else(|| ClientError::InvalidRequest("acknowledgement already awaited".into()))?;
        let confirmation = ack
            .await
            .map_err(|_| ClientError::PublishFailed("relay connection closed".to_string()))?;
        if confirmation.accepted {
            Ok(confirmation)
        } else {
            Err(ClientError::PublishFailed(confirmation.message))
        }
    }

    /// Wait until the event is observed in a subscription on the relay.
    pub async fn seen(&mut self) -> Result<()> {
        let seen = self
            .seen
            .take()
            .ok_or_else(|| ClientError::InvalidRequest("seen signal already awaited".into()))?;
        seen.await
            .map_err(|_| ClientError::PublishFailed("relay connection closed".to_string()))?
            .map_err(ClientError::PublishFailed)
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

struct OpenSubscription {
    filters: Vec<Filter>,
    skip_verification: bool,
    /// Event ids already handed to `sink`
    delivered: HashSet<String>,
    sink: mpsc::UnboundedSender<SubscriptionMessage>,
}

/// Background task owning the socket and all per-relay bookkeeping.
struct RelayTask {
    shared: Arc<Shared>,
    backoff: Backoff,
    known_event: Option<KnownEventLookup>,
    open_subs: IndexMap<String, OpenSubscription>,
    send_on_connect: Vec<String>,
    pending_confirmations: HashMap<String, Vec<ConfirmationSender>>,
}

fn frame(message: &ClientMessage) -> Option<String> {
    match message.to_json() {
        Ok(text) => Some(text),
        Err(e) => {
            warn!("Failed to serialize client message: {}", e);
            None
        }
    }
}

impl RelayTask {
    fn url(&self) -> &str {
        &self.shared.url
    }

    fn set_state(&self, state: ConnectionState) {
        *self.shared.state.write() = state;
    }

    fn notify(&self, notification: RelayNotification) {
        // No receivers is fine.
        let _ = self.shared.notifications.send(notification);
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            self.set_state(ConnectionState::Connecting);
            info!("Connecting to relay: {}", self.url());

            let attempt = timeout(
                self.shared.config.connect_timeout,
                connect_async(self.shared.url.clone()),
            );
            tokio::pin!(attempt);
            let outcome = loop {
                tokio::select! {
                    result = &mut attempt => break result,
                    command = commands.recv() => {
                        let Some(command) = command else { return };
                        if self.handle_offline(command).is_break() {
                            return;
                        }
                    }
                }
            };

            match outcome {
                Ok(Ok((stream, _))) => {
                    self.backoff.reset();
                    if self.run_session(stream, &mut commands).await.is_break() {
                        return;
                    }
                }
                Ok(Err(e)) => {
                    warn!("Failed to connect to relay {}: {}", self.url(), e);
                    self.notify(RelayNotification::Error(e.to_string()));
                }
                Err(_) => {
                    warn!(
                        "Connection timeout after {:?} for relay {}",
                        self.shared.config.connect_timeout,
                        self.url()
                    );
                    self.notify(RelayNotification::Error("connection timeout".to_string()));
                }
            }

            self.set_state(ConnectionState::Disconnected);
            if !self.shared.config.auto_reconnect {
                info!("Not reconnecting to relay {}", self.url());
                return;
            }

            let delay = self.backoff.next_delay();
            info!("Reconnecting to relay {} in {:?}", self.url(), delay);
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = commands.recv() => {
                        let Some(command) = command else { return };
                        if self.handle_offline(command).is_break() {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Bookkeeping for commands that arrive while there is no socket.
    fn handle_offline(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Subscribe {
                id,
                filters,
                skip_verification,
                sink,
            } => {
                self.open_subs.insert(
                    id,
                    OpenSubscription {
                        filters,
                        skip_verification,
                        delivered: HashSet::new(),
                        sink,
                    },
                );
            }
            Command::Unsubscribe { id } => {
                self.open_subs.shift_remove(&id);
            }
            Command::Publish { event, confirm } => {
                let event_id = event.id.clone();
                if let Some(text) = frame(&ClientMessage::Event(event)) {
                    self.send_on_connect.push(text);
                    self.pending_confirmations
                        .entry(event_id)
                        .or_default()
                        .push(confirm);
                }
            }
            Command::Close { done } => {
                self.set_state(ConnectionState::Disconnected);
                self.notify(RelayNotification::Disconnected);
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn run_session(
        &mut self,
        stream: WsStream,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> ControlFlow<()> {
        let (mut sink, mut source) = stream.split();
        self.set_state(ConnectionState::Connected);
        info!("Connected to relay: {}", self.url());
        self.notify(RelayNotification::Connected);

        let mut backlog: Vec<String> = self
            .open_subs
            .iter()
            .filter_map(|(id, sub)| {
                frame(&ClientMessage::Req {
                    subscription_id: id.clone(),
                    filters: sub.filters.clone(),
                })
            })
            .collect();
        backlog.append(&mut self.send_on_connect);

        for (index, text) in backlog.iter().enumerate() {
            debug!("Sending to {}: {}", self.url(), text);
            if let Err(e) = sink.send(Message::Text(text.clone().into())).await {
                warn!("Send to relay {} failed: {}", self.url(), e);
                // Keep unsent publishes for the next connection.
                self.send_on_connect
                    .extend(backlog[index..].iter().filter(|t| t.starts_with("[\"EVENT\"")).cloned());
                return self.connection_lost();
            }
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None => {
                        let _ = sink.close().await;
                        self.set_state(ConnectionState::Disconnected);
                        return ControlFlow::Break(());
                    }
                    Some(Command::Close { done }) => {
                        self.close_socket(&mut sink, &mut source).await;
                        let _ = done.send(());
                        return ControlFlow::Break(());
                    }
                    Some(command) => {
                        if let Err(e) = self.handle_online(command, &mut sink).await {
                            warn!("Send to relay {} failed: {}", self.url(), e);
                            return self.connection_lost();
                        }
                    }
                },
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Relay {} closed connection", self.url());
                        return self.connection_lost();
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", self.url(), e);
                        self.notify(RelayNotification::Error(e.to_string()));
                        return self.connection_lost();
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    fn connection_lost(&mut self) -> ControlFlow<()> {
        self.set_state(ConnectionState::Disconnected);
        self.notify(RelayNotification::Disconnected);
        ControlFlow::Continue(())
    }

    async fn close_socket(&mut self, sink: &mut WsSink, source: &mut WsSource) {
        info!("Disconnecting from relay: {}", self.url());
        self.set_state(ConnectionState::Closing);
        let _ = sink.close().await;

        // Wait for the relay to finish the closing handshake.
        let drained = timeout(self.shared.config.connect_timeout, async {
            while let Some(Ok(message)) = source.next().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!("Relay {} did not confirm close in time", self.url());
        }

        self.set_state(ConnectionState::Disconnected);
        self.notify(RelayNotification::Disconnected);
        info!("Disconnected from relay: {}", self.url());
    }

    async fn handle_online(
        &mut self,
        command: Command,
        sink: &mut WsSink,
    ) -> std::result::Result<(), tokio_tungstenite::tungstenite::Error> {
        let text = match command {
            Command::Subscribe {
                id,
                filters,
                skip_verification,
                sink: events,
            } => {
                let text = frame(&ClientMessage::Req {
                    subscription_id: id.clone(),
                    filters: filters.clone(),
                });
                self.open_subs.insert(
                    id,
                    OpenSubscription {
                        filters,
                        skip_verification,
                        delivered: HashSet::new(),
                        sink: events,
                    },
                );
                text
            }
            Command::Unsubscribe { id } => match self.open_subs.shift_remove(&id) {
                Some(_) => frame(&ClientMessage::Close {
                    subscription_id: id,
                }),
                None => None,
            },
            Command::Publish { event, confirm } => {
                self.pending_confirmations
                    .entry(event.id.clone())
                    .or_default()
                    .push(confirm);
                frame(&ClientMessage::Event(event))
            }
            Command::Close { done } => {
                let _ = done.send(());
                None
            }
        };

        if let Some(text) = text {
            debug!("Sending to {}: {}", self.url(), text);
            sink.send(Message::Text(text.into())).await?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, text: &str) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring frame from {}: {}", self.shared.url, e);
                return;
            }
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.handle_event(&subscription_id, event),
            RelayMessage::Eose { subscription_id } => {
                if let Some(sub) = self.open_subs.get(&subscription_id) {
                    let _ = sub.sink.send(SubscriptionMessage::Eose);
                }
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                if let Some(waiters) = self.pending_confirmations.remove(&event_id) {
                    for waiter in waiters {
                        let _ = waiter.send(PublishConfirmation {
                            event_id: event_id.clone(),
                            accepted: success,
                            message: message.clone(),
                        });
                    }
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                if let Some(sub) = self.open_subs.shift_remove(&subscription_id) {
                    warn!(
                        "Relay {} closed subscription {}: {}",
                        self.shared.url, subscription_id, message
                    );
                    let _ = sub.sink.send(SubscriptionMessage::Closed(message));
                }
            }
            RelayMessage::Notice { message } => {
                debug!("Notice from {}: {}", self.shared.url, message);
                self.notify(RelayNotification::Notice(message));
            }
            RelayMessage::Auth { challenge } => {
                self.notify(RelayNotification::Auth(challenge));
            }
        }
    }

    fn handle_event(&mut self, subscription_id: &str, event: Event) {
        let known = self
            .known_event
            .as_ref()
            .and_then(|lookup| lookup(&event.id));
        let Some(sub) = self.open_subs.get_mut(subscription_id) else {
            return;
        };
        if sub.delivered.contains(&event.id) {
            return;
        }

        let event = match known {
            Some(cached) => cached,
            None => {
                let valid = validate_event(&event) && (sub.skip_verification || verify_event(&event));
                if !valid {
                    debug!("Dropping invalid event {} from {}", event.id, self.shared.url);
                    return;
                }
                event
            }
        };

        if !match_filters(&sub.filters, &event) {
            return;
        }

        sub.delivered.insert(event.id.clone());
        if sub.sink.send(SubscriptionMessage::Event(event)).is_err() {
            debug!("Subscription {} receiver dropped", subscription_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_monotonically() {
        let mut backoff = Backoff::new(&RelayConfig::default());
        let delays: Vec<Duration> = (0..5).map(|_| backoff.next_delay()).collect();

        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[1], Duration::from_secs(6));
        assert!(delays.windows(2).all(|pair| pair[1] > pair[0]));
    }

    #[test]
    fn test_backoff_reset_and_cap() {
        let config = RelayConfig {
            max_reconnect_delay: Some(Duration::from_secs(10)),
            ..RelayConfig::default()
        };
        let mut backoff = Backoff::new(&config);
        for _ in 0..5 {
            assert!(backoff.next_delay() <= Duration::from_secs(10));
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_ready_state_numbering() {
        assert_eq!(ConnectionState::Connecting.ready_state(), 0);
        assert_eq!(ConnectionState::Connected.ready_state(), 1);
        assert_eq!(ConnectionState::Closing.ready_state(), 2);
        assert_eq!(ConnectionState::Disconnected.ready_state(), 3);
    }

    #[tokio::test]
    async fn test_invalid_url_scheme() {
        let result = RelayConnection::new("http://relay.example.com");
        assert!(matches!(result, Err(ClientError::InvalidUrl(_))));
    }

    #[test]
    fn test_requires_runtime() {
        let result = RelayConnection::new("wss://relay.example.com");
        assert!(matches!(result, Err(ClientError::Connection(_))));
    }

    #[tokio::test]
    async fn test_publish_requires_id() {
        let relay = RelayConnection::with_config(
            "ws://127.0.0.1:9",
            RelayConfig {
                auto_reconnect: false,
                ..RelayConfig::default()
            },
            None,
        )
        .unwrap();
        let event = Event {
            id: String::new(),
            pubkey: "pk".to_string(),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        assert!(matches!(relay.publish(&event), Err(ClientError::InvalidEvent(_))));
        relay.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_relay_without_reconnect_stops() {
        let relay = RelayConnection::with_config(
            "ws://127.0.0.1:9",
            RelayConfig {
                auto_reconnect: false,
                connect_timeout: Duration::from_secs(2),
                ..RelayConfig::default()
            },
            None,
        )
        .unwrap();
        let mut notifications = relay.notifications();

        let first = timeout(Duration::from_secs(5), notifications.recv())
            .await
            .expect("notification in time")
            .unwrap();
        assert!(matches!(first, RelayNotification::Error(_)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.state(), ConnectionState::Disconnected);
    }
}
