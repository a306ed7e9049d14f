//! WebSocket connection registry and topic fan-out
//!
//! The manager owns every connection's topic set and outbound queue. Socket
//! tasks only read from their queue and report inbound frames back here.

pub mod queue;
pub mod socket;

pub use queue::{Outbound, OutboundQueue, PushOutcome};

use crate::jobs::Broadcaster;
use crate::metrics::PipelineMetrics;
use sensorhub_common::config::ConnectionsConfig;
use sensorhub_common::{ConnectionStats, Envelope, MessageKind};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Subscriber-count key for connections without a topic filter
pub const WILDCARD_TOPIC: &str = "*";

pub type ConnectionId = Uuid;

/// Floor for configs built in code without `HubConfig::validate`
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection limit reached ({max})")]
    CapacityReached { max: usize },

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug)]
struct ConnectionInner {
    state: ConnectionState,
    topics: HashSet<String>,
    /// No explicit topic filter yet: receive everything
    wildcard: bool,
    last_heartbeat: Instant,
}

/// One live client
#[derive(Debug)]
pub struct ClientConnection {
    id: ConnectionId,
    queue: OutboundQueue,
    inner: Mutex<ConnectionInner>,
}

impl ClientConnection {
    fn new(id: ConnectionId, queue_capacity: usize, topics: Option<Vec<String>>) -> Self {
        let wildcard = topics.is_none();
        Self {
            id,
            queue: OutboundQueue::new(queue_capacity),
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Connecting,
                topics: topics.unwrap_or_default().into_iter().collect(),
                wildcard,
                last_heartbeat: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Sorted topic list
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.lock().topics.iter().cloned().collect();
        topics.sort();
        topics
    }

    pub fn is_wildcard(&self) -> bool {
        self.lock().wildcard
    }

    fn wants(&self, topic: &str) -> bool {
        let inner = self.lock();
        inner.state == ConnectionState::Active && (inner.wildcard || inner.topics.contains(topic))
    }

    fn set_state(&self, state: ConnectionState) {
        self.lock().state = state;
    }
}

/// Registry slot held by a socket task; unregisters on drop
pub struct ConnectionLease {
    manager: Arc<ConnectionManager>,
    connection: Arc<ClientConnection>,
}

impl ConnectionLease {
    pub fn id(&self) -> ConnectionId {
        self.connection.id
    }

    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Handshake completed
    pub fn activate(&self) {
        self.connection.set_state(ConnectionState::Active);
        self.connection.lock().last_heartbeat = Instant::now();
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.manager.unregister(self.connection.id);
    }
}

pub struct ConnectionManager {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
    max_connections: usize,
    queue_capacity: usize,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
    connections_rejected: AtomicU64,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl ConnectionManager {
    pub fn new(config: &ConnectionsConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections: config.max_connections,
            queue_capacity: config.queue_capacity,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs)
                .max(MIN_HEARTBEAT_INTERVAL),
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
            messages_delivered: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ConnectionId, Arc<ClientConnection>>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<ClientConnection>>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, id: ConnectionId) -> Option<Arc<ClientConnection>> {
        self.read().get(&id).cloned()
    }

    fn publish_count(&self, count: usize) {
        if let Some(ref metrics) = self.metrics {
            metrics.set_active_connections(count);
        }
    }

    /// Reserve a slot at handshake time. `topics: None` subscribes to everything.
    pub fn register(
        self: &Arc<Self>,
        topics: Option<Vec<String>>,
    ) -> Result<ConnectionLease, ConnectionError> {
        let connection = {
            let mut connections = self.write();
            if connections.len() >= self.max_connections {
                drop(connections);
                self.connections_rejected.fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = self.metrics {
                    metrics.record_rejected();
                }
                warn!("Rejecting connection: limit of {} reached", self.max_connections);
                return Err(ConnectionError::CapacityReached {
                    max: self.max_connections,
                });
            }

            let id = Uuid::new_v4();
            let connection = Arc::new(ClientConnection::new(id, self.queue_capacity, topics));
            connections.insert(id, Arc::clone(&connection));
            self.publish_count(connections.len());
            connection
        };

        debug!("Connection {} registered", connection.id);
        Ok(ConnectionLease {
            manager: Arc::clone(self),
            connection,
        })
    }

    fn unregister(&self, id: ConnectionId) {
        let removed = {
            let mut connections = self.write();
            let removed = connections.remove(&id);
            self.publish_count(connections.len());
            removed
        };

        if let Some(connection) = removed {
            connection.queue.close();
            connection.set_state(ConnectionState::Closed);
            debug!("Connection {} closed", id);
        }
    }

    /// Begin closing: stop enqueues and wake the writer so it sends a close frame
    pub fn disconnect(&self, id: ConnectionId) {
        if let Some(connection) = self.get(id) {
            connection.set_state(ConnectionState::Closing);
            connection.queue.close();
        }
    }

    pub fn subscribe(&self, id: ConnectionId, topic: &str) -> Result<(), ConnectionError> {
        let connection = self.get(id).ok_or(ConnectionError::UnknownConnection(id))?;
        let mut inner = connection.lock();
        // An explicit subscription replaces the receive-everything default
        inner.wildcard = false;
        inner.topics.insert(topic.to_string());
        debug!("Connection {} subscribed to {}", id, topic);
        Ok(())
    }

    pub fn unsubscribe(&self, id: ConnectionId, topic: &str) -> Result<(), ConnectionError> {
        let connection = self.get(id).ok_or(ConnectionError::UnknownConnection(id))?;
        connection.lock().topics.remove(topic);
        debug!("Connection {} unsubscribed from {}", id, topic);
        Ok(())
    }

    fn enqueue(&self, connection: &ClientConnection, payload: &Arc<str>) -> bool {
        match connection.queue.push(Arc::clone(payload)) {
            PushOutcome::Queued => true,
            PushOutcome::DroppedOldest => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = self.metrics {
                    metrics.record_dropped();
                }
                debug!("Connection {} queue full, dropped oldest message", connection.id);
                true
            }
            PushOutcome::Closed => false,
        }
    }

    /// Enqueue on every connection subscribed to `topic`; returns recipients
    pub fn broadcast(&self, topic: &str, message: &Envelope) -> usize {
        let payload: Arc<str> = Arc::from(message.to_json());
        let recipients: Vec<Arc<ClientConnection>> = self
            .read()
            .values()
            .filter(|c| c.wants(topic))
            .cloned()
            .collect();

        recipients
            .iter()
            .filter(|connection| self.enqueue(connection, &payload))
            .count()
    }

    /// Enqueue on every active connection regardless of topics
    pub fn broadcast_all(&self, message: &Envelope) -> usize {
        let payload: Arc<str> = Arc::from(message.to_json());
        let recipients: Vec<Arc<ClientConnection>> = self
            .read()
            .values()
            .filter(|c| c.state() == ConnectionState::Active)
            .cloned()
            .collect();

        recipients
            .iter()
            .filter(|connection| self.enqueue(connection, &payload))
            .count()
    }

    /// Enqueue on a single connection
    pub fn send_to(&self, id: ConnectionId, message: &Envelope) -> Result<(), ConnectionError> {
        let connection = self.get(id).ok_or(ConnectionError::UnknownConnection(id))?;
        let payload: Arc<str> = Arc::from(message.to_json());
        self.enqueue(&connection, &payload);
        Ok(())
    }

    /// Apply one inbound client text frame
    pub fn handle_client_message(&self, id: ConnectionId, text: &str) -> Result<(), ConnectionError> {
        self.touch(id);

        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Connection {} sent an invalid message: {}", id, e);
                return self.send_to(id, &Envelope::error("invalid message"));
            }
        };

        let reply = match (envelope.kind, envelope.topic) {
            (MessageKind::Subscribe, Some(topic)) => {
                self.subscribe(id, &topic)?;
                Envelope::new(MessageKind::Subscribed).with_topic(topic)
            }
            (MessageKind::Unsubscribe, Some(topic)) => {
                self.unsubscribe(id, &topic)?;
                Envelope::new(MessageKind::Unsubscribed).with_topic(topic)
            }
            (MessageKind::Subscribe | MessageKind::Unsubscribe, None) => {
                Envelope::error("topic required")
            }
            (MessageKind::Ping, _) => Envelope::new(MessageKind::Pong),
            (MessageKind::Pong, _) => return Ok(()),
            (kind, _) => Envelope::error(format!("unsupported message type: {:?}", kind)),
        };
        self.send_to(id, &reply)
    }

    /// Greeting sent once the socket is up
    pub fn greeting(&self, id: ConnectionId) -> Result<(), ConnectionError> {
        let connection = self.get(id).ok_or(ConnectionError::UnknownConnection(id))?;
        let data = json!({
            "connectionId": id.to_string(),
            "topics": connection.topics(),
            "allTopics": connection.is_wildcard(),
        });
        self.send_to(id, &Envelope::new(MessageKind::Connected).with_data(data))
    }

    /// Record liveness (any inbound frame counts)
    pub fn touch(&self, id: ConnectionId) {
        if let Some(connection) = self.get(id) {
            connection.lock().last_heartbeat = Instant::now();
        }
    }

    pub fn record_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics.record_delivered();
        }
    }

    /// Disconnect silent connections and ping the rest; returns disconnects
    pub fn sweep_heartbeats(&self) -> usize {
        let connections: Vec<Arc<ClientConnection>> = self.read().values().cloned().collect();
        let now = Instant::now();
        let mut disconnected = 0;

        for connection in connections {
            let (state, last_heartbeat) = {
                let inner = connection.lock();
                (inner.state, inner.last_heartbeat)
            };
            if state != ConnectionState::Active {
                continue;
            }

            if now.duration_since(last_heartbeat) > self.heartbeat_timeout {
                warn!("Connection {} missed heartbeats, disconnecting", connection.id);
                self.disconnect(connection.id);
                disconnected += 1;
            } else {
                connection.queue.request_ping();
            }
        }
        disconnected
    }

    /// Heartbeat loop; exits on cancellation
    pub async fn run_heartbeat(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let disconnected = self.sweep_heartbeats();
                    if disconnected > 0 {
                        info!("Heartbeat sweep disconnected {} connections", disconnected);
                    }
                }
            }
        }
        debug!("Heartbeat loop stopped");
    }

    /// Close every connection (shutdown)
    pub fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.read().keys().copied().collect();
        for id in ids {
            self.disconnect(id);
        }
    }

    pub fn active_connections(&self) -> usize {
        self.read().len()
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut topic_subscribers = BTreeMap::new();
        let connections = self.read();
        for connection in connections.values() {
            let inner = connection.lock();
            if inner.wildcard {
                *topic_subscribers.entry(WILDCARD_TOPIC.to_string()).or_insert(0) += 1;
            }
            for topic in &inner.topics {
                *topic_subscribers.entry(topic.clone()).or_insert(0) += 1;
            }
        }

        ConnectionStats {
            active_connections: connections.len(),
            max_connections: self.max_connections,
            topic_subscribers,
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
        }
    }
}

impl Broadcaster for ConnectionManager {
    fn publish(&self, topic: &str, message: &Envelope) -> usize {
        self.broadcast(topic, message)
    }
}
