//! Publish/Subscribe Notification Channel
//!
//! Many-channel, many-subscriber broadcast used to hand asynchronous external
//! replies to in-flight workflows. The callback registry and fan-out live
//! here; the wire transport is pluggable ([`PubSubTransport`]): Redis pub/sub
//! in production, an in-process loopback in tests.
//!
//! Known trade-off: removing the last callback for a channel does not tear
//! down the underlying transport subscription. Messages arriving on an idle
//! channel are logged and dropped; channel names are correlation-scoped, so
//! retention is bounded by workflow cardinality.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

use crate::errors::{Result, ServiceError};

/// Broadcast payload. Constrained to values that survive a full
/// serialize/deserialize round trip; see [`validate_message`].
pub type NotificationMessage = serde_json::Value;

/// Handle returned by `subscribe`. Small positive integers, never reused.
pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(NotificationMessage) + Send + Sync>;

/// Reject values that would not survive a round trip: `null` anywhere, and
/// top-level shapes other than string/number/boolean/record.
pub fn validate_message(message: &NotificationMessage) -> Result<()> {
    fn no_nulls(value: &serde_json::Value) -> bool {
        match value {
            serde_json::Value::Null => false,
            serde_json::Value::Array(items) => items.iter().all(no_nulls),
            serde_json::Value::Object(map) => map.values().all(no_nulls),
            _ => true,
        }
    }

    match message {
        serde_json::Value::Null => Err(ServiceError::UnserializableMessage(
            "null is not a valid notification".to_string(),
        )),
        serde_json::Value::Array(_) => Err(ServiceError::UnserializableMessage(
            "top-level arrays are not valid notifications".to_string(),
        )),
        other if !no_nulls(other) => Err(ServiceError::UnserializableMessage(
            "notification contains null members".to_string(),
        )),
        _ => Ok(()),
    }
}

// ============================================================================
// Transport boundary
// ============================================================================

/// Wire-level pub/sub operations. Implementations must make `subscribe`
/// effective by the time it returns: the deferred-job protocol relies on
/// subscription being established before any side effect is triggered.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<()>;
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;
}

// ============================================================================
// Channel registry
// ============================================================================

/// Callback registry and fan-out hub over one transport.
pub struct PubSubChannel {
    transport: Arc<dyn PubSubTransport>,
    channels: Mutex<HashMap<String, BTreeMap<SubscriptionId, Callback>>>,
    next_id: AtomicU64,
}

impl PubSubChannel {
    pub fn new(transport: Arc<dyn PubSubTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn validate_channel(channel: &str) -> Result<()> {
        if channel.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "channel name must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Register a callback. The first subscriber for a channel issues one
    /// transport-level subscribe before this returns.
    pub async fn subscribe<F>(&self, channel: &str, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(NotificationMessage) + Send + Sync + 'static,
    {
        Self::validate_channel(channel)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let first_subscriber = {
            let mut channels = self.channels.lock().unwrap();
            let entry = channels.entry(channel.to_string()).or_default();
            let first = entry.is_empty();
            entry.insert(id, Arc::new(callback));
            first
        };

        if first_subscriber {
            if let Err(e) = self.transport.subscribe(channel).await {
                // Roll the registration back so a later retry re-subscribes.
                self.unsubscribe(channel, id);
                return Err(e);
            }
        }

        debug!(channel, subscription_id = id, "subscribed");
        Ok(id)
    }

    /// Remove one callback. Returns false for an unknown channel or id.
    /// The transport subscription is left in place (see module docs).
    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> bool {
        let mut channels = self.channels.lock().unwrap();
        match channels.get_mut(channel) {
            Some(subs) => subs.remove(&id).is_some(),
            None => false,
        }
    }

    /// Number of callbacks currently registered for a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap()
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Validate, serialize, and send a message to a channel.
    pub async fn publish(&self, channel: &str, message: &NotificationMessage) -> Result<()> {
        Self::validate_channel(channel)?;
        validate_message(message)?;
        let payload = serde_json::to_string(message)?;
        self.transport.publish(channel, payload).await
    }

    /// Fan an inbound transport message out to every registered callback for
    /// the channel, synchronously, in subscription order. A channel with no
    /// callbacks logs and drops.
    pub fn dispatch(&self, channel: &str, payload: &str) {
        let message: NotificationMessage = match serde_json::from_str(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(channel, error = %e, "dropping undecodable notification");
                return;
            }
        };
        if validate_message(&message).is_err() {
            warn!(channel, "dropping notification that fails round-trip validation");
            return;
        }

        let callbacks: Vec<Callback> = {
            let channels = self.channels.lock().unwrap();
            match channels.get(channel) {
                Some(subs) if !subs.is_empty() => subs.values().cloned().collect(),
                _ => {
                    debug!(channel, "notification on channel with no subscribers, dropped");
                    return;
                }
            }
        };

        for callback in callbacks {
            callback(message.clone());
        }
    }
}

// ============================================================================
// Redis transport
// ============================================================================

/// Redis pub/sub transport: a dedicated subscriber connection (split into
/// sink + stream) plus a regular connection for publishing.
pub struct RedisPubSubTransport {
    sink: tokio::sync::Mutex<redis::aio::PubSubSink>,
    publisher: redis::aio::ConnectionManager,
}

impl RedisPubSubTransport {
    /// Connect and hand back the transport plus the raw message stream. The
    /// caller wires the stream to a hub with [`spawn_dispatcher`].
    pub async fn connect(url: &str) -> Result<(Arc<Self>, redis::aio::PubSubStream)> {
        let client =
            redis::Client::open(url).map_err(|e| ServiceError::PubSub(e.to_string()))?;
        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| ServiceError::PubSub(e.to_string()))?;
        let (sink, stream) = pubsub.split();
        let publisher = client
            .get_connection_manager()
            .await
            .map_err(|e| ServiceError::PubSub(e.to_string()))?;
        Ok((
            Arc::new(Self {
                sink: tokio::sync::Mutex::new(sink),
                publisher,
            }),
            stream,
        ))
    }
}

/// Pump inbound Redis messages into the hub until the connection closes.
pub fn spawn_dispatcher(
    mut stream: redis::aio::PubSubStream,
    hub: Arc<PubSubChannel>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => hub.dispatch(&channel, &payload),
                Err(e) => warn!(channel, error = %e, "undecodable pubsub payload"),
            }
        }
        warn!("pubsub message stream closed");
    })
}

#[async_trait]
impl PubSubTransport for RedisPubSubTransport {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        self.sink
            .lock()
            .await
            .subscribe(channel)
            .await
            .map_err(|e| ServiceError::PubSub(e.to_string()))
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| ServiceError::PubSub(e.to_string()))?;
        Ok(())
    }
}

// ============================================================================
// In-process loopback transport
// ============================================================================

/// Loopback transport: publishes are dispatched straight back into the
/// attached hub. Records subscribe/publish calls so tests can observe
/// ordering.
#[derive(Default)]
pub struct MemoryTransport {
    hub: Mutex<Weak<PubSubChannel>>,
    subscribed: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, String)>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wire the loopback to its hub. Must be called once after the hub is
    /// constructed around this transport.
    pub fn attach(&self, hub: &Arc<PubSubChannel>) {
        *self.hub.lock().unwrap() = Arc::downgrade(hub);
    }

    /// Channels subscribed at the transport level, in order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    /// Raw publishes seen by the transport, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        self.subscribed.lock().unwrap().push(channel.to_string());
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), payload.clone()));
        let subscribed = self.subscribed.lock().unwrap().iter().any(|c| c == channel);
        if subscribed {
            if let Some(hub) = self.hub.lock().unwrap().upgrade() {
                hub.dispatch(channel, &payload);
            }
        }
        Ok(())
    }
}

/// Convenience: a hub over an attached loopback transport.
pub fn memory_channel() -> (Arc<PubSubChannel>, Arc<MemoryTransport>) {
    let transport = MemoryTransport::new();
    let hub = PubSubChannel::new(transport.clone());
    transport.attach(&hub);
    (hub, transport)
}
