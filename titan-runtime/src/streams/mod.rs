//! Stream pub/sub
//!
//! Named, typed streams identified by `(namespace, stream-id)`. The
//! in-memory provider delivers events in publisher order per stream;
//! delivery is at-least-once within a session and nothing survives a silo
//! restart, so subscribers must be idempotent. Cluster-wide fan-out goes
//! through the subscription directory grain in [`directory`].

pub mod directory;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;

use crate::codec;
use crate::error::Result;

pub use directory::{SubscriptionDirectoryGrain, SUBSCRIPTION_DIRECTORY_GRAIN};

/// Stream address: `(namespace, stream-id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId {
    /// Grouping namespace, e.g. `"ratelimit"`
    pub namespace: String,
    /// Stream name within the namespace
    pub id: String,
}

impl StreamId {
    /// Build a stream address
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// One published event
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Stream the event was published on
    pub stream: StreamId,
    /// Per-stream publisher sequence, for idempotence checks
    pub sequence: u64,
    /// Encoded payload
    pub payload: Vec<u8>,
}

impl StreamEvent {
    /// Decode the payload as a typed record
    pub fn decode<M: prost::Message + Default>(&self) -> Result<M> {
        codec::decode(&self.payload)
    }
}

struct StreamChannel {
    tx: broadcast::Sender<StreamEvent>,
    sequence: AtomicU64,
}

/// Per-silo stream fan-out
pub struct StreamBroker {
    channels: DashMap<StreamId, Arc<StreamChannel>>,
    capacity: usize,
}

impl StreamBroker {
    /// Create a broker with the given per-stream buffer capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn channel(&self, stream: &StreamId) -> Arc<StreamChannel> {
        self.channels
            .entry(stream.clone())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(self.capacity);
                Arc::new(StreamChannel {
                    tx,
                    sequence: AtomicU64::new(0),
                })
            })
            .clone()
    }

    /// Publish to local subscribers; returns the event's sequence number
    pub fn publish_local(&self, stream: &StreamId, payload: Vec<u8>) -> u64 {
        let channel = self.channel(stream);
        let sequence = channel.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let event = StreamEvent {
            stream: stream.clone(),
            sequence,
            payload,
        };
        // No local subscribers is fine; remote silos may still be listening
        let _ = channel.tx.send(event);
        sequence
    }

    /// Open a local subscription
    pub fn subscribe_local(&self, stream: &StreamId) -> StreamSubscription {
        StreamSubscription {
            stream: stream.clone(),
            rx: self.channel(stream).tx.subscribe(),
        }
    }

    /// Count of live local subscribers
    pub fn local_subscribers(&self, stream: &StreamId) -> usize {
        self.channels
            .get(stream)
            .map(|c| c.tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for StreamBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Receiving half of a subscription
pub struct StreamSubscription {
    stream: StreamId,
    rx: broadcast::Receiver<StreamEvent>,
}

impl StreamSubscription {
    /// Next event, or `None` when the stream channel is gone.
    ///
    /// A slow subscriber that overflows the buffer loses the oldest events
    /// and keeps going; the sequence numbers expose the gap.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(stream = %self.stream, missed, "stream subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Wire form of a stream event relayed between silos
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RelayedEvent {
    #[prost(string, tag = "1")]
    pub namespace: String,
    #[prost(string, tag = "2")]
    pub stream: String,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}
