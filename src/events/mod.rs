//! Event source adapters.
//!
//! Brokers (NATS, Kafka, Redis, ...) are reached only through the
//! [`EventSourceAdapter`] trait. The engine never sees a broker SDK; a
//! generation simply carries an [`AdapterSet`] keyed by provider id.
//!
//! Subscriptions are returned as an [`EventStream`]. Dropping the stream
//! releases the broker-side subscription; there is no separate cancel call.
//! Adapters apply broker-native backpressure and must not buffer
//! unboundedly on behalf of a slow consumer.

pub mod memory;

pub use memory::InMemoryAdapter;

use ahash::AHashMap;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Raw payloads delivered by a broker subscription, in broker order.
pub type EventStream = BoxStream<'static, std::result::Result<Bytes, AdapterError>>;

/// Errors raised by an event source adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The stream, consumer or topic does not exist on the broker
    #[error("stream or consumer for '{topic}' does not exist")]
    NotFound { topic: String },

    /// Nobody answered a request
    #[error("no responders available for '{topic}'")]
    NoResponders { topic: String },

    /// A request did not get a reply in time
    #[error("request to '{topic}' timed out after {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    /// The broker connection failed
    #[error("broker transport error: {0}")]
    Transport(String),

    /// The adapter has been shut down
    #[error("adapter is closed")]
    Closed,
}

impl AdapterError {
    /// Whether this error reports a missing stream/consumer/topic.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AdapterError::NotFound { .. })
    }
}

/// Uniform interface over one broker provider.
#[async_trait]
pub trait EventSourceAdapter: Send + Sync {
    /// Provider id this adapter is registered under.
    fn provider_id(&self) -> &str;

    /// Subscribe to a topic.
    ///
    /// Must fail with [`AdapterError::NotFound`] when a durable stream or
    /// consumer backing the topic does not exist.
    async fn subscribe(&self, topic: &str) -> std::result::Result<EventStream, AdapterError>;

    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> std::result::Result<(), AdapterError>;

    /// Send a request and wait for a single reply.
    async fn request(
        &self,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> std::result::Result<Bytes, AdapterError>;
}

/// Adapters of one generation, keyed by provider id.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: AHashMap<String, Arc<dyn EventSourceAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own provider id.
    pub fn with_adapter(mut self, adapter: Arc<dyn EventSourceAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn insert(&mut self, adapter: Arc<dyn EventSourceAdapter>) {
        self.adapters
            .insert(adapter.provider_id().to_string(), adapter);
    }

    pub fn get(&self, provider_id: &str) -> Option<&Arc<dyn EventSourceAdapter>> {
        self.adapters.get(provider_id)
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.adapters.contains_key(provider_id)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn provider_ids(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterSet")
            .field("providers", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
