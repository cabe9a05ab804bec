//! In-process event source adapter.
//!
//! Backed by one bounded `broadcast` channel per topic. Delivery is
//! at-most-once: a subscriber that falls more than `capacity` messages behind
//! skips the overflow instead of growing memory. Request/reply is served by
//! responders registered with [`InMemoryAdapter::serve_requests`].
//!
//! The adapter can emulate the broker behaviors the engine must tolerate:
//! missing durable streams ([`InMemoryAdapter::require_declared_streams`]) and
//! connection loss ([`InMemoryAdapter::disconnect`]).

use super::{AdapterError, EventSourceAdapter, EventStream};
use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 64;

/// A request delivered to a responder.
#[derive(Debug)]
pub struct InMemoryRequest {
    pub topic: String,
    pub payload: Bytes,
    reply: oneshot::Sender<Bytes>,
}

impl InMemoryRequest {
    /// Answer the request. Late replies after a timeout are dropped.
    pub fn respond(self, payload: impl Into<Bytes>) {
        let _ = self.reply.send(payload.into());
    }
}

/// Broadcast-backed adapter for tests and single-process deployments.
pub struct InMemoryAdapter {
    provider_id: String,
    capacity: usize,
    topics: Mutex<AHashMap<String, broadcast::Sender<Bytes>>>,
    responders: Mutex<AHashMap<String, mpsc::Sender<InMemoryRequest>>>,
    declared_streams: Mutex<Option<AHashSet<String>>>,
    connection: Mutex<CancellationToken>,
    closed: AtomicBool,
}

impl InMemoryAdapter {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self::with_capacity(provider_id, DEFAULT_CAPACITY)
    }

    /// Adapter whose per-topic buffers hold `capacity` messages.
    pub fn with_capacity(provider_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            provider_id: provider_id.into(),
            capacity: capacity.max(1),
            topics: Mutex::new(AHashMap::new()),
            responders: Mutex::new(AHashMap::new()),
            declared_streams: Mutex::new(None),
            connection: Mutex::new(CancellationToken::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Only topics declared with [`Self::declare_stream`] can be subscribed;
    /// anything else fails with [`AdapterError::NotFound`].
    pub fn require_declared_streams(self) -> Self {
        *self.declared_streams.lock() = Some(AHashSet::new());
        self
    }

    pub fn declare_stream(&self, topic: impl Into<String>) {
        let mut declared = self.declared_streams.lock();
        declared.get_or_insert_with(AHashSet::new).insert(topic.into());
    }

    /// Register a responder for request/reply on `topic`.
    pub fn serve_requests(&self, topic: impl Into<String>) -> mpsc::Receiver<InMemoryRequest> {
        let (tx, rx) = mpsc::channel(16);
        self.responders.lock().insert(topic.into(), tx);
        rx
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.live_sender(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Sender of `topic`, dropping the entry once its last receiver is gone.
    fn live_sender(&self, topic: &str) -> Option<broadcast::Sender<Bytes>> {
        let mut topics = self.topics.lock();
        if topics.get(topic).is_some_and(|tx| tx.receiver_count() == 0) {
            topics.remove(topic);
            debug!(provider_id = %self.provider_id, topic, "Pruned topic without subscribers");
        }
        topics.get(topic).cloned()
    }

    /// Poll until `topic` has `count` subscribers or `timeout` elapses.
    pub async fn wait_for_subscribers(&self, topic: &str, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.subscriber_count(topic) == count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Emulate a lost broker connection. Every open stream yields one
    /// transport error and ends; later subscriptions work again.
    pub fn disconnect(&self) {
        let mut connection = self.connection.lock();
        connection.cancel();
        *connection = CancellationToken::new();
        warn!(provider_id = %self.provider_id, "In-memory broker connection dropped");
    }

    /// Close the adapter. Open streams end and further calls fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.topics.lock().clear();
        self.responders.lock().clear();
    }

    fn ensure_open(&self) -> Result<(), AdapterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::Closed);
        }
        Ok(())
    }
}

struct TopicReader {
    topic: String,
    rx: broadcast::Receiver<Bytes>,
    connection: CancellationToken,
    done: bool,
}

#[async_trait]
impl EventSourceAdapter for InMemoryAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn subscribe(&self, topic: &str) -> Result<EventStream, AdapterError> {
        self.ensure_open()?;

        if let Some(declared) = self.declared_streams.lock().as_ref() {
            if !declared.contains(topic) {
                return Err(AdapterError::NotFound {
                    topic: topic.to_string(),
                });
            }
        }

        let rx = self
            .topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        debug!(provider_id = %self.provider_id, topic, "Subscribed to topic");

        let state = TopicReader {
            topic: topic.to_string(),
            rx,
            connection: self.connection.lock().clone(),
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            loop {
                tokio::select! {
                    biased;
                    _ = state.connection.cancelled() => {
                        state.done = true;
                        let err = AdapterError::Transport(format!(
                            "connection lost while reading '{}'",
                            state.topic
                        ));
                        return Some((Err(err), state));
                    }
                    msg = state.rx.recv() => match msg {
                        Ok(payload) => return Some((Ok(payload), state)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %state.topic, skipped, "Slow subscriber skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), AdapterError> {
        self.ensure_open()?;

        match self.live_sender(topic) {
            Some(tx) => {
                // No receivers is not an error: at-most-once delivery
                let delivered = tx.send(payload).unwrap_or(0);
                debug!(provider_id = %self.provider_id, topic, delivered, "Published event");
            }
            None => {
                debug!(provider_id = %self.provider_id, topic, "Published event without subscribers");
            }
        }
        Ok(())
    }

    async fn request(
        &self,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, AdapterError> {
        self.ensure_open()?;

        let no_responders = || AdapterError::NoResponders {
            topic: topic.to_string(),
        };

        let responder = self
            .responders
            .lock()
            .get(topic)
            .cloned()
            .ok_or_else(no_responders)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = InMemoryRequest {
            topic: topic.to_string(),
            payload,
            reply: reply_tx,
        };

        if responder.send(request).await.is_err() {
            self.responders.lock().remove(topic);
            return Err(no_responders());
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(no_responders()),
            Err(_) => Err(AdapterError::Timeout {
                topic: topic.to_string(),
                timeout,
            }),
        }
    }
}
