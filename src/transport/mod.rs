//! Transport sessions for streaming subscriptions.
//!
//! Four transports share the subscription engine:
//!
//! - **WebSocket** with the `graphql-transport-ws` and legacy `graphql-ws`
//!   sub-protocols, multiplexing many subscriptions per connection
//! - **SSE** (`text/event-stream`)
//! - **Multipart** (`multipart/mixed; subscriptionSpec="1.0"`)
//! - **Subscribe-once**: the first event, then the response ends
//!
//! Every transport writes through one queue per session so frames never
//! interleave on the wire. The event loop in [`pump`] is shared: it races
//! the event stream against the heartbeat timer, the client going away and
//! the forced close of the session's generation.

pub mod framing;
pub mod http;
pub mod websocket;

pub use framing::{Framing, StreamFrame};

use crate::engine::{SubscriptionEvent, SubscriptionStream};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Transport a streaming session runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSocket,
    Sse,
    Multipart,
    SubscribeOnce,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Sse => "sse",
            TransportKind::Multipart => "multipart",
            TransportKind::SubscribeOnce => "subscribe_once",
        }
    }
}

/// How a subscription loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The event stream finished
    Completed,
    /// A fatal error frame was delivered and the stream stopped
    Failed,
    /// The consumer of the queue went away
    ClientGone,
    /// The session was force-closed
    Closed,
}

impl Outcome {
    /// Whether a graceful completion frame should follow.
    pub fn should_complete(&self) -> bool {
        matches!(self, Outcome::Completed | Outcome::Failed)
    }
}

/// Lifecycle of one subscription within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Opening adapter streams
    Subscribing,
    /// Forwarding events
    Streaming,
    /// Ended gracefully; the completion frame is pending
    Completing,
    Closed,
}

/// Progress of one subscription: its state and how many events it emitted.
///
/// Only frames that reach the queue count; heartbeats and events an
/// engine filter dropped never do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    state: SubscriptionState,
    sequence: u64,
}

impl Subscription {
    pub fn new() -> Self {
        Self {
            state: SubscriptionState::Subscribing,
            sequence: 0,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Number of events delivered so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Mark the subscription closed once its session wrote the last frame.
    pub fn close(&mut self) {
        self.state = SubscriptionState::Closed;
    }

    fn finish(&mut self, outcome: Outcome) -> Outcome {
        self.state = if outcome.should_complete() {
            SubscriptionState::Completing
        } else {
            SubscriptionState::Closed
        };
        outcome
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new()
    }
}

/// Options of one subscription loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct PumpOptions {
    /// Heartbeat period; the timer restarts after every data frame
    pub heartbeat: Option<Duration>,
    /// Stop after the first event
    pub once: bool,
}

/// Forward `events` into `queue` until the stream ends, fails fatally,
/// the queue closes or `closed` fires. `encode` turns frames into queue
/// items; returning `None` drops the frame.
///
/// `subscription` moves to `Streaming` on entry and to `Completing` or
/// `Closed` on return, counting every event frame delivered on the way.
pub async fn pump<T, F>(
    mut events: SubscriptionStream,
    queue: &mpsc::Sender<T>,
    closed: &CancellationToken,
    options: PumpOptions,
    subscription: &mut Subscription,
    mut encode: F,
) -> Outcome
where
    F: FnMut(StreamFrame) -> Option<T>,
{
    subscription.state = SubscriptionState::Streaming;
    let mut heartbeat = options.heartbeat.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => return subscription.finish(Outcome::Closed),
            _ = queue.closed() => return subscription.finish(Outcome::ClientGone),
            event = events.next() => {
                let Some(event) = event else {
                    return subscription.finish(Outcome::Completed);
                };
                let fatal = matches!(&event, SubscriptionEvent::Error(e) if e.is_fatal());
                if let Some(item) = encode(StreamFrame::Next(event.into_response())) {
                    if let Err(outcome) = deliver(queue, closed, item).await {
                        return subscription.finish(outcome);
                    }
                    subscription.sequence += 1;
                }
                if fatal {
                    return subscription.finish(Outcome::Failed);
                }
                if options.once {
                    return subscription.finish(Outcome::Completed);
                }
                if let Some(ticker) = heartbeat.as_mut() {
                    ticker.reset();
                }
            }
            _ = next_tick(&mut heartbeat) => {
                trace!(sequence = subscription.sequence, "Sending heartbeat");
                if let Some(item) = encode(StreamFrame::Heartbeat) {
                    if let Err(outcome) = deliver(queue, closed, item).await {
                        return subscription.finish(outcome);
                    }
                }
            }
        }
    }
}

/// Queue one item, giving up when the session is closed meanwhile.
pub async fn deliver<T>(
    queue: &mpsc::Sender<T>,
    closed: &CancellationToken,
    item: T,
) -> Result<(), Outcome> {
    tokio::select! {
        biased;
        _ = closed.cancelled() => Err(Outcome::Closed),
        sent = queue.send(item) => sent.map_err(|_| Outcome::ClientGone),
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SubscriptionError;
    use futures::stream;
    use serde_json::json;

    fn frame_name(frame: StreamFrame) -> Option<String> {
        Some(match frame {
            StreamFrame::Next(response) => serde_json::to_string(&response).unwrap(),
            StreamFrame::Heartbeat => "heartbeat".into(),
            StreamFrame::Complete => "complete".into(),
        })
    }

    async fn drain(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_resets_after_data() {
        let events = stream::unfold(0u32, |i| async move {
            if i >= 3 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(550)).await;
            Some((SubscriptionEvent::Data(json!({"countEmp": i})), i + 1))
        })
        .boxed();

        let (tx, rx) = mpsc::channel(16);
        let closed = CancellationToken::new();
        let options = PumpOptions {
            heartbeat: Some(Duration::from_millis(300)),
            once: false,
        };
        let mut subscription = Subscription::new();
        let outcome = pump(events, &tx, &closed, options, &mut subscription, frame_name).await;
        drop(tx);

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(subscription.sequence(), 3);
        assert_eq!(subscription.state(), SubscriptionState::Completing);
        assert_eq!(
            drain(rx).await,
            vec![
                "heartbeat",
                r#"{"data":{"countEmp":0}}"#,
                "heartbeat",
                r#"{"data":{"countEmp":1}}"#,
                "heartbeat",
                r#"{"data":{"countEmp":2}}"#,
            ]
        );
    }

    #[tokio::test]
    async fn test_once_stops_after_first_event() {
        let events = stream::iter(vec![
            SubscriptionEvent::Data(json!({"a": 1})),
            SubscriptionEvent::Data(json!({"a": 2})),
        ])
        .boxed();
        let (tx, rx) = mpsc::channel(4);
        let options = PumpOptions {
            heartbeat: None,
            once: true,
        };
        let outcome = pump(events, &tx, &CancellationToken::new(), options, &mut Subscription::new(), frame_name).await;
        drop(tx);
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(drain(rx).await, vec![r#"{"data":{"a":1}}"#]);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_stream() {
        let events = stream::iter(vec![
            SubscriptionEvent::Error(SubscriptionError::EventDecode),
            SubscriptionEvent::Error(SubscriptionError::BrokerTransport("lost".into())),
            SubscriptionEvent::Data(json!({"a": 1})),
        ])
        .boxed();
        let (tx, rx) = mpsc::channel(4);
        let mut subscription = Subscription::new();
        let outcome = pump(
            events,
            &tx,
            &CancellationToken::new(),
            PumpOptions::default(),
            &mut subscription,
            frame_name,
        )
        .await;
        drop(tx);
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(subscription.sequence(), 2);
        assert!(outcome.should_complete());
        let frames = drain(rx).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0],
            r#"{"errors":[{"message":"Invalid message received"}],"data":null}"#
        );
    }

    #[tokio::test]
    async fn test_forced_close_wins() {
        let events = stream::pending().boxed();
        let (tx, _rx) = mpsc::channel::<String>(4);
        let closed = CancellationToken::new();
        closed.cancel();
        let mut subscription = Subscription::new();
        let outcome = pump(events, &tx, &closed, PumpOptions::default(), &mut subscription, frame_name).await;
        assert_eq!(outcome, Outcome::Closed);
        assert_eq!(subscription.state(), SubscriptionState::Closed);
        assert_eq!(subscription.sequence(), 0);
        assert!(!outcome.should_complete());
    }

    #[tokio::test]
    async fn test_client_gone() {
        let events = stream::pending().boxed();
        let (tx, rx) = mpsc::channel::<String>(4);
        drop(rx);
        let outcome = pump(
            events,
            &tx,
            &CancellationToken::new(),
            PumpOptions::default(),
            &mut Subscription::new(),
            frame_name,
        )
        .await;
        assert_eq!(outcome, Outcome::ClientGone);
    }
}
