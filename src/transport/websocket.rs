//! Multiplexed GraphQL subscriptions over WebSocket.
//!
//! Two sub-protocols are served on the same endpoint:
//!
//! - [graphql-transport-ws](https://github.com/enisdenjo/graphql-ws/blob/master/PROTOCOL.md):
//!   `connection_init` → `connection_ack`, `subscribe` / `next` / `error` /
//!   `complete`, `ping` / `pong`
//! - legacy `graphql-ws` (subscriptions-transport-ws): `start` / `data` /
//!   `stop`, `connection_terminate` and a server `ka` keep-alive
//!
//! A client offering no sub-protocol gets the legacy one.
//!
//! Each connection is one session of the generation it was admitted to.
//! When that generation is retired the socket is dropped without a close
//! frame; clients observe an abnormal closure, never `complete`.

use super::{deliver, pump, PumpOptions, StreamFrame, Subscription};
use crate::config::{SecurityConfig, SubscriptionConfig};
use crate::error::{Error, GraphQLError};
use crate::executor::{GraphQLRequest, GraphQLResponse};
use crate::generation::Generation;
use crate::operation::{Operation, OperationKind};
use crate::registry::SessionAdmission;
use ahash::AHashMap;
use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    http::HeaderValue,
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const GRAPHQL_TRANSPORT_WS: &str = "graphql-transport-ws";
pub const GRAPHQL_WS: &str = "graphql-ws";

/// Close code for a missing `connection_init` (graphql-transport-ws).
const CLOSE_INIT_TIMEOUT: u16 = 4408;

/// WebSocket sub-protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsProtocol {
    GraphQLTransportWs,
    GraphQLWs,
}

impl WsProtocol {
    /// Protocol negotiated during the upgrade; none means legacy.
    pub fn from_header(value: Option<&HeaderValue>) -> Self {
        match value.and_then(|v| v.to_str().ok()) {
            Some(GRAPHQL_TRANSPORT_WS) => WsProtocol::GraphQLTransportWs,
            _ => WsProtocol::GraphQLWs,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WsProtocol::GraphQLTransportWs => GRAPHQL_TRANSPORT_WS,
            WsProtocol::GraphQLWs => GRAPHQL_WS,
        }
    }

    fn next(&self, id: &str, response: &GraphQLResponse) -> ProtocolMessage {
        let message_type = match self {
            WsProtocol::GraphQLTransportWs => MessageType::Next,
            WsProtocol::GraphQLWs => MessageType::Data,
        };
        ProtocolMessage {
            message_type,
            id: Some(id.to_string()),
            payload: serde_json::to_value(response).ok(),
        }
    }
}

/// Message types of both sub-protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Client -> Server
    ConnectionInit,
    Subscribe,
    Start,
    Stop,
    ConnectionTerminate,
    // Both directions
    Complete,
    Ping,
    Pong,
    // Server -> Client
    ConnectionAck,
    ConnectionError,
    Next,
    Data,
    Error,
    Ka,
}

/// Protocol message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ProtocolMessage {
    fn bare(message_type: MessageType) -> Self {
        Self {
            message_type,
            id: None,
            payload: None,
        }
    }

    pub fn connection_ack() -> Self {
        Self::bare(MessageType::ConnectionAck)
    }

    pub fn keep_alive() -> Self {
        Self::bare(MessageType::Ka)
    }

    pub fn pong() -> Self {
        Self::bare(MessageType::Pong)
    }

    pub fn error(id: String, errors: Vec<GraphQLError>) -> Self {
        Self {
            message_type: MessageType::Error,
            id: Some(id),
            payload: serde_json::to_value(errors).ok(),
        }
    }

    pub fn complete(id: String) -> Self {
        Self {
            message_type: MessageType::Complete,
            id: Some(id),
            payload: None,
        }
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        serde_json::to_string(self).map_err(Error::Serialization)
    }

    fn into_message(self) -> Option<Message> {
        match self.to_json() {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                None
            }
        }
    }
}

/// Active subscriptions of one connection.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    next_serial: u64,
    subscriptions: AHashMap<String, (u64, CancellationToken)>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id`; returns the serial used to deregister it.
    pub fn add(&mut self, id: String, token: CancellationToken) -> u64 {
        self.next_serial += 1;
        self.subscriptions.insert(id, (self.next_serial, token));
        self.next_serial
    }

    /// Deregister `id` if it still refers to the subscription `serial`.
    pub fn remove(&mut self, id: &str, serial: u64) -> bool {
        match self.subscriptions.get(id) {
            Some((current, _)) if *current == serial => {
                self.subscriptions.remove(id);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subscriptions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Cancel one subscription, leaving the others untouched.
    pub fn cancel(&mut self, id: &str) -> bool {
        match self.subscriptions.remove(id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, token)) in self.subscriptions.drain() {
            token.cancel();
        }
    }
}

/// Settings of the WebSocket transport.
#[derive(Debug, Clone, Default)]
pub struct WebSocketSettings {
    pub subscriptions: SubscriptionConfig,
    pub security: SecurityConfig,
}

/// Complete the upgrade and serve the connection as `admission`'s session.
pub fn upgrade(ws: WebSocketUpgrade, admission: SessionAdmission, settings: Arc<WebSocketSettings>) -> Response {
    ws.protocols([GRAPHQL_TRANSPORT_WS, GRAPHQL_WS])
        .on_upgrade(move |socket| handle_socket(socket, admission, settings))
}

enum Exit {
    ClientClosed,
    ForcedClose,
    InitTimeout,
}

struct Connection {
    protocol: WsProtocol,
    generation: Arc<Generation>,
    outbound: mpsc::Sender<Message>,
    subscriptions: Arc<Mutex<SubscriptionRegistry>>,
    token: CancellationToken,
    settings: Arc<WebSocketSettings>,
}

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);

/// Handle the WebSocket connection
async fn handle_socket(socket: WebSocket, admission: SessionAdmission, settings: Arc<WebSocketSettings>) {
    let protocol = WsProtocol::from_header(socket.protocol());
    let connection_id = CONNECTION_IDS.fetch_add(1, Ordering::Relaxed);
    let (sender, mut receiver) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(settings.subscriptions.channel_capacity.max(1));

    let write_handle = tokio::spawn(write_messages(sender, outbound_rx));

    let forced = admission.token().clone();
    let connection = Connection {
        protocol,
        generation: admission.generation().clone(),
        outbound: outbound_tx,
        subscriptions: Arc::new(Mutex::new(SubscriptionRegistry::new())),
        token: forced.child_token(),
        settings: settings.clone(),
    };

    info!(
        connection_id,
        protocol = protocol.name(),
        version = %connection.generation.version(),
        "WebSocket connection opened"
    );

    let exit = connection.run(&mut receiver, &forced).await;

    connection.subscriptions.lock().cancel_all();
    connection.token.cancel();

    match exit {
        Exit::ForcedClose => {
            // Drop both halves without a close frame.
            write_handle.abort();
            info!(connection_id, "WebSocket connection force-closed by config reload");
        }
        Exit::ClientClosed | Exit::InitTimeout => {
            drop(connection);
            let _ = timeout(Duration::from_secs(1), write_handle).await;
            debug!(connection_id, "WebSocket connection closed");
        }
    }
    drop(receiver);
    drop(admission);
}

impl Connection {
    async fn run(&self, receiver: &mut SplitStream<WebSocket>, forced: &CancellationToken) -> Exit {
        let config = &self.settings.subscriptions;

        if config.require_connection_init {
            let init = tokio::select! {
                biased;
                _ = forced.cancelled() => return Exit::ForcedClose,
                init = timeout(config.connection_init_timeout(), wait_for_init(receiver)) => init,
            };
            match init {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Client disconnected before completing initialization");
                    return Exit::ClientClosed;
                }
                Err(_) => {
                    warn!("Connection initialization timeout");
                    if self.protocol == WsProtocol::GraphQLTransportWs {
                        let close = Message::Close(Some(CloseFrame {
                            code: CLOSE_INIT_TIMEOUT,
                            reason: "Connection initialisation timeout".into(),
                        }));
                        let _ = deliver(&self.outbound, &self.token, close).await;
                    }
                    return Exit::InitTimeout;
                }
            }
            self.send(ProtocolMessage::connection_ack()).await;
            debug!("Connection initialized");
        }

        let legacy = self.protocol == WsProtocol::GraphQLWs;
        if legacy {
            self.send(ProtocolMessage::keep_alive()).await;
        }
        let period = config.keep_alive_interval();
        let mut keep_alive = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;
                _ = forced.cancelled() => return Exit::ForcedClose,
                _ = keep_alive.tick(), if legacy => {
                    self.send(ProtocolMessage::keep_alive()).await;
                }
                msg = receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ProtocolMessage>(&text) {
                            Ok(msg) => {
                                if self.handle_message(msg).await.is_break() {
                                    return Exit::ClientClosed;
                                }
                            }
                            Err(e) => debug!(error = %e, "Ignoring unparseable message"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client closed connection");
                        return Exit::ClientClosed;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        return Exit::ClientClosed;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    async fn handle_message(&self, msg: ProtocolMessage) -> std::ops::ControlFlow<()> {
        match msg.message_type {
            MessageType::Subscribe | MessageType::Start => self.handle_subscribe(msg).await,
            MessageType::Complete | MessageType::Stop => {
                if let Some(id) = msg.id {
                    if self.subscriptions.lock().cancel(&id) {
                        debug!(subscription_id = %id, "Subscription completed by client");
                    }
                }
            }
            MessageType::Ping => self.send(ProtocolMessage::pong()).await,
            MessageType::ConnectionInit => {
                // Already initialized, send ack again (idempotent)
                self.send(ProtocolMessage::connection_ack()).await;
            }
            MessageType::ConnectionTerminate => return std::ops::ControlFlow::Break(()),
            other => debug!("Ignoring unexpected message type: {:?}", other),
        }
        std::ops::ControlFlow::Continue(())
    }

    /// Handle a subscribe (or legacy start) message
    async fn handle_subscribe(&self, msg: ProtocolMessage) {
        let id = match msg.id {
            Some(id) => id,
            None => {
                warn!("Subscribe message missing ID");
                return;
            }
        };

        if self.subscriptions.lock().contains(&id) {
            self.send_error(id, GraphQLError::new("Subscriber for this ID already exists"))
                .await;
            return;
        }

        if self.subscriptions.lock().len() >= self.settings.subscriptions.max_subscriptions_per_connection {
            self.send_error(id, GraphQLError::new("Too many subscriptions")).await;
            return;
        }

        let request = match msg.payload {
            Some(p) => match serde_json::from_value::<GraphQLRequest>(p) {
                Ok(request) => request,
                Err(e) => {
                    self.send_error(id, GraphQLError::new(format!("Invalid payload: {}", e)))
                        .await;
                    return;
                }
            },
            None => {
                self.send_error(id, GraphQLError::new("Missing payload")).await;
                return;
            }
        };

        let operation = match request.operation() {
            Ok(operation) => operation,
            Err(e) => {
                self.send_error(id, e.to_graphql_error()).await;
                return;
            }
        };

        if let Some(blocked) = self.settings.security.blocked(operation.kind) {
            self.send_error(id, blocked.to_graphql_error()).await;
            return;
        }

        let token = self.token.child_token();
        let serial = self.subscriptions.lock().add(id.clone(), token.clone());

        let task = OperationTask {
            id: id.clone(),
            request,
            operation,
            protocol: self.protocol,
            generation: self.generation.clone(),
            outbound: self.outbound.clone(),
            token,
        };
        let subscriptions = self.subscriptions.clone();
        tokio::spawn(async move {
            let id = task.id.clone();
            task.run().await;
            subscriptions.lock().remove(&id, serial);
        });

        info!(subscription_id = %id, "Subscription started");
    }

    /// Queue a frame for the writer. Gives up once the connection is
    /// force-closed, so a client that stopped reading cannot pin the read
    /// loop on a full queue.
    async fn send(&self, msg: ProtocolMessage) {
        if let Some(message) = msg.into_message() {
            let _ = deliver(&self.outbound, &self.token, message).await;
        }
    }

    async fn send_error(&self, id: String, error: GraphQLError) {
        self.send(ProtocolMessage::error(id, vec![error])).await;
    }
}

/// One operation running on a connection.
struct OperationTask {
    id: String,
    request: GraphQLRequest,
    operation: Operation,
    protocol: WsProtocol,
    generation: Arc<Generation>,
    outbound: mpsc::Sender<Message>,
    token: CancellationToken,
}

impl OperationTask {
    async fn run(self) {
        let engine = self.generation.engine();

        if self.operation.kind != OperationKind::Subscription {
            let guard = self.generation.begin_request();
            let ctx = self.generation.context(guard.token().clone());
            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                result = engine.execute(&self.request, &self.operation, &ctx) => result,
            };
            match result {
                Ok(response) => {
                    self.emit(self.protocol.next(&self.id, &response)).await;
                    self.emit(ProtocolMessage::complete(self.id.clone())).await;
                }
                Err(e) => {
                    self.emit(ProtocolMessage::error(self.id.clone(), vec![e.to_graphql_error()]))
                        .await;
                }
            }
            return;
        }

        let mut subscription = Subscription::new();
        let ctx = self.generation.context(self.token.clone());
        let events = match engine.subscribe(&self.request, &self.operation, ctx).await {
            Ok(events) => events,
            Err(e) => {
                warn!(subscription_id = %self.id, error = %e, "Failed to open subscription");
                self.emit(ProtocolMessage::error(self.id.clone(), vec![e.to_graphql_error()]))
                    .await;
                return;
            }
        };

        let protocol = self.protocol;
        let id = self.id.as_str();
        let outcome = pump(
            events,
            &self.outbound,
            &self.token,
            PumpOptions::default(),
            &mut subscription,
            |frame| match frame {
                StreamFrame::Next(response) => protocol.next(id, &response).into_message(),
                StreamFrame::Heartbeat | StreamFrame::Complete => None,
            },
        )
        .await;

        if outcome.should_complete() {
            self.emit(ProtocolMessage::complete(self.id.clone())).await;
        }
        subscription.close();
        debug!(
            subscription_id = %self.id,
            outcome = ?outcome,
            sequence = subscription.sequence(),
            "Subscription finished"
        );
    }

    async fn emit(&self, msg: ProtocolMessage) {
        if let Some(message) = msg.into_message() {
            let _ = deliver(&self.outbound, &self.token, message).await;
        }
    }
}

/// Wait for connection initialization
async fn wait_for_init(receiver: &mut SplitStream<WebSocket>) -> bool {
    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if let Ok(msg) = serde_json::from_str::<ProtocolMessage>(&text) {
                    if msg.message_type == MessageType::ConnectionInit {
                        return true;
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => {
                return false;
            }
            _ => {}
        }
    }
    false
}

/// Write outbound messages to the WebSocket
async fn write_messages(mut sender: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if sender.send(msg).await.is_err() || closing {
            break;
        }
    }
}
