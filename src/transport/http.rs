//! HTTP streaming transports: SSE, multipart and subscribe-once.

use super::framing::{Framing, StreamFrame};
use super::{deliver, pump, Outcome, PumpOptions, Subscription, TransportKind};
use crate::engine::SubscriptionStream;
use crate::executor::GraphQLResponse;
use crate::registry::SessionAdmission;
use axum::body::Body;
use axum::http::header::ACCEPT;
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures::stream;
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Query parameter requesting one-shot delivery.
pub const SUBSCRIBE_ONCE_PARAM: &str = "wg_subscribe_once";
/// Query parameter forcing SSE regardless of `Accept`.
pub const SSE_PARAM: &str = "wg_sse";

/// Pick the streaming transport for an HTTP subscription request.
pub fn select_transport(headers: &HeaderMap, params: &HashMap<String, String>) -> TransportKind {
    if params.contains_key(SUBSCRIBE_ONCE_PARAM) {
        return TransportKind::SubscribeOnce;
    }
    let accept = headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(",");
    if params.contains_key(SSE_PARAM) || accept.contains("text/event-stream") {
        return TransportKind::Sse;
    }
    if accept.contains("multipart/mixed") {
        return TransportKind::Multipart;
    }
    TransportKind::Sse
}

pub fn framing_for(kind: TransportKind) -> Framing {
    match kind {
        TransportKind::Multipart => Framing::Multipart,
        TransportKind::SubscribeOnce => Framing::SubscribeOnce,
        TransportKind::Sse | TransportKind::WebSocket => Framing::Sse,
    }
}

/// Settings shared by the HTTP streaming transports.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub heartbeat: Duration,
    pub channel_capacity: usize,
}

/// Stream an open subscription as the response body.
///
/// Headers go out immediately. The session stays registered until the
/// stream finishes; a forced close aborts the body without a terminator.
pub fn stream_response(
    kind: TransportKind,
    admission: SessionAdmission,
    events: SubscriptionStream,
    settings: StreamSettings,
) -> Response {
    let framing = framing_for(kind);
    let closed = admission.token().clone();
    let (tx, rx) = mpsc::channel::<Bytes>(settings.channel_capacity.max(1));

    let options = PumpOptions {
        heartbeat: (kind != TransportKind::SubscribeOnce).then_some(settings.heartbeat),
        once: kind == TransportKind::SubscribeOnce,
    };

    tokio::spawn(async move {
        let session_id = admission.handle().id();
        debug!(session_id, transport = kind.as_str(), "Subscription started");
        let closed = admission.token().clone();

        let mut subscription = Subscription::new();
        let outcome = pump(events, &tx, &closed, options, &mut subscription, |frame| {
            framing.encode(&frame)
        })
        .await;
        if outcome.should_complete() {
            if let Some(terminator) = framing.encode(&StreamFrame::Complete) {
                let _ = deliver(&tx, &closed, terminator).await;
            }
        }
        subscription.close();

        debug!(
            session_id,
            transport = kind.as_str(),
            outcome = ?outcome,
            sequence = subscription.sequence(),
            "Subscription finished"
        );
        drop(admission);
    });

    with_headers(framing, body_stream(rx, closed))
}

/// Respond to a streaming request that failed before any event: one
/// error frame followed by the transport's completion.
pub fn error_response(kind: TransportKind, response: GraphQLResponse) -> Response {
    let framing = framing_for(kind);
    let mut body = BytesMut::new();
    for frame in [StreamFrame::Next(response), StreamFrame::Complete] {
        if let Some(bytes) = framing.encode(&frame) {
            body.extend_from_slice(&bytes);
        }
    }
    with_headers(framing, Body::from(body.freeze()))
}

fn with_headers(framing: Framing, body: Body) -> Response {
    let mut response = Response::new(body);
    response.headers_mut().extend(framing.headers());
    response
}

struct BodyState {
    rx: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
    aborted: bool,
}

/// Body fed by the session queue. A forced close surfaces as a body error
/// so the connection is cut instead of ending cleanly.
fn body_stream(rx: mpsc::Receiver<Bytes>, closed: CancellationToken) -> Body {
    let state = BodyState {
        rx,
        closed,
        aborted: false,
    };
    Body::from_stream(stream::unfold(state, |mut state| async move {
        if state.aborted {
            return None;
        }
        tokio::select! {
            biased;
            _ = state.closed.cancelled() => {
                state.aborted = true;
                let err = io::Error::new(io::ErrorKind::ConnectionAborted, "session closed by config reload");
                Some((Err(err), state))
            }
            chunk = state.rx.recv() => chunk.map(|bytes| (Ok(bytes), state)),
        }
    }))
}
