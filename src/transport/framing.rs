//! Wire framing of the HTTP streaming transports.

use crate::executor::GraphQLResponse;
use axum::http::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use bytes::Bytes;
use serde::Serialize;
use tracing::error;

pub const MULTIPART_BOUNDARY: &str = "graphql";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/mixed; boundary=\"graphql\"; subscriptionSpec=\"1.0\"";
pub const SSE_CONTENT_TYPE: &str = "text/event-stream";
pub const SUBSCRIBE_ONCE_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Transport-neutral frame produced by the subscription loop.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Next(GraphQLResponse),
    Heartbeat,
    Complete,
}

/// Byte framing for one of the HTTP streaming transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Sse,
    Multipart,
    SubscribeOnce,
}

#[derive(Serialize)]
struct MultipartPayload<'a> {
    payload: &'a GraphQLResponse,
}

impl Framing {
    /// Encode a frame. `None` means the transport has no wire form for it.
    pub fn encode(&self, frame: &StreamFrame) -> Option<Bytes> {
        match (self, frame) {
            (Framing::Sse, StreamFrame::Next(response)) => {
                let json = to_json(response);
                let mut out = Vec::with_capacity(json.len() + 20);
                out.extend_from_slice(b"event: next\ndata: ");
                out.extend_from_slice(&json);
                out.extend_from_slice(b"\n\n");
                Some(Bytes::from(out))
            }
            (Framing::Sse, StreamFrame::Heartbeat) => Some(Bytes::from_static(b":heartbeat\n\n")),
            (Framing::Sse, StreamFrame::Complete) => Some(Bytes::from_static(b"event: complete\ndata: \n\n")),

            (Framing::Multipart, StreamFrame::Next(response)) => {
                Some(multipart_part(&to_json(&MultipartPayload { payload: response })))
            }
            (Framing::Multipart, StreamFrame::Heartbeat) => Some(multipart_part(b"{}")),
            (Framing::Multipart, StreamFrame::Complete) => {
                Some(Bytes::from(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY)))
            }

            (Framing::SubscribeOnce, StreamFrame::Next(response)) => {
                let mut out = to_json(response);
                out.push(b'\n');
                Some(Bytes::from(out))
            }
            (Framing::SubscribeOnce, _) => None,
        }
    }

    /// Response headers sent before the first frame.
    pub fn headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        let streaming = |content_type: &'static str| {
            vec![
                (CONTENT_TYPE, HeaderValue::from_static(content_type)),
                (CACHE_CONTROL, HeaderValue::from_static("no-cache")),
                (CONNECTION, HeaderValue::from_static("keep-alive")),
                (X_ACCEL_BUFFERING, HeaderValue::from_static("no")),
            ]
        };
        match self {
            Framing::Sse => streaming(SSE_CONTENT_TYPE),
            Framing::Multipart => streaming(MULTIPART_CONTENT_TYPE),
            Framing::SubscribeOnce => vec![(CONTENT_TYPE, HeaderValue::from_static(SUBSCRIBE_ONCE_CONTENT_TYPE))],
        }
    }
}

fn multipart_part(body: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(body.len() + 64);
    out.extend_from_slice(format!("\r\n--{}\r\nContent-Type: application/json\r\n\r\n", MULTIPART_BOUNDARY).as_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n");
    Bytes::from(out)
}

fn to_json<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_else(|e| {
        error!(error = %e, "Failed to serialize stream frame");
        br#"{"errors":[{"message":"Internal server error"}]}"#.to_vec()
    })
}
