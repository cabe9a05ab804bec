//! Runtime support for the gateway - HTTP and WebSocket integration.
//!
//! Every request is admitted against the generation that is active at that
//! moment and runs to completion there, whatever swaps happen meanwhile. The
//! `X-Router-Config-Version` header names that generation.

use crate::batch::{check_batch, execute_batch, RequestBody};
use crate::config::{GatewayConfig, CONFIG_VERSION_HEADER};
use crate::error::{Error, Result};
use crate::executor::{GraphQLRequest, GraphQLResponse};
use crate::health::{health_handler, readiness_handler, HealthState};
use crate::registry::GenerationRegistry;
use crate::transport::http::{error_response, select_transport, stream_response, StreamSettings};
use crate::transport::websocket::{self, WebSocketSettings};
use crate::transport::TransportKind;
use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info_span, warn};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// ServeMux - main gateway handler
///
/// Dispatches the GraphQL path by method and body shape: WebSocket
/// upgrades, streaming subscriptions, single operations and batches.
#[derive(Clone)]
pub struct ServeMux {
    registry: Arc<GenerationRegistry>,
    config: Arc<GatewayConfig>,
    ws_settings: Arc<WebSocketSettings>,
}

impl ServeMux {
    pub fn new(registry: Arc<GenerationRegistry>, config: GatewayConfig) -> Self {
        let ws_settings = Arc::new(WebSocketSettings {
            subscriptions: config.subscriptions.clone(),
            security: config.security.clone(),
        });
        Self {
            registry,
            config: Arc::new(config),
            ws_settings,
        }
    }

    pub fn registry(&self) -> &Arc<GenerationRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            heartbeat: self.config.subscriptions.heartbeat_interval(),
            channel_capacity: self.config.subscriptions.channel_capacity,
        }
    }

    /// Stamp the serving generation's version on `response`.
    fn with_version(&self, mut response: Response, version: &str) -> Response {
        if self.config.set_config_version_header {
            if let Ok(value) = HeaderValue::from_str(version) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(CONFIG_VERSION_HEADER), value);
            }
        }
        response
    }

    /// Handle one GraphQL operation received over HTTP.
    pub async fn handle_operation(
        &self,
        headers: &HeaderMap,
        params: &HashMap<String, String>,
        request: GraphQLRequest,
    ) -> Response {
        let operation = match request.operation() {
            Ok(operation) => operation,
            Err(e) => return error_json(&e),
        };

        if operation.is_subscription() {
            let kind = select_transport(headers, params);
            if let Some(blocked) = self.config.security.blocked(operation.kind) {
                return error_response(kind, GraphQLResponse::from_error(&blocked));
            }

            let admission = match self.registry.open_session(kind) {
                Ok(admission) => admission,
                Err(e) => return error_json(&e),
            };
            let generation = admission.generation().clone();
            let ctx = generation.context(admission.token().clone());
            let response = match generation.engine().subscribe(&request, &operation, ctx).await {
                Ok(events) => stream_response(kind, admission, events, self.stream_settings()),
                Err(e) => {
                    warn!(version = %generation.version(), error = %e, "Failed to open subscription");
                    error_response(kind, GraphQLResponse::from_error(&e))
                }
            };
            return self.with_version(response, generation.version());
        }

        if let Some(blocked) = self.config.security.blocked(operation.kind) {
            return error_json(&blocked);
        }

        let admission = match self.registry.begin_request() {
            Ok(admission) => admission,
            Err(e) => return error_json(&e),
        };
        let generation = admission.generation();
        let ctx = generation.context(admission.token().clone());
        let response = match generation.engine().execute(&request, &operation, &ctx).await {
            Ok(response) => Json(response).into_response(),
            Err(e) => error_json(&e),
        };
        self.with_version(response, generation.version())
    }

    /// Handle a batch body.
    pub async fn handle_batch(&self, entries: Vec<serde_json::Value>) -> Response {
        if let Err(e) = check_batch(&self.config.batching, entries.len()) {
            return error_json(&e);
        }
        let admission = match self.registry.begin_request() {
            Ok(admission) => admission,
            Err(e) => return error_json(&e),
        };
        debug!(entries = entries.len(), "Executing batch");
        let responses = execute_batch(&admission, entries, &self.config.batching, &self.config.security).await;
        self.with_version(Json(responses).into_response(), admission.generation().version())
    }

    /// Convert to Axum router
    pub fn into_router(self) -> Router {
        let health_state = Arc::new(HealthState::new(self.registry.clone()));
        let graphql_path = self.config.graphql_path.clone();

        let health = Router::new()
            .route("/health", get(health_handler))
            .route("/ready", get(readiness_handler))
            .with_state(health_state);

        Router::new()
            .route(&graphql_path, get(handle_graphql_get).post(handle_graphql_post))
            .with_state(Arc::new(self))
            .merge(health)
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                info_span!(
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }))
    }
}

/// JSON error body with the status the error maps to.
fn error_json(err: &Error) -> Response {
    (err.status_code(), Json(GraphQLResponse::from_error(err))).into_response()
}

/// Build a request from GET query parameters.
fn request_from_params(params: &HashMap<String, String>) -> Result<GraphQLRequest> {
    let query = params
        .get("query")
        .filter(|q| !q.is_empty())
        .ok_or_else(|| Error::InvalidRequest("missing query parameter".into()))?;
    let variables = match params.get("variables").filter(|v| !v.is_empty()) {
        Some(raw) => Some(
            serde_json::from_str(raw)
                .map_err(|e| Error::InvalidRequest(format!("invalid variables: {}", e)))?,
        ),
        None => None,
    };
    Ok(GraphQLRequest {
        query: query.clone(),
        variables,
        operation_name: params.get("operationName").cloned(),
        extensions: None,
    })
}

/// Handler for GET requests: WebSocket upgrades and URL-encoded operations
async fn handle_graphql_get(
    State(mux): State<Arc<ServeMux>>,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Ok(ws) = ws {
        return match mux.registry.open_session(TransportKind::WebSocket) {
            Ok(admission) => {
                let version = admission.generation().version().to_string();
                let response = websocket::upgrade(ws, admission, mux.ws_settings.clone());
                mux.with_version(response, &version)
            }
            Err(e) => error_json(&e),
        };
    }

    match request_from_params(&params) {
        Ok(request) => mux.handle_operation(&headers, &params, request).await,
        Err(e) => error_json(&e),
    }
}

/// Handler for POST requests to the GraphQL path
async fn handle_graphql_post(
    State(mux): State<Arc<ServeMux>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    match RequestBody::parse(&body) {
        Ok(RequestBody::Single(request)) => mux.handle_operation(&headers, &params, request).await,
        Ok(RequestBody::Batch(entries)) => mux.handle_batch(entries).await,
        Err(e) => (StatusCode::BAD_REQUEST, Json(GraphQLResponse::from_error(&e))).into_response(),
    }
}
