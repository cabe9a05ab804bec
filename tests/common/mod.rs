//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::Router;
use futures::stream::{self, StreamExt};
use graphql_stream_gateway::engine::filter::InCondition;
use graphql_stream_gateway::error::{Error, Result};
use graphql_stream_gateway::executor::ResponseStream;
use graphql_stream_gateway::{
    AdapterSet, ConfigSnapshot, EventBinding, ExecutionContext, Executor, Field, FilterCondition,
    Gateway, GatewayConfig, GenerationBuilder, GenerationParts, GenerationRegistry, GraphQLRequest,
    GraphQLResponse, InMemoryAdapter, Operation,
};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub const PROVIDER: &str = "default";
pub const FILTERED_TOPIC: &str = "employeeUpdates";

pub fn employees() -> Value {
    json!([
        {"id": 1, "__typename": "Employee", "details": {"forename": "Jens", "surname": "Neuse"}},
        {"id": 2, "__typename": "Employee", "details": {"forename": "Dustin", "surname": "Deus"}},
        {"id": 3, "__typename": "Employee", "details": {"forename": "Stefan", "surname": "Avram"}},
        {"id": 4, "__typename": "Employee", "details": {"forename": "Björn", "surname": "Schwenzer"}},
    ])
}

/// Employees subgraph stand-in.
///
/// `employees` sleeps `delay` before answering; `countEmp` counts from 0 to
/// `max` with `intervalMilliseconds` between values and lingers one more
/// interval before ending; events are enriched from the employee list.
pub struct FixtureExecutor {
    delay: Duration,
}

impl FixtureExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Executor for FixtureExecutor {
    async fn execute(
        &self,
        _request: &GraphQLRequest,
        operation: &Operation,
        _ctx: &ExecutionContext,
    ) -> Result<GraphQLResponse> {
        let mut data = Map::new();
        for field in &operation.fields {
            let value = match field.name.as_str() {
                "employees" => {
                    tokio::time::sleep(self.delay).await;
                    employees()
                }
                other => {
                    return Err(Error::InvalidOperation(format!(
                        "Cannot query field \"{}\" on type \"Query\".",
                        other
                    )))
                }
            };
            data.insert(field.response_key().to_string(), field.project(&value));
        }
        Ok(GraphQLResponse::from_data(Value::Object(data)))
    }

    async fn open_subscription(
        &self,
        _request: &GraphQLRequest,
        operation: &Operation,
        _ctx: &ExecutionContext,
    ) -> Result<ResponseStream> {
        let field = operation.root_field()?;
        if field.name != "countEmp" {
            return Err(Error::InvalidOperation(format!(
                "Cannot query field \"{}\" on type \"Subscription\".",
                field.name
            )));
        }
        let max = field.argument("max").and_then(Value::as_u64).unwrap_or(0);
        let interval = Duration::from_millis(
            field
                .argument("intervalMilliseconds")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        );
        let key = field.response_key().to_string();

        Ok(stream::unfold(0u64, move |i| {
            let key = key.clone();
            async move {
                if i > 0 {
                    tokio::time::sleep(interval).await;
                }
                if i > max {
                    return None;
                }
                let mut data = Map::new();
                data.insert(key, json!(i));
                Some((Ok(Value::Object(data)), i + 1))
            }
        })
        .boxed())
    }

    async fn resolve_event(&self, field: &Field, entity: Value, _ctx: &ExecutionContext) -> Result<Value> {
        let id = entity.get("id").and_then(Value::as_u64);
        let mut merged = employees()
            .as_array()
            .and_then(|list| list.iter().find(|e| e["id"].as_u64() == id).cloned())
            .unwrap_or_else(|| json!({}));
        if let (Some(target), Value::Object(source)) = (merged.as_object_mut(), entity) {
            for (key, value) in source {
                target.insert(key, value);
            }
        }
        Ok(field.project(&merged))
    }
}

/// Builds fixture generations; records every version it was asked for.
pub struct FixtureBuilder {
    pub broker: Arc<InMemoryAdapter>,
    pub delay: Duration,
    pub built: Mutex<Vec<String>>,
}

impl FixtureBuilder {
    pub fn new(broker: Arc<InMemoryAdapter>, delay: Duration) -> Self {
        Self {
            broker,
            delay,
            built: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl GenerationBuilder for FixtureBuilder {
    async fn build(&self, snapshot: &ConfigSnapshot) -> Result<GenerationParts> {
        if snapshot.version.starts_with("broken") {
            return Err(Error::GenerationBuild("routing config rejected".into()));
        }
        self.built.lock().push(snapshot.version.clone());
        Ok(GenerationParts {
            executor: Arc::new(FixtureExecutor { delay: self.delay }),
            adapters: AdapterSet::new().with_adapter(self.broker.clone()),
        })
    }
}

/// Snapshot with the event bindings the tests rely on.
pub fn snapshot(version: &str) -> ConfigSnapshot {
    ConfigSnapshot::new(version)
        .with_binding(EventBinding::subscribe(
            "employeeUpdated",
            PROVIDER,
            "employeeUpdated.{{ args.employeeID }}",
        ))
        .with_binding(
            EventBinding::subscribe("filteredEmployeeUpdated", PROVIDER, FILTERED_TOPIC).with_filter(
                FilterCondition::In(InCondition {
                    field_path: vec!["id".into()],
                    values: vec![json!("{{ args.employeeIDs }}")],
                }),
            ),
        )
        .with_binding(
            EventBinding::subscribe("employeeUpdatedStrict", PROVIDER, FILTERED_TOPIC)
                .with_required_fields(&["id", "details.forename"]),
        )
        .with_binding(EventBinding::publish(
            "updateEmployee",
            PROVIDER,
            "employeeUpdated.{{ args.id }}",
        ))
}

pub struct Fixture {
    pub broker: Arc<InMemoryAdapter>,
    pub registry: Arc<GenerationRegistry>,
    pub router: Router,
}

pub async fn fixture(config: GatewayConfig) -> Fixture {
    fixture_with_delay(config, Duration::ZERO).await
}

pub async fn fixture_with_delay(config: GatewayConfig, delay: Duration) -> Fixture {
    let broker = Arc::new(InMemoryAdapter::new(PROVIDER));
    let gateway = Gateway::builder()
        .with_config(config)
        .with_generation_builder(Arc::new(FixtureBuilder::new(broker.clone(), delay)))
        .with_snapshot(snapshot("v1"))
        .build()
        .await
        .expect("gateway builds");
    let registry = gateway.registry().clone();
    Fixture {
        broker,
        registry,
        router: gateway.into_router(),
    }
}

/// Serve `router` on an ephemeral port.
pub async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

pub fn graphql_post(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/graphql")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("build request")
}

pub fn streaming_post(query: &str, accept: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("accept", accept)
        .body(Body::from(json!({ "query": query }).to_string()))
        .expect("build request")
}

pub async fn body_string(response: axum::response::Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

/// Incremental reader over a streaming response body.
pub struct BodyReader {
    body: Body,
    buffer: String,
}

impl BodyReader {
    pub fn new(response: axum::response::Response) -> Self {
        Self {
            body: response.into_body(),
            buffer: String::new(),
        }
    }

    /// Read until `delimiter` shows up and return everything up to and
    /// including it.
    pub async fn read_until(&mut self, delimiter: &str, timeout: Duration) -> String {
        tokio::time::timeout(timeout, async {
            loop {
                if let Some(pos) = self.buffer.find(delimiter) {
                    let end = pos + delimiter.len();
                    let chunk = self.buffer[..end].to_string();
                    self.buffer.drain(..end);
                    return chunk;
                }
                let frame = self
                    .body
                    .frame()
                    .await
                    .expect("body ended early")
                    .expect("body failed");
                if let Ok(data) = frame.into_data() {
                    self.buffer.push_str(std::str::from_utf8(&data).expect("utf8 chunk"));
                }
            }
        })
        .await
        .expect("timed out waiting for body chunk")
    }

    /// Drain the rest of the body; `Err` when the connection was cut.
    pub async fn finish(mut self, timeout: Duration) -> std::result::Result<String, String> {
        tokio::time::timeout(timeout, async {
            while let Some(frame) = self.body.frame().await {
                match frame {
                    Ok(frame) => {
                        if let Ok(data) = frame.into_data() {
                            self.buffer.push_str(&String::from_utf8_lossy(&data));
                        }
                    }
                    Err(e) => return Err(e.to_string()),
                }
            }
            Ok(self.buffer)
        })
        .await
        .expect("timed out waiting for body end")
    }
}

/// The `data:` payload of one SSE `next` event.
pub fn sse_data(event: &str) -> Value {
    let line = event
        .lines()
        .find_map(|l| l.strip_prefix("data: "))
        .expect("data line");
    serde_json::from_str(line).expect("json data")
}

pub async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_str(&body_string(response).await).expect("json body")
}

/// Publish a JSON entity through the broker.
pub async fn publish(broker: &InMemoryAdapter, topic: &str, entity: Value) {
    use graphql_stream_gateway::EventSourceAdapter;
    broker
        .publish(topic, entity.to_string().into())
        .await
        .expect("publish");
}
