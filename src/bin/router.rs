//! Demo router.
//!
//! Serves a small employee graph with one event-driven subscription backed
//! by the in-memory broker:
//!
//! ```text
//! router [gateway.yaml] [snapshot.yaml]
//! ```
//!
//! Without a snapshot file the built-in one is used. `RUST_LOG` controls
//! log verbosity (default `info`).

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use graphql_stream_gateway::{
    AdapterSet, ConfigSnapshot, EventBinding, EventSourceAdapter, ExecutionContext, Executor,
    Field, Gateway, GatewayConfig, GenerationBuilder, GenerationParts, GraphQLRequest,
    GraphQLResponse, InMemoryAdapter, Operation, OperationKind,
};
use graphql_stream_gateway::error::{Error, Result};
use graphql_stream_gateway::executor::ResponseStream;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PROVIDER: &str = "default";

fn employees() -> Value {
    json!([
        {"id": 1, "__typename": "Employee", "details": {"forename": "Jens", "surname": "Neuse"}},
        {"id": 2, "__typename": "Employee", "details": {"forename": "Dustin", "surname": "Deus"}},
        {"id": 3, "__typename": "Employee", "details": {"forename": "Stefan", "surname": "Avram"}},
    ])
}

/// Resolves `employees`, `employee(id:)` and the `countEmp` ticker.
struct DemoExecutor;

#[async_trait]
impl Executor for DemoExecutor {
    async fn execute(
        &self,
        _request: &GraphQLRequest,
        operation: &Operation,
        _ctx: &ExecutionContext,
    ) -> Result<GraphQLResponse> {
        let mut data = serde_json::Map::new();
        for field in &operation.fields {
            let value = match field.name.as_str() {
                "employees" => employees(),
                "employee" => find_employee(field),
                other => {
                    return Err(Error::InvalidOperation(format!(
                        "Cannot query field \"{}\" on type \"{}\".",
                        other,
                        if operation.kind == OperationKind::Mutation { "Mutation" } else { "Query" }
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
        let max = field.argument("max").and_then(Value::as_u64).unwrap_or(10);
        let interval = field
            .argument("intervalMilliseconds")
            .and_then(Value::as_u64)
            .unwrap_or(1000);
        let key = field.response_key().to_string();

        Ok(stream::unfold(0u64, move |i| {
            let key = key.clone();
            async move {
                if i > max {
                    return None;
                }
                if i > 0 {
                    tokio::time::sleep(Duration::from_millis(interval)).await;
                }
                let mut data = serde_json::Map::new();
                data.insert(key, json!(i));
                Some((Ok(Value::Object(data)), i + 1))
            }
        })
        .boxed())
    }
}

fn find_employee(field: &Field) -> Value {
    let id = field.argument("id").and_then(Value::as_u64);
    employees()
        .as_array()
        .and_then(|list| list.iter().find(|e| e["id"].as_u64() == id).cloned())
        .unwrap_or(Value::Null)
}

struct DemoBuilder {
    broker: Arc<InMemoryAdapter>,
}

#[async_trait]
impl GenerationBuilder for DemoBuilder {
    async fn build(&self, snapshot: &ConfigSnapshot) -> Result<GenerationParts> {
        info!(version = %snapshot.version, bindings = snapshot.event_bindings.len(), "Building demo generation");
        Ok(GenerationParts {
            executor: Arc::new(DemoExecutor),
            adapters: AdapterSet::new().with_adapter(self.broker.clone()),
        })
    }
}

fn default_snapshot() -> ConfigSnapshot {
    ConfigSnapshot::new("demo-1")
        .with_binding(EventBinding::subscribe(
            "employeeUpdated",
            PROVIDER,
            "employeeUpdated.{{ args.employeeID }}",
        ))
        .with_binding(EventBinding::publish(
            "updateEmployee",
            PROVIDER,
            "employeeUpdated.{{ args.id }}",
        ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => GatewayConfig::from_yaml_file(&path)?,
        None => GatewayConfig::default(),
    };
    let snapshot = match args.next() {
        Some(path) => ConfigSnapshot::from_yaml_str(&std::fs::read_to_string(&path)?)?,
        None => default_snapshot(),
    };

    let broker = Arc::new(InMemoryAdapter::new(PROVIDER));
    spawn_ticker(broker.clone());

    let gateway = Gateway::builder()
        .with_config(config)
        .with_generation_builder(Arc::new(DemoBuilder { broker }))
        .with_snapshot(snapshot)
        .build()
        .await?;

    let report = gateway.serve().await?;
    info!(
        clean = report.clean,
        cancelled_requests = report.cancelled_requests,
        "Router stopped"
    );
    Ok(())
}

/// Publish an update for a rotating employee every few seconds.
fn spawn_ticker(broker: Arc<InMemoryAdapter>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        let mut id = 0u64;
        loop {
            ticker.tick().await;
            id = id % 3 + 1;
            let payload = json!({"id": id, "__typename": "Employee"}).to_string();
            if let Err(e) = broker.publish(&format!("employeeUpdated.{}", id), payload.into()).await {
                warn!(error = %e, "Demo publish failed");
            }
        }
    });
}
