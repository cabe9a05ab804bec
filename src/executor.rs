//! The GraphQL execution collaborator.
//!
//! Parsing, planning and field resolution live behind [`Executor`]. The
//! runtime only decides *which* generation's executor runs a request and
//! hands it an [`ExecutionContext`] carrying that generation's version,
//! adapters and the request's cancellation token.

use crate::error::{Error, GraphQLError, Result};
use crate::events::AdapterSet;
use crate::operation::{Field, Operation};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// GraphQL-over-HTTP request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(
        default,
        rename = "operationName",
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Read the operation this request selects.
    pub fn operation(&self) -> Result<Operation> {
        Operation::parse(
            &self.query,
            self.operation_name.as_deref(),
            self.variables.as_ref(),
        )
    }
}

/// GraphQL response body.
///
/// `errors` serializes first so per-event error frames read
/// `{"errors":[...],"data":null}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLResponse {
    pub fn from_data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    /// Request-level failure: no `data` key at all.
    pub fn from_errors(errors: Vec<GraphQLError>) -> Self {
        Self {
            errors,
            ..Default::default()
        }
    }

    /// Failure of one event inside a stream: `data` is explicitly null.
    pub fn from_event_errors(errors: Vec<GraphQLError>) -> Self {
        Self {
            errors,
            data: Some(Value::Null),
            extensions: None,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self::from_errors(vec![err.to_graphql_error()])
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Per-request context handed to the executor.
#[derive(Clone)]
pub struct ExecutionContext {
    version: String,
    adapters: AdapterSet,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(version: impl Into<String>, adapters: AdapterSet, cancellation: CancellationToken) -> Self {
        Self {
            version: version.into(),
            adapters,
            cancellation,
        }
    }

    /// Version of the generation the request is bound to.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    /// Cancelled when the shutdown grace period expires or the subscription
    /// owning this context is torn down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Lazy sequence of subscription payloads produced by the executor itself
/// (subgraph-backed subscriptions). Each item is the `data` object.
pub type ResponseStream = BoxStream<'static, Result<Value>>;

/// GraphQL engine consumed by the runtime.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute a query or mutation.
    async fn execute(
        &self,
        request: &GraphQLRequest,
        operation: &Operation,
        ctx: &ExecutionContext,
    ) -> Result<GraphQLResponse>;

    /// Open a subscription the executor serves without an event binding.
    async fn open_subscription(
        &self,
        _request: &GraphQLRequest,
        operation: &Operation,
        _ctx: &ExecutionContext,
    ) -> Result<ResponseStream> {
        Err(Error::InvalidOperation(format!(
            "Cannot query field \"{}\" on type \"Subscription\".",
            operation.root_field()?.name
        )))
    }

    /// Resolve an entity delivered by an event source into the value of
    /// `field`. The default projects the entity onto the field's selection.
    async fn resolve_event(
        &self,
        field: &Field,
        entity: Value,
        _ctx: &ExecutionContext,
    ) -> Result<Value> {
        Ok(field.project(&entity))
    }
}
