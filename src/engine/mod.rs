//! Subscription engine.
//!
//! One [`SubscriptionEngine`] is built per generation from the event
//! bindings of its config snapshot. It turns a subscription operation into
//! a lazy [`SubscriptionStream`]: broker payloads are decoded, filtered,
//! checked for non-nullable fields and resolved through the executor one
//! event at a time. Queries and mutations on event-bound fields (publish
//! and request bindings) are answered here as well; everything else goes
//! straight to the executor.

pub mod filter;
pub mod template;

pub use filter::{FilterCondition, FilterPredicate, InCondition};
pub use template::ArgumentTemplate;

use crate::error::{Error, GraphQLError, Result};
use crate::events::{AdapterError, AdapterSet, EventSourceAdapter, EventStream};
use crate::executor::{ExecutionContext, Executor, GraphQLRequest, GraphQLResponse};
use crate::operation::{Field, Operation, OperationKind};
use ahash::AHashMap;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

// ─── Bindings ──────────────────────────────────────────────────────────

/// How an event-bound root field talks to its broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventBindingKind {
    /// `Subscription` field fed by one or more topics
    #[default]
    Subscribe,
    /// `Mutation` field that publishes its arguments
    Publish,
    /// `Query` field answered by a request/reply round trip
    Request,
}

/// Binding of a root field to an event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBinding {
    pub field_name: String,
    #[serde(default)]
    pub kind: EventBindingKind,
    pub provider_id: String,
    /// Topic templates; subscribe bindings may list several
    pub topics: Vec<String>,
    /// Dotted paths that must be present and non-null in every event
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_yaml::with::singleton_map_recursive"
    )]
    pub filter: Option<FilterCondition>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl EventBinding {
    pub fn subscribe(
        field_name: impl Into<String>,
        provider_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            kind: EventBindingKind::Subscribe,
            provider_id: provider_id.into(),
            topics: vec![topic.into()],
            required_fields: Vec::new(),
            filter: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }

    pub fn publish(
        field_name: impl Into<String>,
        provider_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            kind: EventBindingKind::Publish,
            ..Self::subscribe(field_name, provider_id, topic)
        }
    }

    pub fn request(
        field_name: impl Into<String>,
        provider_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            kind: EventBindingKind::Request,
            ..Self::subscribe(field_name, provider_id, topic)
        }
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_required_fields(mut self, fields: &[&str]) -> Self {
        self.required_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_filter(mut self, filter: FilterCondition) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

struct CompiledBinding {
    binding: EventBinding,
    topics: Vec<ArgumentTemplate>,
    required: Vec<Vec<String>>,
    adapter: Arc<dyn EventSourceAdapter>,
}

impl CompiledBinding {
    fn compile(binding: &EventBinding, adapters: &AdapterSet) -> Result<Self> {
        if binding.topics.is_empty() {
            return Err(Error::GenerationBuild(format!(
                "binding for '{}' declares no topics",
                binding.field_name
            )));
        }
        if binding.kind != EventBindingKind::Subscribe && binding.topics.len() > 1 {
            return Err(Error::GenerationBuild(format!(
                "{:?} binding for '{}' must declare exactly one topic",
                binding.kind, binding.field_name
            )));
        }
        let adapter = adapters.get(&binding.provider_id).cloned().ok_or_else(|| {
            Error::GenerationBuild(format!(
                "binding for '{}' references unknown provider '{}'",
                binding.field_name, binding.provider_id
            ))
        })?;
        let topics = binding
            .topics
            .iter()
            .map(|t| ArgumentTemplate::parse(t))
            .collect::<Result<Vec<_>>>()?;
        if let Some(filter) = &binding.filter {
            filter.validate()?;
        }
        let required = binding
            .required_fields
            .iter()
            .map(|p| p.split('.').map(str::to_string).collect())
            .collect();

        Ok(Self {
            binding: binding.clone(),
            topics,
            required,
            adapter,
        })
    }

    fn render_topic(&self, index: usize, field: &Field) -> Result<String> {
        self.topics[index].render(&field.arguments)
    }
}

// ─── Events ────────────────────────────────────────────────────────────

/// Failure of a single subscription event.
///
/// Non-fatal errors are delivered in place of that one event and the
/// stream continues; fatal errors end the stream after being delivered.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubscriptionError {
    #[error("Invalid message received")]
    EventDecode,

    #[error("Cannot return null for non-nullable field '{path}'.")]
    FieldNullability { path: String },

    #[error("{0}")]
    BrokerSubscribe(String),

    #[error("{0}")]
    BrokerTransport(String),

    #[error("{0}")]
    Resolve(String),
}

impl SubscriptionError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SubscriptionError::BrokerSubscribe(_) | SubscriptionError::BrokerTransport(_)
        )
    }

    pub fn to_graphql_error(&self) -> GraphQLError {
        match self {
            SubscriptionError::BrokerSubscribe(_) => {
                GraphQLError::new(self.to_string()).with_code("BROKER_SUBSCRIBE_ERROR")
            }
            SubscriptionError::BrokerTransport(_) => {
                GraphQLError::new(self.to_string()).with_code("BROKER_ERROR")
            }
            _ => GraphQLError::new(self.to_string()),
        }
    }

    /// Response frame for this error: `{"errors":[...],"data":null}`.
    pub fn to_response(&self) -> GraphQLResponse {
        GraphQLResponse::from_event_errors(vec![self.to_graphql_error()])
    }
}

impl From<AdapterError> for SubscriptionError {
    fn from(err: AdapterError) -> Self {
        if err.is_not_found() {
            SubscriptionError::BrokerSubscribe(err.to_string())
        } else {
            SubscriptionError::BrokerTransport(err.to_string())
        }
    }
}

/// One item of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// The `data` object of a `next` frame
    Data(Value),
    Error(SubscriptionError),
}

impl SubscriptionEvent {
    pub fn into_response(self) -> GraphQLResponse {
        match self {
            SubscriptionEvent::Data(data) => GraphQLResponse::from_data(data),
            SubscriptionEvent::Error(err) => err.to_response(),
        }
    }
}

pub type SubscriptionStream = BoxStream<'static, SubscriptionEvent>;

// ─── Engine ────────────────────────────────────────────────────────────

/// Routes operations of one generation to event sources or the executor.
pub struct SubscriptionEngine {
    bindings: AHashMap<String, CompiledBinding>,
    executor: Arc<dyn Executor>,
}

impl SubscriptionEngine {
    /// Validate and compile `bindings`. Any broken binding fails the build.
    pub fn new(bindings: &[EventBinding], adapters: &AdapterSet, executor: Arc<dyn Executor>) -> Result<Self> {
        let mut compiled = AHashMap::with_capacity(bindings.len());
        for binding in bindings {
            let entry = CompiledBinding::compile(binding, adapters)?;
            if compiled.insert(binding.field_name.clone(), entry).is_some() {
                return Err(Error::GenerationBuild(format!(
                    "field '{}' is bound more than once",
                    binding.field_name
                )));
            }
        }
        Ok(Self {
            bindings: compiled,
            executor,
        })
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn binding(&self, field_name: &str) -> Option<&EventBinding> {
        self.bindings.get(field_name).map(|b| &b.binding)
    }

    /// Open a subscription.
    ///
    /// Broker subscriptions are established before this returns, so a
    /// missing stream or consumer surfaces as an error here rather than
    /// as a stream item.
    pub async fn subscribe(
        &self,
        request: &GraphQLRequest,
        operation: &Operation,
        ctx: ExecutionContext,
    ) -> Result<SubscriptionStream> {
        if !operation.is_subscription() {
            return Err(Error::InvalidOperation(format!(
                "expected a subscription, got a {}",
                operation.kind.as_str()
            )));
        }
        let field = operation.root_field()?.clone();

        let Some(compiled) = self.bindings.get(&field.name) else {
            let stream = self
                .executor
                .open_subscription(request, operation, &ctx)
                .await?;
            return Ok(stream
                .map(|item| match item {
                    Ok(data) => SubscriptionEvent::Data(data),
                    Err(err) => SubscriptionEvent::Error(SubscriptionError::Resolve(err.to_string())),
                })
                .boxed());
        };

        if compiled.binding.kind != EventBindingKind::Subscribe {
            return Err(Error::InvalidOperation(format!(
                "field '{}' cannot be subscribed to",
                field.name
            )));
        }

        let filter = compiled
            .binding
            .filter
            .as_ref()
            .map(|f| f.compile(&field.arguments))
            .transpose()?;

        let mut sources: Vec<EventStream> = Vec::with_capacity(compiled.topics.len());
        for index in 0..compiled.topics.len() {
            let topic = compiled.render_topic(index, &field)?;
            debug!(
                field = %field.name,
                provider = %compiled.binding.provider_id,
                topic = %topic,
                "Opening event subscription"
            );
            sources.push(compiled.adapter.subscribe(&topic).await?);
        }
        let source = if sources.len() == 1 {
            sources.remove(0)
        } else {
            stream::select_all(sources).boxed()
        };

        let pipeline = EventPipeline {
            source,
            field,
            filter,
            required: compiled.required.clone(),
            executor: self.executor.clone(),
            ctx,
            finished: false,
        };

        Ok(stream::unfold(pipeline, |mut pipeline| async move {
            let event = pipeline.next_event().await?;
            Some((event, pipeline))
        })
        .boxed())
    }

    /// Execute a query or mutation.
    ///
    /// Operations whose root fields are all event-bound are answered by
    /// publishing or by request/reply; the rest go to the executor.
    pub async fn execute(
        &self,
        request: &GraphQLRequest,
        operation: &Operation,
        ctx: &ExecutionContext,
    ) -> Result<GraphQLResponse> {
        let bound = operation
            .fields
            .iter()
            .filter(|f| self.bindings.contains_key(&f.name))
            .count();

        let work = async {
            if bound == 0 {
                return self.executor.execute(request, operation, ctx).await;
            }
            if bound != operation.fields.len() {
                return Err(Error::InvalidOperation(
                    "event-driven fields cannot be combined with other root fields".into(),
                ));
            }
            self.execute_bound(operation, ctx).await
        };

        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => Err(Error::FetchFailed("request cancelled".into())),
            result = work => result,
        }
    }

    async fn execute_bound(&self, operation: &Operation, ctx: &ExecutionContext) -> Result<GraphQLResponse> {
        let mut data = Map::with_capacity(operation.fields.len());
        let mut errors = Vec::new();

        for field in &operation.fields {
            let Some(compiled) = self.bindings.get(&field.name) else {
                continue;
            };
            let value = match (compiled.binding.kind, operation.kind) {
                (EventBindingKind::Publish, OperationKind::Mutation) => {
                    self.publish(compiled, field).await
                }
                (EventBindingKind::Request, OperationKind::Query) => {
                    self.request(compiled, field, ctx).await
                }
                (kind, op) => {
                    return Err(Error::InvalidOperation(format!(
                        "field '{}' is a {:?} binding and cannot be used in a {}",
                        field.name,
                        kind,
                        op.as_str()
                    )))
                }
            };

            match value {
                Ok(value) => {
                    data.insert(field.response_key().to_string(), value);
                }
                Err(err) => {
                    let mut error = err.to_graphql_error();
                    error.path = Some(vec![json!(field.response_key())]);
                    errors.push(error);
                    data.insert(field.response_key().to_string(), Value::Null);
                }
            }
        }

        Ok(GraphQLResponse {
            errors,
            data: Some(Value::Object(data)),
            extensions: None,
        })
    }

    async fn publish(&self, compiled: &CompiledBinding, field: &Field) -> Result<Value> {
        let topic = compiled.render_topic(0, field)?;
        let payload = serde_json::to_vec(&field.arguments)?;
        match compiled.adapter.publish(&topic, Bytes::from(payload)).await {
            Ok(()) => Ok(field.project(&json!({"success": true}))),
            Err(err) => {
                warn!(topic = %topic, error = %err, "Publish failed");
                Ok(field.project(&json!({"success": false})))
            }
        }
    }

    async fn request(&self, compiled: &CompiledBinding, field: &Field, ctx: &ExecutionContext) -> Result<Value> {
        let topic = compiled.render_topic(0, field)?;
        let payload = serde_json::to_vec(&field.arguments)?;
        let reply = compiled
            .adapter
            .request(&topic, Bytes::from(payload), compiled.binding.request_timeout())
            .await?;
        let entity: Value = serde_json::from_slice(&reply)
            .map_err(|_| Error::Execution(SubscriptionError::EventDecode.to_string()))?;
        self.executor.resolve_event(field, entity, ctx).await
    }
}

// ─── Pipeline ──────────────────────────────────────────────────────────

struct EventPipeline {
    source: EventStream,
    field: Field,
    filter: Option<FilterPredicate>,
    required: Vec<Vec<String>>,
    executor: Arc<dyn Executor>,
    ctx: ExecutionContext,
    finished: bool,
}

impl EventPipeline {
    async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        if self.finished {
            return None;
        }

        loop {
            let payload = match self.source.next().await? {
                Ok(payload) => payload,
                Err(err) => {
                    self.finished = true;
                    warn!(field = %self.field.name, error = %err, "Event source failed");
                    return Some(SubscriptionEvent::Error(err.into()));
                }
            };

            let entity: Value = match serde_json::from_slice(&payload) {
                Ok(entity @ Value::Object(_)) => entity,
                _ => {
                    debug!(field = %self.field.name, "Dropping undecodable event");
                    return Some(SubscriptionEvent::Error(SubscriptionError::EventDecode));
                }
            };

            if let Some(filter) = &self.filter {
                if !filter.matches(&entity) {
                    trace!(field = %self.field.name, "Event filtered out");
                    continue;
                }
            }

            if let Some(missing) = self.missing_required(&entity) {
                return Some(SubscriptionEvent::Error(SubscriptionError::FieldNullability {
                    path: format!("Subscription.{}.{}", self.field.name, missing),
                }));
            }

            return Some(
                match self
                    .executor
                    .resolve_event(&self.field, entity, &self.ctx)
                    .await
                {
                    Ok(value) => {
                        let mut data = Map::with_capacity(1);
                        data.insert(self.field.response_key().to_string(), value);
                        SubscriptionEvent::Data(Value::Object(data))
                    }
                    Err(err) => SubscriptionEvent::Error(SubscriptionError::Resolve(err.to_string())),
                },
            );
        }
    }

    fn missing_required(&self, entity: &Value) -> Option<String> {
        self.required.iter().find_map(|path| {
            let present = path
                .iter()
                .try_fold(entity, |current, key| current.as_object()?.get(key))
                .is_some_and(|v| !v.is_null());
            (!present).then(|| path.join("."))
        })
    }
}
