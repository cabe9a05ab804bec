//! # graphql-stream-gateway
//!
//! The live-traffic runtime of a GraphQL federation gateway: streaming
//! subscriptions over several transports bridged to event brokers, and
//! generation-based config hot reload that never mixes two configs inside
//! one request.
//!
//! ## Features
//!
//! - **Transports**: WebSocket (`graphql-transport-ws` and legacy
//!   `graphql-ws`), Server-Sent Events, multipart HTTP and subscribe-once
//! - **Event-driven subscriptions**: root fields bound to broker topics,
//!   argument templates, declarative filters and nullability checks
//! - **Hot reload**: atomic generation swap, hard close of streaming
//!   sessions, drain of in-flight requests on the generation that admitted
//!   them
//! - **Graceful shutdown** with a grace period and cancellation of whatever
//!   is left
//! - **Batching**: JSON array bodies fanned out over the executor
//!
//! ## Main Components
//!
//! - [`Gateway`] / [`GatewayBuilder`]: entry point, serving with graceful shutdown
//! - [`GenerationRegistry`]: active generation, swap and shutdown protocol
//! - [`SubscriptionEngine`]: operations bound to [`EventSourceAdapter`]s
//! - [`Executor`]: the GraphQL engine consumed by the runtime
//!
//! ## Example
//!
//! ```rust,no_run
//! use graphql_stream_gateway::{ConfigSnapshot, Gateway, GatewayConfig};
//! # use graphql_stream_gateway::GenerationBuilder;
//! # use std::sync::Arc;
//!
//! # async fn example(builder: Arc<dyn GenerationBuilder>) -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = Gateway::builder()
//!     .with_config(GatewayConfig::from_yaml_file("router.yaml")?)
//!     .with_generation_builder(builder)
//!     .with_snapshot(ConfigSnapshot::new("boot"))
//!     .build()
//!     .await?;
//!
//! let report = gateway.serve().await?;
//! println!("clean shutdown: {}", report.clean);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod config_source;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod gateway;
pub mod generation;
pub mod health;
pub mod lifecycle;
pub mod operation;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod shutdown;
pub mod transport;

pub use config::{
    BatchingConfig, GatewayConfig, SecurityConfig, ShutdownConfig, SubscriptionConfig,
    CONFIG_VERSION_HEADER,
};
pub use config_source::{ConfigSource, ManualConfigSource, StaticConfigSource, UpdateCallback};
pub use engine::{
    EventBinding, EventBindingKind, FilterCondition, SubscriptionEngine, SubscriptionError,
    SubscriptionEvent,
};
pub use error::{Error, GraphQLError, Result};
pub use events::{AdapterError, AdapterSet, EventSourceAdapter, EventStream, InMemoryAdapter};
pub use executor::{ExecutionContext, Executor, GraphQLRequest, GraphQLResponse};
pub use gateway::{Gateway, GatewayBuilder};
pub use generation::{ConfigSnapshot, Generation, GenerationBuilder, GenerationParts, GenerationState};
pub use health::{ComponentHealth, HealthResponse, HealthState, HealthStatus};
pub use lifecycle::{RequestGuard, RequestLifecycleTracker};
pub use operation::{Field, Operation, OperationKind};
pub use registry::{GenerationRegistry, ShutdownReport, SwapOutcome};
pub use runtime::ServeMux;
pub use shutdown::{os_signal_shutdown, run_with_graceful_shutdown, ShutdownTrigger};
pub use transport::{Subscription, SubscriptionState, TransportKind};
