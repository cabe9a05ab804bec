//! Generations: immutable runtime state built from one config snapshot.
//!
//! A [`Generation`] bundles everything a request needs: the executor, the
//! event source adapters, the compiled subscription engine, plus the
//! bookkeeping used to retire it (its request tracker and its session
//! registry). Requests capture an `Arc<Generation>` at admission and keep
//! it until they finish, so a swap never changes the state a request sees.

use crate::engine::{EventBinding, SubscriptionEngine};
use crate::error::Result;
use crate::events::AdapterSet;
use crate::executor::{ExecutionContext, Executor};
use crate::lifecycle::{RequestGuard, RequestLifecycleTracker};
use crate::session::{RegistryClosed, SessionHandle, SessionRegistry};
use crate::transport::TransportKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Versioned router configuration as delivered by a config source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Opaque version string, echoed in `X-Router-Config-Version`
    pub version: String,
    #[serde(default)]
    pub event_bindings: Vec<EventBinding>,
    /// Planner input, interpreted by the [`GenerationBuilder`]
    #[serde(default)]
    pub routing: serde_json::Value,
}

impl ConfigSnapshot {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_binding(mut self, binding: EventBinding) -> Self {
        self.event_bindings.push(binding);
        self
    }

    pub fn with_routing(mut self, routing: serde_json::Value) -> Self {
        self.routing = routing;
        self
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| crate::error::Error::Config(format!("invalid config snapshot: {}", e)))
    }
}

/// The parts of a generation that depend on deployment wiring.
pub struct GenerationParts {
    pub executor: Arc<dyn Executor>,
    pub adapters: AdapterSet,
}

/// Builds executor and adapters for a snapshot.
///
/// A failing build leaves the currently active generation untouched.
#[async_trait]
pub trait GenerationBuilder: Send + Sync {
    async fn build(&self, snapshot: &ConfigSnapshot) -> Result<GenerationParts>;
}

/// Lifecycle state of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GenerationState {
    /// Receives all new traffic
    Active = 0,
    /// Replaced; finishing its in-flight non-streaming requests
    Draining = 1,
    /// Fully drained
    Retired = 2,
}

impl GenerationState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => GenerationState::Active,
            1 => GenerationState::Draining,
            _ => GenerationState::Retired,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationState::Active => "active",
            GenerationState::Draining => "draining",
            GenerationState::Retired => "retired",
        }
    }
}

pub struct Generation {
    snapshot: ConfigSnapshot,
    executor: Arc<dyn Executor>,
    adapters: AdapterSet,
    engine: SubscriptionEngine,
    lifecycle: RequestLifecycleTracker,
    sessions: SessionRegistry,
    created_at: Instant,
    state: AtomicU8,
}

impl Generation {
    /// Build a generation. Every binding is validated here.
    pub async fn build(snapshot: ConfigSnapshot, builder: &dyn GenerationBuilder) -> Result<Arc<Self>> {
        let parts = builder.build(&snapshot).await?;
        Self::from_parts(snapshot, parts).map(Arc::new)
    }

    pub fn from_parts(snapshot: ConfigSnapshot, parts: GenerationParts) -> Result<Self> {
        let engine = SubscriptionEngine::new(&snapshot.event_bindings, &parts.adapters, parts.executor.clone())?;
        Ok(Self {
            snapshot,
            executor: parts.executor,
            adapters: parts.adapters,
            engine,
            lifecycle: RequestLifecycleTracker::new(),
            sessions: SessionRegistry::new(),
            created_at: Instant::now(),
            state: AtomicU8::new(GenerationState::Active as u8),
        })
    }

    pub fn version(&self) -> &str {
        &self.snapshot.version
    }

    pub fn snapshot(&self) -> &ConfigSnapshot {
        &self.snapshot
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    pub fn engine(&self) -> &SubscriptionEngine {
        &self.engine
    }

    pub fn lifecycle(&self) -> &RequestLifecycleTracker {
        &self.lifecycle
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> GenerationState {
        GenerationState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: GenerationState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Track a non-streaming request against this generation.
    pub fn begin_request(&self) -> RequestGuard {
        self.lifecycle.begin()
    }

    /// Attach a streaming session to this generation.
    pub fn open_session(&self, kind: TransportKind) -> std::result::Result<SessionHandle, RegistryClosed> {
        self.sessions.register(kind)
    }

    /// Execution context bound to this generation.
    pub fn context(&self, cancellation: CancellationToken) -> ExecutionContext {
        ExecutionContext::new(self.version(), self.adapters.clone(), cancellation)
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("version", &self.version())
            .field("state", &self.state())
            .field("in_flight", &self.lifecycle.in_flight())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
