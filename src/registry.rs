//! Generation registry: atomic config swap, drain and shutdown.
//!
//! The active generation sits behind an [`ArcSwap`] so admission is a
//! single lock-free load. Swaps are serialized by an async mutex; each one
//! builds the next generation off to the side, publishes it with one atomic
//! store, then force-closes the previous generation's streaming sessions and
//! leaves its non-streaming requests to finish on their own.

use crate::error::{Error, Result};
use crate::generation::{ConfigSnapshot, Generation, GenerationBuilder, GenerationState};
use crate::lifecycle::RequestGuard;
use crate::session::SessionHandle;
use crate::transport::TransportKind;
use arc_swap::ArcSwap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long cancelled requests get to write their failure before the
/// report is returned.
const CANCEL_SETTLE: Duration = Duration::from_secs(1);

/// A non-streaming request admitted against a generation.
pub struct Admission {
    generation: Arc<Generation>,
    guard: RequestGuard,
}

impl Admission {
    pub fn generation(&self) -> &Arc<Generation> {
        &self.generation
    }

    /// Cancelled when the shutdown grace period expires.
    pub fn token(&self) -> &CancellationToken {
        self.guard.token()
    }
}

/// A streaming session admitted against a generation.
pub struct SessionAdmission {
    generation: Arc<Generation>,
    handle: SessionHandle,
}

impl SessionAdmission {
    pub fn generation(&self) -> &Arc<Generation> {
        &self.generation
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Cancelled when the generation is retired or the gateway shuts down.
    pub fn token(&self) -> &CancellationToken {
        self.handle.token()
    }
}

/// Result of [`GenerationRegistry::swap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    Swapped {
        previous: String,
        current: String,
        closed_sessions: usize,
    },
    /// The snapshot carried the active version
    Unchanged,
}

/// Result of [`GenerationRegistry::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every in-flight request finished inside the grace period
    pub clean: bool,
    /// Requests whose context was cancelled at the deadline
    pub cancelled_requests: usize,
    pub closed_sessions: usize,
}

pub struct GenerationRegistry {
    active: ArcSwap<Generation>,
    draining: Mutex<Vec<Arc<Generation>>>,
    builder: Arc<dyn GenerationBuilder>,
    swap_lock: tokio::sync::Mutex<()>,
    accepting: AtomicBool,
    grace_period: Duration,
}

impl GenerationRegistry {
    /// Build the initial generation. Fails if the snapshot cannot be built.
    pub async fn new(
        initial: ConfigSnapshot,
        builder: Arc<dyn GenerationBuilder>,
        grace_period: Duration,
    ) -> Result<Arc<Self>> {
        let generation = Generation::build(initial, builder.as_ref()).await?;
        info!(version = %generation.version(), "Initial generation active");
        Ok(Arc::new(Self {
            active: ArcSwap::new(generation),
            draining: Mutex::new(Vec::new()),
            builder,
            swap_lock: tokio::sync::Mutex::new(()),
            accepting: AtomicBool::new(true),
            grace_period,
        }))
    }

    pub fn current(&self) -> Arc<Generation> {
        self.active.load_full()
    }

    pub fn current_version(&self) -> String {
        self.active.load().version().to_string()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Replaced generations that still have requests in flight.
    pub fn draining_count(&self) -> usize {
        let mut draining = self.draining.lock();
        draining.retain(|g| g.state() == GenerationState::Draining);
        draining.len()
    }

    /// Admit a non-streaming request against the active generation.
    pub fn begin_request(&self) -> Result<Admission> {
        loop {
            if !self.is_accepting() {
                return Err(Error::ShuttingDown);
            }
            let generation = self.current();
            let guard = generation.begin_request();
            // Counted before the pointer moved: the drain will see us.
            if Arc::ptr_eq(&generation, &*self.active.load()) {
                return Ok(Admission { generation, guard });
            }
            debug!(version = %generation.version(), "Generation swapped during admission, retrying");
        }
    }

    /// Admit a streaming session against the active generation.
    pub fn open_session(&self, kind: TransportKind) -> Result<SessionAdmission> {
        loop {
            if !self.is_accepting() {
                return Err(Error::ShuttingDown);
            }
            let generation = self.current();
            match generation.open_session(kind) {
                Ok(handle) => return Ok(SessionAdmission { generation, handle }),
                Err(_) if Arc::ptr_eq(&generation, &*self.active.load()) => {
                    // Sessions of the active generation only close on shutdown.
                    return Err(Error::ShuttingDown);
                }
                Err(_) => continue,
            }
        }
    }

    /// Replace the active generation with one built from `snapshot`.
    ///
    /// `preceding_version` is the version the source believes is active; a
    /// mismatch is logged and the swap proceeds. Build failures leave the
    /// active generation untouched.
    pub async fn swap(
        self: &Arc<Self>,
        snapshot: ConfigSnapshot,
        preceding_version: Option<&str>,
    ) -> Result<SwapOutcome> {
        let _serialized = self.swap_lock.lock().await;
        if !self.is_accepting() {
            return Err(Error::ShuttingDown);
        }

        let current = self.current();
        if let Some(preceding) = preceding_version {
            if preceding != current.version() {
                warn!(
                    expected = %preceding,
                    active = %current.version(),
                    "Config update does not follow the active version"
                );
            }
        }
        if snapshot.version == current.version() {
            info!(version = %snapshot.version, "Config version unchanged, skipping swap");
            return Ok(SwapOutcome::Unchanged);
        }

        let next = Generation::build(snapshot, self.builder.as_ref())
            .await
            .map_err(|e| {
                error!(error = %e, active = %current.version(), "Failed to build generation, keeping active one");
                e
            })?;

        let previous = self.active.swap(next.clone());
        previous.set_state(GenerationState::Draining);
        self.draining.lock().push(previous.clone());
        let closed_sessions = previous.sessions().close_all();

        info!(
            previous = %previous.version(),
            current = %next.version(),
            closed_sessions,
            in_flight = previous.lifecycle().in_flight(),
            "Swapped active generation"
        );

        self.spawn_reaper(previous.clone());

        Ok(SwapOutcome::Swapped {
            previous: previous.version().to_string(),
            current: next.version().to_string(),
            closed_sessions,
        })
    }

    fn spawn_reaper(self: &Arc<Self>, generation: Arc<Generation>) {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            generation.lifecycle().wait_idle(None).await;
            generation.sessions().wait_empty(Duration::from_secs(5)).await;
            generation.set_state(GenerationState::Retired);
            info!(version = %generation.version(), "Generation retired");
            if let Some(registry) = registry.upgrade() {
                registry.draining_count();
            }
        });
    }

    /// Stop admitting work and drain every generation.
    ///
    /// Streaming sessions are closed at once. Non-streaming requests get
    /// the grace period; whatever is left afterwards is cancelled.
    pub async fn shutdown(&self) -> ShutdownReport {
        let _serialized = self.swap_lock.lock().await;
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!(grace_period = ?self.grace_period, "Shutting down generations");
        }

        let active = self.current();
        active.set_state(GenerationState::Draining);
        let mut generations = vec![active];
        generations.extend(self.draining.lock().iter().cloned());

        let closed_sessions: usize = generations
            .iter()
            .map(|g| g.sessions().close_all())
            .sum();

        let drained = join_all(
            generations
                .iter()
                .map(|g| g.lifecycle().wait_idle(Some(self.grace_period))),
        )
        .await;

        let mut cancelled_requests = 0;
        if drained.iter().all(|idle| *idle) {
            info!("All in-flight requests completed");
        } else {
            for generation in &generations {
                let remaining = generation.lifecycle().in_flight();
                if remaining > 0 {
                    warn!(
                        version = %generation.version(),
                        remaining,
                        "Grace period elapsed, cancelling in-flight requests"
                    );
                    cancelled_requests += remaining;
                    generation.lifecycle().cancel_in_flight();
                }
            }
            join_all(
                generations
                    .iter()
                    .map(|g| g.lifecycle().wait_idle(Some(CANCEL_SETTLE))),
            )
            .await;
        }

        for generation in &generations {
            generation.set_state(GenerationState::Retired);
        }

        ShutdownReport {
            clean: cancelled_requests == 0,
            cancelled_requests,
            closed_sessions,
        }
    }
}

impl std::fmt::Debug for GenerationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationRegistry")
            .field("active", &self.current())
            .field("draining", &self.draining.lock().len())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}
