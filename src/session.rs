//! Registry of live streaming sessions.
//!
//! Every subscription transport (a WebSocket connection, an SSE, multipart
//! or subscribe-once response) registers here for the lifetime of its
//! stream. When a generation is retired the registry cancels every token it
//! handed out; transports treat that as a forced close.

use crate::transport::TransportKind;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Streaming sessions bound to one generation.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    sessions: Mutex<SessionTable>,
    empty: Notify,
}

#[derive(Default)]
struct SessionTable {
    closed: bool,
    entries: AHashMap<u64, SessionEntry>,
}

struct SessionEntry {
    kind: TransportKind,
    token: CancellationToken,
}

/// Returned by [`SessionRegistry::register`] after the registry was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryClosed;

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session.
    ///
    /// Fails once [`Self::close_all`] has run, so a session can never attach
    /// to a generation that is already being torn down.
    pub fn register(&self, kind: TransportKind) -> Result<SessionHandle, RegistryClosed> {
        let mut table = self.inner.sessions.lock();
        if table.closed {
            return Err(RegistryClosed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        table.entries.insert(
            id,
            SessionEntry {
                kind,
                token: token.clone(),
            },
        );
        drop(table);

        debug!(session_id = id, transport = kind.as_str(), "Session registered");
        Ok(SessionHandle {
            id,
            kind,
            token,
            registry: self.clone(),
        })
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.inner.sessions.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open sessions using `kind`.
    pub fn count(&self, kind: TransportKind) -> usize {
        self.inner
            .sessions
            .lock()
            .entries
            .values()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sessions.lock().closed
    }

    /// Refuse new sessions and force-close every open one. Idempotent.
    ///
    /// Returns how many sessions were signalled by this call.
    pub fn close_all(&self) -> usize {
        let tokens: Vec<CancellationToken> = {
            let mut table = self.inner.sessions.lock();
            table.closed = true;
            table.entries.values().map(|e| e.token.clone()).collect()
        };
        let mut signalled = 0;
        for token in tokens {
            if !token.is_cancelled() {
                token.cancel();
                signalled += 1;
            }
        }
        signalled
    }

    /// Wait until every session has deregistered, up to `timeout`.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return true;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return self.is_empty(),
            }
        }
    }

    fn remove(&self, id: u64) {
        let now_empty = {
            let mut table = self.inner.sessions.lock();
            table.entries.remove(&id);
            table.entries.is_empty()
        };
        if now_empty {
            self.inner.empty.notify_waiters();
        }
    }
}

/// Membership of one session; deregisters on drop.
pub struct SessionHandle {
    id: u64,
    kind: TransportKind,
    token: CancellationToken,
    registry: SessionRegistry,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Cancelled when the owning generation force-closes its sessions.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        debug!(session_id = self.id, "Session deregistered");
    }
}
