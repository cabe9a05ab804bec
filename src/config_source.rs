//! Config sources feeding snapshots to the generation registry.

use crate::error::Result;
use crate::generation::ConfigSnapshot;
use crate::registry::GenerationRegistry;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Receives `(snapshot, preceding_version)`. An error means the snapshot
/// was not applied; the source decides whether to retry.
pub type UpdateCallback =
    Arc<dyn Fn(ConfigSnapshot, Option<String>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Box an async closure into an [`UpdateCallback`].
pub fn update_callback<F, Fut>(f: F) -> UpdateCallback
where
    F: Fn(ConfigSnapshot, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(
        move |snapshot: ConfigSnapshot, preceding: Option<String>| -> BoxFuture<'static, Result<()>> {
            Box::pin(f(snapshot, preceding))
        },
    )
}

#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Snapshot used to boot the first generation.
    async fn current_config(&self) -> Result<ConfigSnapshot>;

    /// Register for subsequent snapshots.
    fn subscribe(&self, callback: UpdateCallback);
}

/// Wire a source's updates into registry swaps.
pub fn attach(registry: &Arc<GenerationRegistry>, source: &dyn ConfigSource) {
    let registry = registry.clone();
    source.subscribe(update_callback(move |snapshot, preceding| {
        let registry = registry.clone();
        async move {
            registry
                .swap(snapshot, preceding.as_deref())
                .await
                .map(|_| ())
        }
    }));
}

/// A source that never changes.
pub struct StaticConfigSource {
    snapshot: ConfigSnapshot,
}

impl StaticConfigSource {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn current_config(&self) -> Result<ConfigSnapshot> {
        Ok(self.snapshot.clone())
    }

    fn subscribe(&self, _callback: UpdateCallback) {}
}

/// A source updated programmatically through [`ManualConfigSource::publish`].
pub struct ManualConfigSource {
    current: Mutex<ConfigSnapshot>,
    callbacks: Mutex<Vec<UpdateCallback>>,
}

impl ManualConfigSource {
    pub fn new(initial: ConfigSnapshot) -> Self {
        Self {
            current: Mutex::new(initial),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn version(&self) -> String {
        self.current.lock().version.clone()
    }

    /// Deliver `snapshot` to every subscriber.
    ///
    /// The source only advances to `snapshot` when all subscribers applied
    /// it; the first error is returned.
    pub async fn publish(&self, snapshot: ConfigSnapshot) -> Result<()> {
        let preceding = self.version();
        let callbacks: Vec<UpdateCallback> = self.callbacks.lock().clone();
        info!(
            version = %snapshot.version,
            preceding = %preceding,
            subscribers = callbacks.len(),
            "Publishing config snapshot"
        );

        for callback in callbacks {
            if let Err(e) = callback(snapshot.clone(), Some(preceding.clone())).await {
                warn!(version = %snapshot.version, error = %e, "Config snapshot rejected");
                return Err(e);
            }
        }
        *self.current.lock() = snapshot;
        Ok(())
    }
}

#[async_trait]
impl ConfigSource for ManualConfigSource {
    async fn current_config(&self) -> Result<ConfigSnapshot> {
        Ok(self.current.lock().clone())
    }

    fn subscribe(&self, callback: UpdateCallback) {
        self.callbacks.lock().push(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_manual_source_delivers_preceding_version() {
        let source = ManualConfigSource::new(ConfigSnapshot::new("v1"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            source.subscribe(update_callback(move |snapshot: ConfigSnapshot, preceding| {
                seen.lock().push((snapshot.version, preceding));
                async { Ok(()) }
            }));
        }

        source.publish(ConfigSnapshot::new("v2")).await.unwrap();
        source.publish(ConfigSnapshot::new("v3")).await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                ("v2".to_string(), Some("v1".to_string())),
                ("v3".to_string(), Some("v2".to_string())),
            ]
        );
        assert_eq!(source.current_config().await.unwrap().version, "v3");
    }

    #[tokio::test]
    async fn test_rejected_snapshot_is_not_adopted() {
        let source = ManualConfigSource::new(ConfigSnapshot::new("v1"));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            source.subscribe(update_callback(move |_snapshot, _preceding| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::GenerationBuild("bad routing".into())) }
            }));
        }

        assert!(source.publish(ConfigSnapshot::new("v2")).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.version(), "v1");
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticConfigSource::new(ConfigSnapshot::new("boot"));
        assert_eq!(source.current_config().await.unwrap().version, "boot");
    }
}
