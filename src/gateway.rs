//! Gateway builder and main orchestration

use crate::config::GatewayConfig;
use crate::config_source::{attach, ConfigSource, StaticConfigSource};
use crate::error::{Error, Result};
use crate::generation::{ConfigSnapshot, GenerationBuilder};
use crate::registry::{GenerationRegistry, ShutdownReport};
use crate::runtime::ServeMux;
use crate::shutdown::{os_signal_shutdown, run_with_graceful_shutdown};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Main Gateway struct - entry point for the library
///
/// Owns the generation registry and the HTTP surface built on it. It is
/// created via the [`GatewayBuilder`].
///
/// # Example
///
/// ```rust,no_run
/// use graphql_stream_gateway::{ConfigSnapshot, Gateway, GatewayConfig};
/// # use graphql_stream_gateway::generation::GenerationBuilder;
/// # use std::sync::Arc;
///
/// # async fn example(builder: Arc<dyn GenerationBuilder>) -> Result<(), Box<dyn std::error::Error>> {
/// let gateway = Gateway::builder()
///     .with_config(GatewayConfig::default())
///     .with_generation_builder(builder)
///     .with_snapshot(ConfigSnapshot::new("v1"))
///     .build()
///     .await?;
///
/// gateway.serve().await?;
/// # Ok(())
/// # }
/// ```
pub struct Gateway {
    mux: ServeMux,
}

impl Gateway {
    /// Create a new gateway builder
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    pub fn mux(&self) -> &ServeMux {
        &self.mux
    }

    pub fn registry(&self) -> &Arc<GenerationRegistry> {
        self.mux.registry()
    }

    pub fn config(&self) -> &GatewayConfig {
        self.mux.config()
    }

    /// Convert gateway into Axum router
    pub fn into_router(self) -> Router {
        self.mux.into_router()
    }

    /// Serve on the configured address until an OS signal arrives (when
    /// `shutdown.handle_signals` is set), then drain.
    pub async fn serve(self) -> Result<ShutdownReport> {
        let listener = TcpListener::bind(&self.config().listen_addr).await?;
        if self.config().shutdown.handle_signals {
            self.serve_with_listener(listener, os_signal_shutdown()).await
        } else {
            self.serve_with_listener(listener, std::future::pending()).await
        }
    }

    /// Serve on `listener` until `shutdown_signal` completes, then drain.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, shutdown_signal: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let registry = self.registry().clone();
        if let Ok(addr) = listener.local_addr() {
            info!(
                "Gateway server listening on {} (config version {})",
                addr,
                registry.current_version()
            );
        }
        let app = self.into_router();
        Ok(run_with_graceful_shutdown(listener, app, registry, shutdown_signal).await?)
    }
}

/// Builder for creating a Gateway
///
/// A generation builder is required. The first snapshot comes from the
/// config source if one is set, otherwise from [`GatewayBuilder::with_snapshot`].
pub struct GatewayBuilder {
    config: GatewayConfig,
    generation_builder: Option<Arc<dyn GenerationBuilder>>,
    config_source: Option<Arc<dyn ConfigSource>>,
    snapshot: Option<ConfigSnapshot>,
}

impl GatewayBuilder {
    /// Create a new gateway builder
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            generation_builder: None,
            config_source: None,
            snapshot: None,
        }
    }

    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Set how generations are constructed from snapshots.
    pub fn with_generation_builder(mut self, builder: Arc<dyn GenerationBuilder>) -> Self {
        self.generation_builder = Some(builder);
        self
    }

    /// Set the source of config snapshots. Its updates become swaps.
    pub fn with_config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = Some(source);
        self
    }

    /// Boot from a fixed snapshot.
    pub fn with_snapshot(mut self, snapshot: ConfigSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Build the initial generation and wire the config source.
    pub async fn build(self) -> Result<Gateway> {
        self.config.validate()?;
        let builder = self
            .generation_builder
            .ok_or_else(|| Error::Config("a generation builder is required".into()))?;

        let source: Arc<dyn ConfigSource> = match (self.config_source, self.snapshot) {
            (Some(source), _) => source,
            (None, Some(snapshot)) => Arc::new(StaticConfigSource::new(snapshot)),
            (None, None) => return Err(Error::Config("no config snapshot or config source".into())),
        };

        let initial = source.current_config().await?;
        let registry = GenerationRegistry::new(initial, builder, self.config.shutdown.grace_period()).await?;
        attach(&registry, source.as_ref());

        Ok(Gateway {
            mux: ServeMux::new(registry, self.config),
        })
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
