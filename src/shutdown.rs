//! Graceful shutdown support for the gateway.
//!
//! A shutdown trigger (OS signal or [`ShutdownTrigger`]) stops the listener
//! and starts the registry's drain at the same time: streaming sessions are
//! closed at once, in-flight requests get the grace period and are then
//! cancelled.
//!
//! # Example
//!
//! ```rust,no_run
//! use graphql_stream_gateway::shutdown::{run_with_graceful_shutdown, os_signal_shutdown};
//! # use graphql_stream_gateway::registry::GenerationRegistry;
//! # use std::sync::Arc;
//!
//! # async fn example(registry: Arc<GenerationRegistry>, app: axum::Router) -> std::io::Result<()> {
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3002").await?;
//! let report = run_with_graceful_shutdown(listener, app, registry, os_signal_shutdown()).await?;
//! assert!(report.clean);
//! # Ok(())
//! # }
//! ```

use crate::registry::{GenerationRegistry, ShutdownReport};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Programmatic shutdown trigger.
#[derive(Debug, Clone, Default)]
pub struct ShutdownTrigger {
    token: CancellationToken,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once [`ShutdownTrigger::trigger`] was called.
    pub fn triggered(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.token.clone();
        async move { token.cancelled().await }
    }
}

/// Create a future that completes on SIGTERM or SIGINT (Ctrl+C).
#[cfg(unix)]
pub async fn signal_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers: {}", e);
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT (Ctrl+C)");
        }
    }
}

/// Create a future that completes on Ctrl+C.
#[cfg(not(unix))]
pub async fn signal_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Create a combined shutdown signal that triggers on OS signals.
pub fn os_signal_shutdown() -> impl Future<Output = ()> + Send + 'static {
    async {
        signal_shutdown().await;
    }
}

/// Serve `app` until `signal` completes, then drain `registry`.
///
/// The listener stops accepting as soon as `signal` fires; the returned
/// report describes how the drain went.
pub async fn run_with_graceful_shutdown<F>(
    listener: tokio::net::TcpListener,
    app: axum::Router,
    registry: Arc<GenerationRegistry>,
    signal: F,
) -> std::io::Result<ShutdownReport>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (report_tx, report_rx) = oneshot::channel();
    let draining = registry.clone();
    let stop = async move {
        signal.await;
        info!(version = %draining.current_version(), "Initiating graceful shutdown...");
        tokio::spawn(async move {
            let report = draining.shutdown().await;
            let _ = report_tx.send(report);
        });
    };

    axum::serve(listener, app).with_graceful_shutdown(stop).await?;

    let report = match report_rx.await {
        Ok(report) => report,
        // The server stopped without the signal firing.
        Err(_) => registry.shutdown().await,
    };

    if report.clean {
        info!(closed_sessions = report.closed_sessions, "Graceful shutdown complete");
    } else {
        warn!(
            cancelled_requests = report.cancelled_requests,
            closed_sessions = report.closed_sessions,
            "Shutdown grace period exceeded"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger() {
        let trigger = ShutdownTrigger::new();
        assert!(!trigger.is_triggered());

        let waiter = tokio::spawn(trigger.triggered());
        trigger.clone().trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(trigger.is_triggered());
    }
}
