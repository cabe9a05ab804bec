//! Health check endpoints for container orchestration.
//!
//! # Endpoints
//!
//! - `/health` - Liveness probe: Returns 200 while the process serves
//! - `/ready` - Readiness probe: Returns 200 while the gateway admits new
//!   work, 503 once shutdown has begun
//!
//! Both report the active config version and how many replaced generations
//! are still draining.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::registry::GenerationRegistry;

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall health status
    pub status: HealthStatus,
    /// Optional message with details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Version of the active generation
    #[serde(rename = "configVersion", skip_serializing_if = "Option::is_none")]
    pub config_version: Option<String>,
    /// Replaced generations with requests still in flight
    #[serde(rename = "drainingGenerations", default)]
    pub draining_generations: usize,
    /// Individual component checks
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub checks: Vec<ComponentHealth>,
}

/// Health status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Service is healthy
    Healthy,
    /// Service is degraded but operational
    Degraded,
    /// Service is unhealthy
    Unhealthy,
}

/// Individual component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthResponse {
    fn with_status(status: HealthStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            config_version: None,
            draining_generations: 0,
            checks: Vec::new(),
        }
    }

    /// Create a healthy response
    pub fn healthy() -> Self {
        Self::with_status(HealthStatus::Healthy, None)
    }

    /// Create a healthy response with a message
    pub fn healthy_with_message(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Healthy, Some(message.into()))
    }

    /// Create an unhealthy response
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Create a degraded response
    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Degraded, Some(message.into()))
    }

    /// Attach the registry's view of generations.
    pub fn with_generations(mut self, registry: &GenerationRegistry) -> Self {
        self.config_version = Some(registry.current_version());
        self.draining_generations = registry.draining_count();
        self
    }

    /// Add a component check
    pub fn with_check(mut self, check: ComponentHealth) -> Self {
        // Update overall status based on component
        match (&self.status, check.status) {
            (HealthStatus::Healthy, HealthStatus::Unhealthy) => {
                self.status = HealthStatus::Unhealthy;
            }
            (HealthStatus::Healthy, HealthStatus::Degraded) => {
                self.status = HealthStatus::Degraded;
            }
            (HealthStatus::Degraded, HealthStatus::Unhealthy) => {
                self.status = HealthStatus::Unhealthy;
            }
            _ => {}
        }
        self.checks.push(check);
        self
    }
}

impl IntoResponse for HealthResponse {
    fn into_response(self) -> Response {
        let status_code = match self.status {
            HealthStatus::Healthy => StatusCode::OK,
            HealthStatus::Degraded => StatusCode::OK, // Still OK but with warning
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status_code, Json(self)).into_response()
    }
}

/// Shared state for health check handlers
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<GenerationRegistry>,
}

impl HealthState {
    pub fn new(registry: Arc<GenerationRegistry>) -> Self {
        Self { registry }
    }
}

/// Liveness probe handler - `/health`
pub async fn health_handler(State(state): State<Arc<HealthState>>) -> HealthResponse {
    HealthResponse::healthy_with_message("Gateway is running").with_generations(&state.registry)
}

/// Readiness probe handler - `/ready`
pub async fn readiness_handler(State(state): State<Arc<HealthState>>) -> HealthResponse {
    let registry = &state.registry;
    let response = if registry.is_accepting() {
        HealthResponse::healthy()
    } else {
        HealthResponse::unhealthy("Gateway is shutting down")
    };

    let draining = registry.draining_count();
    let check = ComponentHealth {
        name: "generations".to_string(),
        status: if draining > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        },
        message: (draining > 0).then(|| format!("{} generation(s) draining", draining)),
    };

    response.with_check(check).with_generations(registry)
}
