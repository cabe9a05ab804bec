//! Error types for the stream gateway

use crate::events::AdapterError;
use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway
///
/// Covers request validation, generation construction, broker access and
/// runtime failures. Per-event subscription failures have their own type,
/// [`crate::engine::SubscriptionError`], because they never abort a request.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed GraphQL-over-HTTP request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The operation document could not be read
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The operation type is disabled by the security policy
    #[error("operation type '{0}' is blocked")]
    Blocked(&'static str),

    /// A generation could not be constructed from a config snapshot
    #[error("Generation build error: {0}")]
    GenerationBuild(String),

    /// Broker errors surfaced from an event source adapter
    #[error("Broker error: {0}")]
    Broker(#[from] AdapterError),

    /// The executor failed to produce a result
    #[error("Execution error: {0}")]
    Execution(String),

    /// A downstream fetch was cancelled or failed
    #[error("Failed to fetch from Subgraph: {0}")]
    FetchFailed(String),

    /// The gateway no longer accepts work
    #[error("Server is shutting down")]
    ShuttingDown,

    /// Batch request exceeded the configured entry limit
    #[error("unable to process request")]
    BatchLimitExceeded { entries: usize, limit: usize },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Convert error to GraphQL error format
    ///
    /// # Security
    ///
    /// In production (ENV=production), internal error details are sanitized
    /// to prevent information disclosure. Only safe error types show their
    /// full message to clients.
    pub fn to_graphql_error(&self) -> GraphQLError {
        let is_production = std::env::var("ENV")
            .map(|e| e == "production" || e == "prod")
            .unwrap_or(false);

        let message = if is_production {
            match self {
                Error::GenerationBuild(_) => "Service configuration error".to_string(),
                Error::Broker(_) => "Event source error".to_string(),
                Error::Execution(_) => "Execution error".to_string(),
                Error::Internal(_) | Error::Io(_) => "Internal server error".to_string(),
                Error::Config(_) => "Service configuration error".to_string(),
                Error::Serialization(_) => "Data processing error".to_string(),
                Error::Other(_) => "An unexpected error occurred".to_string(),
                // Safe to expose
                Error::InvalidRequest(_)
                | Error::InvalidOperation(_)
                | Error::Blocked(_)
                | Error::FetchFailed(_)
                | Error::ShuttingDown
                | Error::BatchLimitExceeded { .. } => self.to_string(),
            }
        } else {
            self.to_string()
        };

        GraphQLError {
            message,
            path: None,
            extensions: self.extensions(),
        }
    }

    /// HTTP status used when this error terminates a non-streaming request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidRequest(_)
            | Error::InvalidOperation(_)
            | Error::Serialization(_)
            | Error::BatchLimitExceeded { .. } => StatusCode::BAD_REQUEST,
            Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) | Error::Io(_) | Error::Config(_) | Error::GenerationBuild(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            // GraphQL semantics: the request was valid, the failure is in the body
            _ => StatusCode::OK,
        }
    }

    /// Get error code for extensions
    fn extensions(&self) -> std::collections::HashMap<String, serde_json::Value> {
        let mut map = std::collections::HashMap::new();
        let code = match self {
            // Blocked operations are reported with the bare message
            Error::Blocked(_) => return map,
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::InvalidOperation(_) => "GRAPHQL_VALIDATION_FAILED",
            Error::GenerationBuild(_) => "GENERATION_BUILD_ERROR",
            Error::Broker(e) if e.is_not_found() => "BROKER_SUBSCRIBE_ERROR",
            Error::Broker(_) => "BROKER_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::FetchFailed(_) => "FETCH_FAILED",
            Error::ShuttingDown => "SHUTTING_DOWN",
            Error::BatchLimitExceeded { .. } => "BATCH_LIMIT_EXCEEDED",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Other(_) => "UNKNOWN_ERROR",
        };
        map.insert("code".to_string(), serde_json::json!(code));
        map
    }
}

/// GraphQL error response format
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub extensions: std::collections::HashMap<String, serde_json::Value>,
}

impl GraphQLError {
    /// Plain error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: std::collections::HashMap::new(),
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.extensions
            .insert("code".to_string(), serde_json::json!(code));
        self
    }
}

impl From<Error> for GraphQLError {
    fn from(err: Error) -> Self {
        err.to_graphql_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_error_display() {
        let err = Error::InvalidRequest("missing query".to_string());
        assert_eq!(err.to_string(), "Invalid request: missing query");

        let err = Error::Blocked("subscription");
        assert_eq!(err.to_string(), "operation type 'subscription' is blocked");

        let err = Error::BatchLimitExceeded {
            entries: 7,
            limit: 5,
        };
        assert_eq!(err.to_string(), "unable to process request");

        let err = Error::FetchFailed("request cancelled".to_string());
        assert_eq!(
            err.to_string(),
            "Failed to fetch from Subgraph: request cancelled"
        );

        let err = Error::Broker(AdapterError::NotFound {
            topic: "orders".to_string(),
        });
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json");
        assert!(json_err.is_err());
        let err: Error = json_err.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_from_anyhow() {
        let anyhow_err = anyhow::anyhow!("something went wrong");
        let err: Error = anyhow_err.into();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::ShuttingDown.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::BatchLimitExceeded {
                entries: 7,
                limit: 5
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::FetchFailed("cancelled".into()).status_code(),
            StatusCode::OK
        );
    }

    #[test]
    fn test_blocked_error_has_no_extensions() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("ENV");

        let gql_err = Error::Blocked("subscription").to_graphql_error();
        let json = serde_json::to_string(&gql_err).unwrap();
        assert_eq!(
            json,
            r#"{"message":"operation type 'subscription' is blocked"}"#
        );
    }

    #[test]
    fn test_graphql_error_conversion_development() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("ENV");

        let err = Error::Internal("database connection failed".to_string());
        let gql_err = err.to_graphql_error();
        assert_eq!(gql_err.message, "Internal error: database connection failed");
        assert_eq!(gql_err.extensions.get("code").unwrap(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_graphql_error_conversion_production_sanitized() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("ENV", "production");

        let gql_err = Error::Internal("secret".to_string()).to_graphql_error();
        assert_eq!(gql_err.message, "Internal server error");

        let gql_err = Error::GenerationBuild("provider nats missing".to_string()).to_graphql_error();
        assert_eq!(gql_err.message, "Service configuration error");

        let gql_err = Error::InvalidRequest("missing query".to_string()).to_graphql_error();
        assert_eq!(gql_err.message, "Invalid request: missing query");

        std::env::remove_var("ENV");
    }

    #[test]
    fn test_not_found_broker_error_code() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("ENV");

        let err = Error::Broker(AdapterError::NotFound {
            topic: "streamName".to_string(),
        });
        let gql_err = err.to_graphql_error();
        assert_eq!(
            gql_err.extensions.get("code").unwrap(),
            "BROKER_SUBSCRIBE_ERROR"
        );
    }
}
