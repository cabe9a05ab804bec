//! Request batching: a JSON array body executed as independent operations.
//!
//! All entries of a batch are admitted together against one generation and
//! answered as a JSON array in request order.

use crate::config::{BatchingConfig, SecurityConfig};
use crate::error::{Error, GraphQLError, Result};
use crate::executor::{GraphQLRequest, GraphQLResponse};
use crate::registry::Admission;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

/// A POST body: one operation or a batch of them.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Single(GraphQLRequest),
    Batch(Vec<Value>),
}

impl RequestBody {
    /// Read a POST body. Arrays are batches; entries are parsed lazily so a
    /// malformed entry only fails itself.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let first = body.iter().find(|b| !b.is_ascii_whitespace());
        if first == Some(&b'[') {
            let entries: Vec<Value> = serde_json::from_slice(body)
                .map_err(|_| Error::InvalidRequest("error parsing request body".into()))?;
            return Ok(RequestBody::Batch(entries));
        }
        serde_json::from_slice(body)
            .map(RequestBody::Single)
            .map_err(|_| Error::InvalidRequest("error parsing request body".into()))
    }
}

/// Reject batches the configuration does not allow.
pub fn check_batch(config: &BatchingConfig, entries: usize) -> Result<()> {
    if !config.enabled {
        return Err(Error::InvalidRequest("error parsing request body".into()));
    }
    if config.max_entries_per_batch > 0 && entries > config.max_entries_per_batch {
        warn!(entries, limit = config.max_entries_per_batch, "Batch rejected");
        return Err(Error::BatchLimitExceeded {
            entries,
            limit: config.max_entries_per_batch,
        });
    }
    Ok(())
}

/// Execute every entry against the admitted generation, at most
/// `max_concurrency` at a time, keeping request order.
pub async fn execute_batch(
    admission: &Admission,
    entries: Vec<Value>,
    config: &BatchingConfig,
    security: &SecurityConfig,
) -> Vec<GraphQLResponse> {
    let generation = admission.generation();
    let ctx = generation.context(admission.token().clone());
    let total = entries.len();

    stream::iter(entries.into_iter().enumerate())
        .map(|(index, entry)| {
            let ctx = &ctx;
            async move {
                debug!(index, total, "Executing batch entry");
                match execute_entry(generation.engine(), entry, ctx, security).await {
                    Ok(response) => response,
                    Err(e) => GraphQLResponse::from_error(&e),
                }
            }
        })
        .buffered(config.max_concurrency.max(1))
        .collect::<Vec<_>>()
        .await
}

async fn execute_entry(
    engine: &crate::engine::SubscriptionEngine,
    entry: Value,
    ctx: &crate::executor::ExecutionContext,
    security: &SecurityConfig,
) -> Result<GraphQLResponse> {
    let request: GraphQLRequest = serde_json::from_value(entry)
        .map_err(|e| Error::InvalidRequest(format!("invalid batch entry: {}", e)))?;
    let operation = request.operation()?;
    if operation.is_subscription() {
        return Ok(GraphQLResponse::from_errors(vec![GraphQLError::new(
            "Subscriptions aren't supported in batch operations",
        )]));
    }
    if let Some(blocked) = security.blocked(operation.kind) {
        return Err(blocked);
    }
    engine.execute(&request, &operation, ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_and_batch() {
        let single = RequestBody::parse(br#"{"query":"{ employees { id } }"}"#).unwrap();
        assert!(matches!(single, RequestBody::Single(r) if r.query == "{ employees { id } }"));

        let batch = RequestBody::parse(b"  \n[{\"query\":\"{ a }\"},{\"query\":\"{ b }\"}]").unwrap();
        assert!(matches!(batch, RequestBody::Batch(entries) if entries.len() == 2));

        let err = RequestBody::parse(b"{not json").unwrap_err();
        assert_eq!(err.to_string(), "Invalid request: error parsing request body");
    }

    #[test]
    fn test_batch_limits() {
        let disabled = BatchingConfig::default();
        assert!(matches!(check_batch(&disabled, 1), Err(Error::InvalidRequest(_))));

        let limited = BatchingConfig {
            enabled: true,
            max_entries_per_batch: 5,
            max_concurrency: 2,
        };
        assert!(check_batch(&limited, 5).is_ok());
        let err = check_batch(&limited, 7).unwrap_err();
        assert!(matches!(err, Error::BatchLimitExceeded { entries: 7, limit: 5 }));
        assert_eq!(err.to_string(), "unable to process request");

        let unlimited = BatchingConfig {
            max_entries_per_batch: 0,
            ..limited
        };
        assert!(check_batch(&unlimited, 1_000).is_ok());
    }
}
