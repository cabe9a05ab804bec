//! Event filters deliver exactly the matching events, in publish order.

mod common;

use common::*;
use futures::StreamExt;
use graphql_stream_gateway::transport::{pump, Outcome, PumpOptions, StreamFrame};
use graphql_stream_gateway::{
    AdapterSet, Generation, GenerationParts, GraphQLRequest, InMemoryAdapter, Subscription,
    SubscriptionEvent, SubscriptionState,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SENTINEL: u64 = 9_999;

fn generation(broker: Arc<InMemoryAdapter>) -> Generation {
    Generation::from_parts(
        snapshot("v1"),
        GenerationParts {
            executor: Arc::new(FixtureExecutor::new(Duration::ZERO)),
            adapters: AdapterSet::new().with_adapter(broker),
        },
    )
    .expect("generation builds")
}

/// Subscribe with `request`, publish `(id, seq)` events followed by a
/// sentinel with `sentinel_id`, and return the `seq` of every delivered
/// event before the sentinel.
async fn delivered(request: GraphQLRequest, published: &[(u64, u64)], sentinel_id: u64) -> Vec<u64> {
    let broker = Arc::new(InMemoryAdapter::with_capacity(PROVIDER, 256));
    let generation = generation(broker.clone());
    let operation = request.operation().unwrap();
    let mut events = generation
        .engine()
        .subscribe(&request, &operation, generation.context(CancellationToken::new()))
        .await
        .unwrap();

    for (id, seq) in published {
        publish(&broker, FILTERED_TOPIC, json!({"id": id, "seq": seq, "__typename": "Employee"})).await;
    }
    publish(
        &broker,
        FILTERED_TOPIC,
        json!({"id": sentinel_id, "seq": SENTINEL, "__typename": "Employee"}),
    )
    .await;

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .expect("sentinel never arrived")
            .expect("stream ended early");
        let SubscriptionEvent::Data(data) = event else {
            panic!("unexpected error event: {:?}", event);
        };
        let seq = data["filteredEmployeeUpdated"]["seq"].as_u64().unwrap();
        if seq == SENTINEL {
            return seen;
        }
        seen.push(seq);
    }
}

fn filtered(ids: &[u64]) -> GraphQLRequest {
    let list = ids.iter().map(u64::to_string).collect::<Vec<_>>().join(", ");
    GraphQLRequest::new(format!(
        "subscription {{ filteredEmployeeUpdated(employeeIDs: [{}]) {{ id seq }} }}",
        list
    ))
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_in_filter_delivers_exactly_matching_events(
        ids in prop::collection::btree_set(0u64..8, 1..4),
        published in prop::collection::vec(0u64..8, 0..40),
    ) {
        let ids: Vec<u64> = ids.into_iter().collect();
        let events: Vec<(u64, u64)> = published
            .iter()
            .enumerate()
            .map(|(seq, id)| (*id, seq as u64))
            .collect();
        let expected: Vec<u64> = events
            .iter()
            .filter(|(id, _)| ids.contains(id))
            .map(|(_, seq)| *seq)
            .collect();

        let seen = runtime().block_on(delivered(filtered(&ids), &events, ids[0]));
        prop_assert_eq!(seen, expected);
    }
}

#[test]
fn test_filter_values_from_variables() {
    let request = GraphQLRequest::new(
        "subscription Updates($ids: [Int!]!) { filteredEmployeeUpdated(employeeIDs: $ids) { id seq } }",
    )
    .with_variables(json!({"ids": [2, 4]}));
    let events = [(1, 0), (2, 1), (3, 2), (4, 3), (2, 4)];

    let seen = runtime().block_on(delivered(request, &events, 4));
    assert_eq!(seen, vec![1, 3, 4]);
}

#[tokio::test]
async fn test_filtered_events_do_not_advance_sequence() {
    let broker = Arc::new(InMemoryAdapter::with_capacity(PROVIDER, 64));
    let generation = generation(broker.clone());
    let request = filtered(&[2]);
    let operation = request.operation().unwrap();
    let events = generation
        .engine()
        .subscribe(&request, &operation, generation.context(CancellationToken::new()))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let closed = CancellationToken::new();
    let pumping = {
        let closed = closed.clone();
        tokio::spawn(async move {
            let mut subscription = Subscription::new();
            let outcome = pump(events, &tx, &closed, PumpOptions::default(), &mut subscription, |frame| {
                match frame {
                    StreamFrame::Next(response) => Some(response),
                    _ => None,
                }
            })
            .await;
            (outcome, subscription)
        })
    };

    for (id, seq) in [(1, 0), (2, 1), (3, 2), (1, 3), (2, 4)] {
        publish(&broker, FILTERED_TOPIC, json!({"id": id, "seq": seq, "__typename": "Employee"})).await;
    }
    for expected in [1, 4] {
        let response = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event never arrived")
            .expect("pump stopped");
        let data = serde_json::to_value(&response).unwrap();
        assert_eq!(data["data"]["filteredEmployeeUpdated"]["seq"], expected);
    }

    closed.cancel();
    let (outcome, subscription) = pumping.await.unwrap();
    assert_eq!(outcome, Outcome::Closed);
    assert_eq!(subscription.state(), SubscriptionState::Closed);
    assert_eq!(subscription.sequence(), 2);
}
