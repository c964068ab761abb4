//! Delivery ordering properties for subscriptions.

mod common;

use collection_net::{CollectionFilter, ParamsOfSubscribeCollection};
use common::{client, FakeServer};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every pushed record is yielded once, in push order.
    #[test]
    fn prop_events_delivered_in_order(values in prop::collection::vec(any::<u32>(), 0..64)) {
        let server = FakeServer::new().with_collection("events");
        let client = client(&server);
        let sub = client
            .subscribe_collection(&ParamsOfSubscribeCollection::new("events", "seq value"))
            .unwrap();

        for (seq, value) in values.iter().enumerate() {
            server.insert("events", json!({"seq": seq, "value": value}));
        }

        let got: Vec<u32> = (0..values.len())
            .map(|_| {
                let record = sub.recv_timeout(Duration::from_secs(1)).unwrap();
                record["value"].as_u64().unwrap() as u32
            })
            .collect();
        prop_assert_eq!(got, values);
        prop_assert!(sub.try_recv().is_err());
    }

    /// Filtered subscriptions see exactly the matching subsequence.
    #[test]
    fn prop_filtered_subsequence(flags in prop::collection::vec(any::<bool>(), 1..48)) {
        let server = FakeServer::new().with_collection("events");
        let client = client(&server);
        let sub = client
            .subscribe_collection(
                &ParamsOfSubscribeCollection::new("events", "seq")
                    .filter(CollectionFilter::eq("kind", "hit")),
            )
            .unwrap();

        for (seq, hit) in flags.iter().enumerate() {
            let kind = if *hit { "hit" } else { "miss" };
            server.insert("events", json!({"seq": seq, "kind": kind}));
        }

        let expected: Vec<u64> = flags
            .iter()
            .enumerate()
            .filter(|(_, hit)| **hit)
            .map(|(seq, _)| seq as u64)
            .collect();
        let got: Vec<u64> = (0..expected.len())
            .map(|_| sub.recv_timeout(Duration::from_secs(1)).unwrap()["seq"].as_u64().unwrap())
            .collect();
        prop_assert_eq!(got, expected);
        prop_assert!(sub.try_recv().is_err());
    }
}

#[test]
fn test_per_handle_order_with_concurrent_producers() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: u64 = 200;

    let server = FakeServer::new().with_collection("events");
    let client = client(&server);

    let subs: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            client
                .subscribe_collection(
                    &ParamsOfSubscribeCollection::new("events", "producer seq")
                        .filter(CollectionFilter::eq("producer", p as u64)),
                )
                .unwrap()
        })
        .collect();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    server.insert("events", json!({"producer": p as u64, "seq": seq}));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    for (p, sub) in subs.iter().enumerate() {
        let seqs: Vec<u64> = (0..PER_PRODUCER)
            .map(|_| {
                let record = sub.recv_timeout(Duration::from_secs(1)).unwrap();
                assert_eq!(record["producer"], p as u64);
                record["seq"].as_u64().unwrap()
            })
            .collect();
        assert_eq!(seqs, (0..PER_PRODUCER).collect::<Vec<_>>());
        assert!(sub.try_recv().is_err());
    }
}
