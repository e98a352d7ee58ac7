mod common;

use std::sync::Arc;

use eventstash::{Client, EventRepository, ExpectedVersion, SpecificationResult};
use eventstash_postgres::{PostgresConfig, PostgresRepository};
use eventstash_testing::fixtures::{deposited, ledger_mapper, opened, records, unique_stream};
use eventstash_testing::EventCollector;

use crate::common::{fresh_database, fresh_repository};

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires docker"]
async fn migrations_can_run_twice() {
    let repository = fresh_repository().await;
    repository.migrate().await.expect("second migration run should be a no-op");
    repository.ping().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires docker"]
async fn client_round_trips_domain_events() {
    let _guard = tracing_subscriber::fmt()
        .with_env_filter("eventstash_postgres=debug")
        .try_init();

    let client = Client::builder(fresh_repository().await, ledger_mapper()).build();
    let collector = EventCollector::new();
    let _subscription = client
        .subscribe(collector.subscriber(), ["MoneyDeposited"])
        .unwrap();
    let stream = unique_stream("account");
    let events = vec![opened("acc-1"), deposited("acc-1", 40)];

    client
        .publish(events.clone(), &stream, ExpectedVersion::None)
        .await
        .unwrap();

    let read: Vec<_> = client
        .read()
        .for_stream(stream.clone())
        .to_vec()
        .await
        .unwrap();
    assert_eq!(read.len(), 2);
    assert_eq!(read[0].event_id, events[0].event_id);
    assert_eq!(read[1].data, events[1].data);
    assert_eq!(collector.event_ids(), vec![events[1].event_id]);
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires docker"]
async fn appends_without_global_order_lock_keep_stream_invariants() {
    let repository = Arc::new(
        PostgresRepository::with_config(
            fresh_database().await,
            PostgresConfig::default().with_global_order_lock(false),
        )
        .await
        .unwrap(),
    );
    let stream = unique_stream("unlocked");

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let repository = Arc::clone(&repository);
            let stream = stream.clone();
            tokio::spawn(async move {
                repository
                    .append_to_stream(records("Deposited", 3), &stream, ExpectedVersion::Any)
                    .await
            })
        })
        .collect();
    for result in futures::future::join_all(writers).await {
        result.unwrap().unwrap();
    }

    let stored = repository
        .read(&SpecificationResult {
            stream: stream.clone(),
            ..SpecificationResult::default()
        })
        .await
        .unwrap();
    assert_eq!(stored.len(), 12);
    for (expected, record) in (0u64..).zip(&stored) {
        assert_eq!(
            repository
                .position_in_stream(record.event_id, &stream)
                .await
                .unwrap(),
            expected
        );
    }
    assert_eq!(
        repository
            .count(&SpecificationResult::default())
            .await
            .unwrap(),
        12
    );
}
