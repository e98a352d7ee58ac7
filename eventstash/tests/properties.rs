//! Property-based tests for mapping, positions and batched reads.

use eventstash::{
    Event, EventRepository, ExpectedVersion, Metadata, SerializationFormat, Stream,
};
use eventstash_memory::InMemoryRepository;
use eventstash_testing::clock::at;
use eventstash_testing::fixtures::{
    ids, ledger_mapper, records, AccountOpened, LedgerEvent, MoneyDeposited, MoneyWithdrawn,
};
use futures::TryStreamExt;
use proptest::prelude::*;

fn arb_account() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,20}"
}

fn arb_ledger_event() -> impl Strategy<Value = LedgerEvent> {
    prop_oneof![
        (arb_account(), "[A-Za-z ]{1,30}").prop_map(|(account, owner)| {
            LedgerEvent::Opened(AccountOpened { account, owner })
        }),
        (arb_account(), any::<u64>())
            .prop_map(|(account, amount)| LedgerEvent::Deposited(MoneyDeposited { account, amount })),
        (arb_account(), any::<u64>())
            .prop_map(|(account, amount)| LedgerEvent::Withdrawn(MoneyWithdrawn { account, amount })),
    ]
}

fn arb_format() -> impl Strategy<Value = SerializationFormat> {
    prop_oneof![
        Just(SerializationFormat::Json),
        Just(SerializationFormat::MessagePack)
    ]
}

proptest! {
    #[test]
    fn mapped_events_load_back_unchanged(
        payload in arb_ledger_event(),
        format in arb_format(),
        created in 0i64..1_000_000,
        valid in 0i64..1_000_000,
        custom in prop::collection::btree_map("custom_[a-z]{1,8}", "[a-zA-Z0-9 ]{0,16}", 0..4),
    ) {
        let mapper = ledger_mapper().with_format(format);
        let mut metadata = Metadata::new().with_valid_at(at(valid));
        metadata.timestamp = Some(at(created));
        for (key, value) in custom {
            metadata = metadata.with_custom(key, value);
        }
        let event = Event::new(payload).with_metadata(metadata);

        let record = mapper.dump(&event).unwrap();
        prop_assert_eq!(record.created_at, at(created));
        prop_assert_eq!(record.valid_at, at(valid));
        prop_assert_eq!(record.event_type.as_ref(), event.event_type());

        let loaded = mapper.load(&record).unwrap();
        prop_assert_eq!(loaded, event);
    }

    #[test]
    fn positions_stay_dense_under_interleaved_appends(
        batches in prop::collection::vec((0usize..3, 1usize..4), 1..12),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let repository = InMemoryRepository::new();
            let streams = [
                Stream::named("left").unwrap(),
                Stream::named("middle").unwrap(),
                Stream::named("right").unwrap(),
            ];
            let mut written = vec![Vec::new(), Vec::new(), Vec::new()];
            let mut global = Vec::new();

            for (target, size) in batches {
                let batch = records("Tick", size);
                written[target].extend(ids(&batch));
                global.extend(ids(&batch));
                repository
                    .append_to_stream(batch, &streams[target], ExpectedVersion::Any)
                    .await
                    .unwrap();
            }

            for (stream, event_ids) in streams.iter().zip(&written) {
                for (expected, event_id) in event_ids.iter().enumerate() {
                    let position = repository.position_in_stream(*event_id, stream).await.unwrap();
                    prop_assert_eq!(position, expected as u64);
                }
                let last = repository.last_stream_event(stream).await.unwrap();
                prop_assert_eq!(last.map(|record| record.event_id), event_ids.last().copied());
            }

            let mut previous: Option<u64> = None;
            for event_id in &global {
                let position = repository.global_position(*event_id).await.unwrap();
                prop_assert!(previous.map_or(true, |previous| position > previous));
                previous = Some(position);
            }
            Ok(())
        })?;
    }

    #[test]
    fn batched_reads_match_a_single_read(
        total in 0usize..25,
        batch_size in 1usize..8,
        limit in prop::option::of(1usize..30),
        backward in any::<bool>(),
    ) {
        tokio_test::block_on(async {
            let client = eventstash::Client::builder(InMemoryRepository::new(), ledger_mapper()).build();
            let stream = Stream::named("batched").unwrap();
            let events: Vec<_> = (0..total)
                .map(|amount| Event::new(LedgerEvent::Deposited(MoneyDeposited {
                    account: "batched".to_string(),
                    amount: amount as u64,
                })))
                .collect();
            client.append(events, &stream, ExpectedVersion::Any).await.unwrap();

            let mut read = client.read().for_stream(stream).in_batches(batch_size);
            if let Some(limit) = limit {
                read = read.limit(limit);
            }
            if backward {
                read = read.backward();
            }

            let whole: Vec<_> = read
                .to_vec()
                .await
                .unwrap()
                .into_iter()
                .map(|event| event.event_id)
                .collect();
            let batches: Vec<Vec<Event<LedgerEvent>>> = read.each_batch().try_collect().await.unwrap();

            prop_assert!(batches.iter().all(|batch| !batch.is_empty() && batch.len() <= batch_size));
            let batched: Vec<_> = batches
                .into_iter()
                .flatten()
                .map(|event| event.event_id)
                .collect();
            prop_assert_eq!(whole.len(), limit.map_or(total, |limit| limit.min(total)));
            prop_assert_eq!(batched, whole);
            Ok(())
        })?;
    }
}
