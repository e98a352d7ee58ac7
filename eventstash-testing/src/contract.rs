//! Behavior every [`EventRepository`] must show, independent of its backend.
//!
//! Each scenario takes an async factory and builds the repositories it needs.
//! Engines run the whole suite with [`repository_contract_tests!`]. Scenarios
//! that inspect the global stream assume the factory returns an empty store.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use eventstash::{
    Direction, EventId, EventRepository, EventType, ExpectedVersion, Record, SpecificationResult,
    StoreError, StoreResult, Stream, TimeBound, TimeColumn,
};

use crate::clock::at;
use crate::fixtures::{ids, record, record_at, records, unique_stream};

/// A scenario that did not behave as required, with the scenario name.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(scenario: &'static str, operation: &'static str, error: &StoreError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of one scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

trait During<T> {
    fn during(
        self,
        scenario: &'static str,
        operation: &'static str,
    ) -> Result<T, ContractTestFailure>;
}

impl<T> During<T> for StoreResult<T> {
    fn during(
        self,
        scenario: &'static str,
        operation: &'static str,
    ) -> Result<T, ContractTestFailure> {
        self.map_err(|error| ContractTestFailure::store_error(scenario, operation, &error))
    }
}

fn ensure(scenario: &'static str, holds: bool, detail: impl FnOnce() -> String) -> ContractTestResult {
    if holds {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(scenario, detail()))
    }
}

fn ensure_eq<T: PartialEq + fmt::Debug>(
    scenario: &'static str,
    what: &str,
    observed: &T,
    expected: &T,
) -> ContractTestResult {
    ensure(scenario, observed == expected, || {
        format!("{what}: expected {expected:?}, observed {observed:?}")
    })
}

fn expect_error<T: fmt::Debug>(
    scenario: &'static str,
    operation: &'static str,
    result: StoreResult<T>,
    expected: &str,
    matches: impl FnOnce(&StoreError) -> bool,
) -> ContractTestResult {
    match result {
        Err(ref error) if matches(error) => Ok(()),
        Err(error) => Err(ContractTestFailure::assertion(
            scenario,
            format!("{operation}: expected {expected}, got {error}"),
        )),
        Ok(value) => Err(ContractTestFailure::assertion(
            scenario,
            format!("{operation}: expected {expected} but it succeeded with {value:?}"),
        )),
    }
}

fn is_conflict(error: &StoreError) -> bool {
    error.is_concurrency_conflict()
}

fn is_duplicate(error: &StoreError) -> bool {
    matches!(error, StoreError::EventDuplicatedInStream { .. })
}

fn is_not_found(error: &StoreError) -> bool {
    matches!(error, StoreError::EventNotFound(_))
}

fn is_reserved(error: &StoreError) -> bool {
    matches!(error, StoreError::ReservedStreamName)
}

fn reading(stream: &Stream) -> SpecificationResult {
    SpecificationResult {
        stream: stream.clone(),
        ..SpecificationResult::default()
    }
}

async fn read_ids<R: EventRepository + ?Sized>(
    scenario: &'static str,
    repository: &R,
    specification: &SpecificationResult,
) -> Result<Vec<EventId>, ContractTestFailure> {
    let records = repository.read(specification).await.during(scenario, "read")?;
    Ok(ids(&records))
}

async fn append<R: EventRepository + ?Sized>(
    scenario: &'static str,
    repository: &R,
    records: &[Record],
    stream: &Stream,
    expected_version: ExpectedVersion,
) -> ContractTestResult {
    repository
        .append_to_stream(records.to_vec(), stream, expected_version)
        .await
        .during(scenario, "append_to_stream")
}

/// `None` only writes to a stream that has no events yet.
pub async fn test_expected_version_none<F, Fut, R>(make_repository: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = R>,
    R: EventRepository + 'static,
{
    const SCENARIO: &str = "expected_version_none";

    let repository = make_repository().await;
    let stream = unique_stream(SCENARIO);
    let first = record("Opened");
    let rejected = record("Deposited");
    let second = record("Deposited");

    append(SCENARIO, &repository, &[first.clone()], &stream, ExpectedVersion::None).await?;

    expect_error(
        SCENARIO,
        "append_to_stream",
        repository
            .append_to_stream(vec![rejected.clone()], &stream, ExpectedVersion::None)
            .await,
        "WrongExpectedEventVersion",
        is_conflict,
    )?;
    let persisted = repository
        .has_event(rejected.event_id)
        .await
        .during(SCENARIO, "has_event")?;
    ensure(SCENARIO, !persisted, || {
        "rejected append left its event behind".to_string()
    })?;

    append(SCENARIO, &repository, &[second.clone()], &stream, ExpectedVersion::Exact(0)).await?;

    for (event, expected) in [(&first, 0), (&second, 1)] {
        let position = repository
            .position_in_stream(event.event_id, &stream)
            .await
            .during(SCENARIO, "position_in_stream")?;
        ensure_eq(SCENARIO, "stream position", &position, &expected)?;
    }

    Ok(())
}

/// Positions start at zero and have no gaps across appends.
pub async fn test_dense_positions<F, Fut, R>(make_repository: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = R>,
    R: EventRepository + 'static,
{
    const SCENARIO: &str = "dense_positions";

    let repository = make_repository().await;
    let stream = unique_stream(SCENARIO);
    let batches = [
        (records("Deposited", 2), ExpectedVersion::Any),
        (records("Deposited", 1), ExpectedVersion::Auto),
        (records("Withdrawn", 3), ExpectedVersion::Exact(2)),
        (records("Deposited", 1), ExpectedVersion::Any),
    ];

    let mut appended = Vec::new();
    for (batch, expected_version) in &batches {
        append(SCENARIO, &repository, batch, &stream, *expected_version).await?;
        appended.extend(ids(batch));
    }

    let observed = read_ids(SCENARIO, &repository, &reading(&stream)).await?;
    ensure_eq(SCENARIO, "stream order", &observed, &appended)?;

    for (expected, event_id) in (0u64..).zip(&appended) {
        let position = repository
            .position_in_stream(*event_id, &stream)
            .await
            .during(SCENARIO, "position_in_stream")?;
        ensure_eq(SCENARIO, "stream position", &position, &expected)?;
    }

    let last = repository
        .last_stream_event(&stream)
        .await
        .during(SCENARIO, "last_stream_event")?
        .map(|record| record.event_id);
    ensure_eq(SCENARIO, "last stream event", &last, &appended.last().copied())
}

/// A stale `Exact` version is a conflict and writes nothing.
pub async fn test_exact_version_mismatch<F, Fut, R>(make_repository: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = R>,
    R: EventRepository + 'static,
{
    const SCENARIO: &str = "exact_version_mismatch";

    let repository = make_repository().await;
    let stream = unique_stream(SCENARIO);

    expect_error(
        SCENARIO,
        "append_to_stream",
        repository
            .append_to_stream(records("Opened", 1), &stream, ExpectedVersion::Exact(0))
            .await,
        "WrongExpectedEventVersion on an empty stream",
        is_conflict,
    )?;

    append(SCENARIO, &repository, &records("Opened", 2), &stream, ExpectedVersion::None).await?;

    for stale in [0, 5] {
        expect_error(
            SCENARIO,
            "append_to_stream",
            repository
                .append_to_stream(records("Deposited", 1), &stream, ExpectedVersion::Exact(stale))
                .await,
            "WrongExpectedEventVersion",
            is_conflict,
        )?;
    }

    append(SCENARIO, &repository, &records("Deposited", 1), &stream, ExpectedVersion::Exact(1)).await?;

    let count = repository
        .count(&reading(&stream))
        .await
        .during(SCENARIO, "count")?;
    ensure_eq(SCENARIO, "stream length", &count, &3)
}

/// A batch with a duplicate id is rejected as a whole.
pub async fn test_duplicate_ids_are_atomic<F, Fut, R>(make_repository: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = R>,
    R: EventRepository + 'static,
{
    const SCENARIO: &str = "duplicate_ids_are_atomic";

    let repository = make_repository().await;
    let existing = record("Opened");
    let source = unique_stream("source");
    let target = unique_stream("target");
    append(SCENARIO, &repository, &[existing.clone()], &source, ExpectedVersion::Any).await?;

    let fresh = record("Deposited");
    expect_error(
        SCENARIO,
        "append_to_stream",
        repository
            .append_to_stream(vec![fresh.clone(), existing.clone()], &target, ExpectedVersion::Any)
            .await,
        "EventDuplicatedInStream for an id stored elsewhere",
        is_duplicate,
    )?;

    let twice = record("Deposited");
    expect_error(
        SCENARIO,
        "append_to_stream",
        repository
            .append_to_stream(vec![twice.clone(), twice.clone()], &target, ExpectedVersion::Any)
            .await,
        "EventDuplicatedInStream for an id repeated in the batch",
        is_duplicate,
    )?;

    for event_id in [fresh.event_id, twice.event_id] {
        let persisted = repository
            .has_event(event_id)
            .await
            .during(SCENARIO, "has_event")?;
        ensure(SCENARIO, !persisted, || {
            format!("event {event_id} of a rejected batch was persisted")
        })?;
    }

    let target_events = read_ids(SCENARIO, &repository, &reading(&target)).await?;
    ensure(SCENARIO, target_events.is_empty(), || {
        format!("rejected batches left {target_events:?} in the target stream")
    })?;

    let global = read_ids(SCENARIO, &repository, &reading(&Stream::Global)).await?;
    ensure_eq(SCENARIO, "global stream", &global, &vec![existing.event_id])
}

/// Linking adds memberships; a missing id fails the whole link.
pub async fn test_link_existing_then_missing<F, Fut, R>(make_repository: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = R>,
    R: EventRepository + 'static,
{
    const SCENARIO: &str = "link_existing_then_missing";

    let repository = make_repository().await;
    let source = unique_stream("orders");
    let target = unique_stream("audit");
    let events = records("Opened", 2);
    append(SCENARIO, &repository, &events, &source, ExpectedVersion::None).await?;

    repository
        .link_to_stream(&[events[1].event_id], &target, ExpectedVersion::None)
        .await
        .during(SCENARIO, "link_to_stream")?;

    let linked = read_ids(SCENARIO, &repository, &reading(&target)).await?;
    ensure_eq(SCENARIO, "linked stream", &linked, &vec![events[1].event_id])?;

    let streams: BTreeSet<Stream> = repository
        .streams_of(events[1].event_id)
        .await
        .during(SCENARIO, "streams_of")?
        .into_iter()
        .collect();
    ensure_eq(
        SCENARIO,
        "streams of linked event",
        &streams,
        &BTreeSet::from([source.clone(), target.clone()]),
    )?;

    let missing = EventId::generate();
    expect_error(
        SCENARIO,
        "link_to_stream",
        repository
            .link_to_stream(&[events[0].event_id, missing], &target, ExpectedVersion::Exact(0))
            .await,
        "EventNotFound",
        |error| matches!(error, StoreError::EventNotFound(id) if *id == missing),
    )?;
    let partially_linked = repository
        .event_in_stream(events[0].event_id, &target)
        .await
        .during(SCENARIO, "event_in_stream")?;
    ensure(SCENARIO, !partially_linked, || {
        "failed link left the existing event linked".to_string()
    })?;

    expect_error(
        SCENARIO,
        "link_to_stream",
        repository
            .link_to_stream(&[events[1].event_id], &target, ExpectedVersion::Any)
            .await,
        "EventDuplicatedInStream",
        is_duplicate,
    )?;

    expect_error(
        SCENARIO,
        "link_to_stream",
        repository
            .link_to_stream(&[events[0].event_id], &target, ExpectedVersion::None)
            .await,
        "WrongExpectedEventVersion",
        is_conflict,
    )?;

    expect_error(
        SCENARIO,
        "link_to_stream",
        repository
            .link_to_stream(&[events[0].event_id], &Stream::Global, ExpectedVersion::Auto)
            .await,
        "ReservedStreamName",
        is_reserved,
    )?;

    let global = repository
        .count(&reading(&Stream::Global))
        .await
        .during(SCENARIO, "count")?;
    ensure_eq(SCENARIO, "global stream length after linking", &global, &2)
}

/// The global stream takes `Auto` appends only and cannot be linked to or deleted.
pub async fn test_global_stream_rules<F, Fut, R>(make_repository: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = R>,
    R: EventRepository + 'static,
{
    const SCENARIO: &str = "global_stream_rules";

    let repository = make_repository().await;

    for expected_version in [
        ExpectedVersion::None,
        ExpectedVersion::Any,
        ExpectedVersion::Exact(0),
    ] {
        expect_error(
            SCENARIO,
            "append_to_stream",
            repository
                .append_to_stream(records("Opened", 1), &Stream::Global, expected_version)
                .await,
            "InvalidExpectedVersion",
            |error| matches!(error, StoreError::InvalidExpectedVersion(_)),
        )?;
    }

    let unnamed = record("Opened");
    append(SCENARIO, &repository, &[unnamed.clone()], &Stream::Global, ExpectedVersion::Auto).await?;

    let streams = repository
        .streams_of(unnamed.event_id)
        .await
        .during(SCENARIO, "streams_of")?;
    ensure(SCENARIO, streams.is_empty(), || {
        format!("event appended to the global stream belongs to {streams:?}")
    })?;

    let in_global = repository
        .event_in_stream(unnamed.event_id, &Stream::Global)
        .await
        .during(SCENARIO, "event_in_stream")?;
    ensure(SCENARIO, in_global, || {
        "every stored event must be part of the global stream".to_string()
    })?;

    expect_error(
        SCENARIO,
        "delete_stream",
        repository.delete_stream(&Stream::Global).await,
        "ReservedStreamName",
        is_reserved,
    )
}

/// The global stream reads in commit order across streams.
pub async fn test_global_order_follows_commits<F, Fut, R>(make_repository: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = R>,
    R: EventRepository + 'static,
{
    const SCENARIO: &str = "global_order_follows_commits";

    let repository = make_repository().await;
    let first_stream = unique_stream("first");
    let second_stream = unique_stream("second");
    let a = records("Opened", 1);
    let bc = records("Deposited", 2);
    let d = records("Withdrawn", 1);

    append(SCENARIO, &repository, &a, &first_stream, ExpectedVersion::Any).await?;
    append(SCENARIO, &repository, &bc, &second_stream, ExpectedVersion::Any).await?;
    append(SCENARIO, &repository, &d, &first_stream, ExpectedVersion::Any).await?;

    let expected: Vec<EventId> = [&a, &bc, &d].into_iter().flat_map(|batch| ids(batch)).collect();
    let forward = read_ids(SCENARIO, &repository, &reading(&Stream::Global)).await?;
    ensure_eq(SCENARIO, "global order", &forward, &expected)?;

    let backward = read_ids(
        SCENARIO,
        &repository,
        &SpecificationResult {
            direction: Direction::Backward,
            ..reading(&Stream::Global)
        },
    )
    .await?;
    let mut reversed = expected.clone();
    reversed.reverse();
    ensure_eq(SCENARIO, "backward global order", &backward, &reversed)?;

    let mut previous = None;
    for event_id in &expected {
        let position = repository
            .global_position(*event_id)
            .await
            .during(SCENARIO, "global_position")?;
        let via_stream = repository
            .position_in_stream(*event_id, &Stream::Global)
            .await
            .during(SCENARIO, "position_in_stream")?;
        ensure_eq(SCENARIO, "global position through the stream", &via_stream, &position)?;
        ensure(SCENARIO, previous.map_or(true, |before| position > before), || {
            format!("global positions are not increasing: {previous:?} then {position}")
        })?;
        previous = Some(position);
    }

    Ok(())
}

/// Racing `Exact` appenders: one wins, the others conflict.
pub async fn test_concurrent_appenders<F, Fut, R>(make_repository: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = R>,
    R: EventRepository + 'static,
{
    const SCENARIO: &str = "concurrent_appenders";
    const WRITERS: usize = 8;

    let repository = Arc::new(make_repository().await);

    for seeded in [false, true] {
        let stream = unique_stream(SCENARIO);
        let expected_version = if seeded {
            append(SCENARIO, &*repository, &records("Opened", 1), &stream, ExpectedVersion::None)
                .await?;
            ExpectedVersion::Exact(0)
        } else {
            ExpectedVersion::None
        };

        let writers: Vec<_> = (0..WRITERS)
            .map(|_| {
                let repository = Arc::clone(&repository);
                let stream = stream.clone();
                tokio::spawn(async move {
                    repository
                        .append_to_stream(records("Deposited", 2), &stream, expected_version)
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        for writer in writers {
            match writer.await {
                Ok(Ok(())) => winners += 1,
                Ok(Err(error)) if error.is_concurrency_conflict() => {}
                Ok(Err(error)) => {
                    return Err(ContractTestFailure::store_error(
                        SCENARIO,
                        "append_to_stream",
                        &error,
                    ))
                }
                Err(error) => {
                    return Err(ContractTestFailure::assertion(
                        SCENARIO,
                        format!("writer task failed: {error}"),
                    ))
                }
            }
        }
        ensure_eq(SCENARIO, "successful writers", &winners, &1)?;

        let length = repository
            .count(&reading(&stream))
            .await
            .during(SCENARIO, "count")?;
        let expected_length = if seeded { 3 } else { 2 };
        ensure_eq(SCENARIO, "stream length", &length, &expected_length)?;
    }

    Ok(())
}

/// Deleting a stream removes memberships but keeps the events.
pub async fn test_delete_stream_keeps_events<F, Fut, R>(make_repository: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = R>,
    R: EventRepository + 'static,
{
    const SCENARIO: &str = "delete_stream_keeps_events";

    let repository = make_repository().await;
    let doomed = unique_stream("doomed");
    let kept = unique_stream("kept");
    let events = records("Opened", 2);
    append(SCENARIO, &repository, &events, &doomed, ExpectedVersion::None).await?;
    repository
        .link_to_stream(&ids(&events), &kept, ExpectedVersion::None)
        .await
        .during(SCENARIO, "link_to_stream")?;

    repository
        .delete_stream(&doomed)
        .await
        .during(SCENARIO, "delete_stream")?;

    let remaining = read_ids(SCENARIO, &repository, &reading(&doomed)).await?;
    ensure(SCENARIO, remaining.is_empty(), || {
        format!("deleted stream still lists {remaining:?}")
    })?;

    let last = repository
        .last_stream_event(&doomed)
        .await
        .during(SCENARIO, "last_stream_event")?;
    ensure(SCENARIO, last.is_none(), || {
        "deleted stream still has a last event".to_string()
    })?;

    for event in &events {
        let exists = repository
            .has_event(event.event_id)
            .await
            .during(SCENARIO, "has_event")?;
        ensure(SCENARIO, exists, || "deleting a stream removed an event".to_string())?;

        let streams = repository
            .streams_of(event.event_id)
            .await
            .during(SCENARIO, "streams_of")?;
        ensure_eq(SCENARIO, "streams after delete", &streams, &vec![kept.clone()])?;
    }

    let global = read_ids(SCENARIO, &repository, &reading(&Stream::Global)).await?;
    ensure_eq(SCENARIO, "global stream after delete", &global, &ids(&events))?;

    repository
        .delete_stream(&doomed)
        .await
        .during(SCENARIO, "delete_stream")?;
    repository
        .delete_stream(&unique_stream("never-written"))
        .await
        .during(SCENARIO, "delete_stream")?;

    let reused = record("Opened");
    append(SCENARIO, &repository, &[reused.clone()], &doomed, ExpectedVersion::None).await?;
    let position = repository
        .position_in_stream(reused.event_id, &doomed)
        .await
        .during(SCENARIO, "position_in_stream")?;
    ensure_eq(SCENARIO, "position in a recreated stream", &position, &0)
}

/// Type and id filters, direction, limits and cursors.
pub async fn test_read_filters_and_cursors<F, Fut, R>(make_repository: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = R>,
    R: EventRepository + 'static,
{
    const SCENARIO: &str = "read_filters_and_cursors";

    let repository = make_repository().await;
    let stream = unique_stream(SCENARIO);
    let other = unique_stream("other");
    let events = vec![
        record("Opened"),
        record("Deposited"),
        record("Withdrawn"),
        record("Deposited"),
        record("Deposited"),
    ];
    let all = ids(&events);
    append(SCENARIO, &repository, &events, &stream, ExpectedVersion::None).await?;
    let foreign = record("Opened");
    append(SCENARIO, &repository, &[foreign.clone()], &other, ExpectedVersion::None).await?;

    let deposited = EventType::try_new("Deposited")
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;
    let base = reading(&stream);

    let cases: Vec<(&str, SpecificationResult, Vec<EventId>)> = vec![
        ("whole stream", base.clone(), all.clone()),
        (
            "backward",
            SpecificationResult {
                direction: Direction::Backward,
                ..base.clone()
            },
            all.iter().rev().copied().collect(),
        ),
        (
            "limit",
            SpecificationResult {
                limit: Some(2),
                ..base.clone()
            },
            all[..2].to_vec(),
        ),
        (
            "of type",
            SpecificationResult {
                event_types: Some(vec![deposited.clone()]),
                ..base.clone()
            },
            vec![all[1], all[3], all[4]],
        ),
        (
            "of type with limit",
            SpecificationResult {
                event_types: Some(vec![deposited.clone()]),
                limit: Some(2),
                ..base.clone()
            },
            vec![all[1], all[3]],
        ),
        (
            "with ids",
            SpecificationResult {
                event_ids: Some(vec![all[4], all[0]]),
                ..base.clone()
            },
            vec![all[0], all[4]],
        ),
        (
            "from cursor",
            SpecificationResult {
                start: Some(all[1]),
                ..base.clone()
            },
            all[2..].to_vec(),
        ),
        (
            "from and to cursors",
            SpecificationResult {
                start: Some(all[0]),
                stop: Some(all[3]),
                ..base.clone()
            },
            all[1..3].to_vec(),
        ),
        (
            "backward from cursor",
            SpecificationResult {
                direction: Direction::Backward,
                start: Some(all[3]),
                ..base.clone()
            },
            vec![all[2], all[1], all[0]],
        ),
        (
            "cursor with type filter",
            SpecificationResult {
                start: Some(all[1]),
                event_types: Some(vec![deposited]),
                ..base.clone()
            },
            vec![all[3], all[4]],
        ),
    ];

    for (name, specification, expected) in cases {
        let observed = read_ids(SCENARIO, &repository, &specification).await?;
        ensure_eq(SCENARIO, name, &observed, &expected)?;

        let count = repository
            .count(&specification)
            .await
            .during(SCENARIO, "count")?;
        ensure_eq(SCENARIO, name, &count, &expected.len())?;
    }

    expect_error(
        SCENARIO,
        "read",
        repository
            .read(&SpecificationResult {
                start: Some(foreign.event_id),
                ..base.clone()
            })
            .await,
        "EventNotFound for a cursor outside the stream",
        is_not_found,
    )?;

    expect_error(
        SCENARIO,
        "read",
        repository
            .read(&SpecificationResult {
                stop: Some(EventId::generate()),
                ..base.clone()
            })
            .await,
        "EventNotFound for an unknown cursor",
        is_not_found,
    )?;

    expect_error(
        SCENARIO,
        "read",
        repository
            .read(&SpecificationResult {
                limit: Some(0),
                ..base
            })
            .await,
        "InvalidQuery for a zero limit",
        |error| matches!(error, StoreError::InvalidQuery(_)),
    )
}

/// Time range filters and ordering by either time column.
pub async fn test_time_filters_and_sorting<F, Fut, R>(make_repository: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = R>,
    R: EventRepository + 'static,
{
    const SCENARIO: &str = "time_filters_and_sorting";

    let repository = make_repository().await;
    let stream = unique_stream(SCENARIO);
    // Business time runs opposite to system time.
    let events = vec![
        record_at("Deposited", at(0)).with_valid_at(at(30)),
        record_at("Deposited", at(10)).with_valid_at(at(20)),
        record_at("Deposited", at(20)).with_valid_at(at(10)),
    ];
    let all = ids(&events);
    append(SCENARIO, &repository, &events, &stream, ExpectedVersion::None).await?;

    let base = reading(&stream);
    let as_of = SpecificationResult {
        time_sort: Some(TimeColumn::ValidAt),
        ..base.clone()
    };

    let cases: Vec<(&str, SpecificationResult, Vec<EventId>)> = vec![
        (
            "newer than",
            SpecificationResult {
                time_bounds: vec![TimeBound::NewerThan(at(0))],
                ..base.clone()
            },
            vec![all[1], all[2]],
        ),
        (
            "older than or equal",
            SpecificationResult {
                time_bounds: vec![TimeBound::OlderThanOrEqual(at(10))],
                ..base.clone()
            },
            vec![all[0], all[1]],
        ),
        (
            "between",
            SpecificationResult {
                time_bounds: vec![
                    TimeBound::NewerThanOrEqual(at(0)),
                    TimeBound::OlderThan(at(20)),
                ],
                ..base.clone()
            },
            vec![all[0], all[1]],
        ),
        (
            "as at",
            SpecificationResult {
                time_sort: Some(TimeColumn::CreatedAt),
                ..base.clone()
            },
            all.clone(),
        ),
        ("as of", as_of.clone(), vec![all[2], all[1], all[0]]),
        (
            "as of backward",
            SpecificationResult {
                direction: Direction::Backward,
                ..as_of.clone()
            },
            all.clone(),
        ),
        (
            "as of with a bound on business time",
            SpecificationResult {
                time_bounds: vec![TimeBound::NewerThan(at(15))],
                ..as_of.clone()
            },
            vec![all[1], all[0]],
        ),
        (
            "as of from cursor",
            SpecificationResult {
                start: Some(all[2]),
                ..as_of
            },
            vec![all[1], all[0]],
        ),
    ];

    for (name, specification, expected) in cases {
        let observed = read_ids(SCENARIO, &repository, &specification).await?;
        ensure_eq(SCENARIO, name, &observed, &expected)?;
    }

    Ok(())
}

/// In-place updates keep ids, order and memberships.
pub async fn test_update_messages_in_place<F, Fut, R>(make_repository: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = R>,
    R: EventRepository + 'static,
{
    const SCENARIO: &str = "update_messages_in_place";

    let repository = make_repository().await;
    let stream = unique_stream(SCENARIO);
    let events = vec![record_at("Deposited", at(0)), record_at("Deposited", at(1))];
    append(SCENARIO, &repository, &events, &stream, ExpectedVersion::None).await?;

    let mut corrected = events[0].clone();
    corrected.event_type = EventType::try_new("Withdrawn")
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;
    corrected.data = br#"{"corrected":true}"#.to_vec();
    corrected.metadata = br#"{"reason":"typo"}"#.to_vec();
    corrected.valid_at = at(-60);
    repository
        .update_messages(vec![corrected.clone()])
        .await
        .during(SCENARIO, "update_messages")?;

    let stored = repository
        .read_event(corrected.event_id)
        .await
        .during(SCENARIO, "read_event")?;
    ensure_eq(SCENARIO, "event type", &stored.event_type, &corrected.event_type)?;
    ensure_eq(SCENARIO, "data", &stored.data, &corrected.data)?;
    ensure_eq(SCENARIO, "metadata", &stored.metadata, &corrected.metadata)?;
    ensure_eq(SCENARIO, "valid at", &stored.valid_at, &corrected.valid_at)?;
    ensure_eq(SCENARIO, "created at", &stored.created_at, &events[0].created_at)?;

    let order = read_ids(SCENARIO, &repository, &reading(&stream)).await?;
    ensure_eq(SCENARIO, "order after update", &order, &ids(&events))?;

    let mut untouched = events[1].clone();
    untouched.data = br#"{"lost":true}"#.to_vec();
    expect_error(
        SCENARIO,
        "update_messages",
        repository
            .update_messages(vec![untouched, record("Deposited")])
            .await,
        "EventNotFound",
        is_not_found,
    )?;
    let second = repository
        .read_event(events[1].event_id)
        .await
        .during(SCENARIO, "read_event")?;
    ensure_eq(SCENARIO, "data after a rejected update", &second.data, &events[1].data)
}

/// Membership and position lookups by event id.
pub async fn test_lookups<F, Fut, R>(make_repository: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = R>,
    R: EventRepository + 'static,
{
    const SCENARIO: &str = "lookups";

    let repository = make_repository().await;
    let stream = unique_stream(SCENARIO);
    let elsewhere = unique_stream("elsewhere");
    let stored = record("Opened");
    append(SCENARIO, &repository, &[stored.clone()], &stream, ExpectedVersion::None).await?;
    let unknown = EventId::generate();

    let read_back = repository
        .read_event(stored.event_id)
        .await
        .during(SCENARIO, "read_event")?;
    ensure_eq(SCENARIO, "stored record", &read_back, &stored)?;

    let exists = repository.has_event(unknown).await.during(SCENARIO, "has_event")?;
    ensure(SCENARIO, !exists, || "unknown event reported as stored".to_string())?;

    expect_error(
        SCENARIO,
        "read_event",
        repository.read_event(unknown).await,
        "EventNotFound",
        is_not_found,
    )?;
    expect_error(
        SCENARIO,
        "global_position",
        repository.global_position(unknown).await,
        "EventNotFound",
        is_not_found,
    )?;
    expect_error(
        SCENARIO,
        "position_in_stream",
        repository.position_in_stream(stored.event_id, &elsewhere).await,
        "EventNotFound for an event outside the stream",
        is_not_found,
    )?;

    let member = repository
        .event_in_stream(stored.event_id, &elsewhere)
        .await
        .during(SCENARIO, "event_in_stream")?;
    ensure(SCENARIO, !member, || "event reported in a foreign stream".to_string())?;

    let streams = repository
        .streams_of(unknown)
        .await
        .during(SCENARIO, "streams_of")?;
    ensure(SCENARIO, streams.is_empty(), || {
        format!("unknown event belongs to {streams:?}")
    })?;

    let empty_last = repository
        .last_stream_event(&elsewhere)
        .await
        .during(SCENARIO, "last_stream_event")?;
    ensure(SCENARIO, empty_last.is_none(), || {
        "empty stream reported a last event".to_string()
    })
}

/// Generates one `#[tokio::test]` per scenario inside a module named `suite`.
///
/// `ignore = "reason"` marks every generated test as ignored.
#[macro_export]
macro_rules! repository_contract_tests {
    (suite = $suite:ident, make_repository = $make_repository:expr $(, ignore = $reason:literal)? $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            #[allow(unused_imports)]
            use super::*;
            use $crate::contract::{
                test_concurrent_appenders, test_delete_stream_keeps_events, test_dense_positions,
                test_duplicate_ids_are_atomic, test_exact_version_mismatch,
                test_expected_version_none, test_global_order_follows_commits,
                test_global_stream_rules, test_link_existing_then_missing, test_lookups,
                test_read_filters_and_cursors, test_time_filters_and_sorting,
                test_update_messages_in_place,
            };

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn expected_version_none_contract() {
                test_expected_version_none($make_repository)
                    .await
                    .expect("repository contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn dense_positions_contract() {
                test_dense_positions($make_repository)
                    .await
                    .expect("repository contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn exact_version_mismatch_contract() {
                test_exact_version_mismatch($make_repository)
                    .await
                    .expect("repository contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn duplicate_ids_are_atomic_contract() {
                test_duplicate_ids_are_atomic($make_repository)
                    .await
                    .expect("repository contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn link_existing_then_missing_contract() {
                test_link_existing_then_missing($make_repository)
                    .await
                    .expect("repository contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn global_stream_rules_contract() {
                test_global_stream_rules($make_repository)
                    .await
                    .expect("repository contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn global_order_follows_commits_contract() {
                test_global_order_follows_commits($make_repository)
                    .await
                    .expect("repository contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn concurrent_appenders_contract() {
                test_concurrent_appenders($make_repository)
                    .await
                    .expect("repository contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn delete_stream_keeps_events_contract() {
                test_delete_stream_keeps_events($make_repository)
                    .await
                    .expect("repository contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn read_filters_and_cursors_contract() {
                test_read_filters_and_cursors($make_repository)
                    .await
                    .expect("repository contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn time_filters_and_sorting_contract() {
                test_time_filters_and_sorting($make_repository)
                    .await
                    .expect("repository contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn update_messages_in_place_contract() {
                test_update_messages_in_place($make_repository)
                    .await
                    .expect("repository contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn lookups_contract() {
                test_lookups($make_repository)
                    .await
                    .expect("repository contract failed");
            }
        }
    };
}

pub use repository_contract_tests;
