//! In-memory storage engine for `eventstash`
//!
//! This crate provides an implementation of the `EventRepository` trait that
//! keeps everything in process memory, useful for tests and for applications
//! that do not need durability.
//!
//! All state lives behind a single lock, so every write checks its
//! preconditions and commits under the same exclusive access.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use eventstash::errors::{StoreError, StoreResult};
use eventstash::record::Record;
use eventstash::repository::EventRepository;
use eventstash::specification::{Direction, SpecificationResult};
use eventstash::types::{EventId, ExpectedVersion, Stream, StreamName};
use parking_lot::RwLock;
use tracing::{info, instrument, warn};

#[derive(Debug, Default)]
struct State {
    // Records in global sequence order.
    events: Vec<Record>,
    // Event id to index into `events`.
    index: HashMap<EventId, usize>,
    // Member ids of each named stream, in position order.
    streams: HashMap<StreamName, Vec<EventId>>,
}

impl State {
    fn record(&self, event_id: EventId) -> Option<&Record> {
        self.index.get(&event_id).map(|&index| &self.events[index])
    }

    fn members(&self, name: &StreamName) -> &[EventId] {
        self.streams.get(name).map_or(&[], Vec::as_slice)
    }

    fn last_position(&self, name: &StreamName) -> Option<u64> {
        match self.members(name).len() {
            0 => None,
            len => Some(len as u64 - 1),
        }
    }

    fn check_expected_version(
        &self,
        name: &StreamName,
        stream: &Stream,
        expected_version: ExpectedVersion,
    ) -> StoreResult<()> {
        let last_position = self.last_position(name);
        if expected_version.resolve(last_position).is_none() {
            warn!(
                stream = %stream,
                expected_version = %expected_version,
                last_position = ?last_position,
                "[memory.check_expected_version] wrong expected version"
            );
            return Err(StoreError::WrongExpectedEventVersion {
                stream: stream.clone(),
                expected: expected_version,
            });
        }
        Ok(())
    }

    /// Records of `stream` paired with their ordinal (position or sequence),
    /// in position order.
    fn stream_records(&self, stream: &Stream) -> Vec<(usize, &Record)> {
        match stream {
            Stream::Global => self.events.iter().enumerate().collect(),
            Stream::Named(name) => self
                .members(name)
                .iter()
                .filter_map(|event_id| self.record(*event_id))
                .enumerate()
                .collect(),
        }
    }

    fn read(&self, specification: &SpecificationResult) -> StoreResult<Vec<Record>> {
        specification.validate()?;

        let mut ordered = self.stream_records(&specification.stream);
        if let Some(column) = specification.time_sort {
            ordered.sort_by_key(|(ordinal, record)| (column.of(record), *ordinal));
        }
        if specification.direction == Direction::Backward {
            ordered.reverse();
        }

        let cursor = |event_id: EventId| {
            ordered
                .iter()
                .position(|(_, record)| record.event_id == event_id)
                .ok_or(StoreError::EventNotFound(event_id))
        };
        let begin = specification
            .start
            .map(cursor)
            .transpose()?
            .map_or(0, |index| index + 1);
        let end = specification
            .stop
            .map(cursor)
            .transpose()?
            .unwrap_or(ordered.len());

        Ok(ordered
            .get(begin..end.max(begin))
            .unwrap_or_default()
            .iter()
            .map(|(_, record)| *record)
            .filter(|record| specification.matches(record))
            .take(specification.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

/// Thread-safe in-memory event repository.
///
/// Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<RwLock<State>>,
}

impl InMemoryRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events in the global stream.
    pub fn len(&self) -> usize {
        self.state.read().events.len()
    }

    /// Returns whether no event was ever appended.
    pub fn is_empty(&self) -> bool {
        self.state.read().events.is_empty()
    }
}

#[async_trait]
impl EventRepository for InMemoryRepository {
    #[instrument(name = "memory.append_to_stream", skip_all, fields(stream = %stream, expected_version = %expected_version, count = records.len()))]
    async fn append_to_stream(
        &self,
        records: Vec<Record>,
        stream: &Stream,
        expected_version: ExpectedVersion,
    ) -> StoreResult<()> {
        let expected_version = expected_version.validate_for(stream)?;
        let mut state = self.state.write();

        if let Stream::Named(name) = stream {
            state.check_expected_version(name, stream, expected_version)?;
        }

        let mut batch = HashSet::with_capacity(records.len());
        for record in &records {
            if state.index.contains_key(&record.event_id) || !batch.insert(record.event_id) {
                warn!(event_id = %record.event_id, "[memory.append_to_stream] duplicate event id");
                return Err(StoreError::EventDuplicatedInStream {
                    stream: stream.clone(),
                    event_id: Some(record.event_id),
                });
            }
        }

        let event_ids: Vec<EventId> = records.iter().map(|record| record.event_id).collect();
        for record in records {
            let index = state.events.len();
            state.index.insert(record.event_id, index);
            state.events.push(record);
        }
        if let Stream::Named(name) = stream {
            state
                .streams
                .entry(name.clone())
                .or_default()
                .extend(event_ids.iter().copied());
        }

        info!(count = event_ids.len(), "[memory.append_to_stream] events appended");
        Ok(())
    }

    #[instrument(name = "memory.link_to_stream", skip_all, fields(stream = %stream, expected_version = %expected_version, count = event_ids.len()))]
    async fn link_to_stream(
        &self,
        event_ids: &[EventId],
        stream: &Stream,
        expected_version: ExpectedVersion,
    ) -> StoreResult<()> {
        let name = stream.require_named()?;
        let mut state = self.state.write();

        if let Some(missing) = event_ids
            .iter()
            .find(|event_id| !state.index.contains_key(event_id))
        {
            return Err(StoreError::EventNotFound(*missing));
        }
        state.check_expected_version(name, stream, expected_version)?;

        let members = state.members(name);
        let mut batch = HashSet::with_capacity(event_ids.len());
        for event_id in event_ids {
            if members.contains(event_id) || !batch.insert(*event_id) {
                warn!(event_id = %event_id, "[memory.link_to_stream] event already linked");
                return Err(StoreError::EventDuplicatedInStream {
                    stream: stream.clone(),
                    event_id: Some(*event_id),
                });
            }
        }

        state
            .streams
            .entry(name.clone())
            .or_default()
            .extend(event_ids.iter().copied());

        info!(count = event_ids.len(), "[memory.link_to_stream] events linked");
        Ok(())
    }

    #[instrument(name = "memory.delete_stream", skip(self), fields(stream = %stream))]
    async fn delete_stream(&self, stream: &Stream) -> StoreResult<()> {
        let name = stream.require_named()?;
        if self.state.write().streams.remove(name).is_some() {
            info!("[memory.delete_stream] stream deleted");
        }
        Ok(())
    }

    async fn has_event(&self, event_id: EventId) -> StoreResult<bool> {
        Ok(self.state.read().index.contains_key(&event_id))
    }

    async fn read_event(&self, event_id: EventId) -> StoreResult<Record> {
        self.state
            .read()
            .record(event_id)
            .cloned()
            .ok_or(StoreError::EventNotFound(event_id))
    }

    async fn last_stream_event(&self, stream: &Stream) -> StoreResult<Option<Record>> {
        let state = self.state.read();
        let last = match stream {
            Stream::Global => state.events.last(),
            Stream::Named(name) => state
                .members(name)
                .last()
                .and_then(|event_id| state.record(*event_id)),
        };
        Ok(last.cloned())
    }

    async fn read(&self, specification: &SpecificationResult) -> StoreResult<Vec<Record>> {
        self.state.read().read(specification)
    }

    async fn count(&self, specification: &SpecificationResult) -> StoreResult<usize> {
        self.state
            .read()
            .read(specification)
            .map(|records| records.len())
    }

    async fn streams_of(&self, event_id: EventId) -> StoreResult<Vec<Stream>> {
        let state = self.state.read();
        let mut names: Vec<&StreamName> = state
            .streams
            .iter()
            .filter(|(_, members)| members.contains(&event_id))
            .map(|(name, _)| name)
            .collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| Stream::Named(name.clone()))
            .collect())
    }

    #[instrument(name = "memory.update_messages", skip_all, fields(count = records.len()))]
    async fn update_messages(&self, records: Vec<Record>) -> StoreResult<()> {
        let mut state = self.state.write();
        if let Some(missing) = records
            .iter()
            .find(|record| !state.index.contains_key(&record.event_id))
        {
            return Err(StoreError::EventNotFound(missing.event_id));
        }

        for record in records {
            let Some(index) = state.index.get(&record.event_id).copied() else {
                continue;
            };
            let stored = &mut state.events[index];
            stored.event_type = record.event_type;
            stored.data = record.data;
            stored.metadata = record.metadata;
            stored.valid_at = record.valid_at;
        }
        info!("[memory.update_messages] events rewritten");
        Ok(())
    }

    async fn position_in_stream(&self, event_id: EventId, stream: &Stream) -> StoreResult<u64> {
        match stream {
            Stream::Global => self.global_position(event_id).await,
            Stream::Named(name) => self
                .state
                .read()
                .members(name)
                .iter()
                .position(|member| *member == event_id)
                .map(|position| position as u64)
                .ok_or(StoreError::EventNotFound(event_id)),
        }
    }

    async fn global_position(&self, event_id: EventId) -> StoreResult<u64> {
        self.state
            .read()
            .index
            .get(&event_id)
            .map(|&index| index as u64)
            .ok_or(StoreError::EventNotFound(event_id))
    }

    async fn event_in_stream(&self, event_id: EventId, stream: &Stream) -> StoreResult<bool> {
        let state = self.state.read();
        Ok(match stream {
            Stream::Global => state.index.contains_key(&event_id),
            Stream::Named(name) => state.members(name).contains(&event_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventstash::specification::TimeColumn;
    use eventstash::types::{EventType, Timestamp};
    use proptest::prelude::*;

    fn record(event_type: &str) -> Record {
        Record::new(
            EventId::generate(),
            EventType::try_new(event_type).unwrap(),
            b"{}".to_vec(),
            b"{}".to_vec(),
            Timestamp::now(),
        )
    }

    fn stream(name: &str) -> Stream {
        Stream::named(name).unwrap()
    }

    fn read_stream(name: &str) -> SpecificationResult {
        SpecificationResult {
            stream: stream(name),
            ..SpecificationResult::default()
        }
    }

    fn ids(records: &[Record]) -> Vec<EventId> {
        records.iter().map(|record| record.event_id).collect()
    }

    #[tokio::test]
    async fn appends_get_dense_positions() {
        let repository = InMemoryRepository::new();
        let orders = stream("orders");
        let first = vec![record("A"), record("B")];
        let second = vec![record("C")];

        repository
            .append_to_stream(first.clone(), &orders, ExpectedVersion::None)
            .await
            .unwrap();
        repository
            .append_to_stream(second.clone(), &orders, ExpectedVersion::Exact(1))
            .await
            .unwrap();

        for (expected, record) in first.iter().chain(&second).enumerate() {
            assert_eq!(
                repository
                    .position_in_stream(record.event_id, &orders)
                    .await
                    .unwrap(),
                expected as u64
            );
        }
        assert_eq!(repository.len(), 3);
    }

    #[tokio::test]
    async fn duplicate_in_batch_leaves_nothing_behind() {
        let repository = InMemoryRepository::new();
        let duplicate = record("A");

        let result = repository
            .append_to_stream(
                vec![duplicate.clone(), duplicate],
                &stream("orders"),
                ExpectedVersion::Any,
            )
            .await;

        assert!(matches!(
            result,
            Err(StoreError::EventDuplicatedInStream { .. })
        ));
        assert!(repository.is_empty());
    }

    #[tokio::test]
    async fn cursors_are_exclusive_in_both_directions() {
        let repository = InMemoryRepository::new();
        let records: Vec<Record> = (0..5).map(|_| record("A")).collect();
        repository
            .append_to_stream(records.clone(), &stream("s"), ExpectedVersion::Any)
            .await
            .unwrap();

        let forward = repository
            .read(&SpecificationResult {
                start: Some(records[1].event_id),
                stop: Some(records[4].event_id),
                ..read_stream("s")
            })
            .await
            .unwrap();
        assert_eq!(ids(&forward), ids(&records[2..4]));

        let backward = repository
            .read(&SpecificationResult {
                direction: Direction::Backward,
                start: Some(records[3].event_id),
                ..read_stream("s")
            })
            .await
            .unwrap();
        assert_eq!(
            ids(&backward),
            vec![records[2].event_id, records[1].event_id, records[0].event_id]
        );
    }

    #[tokio::test]
    async fn cursor_outside_the_stream_is_not_found() {
        let repository = InMemoryRepository::new();
        let outside = record("A");
        repository
            .append_to_stream(vec![outside.clone()], &Stream::Global, ExpectedVersion::Auto)
            .await
            .unwrap();

        let result = repository
            .read(&SpecificationResult {
                start: Some(outside.event_id),
                ..read_stream("empty")
            })
            .await;
        assert!(matches!(result, Err(StoreError::EventNotFound(id)) if id == outside.event_id));
    }

    #[tokio::test]
    async fn as_of_sorts_by_business_time() {
        let repository = InMemoryRepository::new();
        let late = record("A");
        let early = record("A").with_valid_at(
            Timestamp::new(late.created_at.into_datetime() - chrono::Duration::days(1)),
        );
        repository
            .append_to_stream(vec![late.clone(), early.clone()], &stream("s"), ExpectedVersion::Any)
            .await
            .unwrap();

        let by_position = repository.read(&read_stream("s")).await.unwrap();
        let by_valid_at = repository
            .read(&SpecificationResult {
                time_sort: Some(TimeColumn::ValidAt),
                ..read_stream("s")
            })
            .await
            .unwrap();

        assert_eq!(ids(&by_position), vec![late.event_id, early.event_id]);
        assert_eq!(ids(&by_valid_at), vec![early.event_id, late.event_id]);
    }

    #[tokio::test]
    async fn update_messages_rewrites_in_place() {
        let repository = InMemoryRepository::new();
        let original = record("A");
        repository
            .append_to_stream(vec![original.clone()], &stream("s"), ExpectedVersion::Any)
            .await
            .unwrap();

        let mut rewritten = original.clone();
        rewritten.event_type = EventType::try_new("B").unwrap();
        rewritten.data = b"{\"v\":2}".to_vec();
        repository
            .update_messages(vec![rewritten.clone()])
            .await
            .unwrap();

        let stored = repository.read_event(original.event_id).await.unwrap();
        assert_eq!(stored, rewritten);
        assert_eq!(
            repository
                .position_in_stream(original.event_id, &stream("s"))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn update_messages_with_unknown_id_changes_nothing() {
        let repository = InMemoryRepository::new();
        let original = record("A");
        repository
            .append_to_stream(vec![original.clone()], &Stream::Global, ExpectedVersion::Auto)
            .await
            .unwrap();

        let mut rewritten = original.clone();
        rewritten.data = b"{}".to_vec();
        let result = repository
            .update_messages(vec![rewritten, record("B")])
            .await;

        assert!(matches!(result, Err(StoreError::EventNotFound(_))));
        assert_eq!(repository.read_event(original.event_id).await.unwrap(), original);
    }

    proptest! {
        #[test]
        fn links_and_appends_share_one_position_sequence(
            appends in prop::collection::vec(any::<bool>(), 1..20),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let repository = InMemoryRepository::new();
                let source = stream("source");
                let target = stream("target");
                let mut expected = Vec::new();

                for append in appends {
                    let next = record("A");
                    expected.push(next.event_id);
                    if append {
                        repository
                            .append_to_stream(vec![next], &target, ExpectedVersion::Any)
                            .await
                            .unwrap();
                    } else {
                        repository
                            .append_to_stream(vec![next.clone()], &source, ExpectedVersion::Any)
                            .await
                            .unwrap();
                        repository
                            .link_to_stream(&[next.event_id], &target, ExpectedVersion::Any)
                            .await
                            .unwrap();
                    }
                }

                let stored = repository.read(&read_stream("target")).await.unwrap();
                prop_assert_eq!(ids(&stored), expected.clone());
                for (position, event_id) in expected.iter().enumerate() {
                    prop_assert_eq!(
                        repository.position_in_stream(*event_id, &target).await.unwrap(),
                        position as u64
                    );
                }
                Ok(())
            })?;
        }
    }
}
