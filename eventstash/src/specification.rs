//! Read descriptors and the reader that resolves them.
//!
//! A [`Specification`] is an immutable, chainable description of a read.
//! Building one never touches storage; only the terminal methods (`to_vec`,
//! `first`, `last`, `count`, `event`, `each`, `each_batch`) do. Repositories
//! receive the plain data form, [`SpecificationResult`], and return records
//! in the order it describes.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::errors::{StoreError, StoreResult};
use crate::event::{DomainEvent, Event};
use crate::mapper::Mapper;
use crate::record::Record;
use crate::repository::EventRepository;
use crate::types::{BatchSize, EventId, EventType, Stream, Timestamp};

/// Read direction relative to stream position (or time, for time-sorted reads).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    /// Oldest first.
    #[default]
    Forward,
    /// Newest first.
    Backward,
}

impl Direction {
    /// The opposite direction.
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Self::Forward => Self::Backward,
            Self::Backward => Self::Forward,
        }
    }
}

/// Record time column used by time-sorted reads and time filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeColumn {
    /// System time (`as_at`).
    CreatedAt,
    /// Business time (`as_of`).
    ValidAt,
}

impl TimeColumn {
    /// Reads this column from a record.
    pub const fn of(self, record: &Record) -> Timestamp {
        match self {
            Self::CreatedAt => record.created_at,
            Self::ValidAt => record.valid_at,
        }
    }
}

/// A time filter on the query's time column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeBound {
    /// Strictly before the instant.
    OlderThan(Timestamp),
    /// At or before the instant.
    OlderThanOrEqual(Timestamp),
    /// Strictly after the instant.
    NewerThan(Timestamp),
    /// At or after the instant.
    NewerThanOrEqual(Timestamp),
}

impl TimeBound {
    /// Returns whether `time` satisfies the bound.
    pub fn matches(self, time: Timestamp) -> bool {
        match self {
            Self::OlderThan(bound) => time < bound,
            Self::OlderThanOrEqual(bound) => time <= bound,
            Self::NewerThan(bound) => time > bound,
            Self::NewerThanOrEqual(bound) => time >= bound,
        }
    }
}

/// The plain data of a read, as handed to repositories.
///
/// All predicates are ANDed. `start` and `stop` are exclusive cursors given
/// as event ids of the target stream, interpreted in read direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecificationResult {
    /// Stream to read
    pub stream: Stream,
    /// Read direction
    pub direction: Direction,
    /// Exclusive start cursor
    pub start: Option<EventId>,
    /// Exclusive stop cursor
    pub stop: Option<EventId>,
    /// Maximum number of records
    pub limit: Option<usize>,
    /// Accepted event types; `None` accepts every type
    pub event_types: Option<Vec<EventType>>,
    /// Accepted event ids; `None` accepts every id
    pub event_ids: Option<Vec<EventId>>,
    /// Time filters on [`SpecificationResult::time_column`]
    pub time_bounds: Vec<TimeBound>,
    /// Sort by time instead of position
    pub time_sort: Option<TimeColumn>,
    /// Chunk size for batched reads
    pub batch_size: BatchSize,
}

impl Default for SpecificationResult {
    fn default() -> Self {
        Self {
            stream: Stream::Global,
            direction: Direction::Forward,
            start: None,
            stop: None,
            limit: None,
            event_types: None,
            event_ids: None,
            time_bounds: Vec::new(),
            time_sort: None,
            batch_size: BatchSize::default(),
        }
    }
}

impl SpecificationResult {
    /// Column the time filters compare: `valid_at` for `as_of` reads,
    /// `created_at` otherwise.
    pub fn time_column(&self) -> TimeColumn {
        self.time_sort.unwrap_or(TimeColumn::CreatedAt)
    }

    /// Whether `record` passes the type, id and time filters.
    ///
    /// Stream membership and cursors are the repository's concern.
    pub fn matches(&self, record: &Record) -> bool {
        let column = self.time_column();
        self.event_types
            .as_ref()
            .map_or(true, |types| types.contains(&record.event_type))
            && self
                .event_ids
                .as_ref()
                .map_or(true, |ids| ids.contains(&record.event_id))
            && self
                .time_bounds
                .iter()
                .all(|bound| bound.matches(column.of(record)))
    }

    /// Rejects descriptors no repository can answer.
    pub fn validate(&self) -> StoreResult<()> {
        if self.limit == Some(0) {
            return Err(StoreError::InvalidQuery(
                "limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A builder error, reported when the read runs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Invalid {
    ReservedStreamName,
    StreamName(String),
    Query(String),
}

impl Invalid {
    fn to_error(&self) -> StoreError {
        match self {
            Self::ReservedStreamName => StoreError::ReservedStreamName,
            Self::StreamName(detail) => StoreError::InvalidStreamName(detail.clone()),
            Self::Query(detail) => StoreError::InvalidQuery(detail.clone()),
        }
    }
}

impl From<StoreError> for Invalid {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::ReservedStreamName => Self::ReservedStreamName,
            StoreError::InvalidStreamName(detail) => Self::StreamName(detail),
            StoreError::InvalidQuery(detail) => Self::Query(detail),
            other => Self::Query(other.to_string()),
        }
    }
}

/// Chainable read descriptor bound to a repository and a mapper.
pub struct Specification<E> {
    repository: Arc<dyn EventRepository>,
    mapper: Arc<Mapper<E>>,
    result: SpecificationResult,
    invalid: Option<Invalid>,
}

impl<E> Clone for Specification<E> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            mapper: Arc::clone(&self.mapper),
            result: self.result.clone(),
            invalid: self.invalid.clone(),
        }
    }
}

impl<E> std::fmt::Debug for Specification<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Specification")
            .field("result", &self.result)
            .field("invalid", &self.invalid)
            .finish_non_exhaustive()
    }
}

impl<E: DomainEvent> Specification<E> {
    /// Creates a descriptor reading the whole global stream forward.
    pub fn new(repository: Arc<dyn EventRepository>, mapper: Arc<Mapper<E>>) -> Self {
        Self {
            repository,
            mapper,
            result: SpecificationResult::default(),
            invalid: None,
        }
    }

    /// The plain data this descriptor resolves to.
    pub const fn result(&self) -> &SpecificationResult {
        &self.result
    }

    // The first builder error wins.
    fn invalidate(mut self, error: StoreError) -> Self {
        if self.invalid.is_none() {
            self.invalid = Some(Invalid::from(error));
        }
        self
    }

    /// Reads the stream called `name`.
    ///
    /// The reserved global name is rejected when the read runs; use
    /// [`Specification::for_stream`] with [`Stream::Global`] instead.
    #[must_use]
    pub fn stream(self, name: impl Into<String>) -> Self {
        match Stream::named(name) {
            Ok(stream) => self.for_stream(stream),
            Err(error) => self.invalidate(error),
        }
    }

    /// Reads `stream`.
    #[must_use]
    pub fn for_stream(mut self, stream: Stream) -> Self {
        self.result.stream = stream;
        self
    }

    /// Starts after `event_id`.
    #[must_use]
    pub fn from(mut self, event_id: EventId) -> Self {
        self.result.start = Some(event_id);
        self
    }

    /// Stops before `event_id`.
    #[must_use]
    pub fn to(mut self, event_id: EventId) -> Self {
        self.result.stop = Some(event_id);
        self
    }

    /// Returns at most `count` events.
    #[must_use]
    pub fn limit(mut self, count: usize) -> Self {
        self.result.limit = Some(count);
        self
    }

    /// Reads oldest first.
    #[must_use]
    pub fn forward(mut self) -> Self {
        self.result.direction = Direction::Forward;
        self
    }

    /// Reads newest first.
    #[must_use]
    pub fn backward(mut self) -> Self {
        self.result.direction = Direction::Backward;
        self
    }

    /// Only events of `event_type`.
    #[must_use]
    pub fn of_type(self, event_type: impl Into<String>) -> Self {
        self.of_types([event_type])
    }

    /// Only events of any of `event_types`.
    #[must_use]
    pub fn of_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parsed: StoreResult<Vec<EventType>> = event_types
            .into_iter()
            .map(|name| {
                let name = name.into();
                EventType::try_new(name.clone()).map_err(|error| {
                    StoreError::InvalidQuery(format!("invalid event type `{name}`: {error}"))
                })
            })
            .collect();
        match parsed {
            Ok(types) => {
                self.result.event_types = Some(types);
                self
            }
            Err(error) => self.invalidate(error),
        }
    }

    /// Only the event `event_id`.
    #[must_use]
    pub fn with_id(self, event_id: EventId) -> Self {
        self.with_ids([event_id])
    }

    /// Only events whose id is in `event_ids`.
    #[must_use]
    pub fn with_ids(mut self, event_ids: impl IntoIterator<Item = EventId>) -> Self {
        self.result.event_ids = Some(event_ids.into_iter().collect());
        self
    }

    fn with_time_bound(mut self, bound: TimeBound) -> Self {
        self.result.time_bounds.push(bound);
        self
    }

    /// Only events strictly before `time`.
    #[must_use]
    pub fn older_than(self, time: Timestamp) -> Self {
        self.with_time_bound(TimeBound::OlderThan(time))
    }

    /// Only events at or before `time`.
    #[must_use]
    pub fn older_than_or_equal(self, time: Timestamp) -> Self {
        self.with_time_bound(TimeBound::OlderThanOrEqual(time))
    }

    /// Only events strictly after `time`.
    #[must_use]
    pub fn newer_than(self, time: Timestamp) -> Self {
        self.with_time_bound(TimeBound::NewerThan(time))
    }

    /// Only events at or after `time`.
    #[must_use]
    pub fn newer_than_or_equal(self, time: Timestamp) -> Self {
        self.with_time_bound(TimeBound::NewerThanOrEqual(time))
    }

    /// Only events in the half-open range `[from, until)`.
    #[must_use]
    pub fn between(self, from: Timestamp, until: Timestamp) -> Self {
        self.newer_than_or_equal(from).older_than(until)
    }

    /// Orders by system time.
    #[must_use]
    pub fn as_at(mut self) -> Self {
        self.result.time_sort = Some(TimeColumn::CreatedAt);
        self
    }

    /// Orders by business time; time filters then compare business time too.
    #[must_use]
    pub fn as_of(mut self) -> Self {
        self.result.time_sort = Some(TimeColumn::ValidAt);
        self
    }

    /// Fetches `size` events per round trip in batched reads.
    #[must_use]
    pub fn in_batches(mut self, size: usize) -> Self {
        match BatchSize::try_new(size) {
            Ok(batch_size) => {
                self.result.batch_size = batch_size;
                self
            }
            Err(error) => self.invalidate(StoreError::InvalidQuery(format!(
                "batch size must be greater than zero: {error}"
            ))),
        }
    }

    fn checked(&self) -> StoreResult<&SpecificationResult> {
        if let Some(invalid) = &self.invalid {
            return Err(invalid.to_error());
        }
        self.result.validate()?;
        Ok(&self.result)
    }

    async fn read_records(&self, result: &SpecificationResult) -> StoreResult<Vec<Record>> {
        self.repository.read(result).await
    }

    /// Reads every matching event.
    pub async fn to_vec(&self) -> StoreResult<Vec<Event<E>>> {
        let result = self.checked()?;
        let records = self.read_records(result).await?;
        self.mapper.load_all(&records)
    }

    /// Reads the first matching event.
    pub async fn first(&self) -> StoreResult<Option<Event<E>>> {
        let result = self.checked()?;
        if result.limit.is_some_and(|limit| limit > 1) {
            return Err(StoreError::InvalidQuery(
                "first cannot be combined with a limit greater than one".to_string(),
            ));
        }
        let result = SpecificationResult {
            limit: Some(1),
            ..result.clone()
        };
        let records = self.read_records(&result).await?;
        records.first().map(|record| self.mapper.load(record)).transpose()
    }

    /// Reads the last matching event.
    ///
    /// With a limit this is the last event of the limited read.
    pub async fn last(&self) -> StoreResult<Option<Event<E>>> {
        let result = self.checked()?;
        let records = if result.limit.is_some() {
            self.read_records(result).await?
        } else {
            let reversed = SpecificationResult {
                direction: result.direction.reverse(),
                limit: Some(1),
                ..result.clone()
            };
            self.read_records(&reversed).await?
        };
        records.last().map(|record| self.mapper.load(record)).transpose()
    }

    /// Counts matching events, honoring the limit.
    pub async fn count(&self) -> StoreResult<usize> {
        let result = self.checked()?;
        self.repository.count(result).await
    }

    /// Reads the event `event_id` if it matches this descriptor.
    ///
    /// Fails with `EventNotFound` when the event does not exist or is filtered
    /// out by the descriptor.
    pub async fn event(&self, event_id: EventId) -> StoreResult<Event<E>> {
        let result = self.checked()?;
        if result
            .event_ids
            .as_ref()
            .is_some_and(|ids| !ids.contains(&event_id))
        {
            return Err(StoreError::EventNotFound(event_id));
        }
        let result = SpecificationResult {
            event_ids: Some(vec![event_id]),
            limit: Some(1),
            ..result.clone()
        };
        let records = self.read_records(&result).await?;
        records
            .first()
            .map(|record| self.mapper.load(record))
            .transpose()?
            .ok_or(StoreError::EventNotFound(event_id))
    }

    /// Lazily reads matching events in chunks of the batch size.
    ///
    /// Each chunk is fetched with the previous chunk's last event as start
    /// cursor. The stream can be consumed again by calling this method again.
    pub fn each_batch(&self) -> BoxStream<'static, StoreResult<Vec<Event<E>>>> {
        let result = match self.checked() {
            Ok(result) => result.clone(),
            Err(error) => return stream::once(async move { Err(error) }).boxed(),
        };
        let state = BatchCursor {
            repository: Arc::clone(&self.repository),
            mapper: Arc::clone(&self.mapper),
            next: Some(result.start),
            remaining: result.limit,
            result,
        };
        stream::try_unfold(state, BatchCursor::next_batch).boxed()
    }

    /// Lazily reads matching events one by one, fetching them in batches.
    pub fn each(&self) -> BoxStream<'static, StoreResult<Event<E>>> {
        self.each_batch()
            .map_ok(|batch| stream::iter(batch.into_iter().map(Ok::<_, StoreError>)))
            .try_flatten()
            .boxed()
    }
}

struct BatchCursor<E> {
    repository: Arc<dyn EventRepository>,
    mapper: Arc<Mapper<E>>,
    result: SpecificationResult,
    // `None` once the last chunk was read; the inner option is the cursor.
    next: Option<Option<EventId>>,
    remaining: Option<usize>,
}

impl<E: DomainEvent> BatchCursor<E> {
    async fn next_batch(mut self) -> StoreResult<Option<(Vec<Event<E>>, Self)>> {
        let Some(start) = self.next else {
            return Ok(None);
        };
        let batch_size = usize::from(self.result.batch_size);
        let wanted = self
            .remaining
            .map_or(batch_size, |remaining| remaining.min(batch_size));
        if wanted == 0 {
            return Ok(None);
        }

        let chunk = SpecificationResult {
            start,
            limit: Some(wanted),
            ..self.result.clone()
        };
        let records = self.repository.read(&chunk).await?;
        if records.is_empty() {
            return Ok(None);
        }

        self.remaining = self
            .remaining
            .map(|remaining| remaining.saturating_sub(records.len()));
        self.next = (records.len() == wanted)
            .then(|| records.last().map(|record| record.event_id));
        let events = self.mapper.load_all(&records)?;
        Ok(Some((events, self)))
    }
}
