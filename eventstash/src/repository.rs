//! Repository abstraction for the `eventstash` event store.
//!
//! [`EventRepository`] is the port every storage engine implements. It works
//! on [`Record`]s only; mapping to domain events happens in the client.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::StoreResult;
use crate::record::Record;
use crate::specification::SpecificationResult;
use crate::types::{EventId, ExpectedVersion, Stream};

/// The storage contract all engines must satisfy.
///
/// Every call completes its whole unit of work before returning. Append and
/// link are atomic: after an error nothing from that call is persisted.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Appends new records to `stream`.
    ///
    /// Records are added to the global stream and, for a named stream, get
    /// consecutive positions starting right after the position
    /// `expected_version` resolves to.
    ///
    /// # Errors
    /// * `InvalidExpectedVersion` - anything but `Auto` for the global stream
    /// * `WrongExpectedEventVersion` - the precondition does not hold
    /// * `EventDuplicatedInStream` - an id already exists in the store
    async fn append_to_stream(
        &self,
        records: Vec<Record>,
        stream: &Stream,
        expected_version: ExpectedVersion,
    ) -> StoreResult<()>;

    /// Adds existing events to a named stream.
    ///
    /// # Errors
    /// * `ReservedStreamName` - `stream` is the global stream
    /// * `EventNotFound` - an id does not exist; checked before anything is written
    /// * `WrongExpectedEventVersion` - the precondition does not hold
    /// * `EventDuplicatedInStream` - an event is already part of `stream`
    async fn link_to_stream(
        &self,
        event_ids: &[EventId],
        stream: &Stream,
        expected_version: ExpectedVersion,
    ) -> StoreResult<()>;

    /// Removes every membership of `stream`. The events themselves stay.
    ///
    /// Deleting a stream that has no events succeeds.
    ///
    /// # Errors
    /// * `ReservedStreamName` - `stream` is the global stream
    async fn delete_stream(&self, stream: &Stream) -> StoreResult<()>;

    /// Returns whether the event exists.
    async fn has_event(&self, event_id: EventId) -> StoreResult<bool>;

    /// Reads a single record.
    ///
    /// # Errors
    /// * `EventNotFound` - the event does not exist
    async fn read_event(&self, event_id: EventId) -> StoreResult<Record>;

    /// Reads the record at the highest position of `stream`.
    async fn last_stream_event(&self, stream: &Stream) -> StoreResult<Option<Record>>;

    /// Reads the records `specification` describes, in the order it describes.
    ///
    /// # Errors
    /// * `EventNotFound` - a cursor is not part of the target stream
    async fn read(&self, specification: &SpecificationResult) -> StoreResult<Vec<Record>>;

    /// Counts the records `specification` describes, honoring its limit.
    async fn count(&self, specification: &SpecificationResult) -> StoreResult<usize>;

    /// Returns the named streams the event is a member of.
    async fn streams_of(&self, event_id: EventId) -> StoreResult<Vec<Stream>>;

    /// Rewrites type, payload, metadata and `valid_at` of existing records by id.
    ///
    /// Ids, `created_at`, order and memberships are kept.
    ///
    /// # Errors
    /// * `EventNotFound` - an id does not exist; nothing is updated
    async fn update_messages(&self, records: Vec<Record>) -> StoreResult<()>;

    /// Returns the zero-based position of the event in `stream`.
    ///
    /// For the global stream this is [`EventRepository::global_position`].
    ///
    /// # Errors
    /// * `EventNotFound` - the event is not a member of `stream`
    async fn position_in_stream(&self, event_id: EventId, stream: &Stream) -> StoreResult<u64>;

    /// Returns the position of the event in the global order.
    ///
    /// # Errors
    /// * `EventNotFound` - the event does not exist
    async fn global_position(&self, event_id: EventId) -> StoreResult<u64>;

    /// Returns whether the event is a member of `stream`.
    async fn event_in_stream(&self, event_id: EventId, stream: &Stream) -> StoreResult<bool>;
}

#[async_trait]
impl<R> EventRepository for Arc<R>
where
    R: EventRepository + ?Sized,
{
    async fn append_to_stream(
        &self,
        records: Vec<Record>,
        stream: &Stream,
        expected_version: ExpectedVersion,
    ) -> StoreResult<()> {
        (**self)
            .append_to_stream(records, stream, expected_version)
            .await
    }

    async fn link_to_stream(
        &self,
        event_ids: &[EventId],
        stream: &Stream,
        expected_version: ExpectedVersion,
    ) -> StoreResult<()> {
        (**self)
            .link_to_stream(event_ids, stream, expected_version)
            .await
    }

    async fn delete_stream(&self, stream: &Stream) -> StoreResult<()> {
        (**self).delete_stream(stream).await
    }

    async fn has_event(&self, event_id: EventId) -> StoreResult<bool> {
        (**self).has_event(event_id).await
    }

    async fn read_event(&self, event_id: EventId) -> StoreResult<Record> {
        (**self).read_event(event_id).await
    }

    async fn last_stream_event(&self, stream: &Stream) -> StoreResult<Option<Record>> {
        (**self).last_stream_event(stream).await
    }

    async fn read(&self, specification: &SpecificationResult) -> StoreResult<Vec<Record>> {
        (**self).read(specification).await
    }

    async fn count(&self, specification: &SpecificationResult) -> StoreResult<usize> {
        (**self).count(specification).await
    }

    async fn streams_of(&self, event_id: EventId) -> StoreResult<Vec<Stream>> {
        (**self).streams_of(event_id).await
    }

    async fn update_messages(&self, records: Vec<Record>) -> StoreResult<()> {
        (**self).update_messages(records).await
    }

    async fn position_in_stream(&self, event_id: EventId, stream: &Stream) -> StoreResult<u64> {
        (**self).position_in_stream(event_id, stream).await
    }

    async fn global_position(&self, event_id: EventId) -> StoreResult<u64> {
        (**self).global_position(event_id).await
    }

    async fn event_in_stream(&self, event_id: EventId, stream: &Stream) -> StoreResult<bool> {
        (**self).event_in_stream(event_id, stream).await
    }
}
