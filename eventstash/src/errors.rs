//! Error types for `eventstash`.
//!
//! Every failure of the store is reported through [`StoreError`]. Variants are
//! grouped by what the caller can do about them:
//!
//! - **Concurrency conflict** (`WrongExpectedEventVersion`): re-read and retry
//!   with fresh state if appropriate. Never retried internally.
//! - **Duplicate identity** (`EventDuplicatedInStream`): retrying with the same
//!   id always fails again.
//! - **Not found** (`EventNotFound`): the referenced event does not exist, or is
//!   not part of the stream used as a cursor.
//! - **Programmer errors** (`InvalidExpectedVersion`, `ReservedStreamName`,
//!   `InvalidStreamName`, `InvalidQuery`, `InvalidHandler`): fail fast, before
//!   any storage interaction.
//! - **Mapping** (`EncodingFailed`, `DecodingFailed`, `UnknownEventType`).
//! - **Dispatch** (`SubscriberFailed`, `SchedulerFailed`): the write already
//!   committed; a subscriber or scheduler failed afterwards.
//! - **Infrastructure** (`StoreFailure`, `Configuration`).
//!
//! Append and link operations are all-or-nothing: after any error from them,
//! nothing from that call was persisted.

use thiserror::Error;

use crate::types::{EventId, EventType, ExpectedVersion, Stream};

/// Error returned by handlers and schedulers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used across the crate.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stream's last position did not match the expected version.
    #[error("Wrong expected version {expected} for stream '{stream}'")]
    WrongExpectedEventVersion {
        /// The stream that was written to
        stream: Stream,
        /// The precondition the caller supplied
        expected: ExpectedVersion,
    },

    /// An event id already exists in the store or in the target stream.
    #[error("Event {} already exists in stream '{stream}'", display_event_id(.event_id.as_ref()))]
    EventDuplicatedInStream {
        /// The stream that was written to
        stream: Stream,
        /// The duplicated id, when the backend can tell which one it was
        event_id: Option<EventId>,
    },

    /// The referenced event does not exist.
    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    /// The expected version cannot be used with the target stream.
    #[error("Invalid expected version: {0}")]
    InvalidExpectedVersion(String),

    /// The global stream was used where only a named stream is allowed.
    #[error("The global stream name is reserved and cannot be used as an explicit target")]
    ReservedStreamName,

    /// A stream name failed validation.
    #[error("Invalid stream name: {0}")]
    InvalidStreamName(String),

    /// A read specification is not consistent.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The payload or metadata could not be represented by the serializer.
    #[error("Encoding event of type '{event_type}' failed: {detail}")]
    EncodingFailed {
        /// The event type being encoded
        event_type: String,
        /// What the serializer reported
        detail: String,
    },

    /// Stored bytes could not be turned back into an event.
    #[error("Decoding event {event_id} of type '{event_type}' failed: {detail}")]
    DecodingFailed {
        /// The event being decoded
        event_id: EventId,
        /// Its stored type name
        event_type: String,
        /// What the serializer or constructor reported
        detail: String,
    },

    /// No constructor is registered for a stored type name.
    #[error("Unknown event type: {0}")]
    UnknownEventType(EventType),

    /// No dispatch strategy accepts this subscriber.
    #[error("Invalid handler: {0}")]
    InvalidHandler(String),

    /// A subscriber failed while handling a published event.
    #[error("Subscriber {subscriber} failed handling event {event_id}: {source}")]
    SubscriberFailed {
        /// Description of the subscriber
        subscriber: String,
        /// The event being handled
        event_id: EventId,
        /// The error the subscriber returned
        #[source]
        source: HandlerError,
    },

    /// A scheduler could not accept a record for asynchronous delivery.
    #[error("Scheduling job {job} for event {event_id} failed: {source}")]
    SchedulerFailed {
        /// The job the record was meant for
        job: String,
        /// The event being scheduled
        event_id: EventId,
        /// The error the scheduler returned
        #[source]
        source: HandlerError,
    },

    /// The storage backend failed for a reason unrelated to the store's invariants.
    #[error("Store failure during {operation}: {detail}")]
    StoreFailure {
        /// The operation that failed
        operation: Operation,
        /// The backend's description of the failure
        detail: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

fn display_event_id(event_id: Option<&EventId>) -> String {
    event_id.map_or_else(|| "<unknown>".to_string(), ToString::to_string)
}

impl StoreError {
    /// Returns whether the error is an optimistic concurrency conflict.
    pub const fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::WrongExpectedEventVersion { .. })
    }
}

/// Identifies the store operation that failed.
///
/// Used by [`StoreError::StoreFailure`] to say which operation hit an
/// infrastructure failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Opening a transaction.
    BeginTransaction,
    /// Committing a transaction.
    CommitTransaction,
    /// Appending records to a stream.
    AppendToStream,
    /// Linking existing events to a stream.
    LinkToStream,
    /// Deleting a stream's memberships.
    DeleteStream,
    /// Reading a single event or a stream.
    Read,
    /// Counting events.
    Count,
    /// Rewriting stored events in place.
    UpdateMessages,
    /// Looking up stream memberships of an event.
    StreamsOf,
    /// Running schema migrations.
    Migrate,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BeginTransaction => "begin_transaction",
            Self::CommitTransaction => "commit_transaction",
            Self::AppendToStream => "append_to_stream",
            Self::LinkToStream => "link_to_stream",
            Self::DeleteStream => "delete_stream",
            Self::Read => "read",
            Self::Count => "count",
            Self::UpdateMessages => "update_messages",
            Self::StreamsOf => "streams_of",
            Self::Migrate => "migrate",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_without_known_id_displays_placeholder() {
        let error = StoreError::EventDuplicatedInStream {
            stream: Stream::Global,
            event_id: None,
        };
        assert_eq!(
            error.to_string(),
            "Event <unknown> already exists in stream 'all'"
        );
    }

    #[test]
    fn wrong_expected_version_is_a_concurrency_conflict() {
        let error = StoreError::WrongExpectedEventVersion {
            stream: Stream::named("orders").unwrap(),
            expected: ExpectedVersion::Exact(4),
        };
        assert!(error.is_concurrency_conflict());
        assert_eq!(
            error.to_string(),
            "Wrong expected version 4 for stream 'orders'"
        );
        assert!(!StoreError::ReservedStreamName.is_concurrency_conflict());
    }

    #[test]
    fn store_failure_names_the_operation() {
        let error = StoreError::StoreFailure {
            operation: Operation::LinkToStream,
            detail: "connection reset".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Store failure during link_to_stream: connection reset"
        );
    }
}
