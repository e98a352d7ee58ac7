//! The storage-neutral unit the repositories persist.

use serde::{Deserialize, Serialize};

use crate::types::{EventId, EventType, Timestamp};

/// A serialized event as it exists in storage.
///
/// `data` and `metadata` are opaque bytes produced by the configured
/// serializer. `created_at` is system time; `valid_at` is business time and
/// defaults to `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier for this event
    pub event_id: EventId,
    /// Type tag used to resolve the domain type on load
    pub event_type: EventType,
    /// Serialized payload
    pub data: Vec<u8>,
    /// Serialized metadata
    pub metadata: Vec<u8>,
    /// When the event was appended
    pub created_at: Timestamp,
    /// When the event is considered to have happened
    pub valid_at: Timestamp,
}

impl Record {
    /// Creates a new record whose business time equals its system time.
    pub fn new(
        event_id: EventId,
        event_type: EventType,
        data: Vec<u8>,
        metadata: Vec<u8>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            event_id,
            event_type,
            data,
            metadata,
            created_at,
            valid_at: created_at,
        }
    }

    /// Overrides the business time.
    #[must_use]
    pub const fn with_valid_at(mut self, valid_at: Timestamp) -> Self {
        self.valid_at = valid_at;
        self
    }
}
