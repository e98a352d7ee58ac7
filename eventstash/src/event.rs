//! Domain events and their metadata.
//!
//! An [`Event`] wraps a caller-defined payload with its id and [`Metadata`].
//! The payload type implements [`DomainEvent`], which only has to name its
//! concrete type; deserialization is routed through the mapper's
//! [`TypeRegistry`](crate::mapper::TypeRegistry).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{EventId, Timestamp};

/// A payload that can be stored and published.
///
/// Payloads are typically an enum with one variant per event type, each
/// variant wrapping a struct.
pub trait DomainEvent: Serialize + Clone + Send + Sync + 'static {
    /// Returns the stored type name of this payload.
    fn event_type(&self) -> &str;
}

/// Metadata attached to every event.
///
/// `timestamp` and `valid_at` are filled by the client at publish time when
/// missing and are stored in the record's own columns. Everything else is
/// serialized with the record's metadata bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// When the event was published
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// When the event is considered to have happened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_at: Option<Timestamp>,
    /// Links events of the same logical workflow
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// The event that directly caused this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    /// Additional custom metadata
    #[serde(flatten)]
    pub custom: BTreeMap<String, Value>,
}

impl Metadata {
    /// Keys of the typed fields; custom metadata may not use them.
    pub const RESERVED_KEYS: [&str; 4] =
        ["timestamp", "valid_at", "correlation_id", "causation_id"];

    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata for an event caused by `event`.
    ///
    /// The correlation id is inherited from `event` (or is its id when it has
    /// none); the causation id is `event`'s id.
    pub fn caused_by<E>(event: &Event<E>) -> Self {
        Self {
            correlation_id: Some(
                event
                    .metadata
                    .correlation_id
                    .unwrap_or_else(|| *event.event_id),
            ),
            causation_id: Some(*event.event_id),
            ..Self::default()
        }
    }

    /// Sets the correlation id.
    #[must_use]
    pub const fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the causation id.
    #[must_use]
    pub const fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Sets the business time.
    #[must_use]
    pub const fn with_valid_at(mut self, valid_at: Timestamp) -> Self {
        self.valid_at = Some(valid_at);
        self
    }

    /// Adds custom metadata.
    #[must_use]
    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// Fills every field that is unset here from `defaults`.
    ///
    /// Values already present always win.
    pub fn merge_missing(&mut self, defaults: &Self) {
        self.timestamp = self.timestamp.or(defaults.timestamp);
        self.valid_at = self.valid_at.or(defaults.valid_at);
        self.correlation_id = self.correlation_id.or(defaults.correlation_id);
        self.causation_id = self.causation_id.or(defaults.causation_id);
        for (key, value) in &defaults.custom {
            self.custom
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

/// A domain event with its identity and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<E> {
    /// Unique identifier for this event
    pub event_id: EventId,
    /// The caller's payload
    pub data: E,
    /// Metadata for this event
    pub metadata: Metadata,
}

impl<E> Event<E> {
    /// Wraps a payload with a freshly generated id and empty metadata.
    pub fn new(data: E) -> Self {
        Self::with_id(EventId::generate(), data)
    }

    /// Wraps a payload with a caller-chosen id.
    pub fn with_id(event_id: EventId, data: E) -> Self {
        Self {
            event_id,
            data,
            metadata: Metadata::new(),
        }
    }

    /// Replaces the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Marks this event as caused by `other`, unless it already names a cause.
    #[must_use]
    pub fn correlate_with<O>(mut self, other: &Event<O>) -> Self {
        self.metadata.merge_missing(&Metadata::caused_by(other));
        self
    }

    /// Returns the publish time, once the event has been stored.
    pub const fn timestamp(&self) -> Option<Timestamp> {
        self.metadata.timestamp
    }

    /// Returns the business time, once the event has been stored.
    pub const fn valid_at(&self) -> Option<Timestamp> {
        self.metadata.valid_at
    }
}

impl<E: DomainEvent> Event<E> {
    /// Returns the stored type name of the payload.
    pub fn event_type(&self) -> &str {
        self.data.event_type()
    }
}
