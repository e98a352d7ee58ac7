//! Conversion between domain events and storage records.
//!
//! A [`Mapper`] runs every event through the same pipeline:
//!
//! 1. the domain step turns the payload and metadata into structured values,
//! 2. each configured [`Transformation`] rewrites the resulting [`RecordDraft`],
//! 3. the [`Serializer`] turns the structured values into bytes.
//!
//! Loading runs the pipeline backwards and resolves the payload type through
//! the [`TypeRegistry`].

mod serializer;
mod transformations;
mod type_registry;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};

pub use self::serializer::{
    JsonSerializer, MessagePackSerializer, SerializationError, SerializationFormat, Serializer,
};
pub use self::transformations::{
    EventTypeRemapping, MetadataKeyNormalization, RecordDraft, Transformation,
};
pub use self::type_registry::{TypeRegistry, UnknownTypePolicy};

use crate::errors::{StoreError, StoreResult};
use crate::event::{DomainEvent, Event, Metadata};
use crate::record::Record;
use crate::types::{EventId, EventType, Timestamp};

/// Cache of events this mapper has seen stored, keyed by id.
///
/// Loading a cached id returns the cached event without touching the
/// serializer or the registry.
#[derive(Debug)]
pub struct IdentityMap<E> {
    events: Mutex<HashMap<EventId, Event<E>>>,
}

impl<E: Clone> IdentityMap<E> {
    fn new() -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, event_id: EventId) -> Option<Event<E>> {
        self.events.lock().get(&event_id).cloned()
    }

    fn insert(&self, event: Event<E>) {
        self.events.lock().insert(event.event_id, event);
    }

    /// Number of cached events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Forgets every cached event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// Converts [`Event`]s to [`Record`]s and back.
pub struct Mapper<E> {
    registry: TypeRegistry<E>,
    transformations: Vec<Arc<dyn Transformation>>,
    serializer: Arc<dyn Serializer>,
    identity_map: Option<IdentityMap<E>>,
}

impl<E: DomainEvent> std::fmt::Debug for Mapper<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper")
            .field("registry", &self.registry)
            .field("transformations", &self.transformations.len())
            .field("format", &self.serializer.format())
            .field("identity_map", &self.identity_map.is_some())
            .finish()
    }
}

impl<E: DomainEvent> Mapper<E> {
    /// Creates a JSON mapper resolving payloads through `registry`.
    pub fn new(registry: TypeRegistry<E>) -> Self {
        Self {
            registry,
            transformations: Vec::new(),
            serializer: Arc::new(JsonSerializer),
            identity_map: None,
        }
    }

    /// Replaces the serializer.
    #[must_use]
    pub fn with_serializer(mut self, serializer: impl Serializer + 'static) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    /// Uses the serializer for `format`.
    #[must_use]
    pub fn with_format(mut self, format: SerializationFormat) -> Self {
        self.serializer = format.create_serializer();
        self
    }

    /// Appends a step to the pipeline.
    #[must_use]
    pub fn with_transformation(mut self, transformation: impl Transformation + 'static) -> Self {
        self.transformations.push(Arc::new(transformation));
        self
    }

    /// Enables the identity map.
    #[must_use]
    pub fn with_identity_map(mut self) -> Self {
        self.identity_map = Some(IdentityMap::new());
        self
    }

    /// The registry used to resolve payload types.
    pub const fn registry(&self) -> &TypeRegistry<E> {
        &self.registry
    }

    /// The configured serialization format.
    pub fn format(&self) -> SerializationFormat {
        self.serializer.format()
    }

    /// The identity map, when enabled.
    pub const fn identity_map(&self) -> Option<&IdentityMap<E>> {
        self.identity_map.as_ref()
    }

    /// Serializes an event into a record.
    ///
    /// Missing `timestamp` defaults to now and missing `valid_at` to the
    /// timestamp.
    ///
    /// # Errors
    /// * `EncodingFailed` - the payload or metadata cannot be serialized, or
    ///   a custom metadata key is one of [`Metadata::RESERVED_KEYS`]
    pub fn dump(&self, event: &Event<E>) -> StoreResult<Record> {
        let event_type = event.event_type().to_string();
        let encoding_failed = |detail: String| StoreError::EncodingFailed {
            event_type: event_type.clone(),
            detail,
        };

        if let Some(key) = event
            .metadata
            .custom
            .keys()
            .find(|key| Metadata::RESERVED_KEYS.contains(&key.as_str()))
        {
            return Err(encoding_failed(format!(
                "custom metadata key `{key}` is reserved"
            )));
        }

        let data =
            serde_json::to_value(&event.data).map_err(|error| encoding_failed(error.to_string()))?;
        let created_at = event.metadata.timestamp.unwrap_or_else(Timestamp::now);
        let valid_at = event.metadata.valid_at.unwrap_or(created_at);
        let metadata = Metadata {
            timestamp: None,
            valid_at: None,
            ..event.metadata.clone()
        };
        let metadata = match serde_json::to_value(&metadata) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(encoding_failed(format!(
                    "metadata must serialize to a map, got {other}"
                )));
            }
            Err(error) => return Err(encoding_failed(error.to_string())),
        };

        let mut draft = RecordDraft {
            event_id: event.event_id,
            event_type: event_type.clone(),
            data,
            metadata,
            created_at,
            valid_at,
        };
        for transformation in &self.transformations {
            draft = transformation.dump(draft)?;
        }

        let stored_type = EventType::try_new(draft.event_type.clone())
            .map_err(|error| encoding_failed(error.to_string()))?;
        let data = self
            .serializer
            .dump(&draft.data)
            .map_err(|error| encoding_failed(error.to_string()))?;
        let metadata = self
            .serializer
            .dump(&Value::Object(draft.metadata))
            .map_err(|error| encoding_failed(error.to_string()))?;

        Ok(Record::new(draft.event_id, stored_type, data, metadata, draft.created_at)
            .with_valid_at(draft.valid_at))
    }

    /// Serializes every event, failing on the first error.
    pub fn dump_all(&self, events: &[Event<E>]) -> StoreResult<Vec<Record>> {
        events.iter().map(|event| self.dump(event)).collect()
    }

    /// Deserializes a record into an event.
    ///
    /// The event's `timestamp` and `valid_at` come from the record columns.
    pub fn load(&self, record: &Record) -> StoreResult<Event<E>> {
        if let Some(event) = self
            .identity_map
            .as_ref()
            .and_then(|identity_map| identity_map.get(record.event_id))
        {
            return Ok(event);
        }

        let decoding_failed = |detail: String| StoreError::DecodingFailed {
            event_id: record.event_id,
            event_type: record.event_type.to_string(),
            detail,
        };

        let data = self
            .serializer
            .load(&record.data)
            .map_err(|error| decoding_failed(error.to_string()))?;
        let metadata = match self
            .serializer
            .load(&record.metadata)
            .map_err(|error| decoding_failed(error.to_string()))?
        {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => return Err(decoding_failed(format!("metadata is not a map: {other}"))),
        };

        let mut draft = RecordDraft {
            event_id: record.event_id,
            event_type: record.event_type.to_string(),
            data,
            metadata,
            created_at: record.created_at,
            valid_at: record.valid_at,
        };
        for transformation in self.transformations.iter().rev() {
            draft = transformation.load(draft)?;
        }

        let event_type = EventType::try_new(draft.event_type.clone())
            .map_err(|error| decoding_failed(error.to_string()))?;
        let payload = self.registry.construct(draft.event_id, &event_type, draft.data)?;
        let mut metadata: Metadata = serde_json::from_value(Value::Object(draft.metadata))
            .map_err(|error| decoding_failed(error.to_string()))?;
        metadata.timestamp = Some(draft.created_at);
        metadata.valid_at = Some(draft.valid_at);

        Ok(Event {
            event_id: draft.event_id,
            data: payload,
            metadata,
        })
    }

    /// Deserializes every record, failing on the first error.
    pub fn load_all(&self, records: &[Record]) -> StoreResult<Vec<Event<E>>> {
        records.iter().map(|record| self.load(record)).collect()
    }

    /// Caches stored events in the identity map, when enabled.
    ///
    /// Called once the events are known to be persisted, so failed writes
    /// never populate the cache.
    pub fn remember(&self, events: &[Event<E>]) {
        if let Some(identity_map) = &self.identity_map {
            for event in events {
                identity_map.insert(event.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Deposited {
        amount: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(untagged)]
    enum Ledger {
        Deposited(Deposited),
    }

    impl DomainEvent for Ledger {
        fn event_type(&self) -> &str {
            match self {
                Self::Deposited(_) => "Deposited",
            }
        }
    }

    impl From<Deposited> for Ledger {
        fn from(event: Deposited) -> Self {
            Self::Deposited(event)
        }
    }

    fn mapper() -> Mapper<Ledger> {
        Mapper::new(TypeRegistry::new().register::<Deposited>("Deposited"))
    }

    fn deposited(amount: u64) -> Event<Ledger> {
        Event::new(Ledger::Deposited(Deposited { amount }))
    }

    #[test]
    fn dump_fills_time_columns() {
        let record = mapper().dump(&deposited(5)).unwrap();
        assert_eq!(record.event_type.as_ref(), "Deposited");
        assert_eq!(record.valid_at, record.created_at);
        assert_eq!(
            serde_json::from_slice::<Value>(&record.data).unwrap(),
            json!({"amount": 5})
        );
    }

    #[test]
    fn time_columns_are_not_serialized_into_metadata() {
        let timestamp = Timestamp::now();
        let event = deposited(1).with_metadata(Metadata {
            timestamp: Some(timestamp),
            ..Metadata::new().with_custom("tenant", "acme")
        });
        let record = mapper().dump(&event).unwrap();
        assert_eq!(record.created_at, timestamp);
        assert_eq!(
            serde_json::from_slice::<Value>(&record.metadata).unwrap(),
            json!({"tenant": "acme"})
        );
    }

    #[test]
    fn load_restores_payload_and_metadata() {
        let mapper = mapper().with_format(SerializationFormat::MessagePack);
        let event = deposited(9).with_metadata(Metadata::new().with_custom("tenant", "acme"));
        let record = mapper.dump(&event).unwrap();
        let loaded = mapper.load(&record).unwrap();

        assert_eq!(loaded.event_id, event.event_id);
        assert_eq!(loaded.data, event.data);
        assert_eq!(loaded.metadata.custom, event.metadata.custom);
        assert_eq!(loaded.timestamp(), Some(record.created_at));
        assert_eq!(loaded.valid_at(), Some(record.valid_at));
    }

    #[test]
    fn reserved_custom_keys_are_rejected() {
        for key in Metadata::RESERVED_KEYS {
            let event = deposited(2).with_metadata(Metadata::new().with_custom(key, "noon"));
            assert!(matches!(
                mapper().dump(&event),
                Err(StoreError::EncodingFailed { detail, .. }) if detail.contains(key)
            ));
        }
    }

    #[test]
    fn custom_keys_next_to_typed_fields_load_back() {
        let mapper = mapper();
        let event = deposited(2).with_metadata(
            Metadata::new()
                .with_correlation_id(uuid::Uuid::new_v4())
                .with_custom("timestamp_source", "ntp")
                .with_custom("causation", "manual"),
        );
        let loaded = mapper.load(&mapper.dump(&event).unwrap()).unwrap();

        assert_eq!(loaded.metadata.custom, event.metadata.custom);
        assert_eq!(loaded.metadata.correlation_id, event.metadata.correlation_id);
    }

    #[test]
    fn payloads_without_a_json_form_fail_to_encode() {
        #[derive(Debug, Clone, Serialize)]
        struct Grid {
            cells: HashMap<(u8, u8), u8>,
        }

        impl DomainEvent for Grid {
            fn event_type(&self) -> &str {
                "Grid"
            }
        }

        let mapper: Mapper<Grid> = Mapper::new(TypeRegistry::new());
        let event = Event::new(Grid {
            cells: HashMap::from([((0, 1), 2)]),
        });

        assert!(matches!(
            mapper.dump(&event),
            Err(StoreError::EncodingFailed { event_type, .. }) if event_type == "Grid"
        ));
    }

    #[test]
    fn renamed_types_load_through_the_pipeline() {
        let mapper = mapper().with_transformation(EventTypeRemapping::new().rename("Credited", "Deposited"));
        let mut record = mapper.dump(&deposited(3)).unwrap();
        record.event_type = EventType::try_new("Credited").unwrap();
        assert_eq!(
            mapper.load(&record).unwrap().data,
            Ledger::Deposited(Deposited { amount: 3 })
        );
    }

    #[test]
    fn unknown_types_are_reported() {
        let mapper = mapper();
        let mut record = mapper.dump(&deposited(3)).unwrap();
        record.event_type = EventType::try_new("Withdrawn").unwrap();
        assert!(matches!(
            mapper.load(&record),
            Err(StoreError::UnknownEventType(_))
        ));
    }

    #[test]
    fn identity_map_only_holds_remembered_events() {
        let mapper = mapper().with_identity_map();
        let event = deposited(4);
        let mut record = mapper.dump(&event).unwrap();
        assert!(mapper.identity_map().unwrap().is_empty());

        mapper.remember(std::slice::from_ref(&event));
        record.data = b"not json".to_vec();
        assert_eq!(mapper.load(&record).unwrap(), event);

        mapper.identity_map().unwrap().clear();
        assert!(matches!(
            mapper.load(&record),
            Err(StoreError::DecodingFailed { .. })
        ));
    }
}
