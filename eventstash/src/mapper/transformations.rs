//! Pipeline steps between the domain step and the serializer.
//!
//! Each [`Transformation`] rewrites a [`RecordDraft`] on the way to storage
//! (`dump`) and back (`load`). Steps run in registration order on dump and in
//! reverse order on load.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::errors::StoreResult;
use crate::types::{EventId, Timestamp};

/// A record whose payload and metadata are still structured values.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDraft {
    /// Unique identifier for this event
    pub event_id: EventId,
    /// Stored type name
    pub event_type: String,
    /// Structured payload
    pub data: Value,
    /// Structured metadata, without the time columns
    pub metadata: Map<String, Value>,
    /// System time
    pub created_at: Timestamp,
    /// Business time
    pub valid_at: Timestamp,
}

/// One reversible step of the mapper pipeline.
pub trait Transformation: Send + Sync {
    /// Rewrites a draft on its way to storage.
    fn dump(&self, draft: RecordDraft) -> StoreResult<RecordDraft>;

    /// Rewrites a draft read from storage.
    fn load(&self, draft: RecordDraft) -> StoreResult<RecordDraft>;
}

/// Renames stored type names on load.
///
/// Records written under an old name are presented with the current one, so
/// the type registry only needs to know current names.
#[derive(Debug, Clone, Default)]
pub struct EventTypeRemapping {
    renames: HashMap<String, String>,
}

impl EventTypeRemapping {
    /// Creates an empty remapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Presents records stored as `old_name` as `new_name`.
    #[must_use]
    pub fn rename(mut self, old_name: impl Into<String>, new_name: impl Into<String>) -> Self {
        self.renames.insert(old_name.into(), new_name.into());
        self
    }
}

impl Transformation for EventTypeRemapping {
    fn dump(&self, draft: RecordDraft) -> StoreResult<RecordDraft> {
        Ok(draft)
    }

    fn load(&self, mut draft: RecordDraft) -> StoreResult<RecordDraft> {
        if let Some(current) = self.renames.get(&draft.event_type) {
            draft.event_type.clone_from(current);
        }
        Ok(draft)
    }
}

/// Normalizes top-level metadata keys to trimmed `snake_case`.
///
/// Applied in both directions; normalizing twice is the same as once.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataKeyNormalization;

impl MetadataKeyNormalization {
    fn normalize(metadata: Map<String, Value>) -> Map<String, Value> {
        metadata
            .into_iter()
            .map(|(key, value)| (snake_case(&key), value))
            .collect()
    }
}

impl Transformation for MetadataKeyNormalization {
    fn dump(&self, mut draft: RecordDraft) -> StoreResult<RecordDraft> {
        draft.metadata = Self::normalize(draft.metadata);
        Ok(draft)
    }

    fn load(&self, mut draft: RecordDraft) -> StoreResult<RecordDraft> {
        draft.metadata = Self::normalize(draft.metadata);
        Ok(draft)
    }
}

fn snake_case(key: &str) -> String {
    let mut normalized = String::with_capacity(key.len() + 4);
    let mut previous_was_word = false;
    for character in key.trim().chars() {
        if character == '-' || character.is_whitespace() {
            normalized.push('_');
            previous_was_word = false;
        } else if character.is_uppercase() {
            if previous_was_word {
                normalized.push('_');
            }
            normalized.extend(character.to_lowercase());
            previous_was_word = false;
        } else {
            normalized.push(character);
            previous_was_word = character.is_lowercase() || character.is_ascii_digit();
        }
    }
    normalized
}
