//! Serializer plugins turning structured values into record bytes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors reported by a [`Serializer`].
#[derive(Debug, Error)]
pub enum SerializationError {
    /// JSON encoding or decoding failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding failed.
    #[error(transparent)]
    MessagePackEncode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding failed.
    #[error(transparent)]
    MessagePackDecode(#[from] rmp_serde::decode::Error),
}

/// Converts the structured form of payloads and metadata to bytes and back.
pub trait Serializer: Send + Sync {
    /// Encodes a value.
    fn dump(&self, value: &Value) -> Result<Vec<u8>, SerializationError>;

    /// Decodes bytes previously produced by [`Serializer::dump`].
    fn load(&self, bytes: &[u8]) -> Result<Value, SerializationError>;

    /// Format this serializer writes.
    fn format(&self) -> SerializationFormat;
}

/// Text serializer producing compact JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn dump(&self, value: &Value) -> Result<Vec<u8>, SerializationError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn load(&self, bytes: &[u8]) -> Result<Value, SerializationError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn format(&self) -> SerializationFormat {
        SerializationFormat::Json
    }
}

/// Binary serializer producing MessagePack.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackSerializer;

impl Serializer for MessagePackSerializer {
    fn dump(&self, value: &Value) -> Result<Vec<u8>, SerializationError> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    fn load(&self, bytes: &[u8]) -> Result<Value, SerializationError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    fn format(&self) -> SerializationFormat {
        SerializationFormat::MessagePack
    }
}

/// Supported serialization formats for record bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SerializationFormat {
    /// JSON format (default) - human-readable, good for debugging
    #[default]
    Json,
    /// MessagePack format - efficient binary format, smaller than JSON
    MessagePack,
}

impl SerializationFormat {
    /// Creates a serializer for this format.
    pub fn create_serializer(self) -> Arc<dyn Serializer> {
        match self {
            Self::Json => Arc::new(JsonSerializer),
            Self::MessagePack => Arc::new(MessagePackSerializer),
        }
    }

    /// Returns the MIME type for this format.
    pub const fn mime_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::MessagePack => "application/msgpack",
        }
    }
}

impl std::fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "JSON"),
            Self::MessagePack => write!(f, "MessagePack"),
        }
    }
}

impl std::str::FromStr for SerializationFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "messagepack" | "msgpack" => Ok(Self::MessagePack),
            _ => Err(format!("Unknown serialization format: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "order_id": "o-1",
            "lines": [{"sku": "A", "quantity": 2}],
            "total": 12.5,
            "gift": false,
            "note": null
        })
    }

    #[test]
    fn json_round_trips_structured_values() {
        let bytes = JsonSerializer.dump(&sample()).unwrap();
        assert_eq!(JsonSerializer.load(&bytes).unwrap(), sample());
    }

    #[test]
    fn message_pack_round_trips_structured_values() {
        let bytes = MessagePackSerializer.dump(&sample()).unwrap();
        assert_eq!(MessagePackSerializer.load(&bytes).unwrap(), sample());
    }

    #[test]
    fn garbage_bytes_fail_to_load() {
        assert!(JsonSerializer.load(b"{not json").is_err());
        assert!(MessagePackSerializer.load(&[0xc1]).is_err());
    }

    #[test]
    fn formats_parse_from_configuration_strings() {
        assert_eq!(
            "msgpack".parse::<SerializationFormat>(),
            Ok(SerializationFormat::MessagePack)
        );
        assert_eq!(
            "JSON".parse::<SerializationFormat>(),
            Ok(SerializationFormat::Json)
        );
        assert!("yaml".parse::<SerializationFormat>().is_err());
        assert_eq!(
            SerializationFormat::MessagePack
                .create_serializer()
                .format(),
            SerializationFormat::MessagePack
        );
    }

    proptest! {
        #[test]
        fn message_pack_round_trips_string_maps(
            entries in prop::collection::btree_map("[a-z_]{1,12}", any::<i64>(), 0..16)
        ) {
            let value = serde_json::to_value(&entries).unwrap();
            let bytes = MessagePackSerializer.dump(&value).unwrap();
            prop_assert_eq!(MessagePackSerializer.load(&bytes).unwrap(), value);
        }
    }
}
