//! Core types for the `eventstash` event store.
//!
//! This module defines the fundamental identifiers used throughout the library.
//! Types with invariants use smart constructors so that a value, once built,
//! is always valid ("parse, don't validate").

use chrono::{DateTime, SubsecRound, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{StoreError, StoreResult};

/// Serialized name of the implicit global stream.
///
/// The name is reserved: no named stream may use it.
pub const GLOBAL_STREAM_NAME: &str = "all";

/// A globally unique event identifier.
///
/// Any UUID is accepted so that callers can bring their own identifiers;
/// [`EventId::generate`] produces a time-ordered `UUIDv7`.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    AsRef,
    Deref,
    Display,
    Serialize,
    Deserialize
))]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a fresh time-ordered event identifier.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::generate()
    }
}

/// Name of a concrete domain event type, used to route deserialization.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventType(String);

impl EventType {
    /// Builds an event type from a name known to be valid (e.g. a `&'static str`
    /// literal returned by a domain type), falling back to a parse error.
    pub fn parse(name: impl Into<String>) -> StoreResult<Self> {
        let name = name.into();
        Self::try_new(name.clone()).map_err(|error| {
            StoreError::Configuration(format!("invalid event type `{name}`: {error}"))
        })
    }
}

fn is_not_reserved(name: &str) -> bool {
    name != GLOBAL_STREAM_NAME
}

/// Name of a caller-defined stream.
///
/// Stream names are non-empty, at most 1024 characters, and never equal to
/// [`GLOBAL_STREAM_NAME`].
#[nutype(
    validate(not_empty, len_char_max = 1024, predicate = is_not_reserved),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct StreamName(String);

/// A read or write target: either a named stream or the implicit global stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stream {
    /// Every event ever appended, in global sequence order.
    Global,
    /// A caller-named stream with dense, zero-based positions.
    Named(StreamName),
}

impl Stream {
    /// Parses a stream name, rejecting the reserved global name.
    pub fn named(name: impl Into<String>) -> StoreResult<Self> {
        let name = name.into();
        if name == GLOBAL_STREAM_NAME {
            return Err(StoreError::ReservedStreamName);
        }
        StreamName::try_new(name.clone())
            .map(Self::Named)
            .map_err(|error| StoreError::InvalidStreamName(format!("`{name}`: {error}")))
    }

    /// Returns whether this is the global stream.
    pub const fn is_global(&self) -> bool {
        matches!(self, Self::Global)
    }

    /// Returns the stream name, or `None` for the global stream.
    pub const fn name(&self) -> Option<&StreamName> {
        match self {
            Self::Global => None,
            Self::Named(name) => Some(name),
        }
    }

    /// Returns the stream name, failing with `ReservedStreamName` for the global stream.
    pub fn require_named(&self) -> StoreResult<&StreamName> {
        self.name().ok_or(StoreError::ReservedStreamName)
    }
}

impl From<StreamName> for Stream {
    fn from(name: StreamName) -> Self {
        Self::Named(name)
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => f.write_str(GLOBAL_STREAM_NAME),
            Self::Named(name) => name.fmt(f),
        }
    }
}

/// Write precondition used for optimistic concurrency control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// The stream must not contain any event yet.
    None,
    /// No concurrency check; the store still assigns dense positions.
    Any,
    /// Continue from whatever the last position is at write time.
    Auto,
    /// The stream's last position must be exactly this value.
    Exact(u64),
}

impl ExpectedVersion {
    /// Rejects combinations that can never be valid for `stream`.
    ///
    /// The global stream's order is assigned by the store, so only
    /// [`ExpectedVersion::Auto`] is accepted there.
    pub fn validate_for(self, stream: &Stream) -> StoreResult<Self> {
        match (stream, self) {
            (Stream::Global, Self::Auto) | (Stream::Named(_), _) => Ok(self),
            (Stream::Global, other) => Err(StoreError::InvalidExpectedVersion(format!(
                "{other} is not allowed for the global stream, use auto"
            ))),
        }
    }

    /// Resolves the first position to write given the stream's last position.
    ///
    /// Returns `None` when the precondition does not hold.
    pub const fn resolve(self, last_position: Option<u64>) -> Option<u64> {
        match (self, last_position) {
            (Self::None, None) => Some(0),
            (Self::None, Some(_)) => None,
            (Self::Any | Self::Auto, None) => Some(0),
            (Self::Any | Self::Auto, Some(last)) => Some(last + 1),
            (Self::Exact(expected), Some(last)) if expected == last => Some(last + 1),
            (Self::Exact(_), _) => None,
        }
    }
}

impl std::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Any => f.write_str("any"),
            Self::Auto => f.write_str("auto"),
            Self::Exact(version) => write!(f, "{version}"),
        }
    }
}

/// A UTC instant with microsecond precision.
///
/// Sub-microsecond digits are dropped on construction so that every backend
/// (including `timestamptz`) stores the value exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime.trunc_subsecs(6))
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self::new(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Number of events fetched per round trip by batched reads.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct BatchSize(usize);

impl Default for BatchSize {
    fn default() -> Self {
        Self::try_new(100).expect("100 is always a valid batch size")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn stream_name_accepts_valid_strings(s in "[a-zA-Z0-9_$-]{1,255}") {
            prop_assume!(s != GLOBAL_STREAM_NAME);
            let stream = Stream::named(s.clone());
            prop_assert!(stream.is_ok());
            prop_assert_eq!(stream.unwrap().to_string(), s);
        }

        #[test]
        fn stream_name_rejects_over_1024_chars(s in "[a-z]{1025,1100}") {
            prop_assert!(matches!(Stream::named(s), Err(StoreError::InvalidStreamName(_))));
        }

        #[test]
        fn any_and_auto_always_continue_after_last(last in proptest::option::of(0u64..10_000)) {
            let expected_start = last.map_or(0, |l| l + 1);
            prop_assert_eq!(ExpectedVersion::Any.resolve(last), Some(expected_start));
            prop_assert_eq!(ExpectedVersion::Auto.resolve(last), Some(expected_start));
        }

        #[test]
        fn exact_only_matches_the_same_last_position(expected in 0u64..1000, last in 0u64..1000) {
            let resolved = ExpectedVersion::Exact(expected).resolve(Some(last));
            if expected == last {
                prop_assert_eq!(resolved, Some(last + 1));
            } else {
                prop_assert_eq!(resolved, None);
            }
        }
    }

    #[test]
    fn reserved_global_name_is_rejected() {
        assert!(matches!(
            Stream::named(GLOBAL_STREAM_NAME),
            Err(StoreError::ReservedStreamName)
        ));
        assert!(StreamName::try_new(GLOBAL_STREAM_NAME).is_err());
    }

    #[test]
    fn empty_stream_name_is_rejected() {
        assert!(matches!(
            Stream::named(""),
            Err(StoreError::InvalidStreamName(_))
        ));
    }

    #[test]
    fn expected_version_none_requires_empty_stream() {
        assert_eq!(ExpectedVersion::None.resolve(None), Some(0));
        assert_eq!(ExpectedVersion::None.resolve(Some(0)), None);
        assert_eq!(ExpectedVersion::Exact(0).resolve(None), None);
    }

    #[test]
    fn global_stream_only_accepts_auto() {
        assert!(ExpectedVersion::Auto.validate_for(&Stream::Global).is_ok());
        for version in [
            ExpectedVersion::Any,
            ExpectedVersion::None,
            ExpectedVersion::Exact(3),
        ] {
            assert!(matches!(
                version.validate_for(&Stream::Global),
                Err(StoreError::InvalidExpectedVersion(_))
            ));
        }
        let named = Stream::named("orders").unwrap();
        assert!(ExpectedVersion::Any.validate_for(&named).is_ok());
    }

    #[test]
    fn timestamps_are_truncated_to_microseconds() {
        let raw = DateTime::parse_from_rfc3339("2024-03-01T10:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let timestamp = Timestamp::new(raw);
        assert_eq!(timestamp.as_datetime().timestamp_subsec_nanos(), 123_456_000);
    }

    #[test]
    fn batch_size_defaults_to_one_hundred() {
        assert_eq!(usize::from(BatchSize::default()), 100);
        assert!(BatchSize::try_new(0).is_err());
    }

    #[test]
    fn generated_event_ids_are_unique() {
        assert_ne!(EventId::generate(), EventId::generate());
    }
}
