//! `eventstash` - Append-only event store with composable reads and pub/sub
//!
//! Events are appended to named streams under optimistic concurrency control
//! and are always part of the implicit global stream. Reads are described with
//! a chainable [`Specification`] and resolved lazily against an
//! [`EventRepository`]. After a successful publish the [`Client`] notifies
//! in-process handlers and hands records to background schedulers.
//!
//! Storage engines live in their own crates (`eventstash-memory`,
//! `eventstash-postgres`) and share the contract suite in
//! `eventstash-testing`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod clock;
pub mod dispatch;
pub mod errors;
pub mod event;
pub mod mapper;
pub mod record;
pub mod repository;
pub mod specification;
pub mod types;

pub use client::{Client, ClientBuilder, MetadataScope, Within};
pub use clock::{Clock, SystemClock};
pub use dispatch::{
    AsyncDispatcher, Broker, ChannelScheduler, ComposedDispatcher, Dispatcher, Handler, JobName,
    ScheduledJob, Scheduler, ScopeId, Subscriber, Subscription, SubscriptionGuard, SyncDispatcher,
};
pub use errors::{HandlerError, Operation, StoreError, StoreResult};
pub use event::{DomainEvent, Event, Metadata};
pub use mapper::{
    EventTypeRemapping, JsonSerializer, Mapper, MessagePackSerializer, MetadataKeyNormalization,
    SerializationFormat, Serializer, Transformation, TypeRegistry, UnknownTypePolicy,
};
pub use record::Record;
pub use repository::EventRepository;
pub use specification::{Direction, Specification, SpecificationResult, TimeBound, TimeColumn};
pub use types::{
    BatchSize, EventId, EventType, ExpectedVersion, Stream, StreamName, Timestamp,
    GLOBAL_STREAM_NAME,
};
