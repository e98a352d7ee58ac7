//! The client façade tying repository, mapper, broker and clock together.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::clock::{Clock, SystemClock};
use crate::dispatch::{Broker, Dispatcher, JobName, Subscriber, Subscription, SyncDispatcher};
use crate::errors::StoreResult;
use crate::event::{DomainEvent, Event, Metadata};
use crate::mapper::Mapper;
use crate::record::Record;
use crate::repository::EventRepository;
use crate::specification::Specification;
use crate::types::{EventId, ExpectedVersion, Stream};

/// Builds a [`Client`].
pub struct ClientBuilder<E> {
    repository: Arc<dyn EventRepository>,
    mapper: Mapper<E>,
    dispatcher: Arc<dyn Dispatcher<E>>,
    clock: Arc<dyn Clock>,
}

impl<E: DomainEvent> ClientBuilder<E> {
    /// Starts a builder with a synchronous dispatcher and the system clock.
    pub fn new(repository: impl EventRepository + 'static, mapper: Mapper<E>) -> Self {
        Self {
            repository: Arc::new(repository),
            mapper,
            dispatcher: Arc::new(SyncDispatcher),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the dispatch strategy.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: impl Dispatcher<E> + 'static) -> Self {
        self.dispatcher = Arc::new(dispatcher);
        self
    }

    /// Replaces the clock used to stamp published events.
    #[must_use]
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Builds the client.
    pub fn build(self) -> Client<E> {
        Client {
            repository: self.repository,
            mapper: Arc::new(self.mapper),
            broker: Arc::new(Broker::new(self.dispatcher)),
            clock: self.clock,
        }
    }
}

/// Entry point for publishing, reading and subscribing.
///
/// Cloning is cheap; clones share the repository, mapper and subscriptions.
pub struct Client<E> {
    repository: Arc<dyn EventRepository>,
    mapper: Arc<Mapper<E>>,
    broker: Arc<Broker<E>>,
    clock: Arc<dyn Clock>,
}

impl<E> Clone for Client<E> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            mapper: Arc::clone(&self.mapper),
            broker: Arc::clone(&self.broker),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<E: DomainEvent> std::fmt::Debug for Client<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("mapper", &self.mapper)
            .field("broker", &self.broker)
            .finish_non_exhaustive()
    }
}

impl<E: DomainEvent> Client<E> {
    /// Starts building a client.
    pub fn builder(repository: impl EventRepository + 'static, mapper: Mapper<E>) -> ClientBuilder<E> {
        ClientBuilder::new(repository, mapper)
    }

    /// The mapper used to convert events.
    pub fn mapper(&self) -> &Mapper<E> {
        &self.mapper
    }

    /// The repository events are stored in.
    pub fn repository(&self) -> &Arc<dyn EventRepository> {
        &self.repository
    }

    fn enrich(&self, events: Vec<Event<E>>, context: Option<&Metadata>) -> Vec<Event<E>> {
        let now = self.clock.now();
        events
            .into_iter()
            .map(|mut event| {
                if let Some(context) = context {
                    event.metadata.merge_missing(context);
                }
                let timestamp = event.metadata.timestamp.unwrap_or(now);
                event.metadata.timestamp = Some(timestamp);
                event.metadata.valid_at = Some(event.metadata.valid_at.unwrap_or(timestamp));
                event
            })
            .collect()
    }

    async fn store(
        &self,
        events: Vec<Event<E>>,
        stream: &Stream,
        expected_version: ExpectedVersion,
        context: Option<&Metadata>,
    ) -> StoreResult<(Vec<Event<E>>, Vec<Record>)> {
        let events = self.enrich(events, context);
        let records = self.mapper.dump_all(&events)?;
        self.repository
            .append_to_stream(records.clone(), stream, expected_version)
            .await?;
        self.mapper.remember(&events);
        Ok((events, records))
    }

    fn dispatch(&self, events: &[Event<E>], records: &[Record]) -> StoreResult<()> {
        let mut first_failure = None;
        for (event, record) in events.iter().zip(records) {
            if let Err(error) = self.broker.notify(event, record) {
                if first_failure.is_none() {
                    first_failure = Some(error);
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    async fn publish_with(
        &self,
        events: Vec<Event<E>>,
        stream: &Stream,
        expected_version: ExpectedVersion,
        context: Option<&Metadata>,
    ) -> StoreResult<()> {
        let (events, records) = self.store(events, stream, expected_version, context).await?;
        info!(count = events.len(), "[client.publish] events stored, dispatching");
        self.dispatch(&events, &records)
    }

    /// Stores events in `stream` and then notifies subscribers.
    ///
    /// # Errors
    /// Any repository or mapping error, in which case nothing was stored and
    /// nobody was notified; or `SubscriberFailed` after a committed write.
    #[instrument(name = "client.publish", skip_all, fields(stream = %stream, expected_version = %expected_version))]
    pub async fn publish(
        &self,
        events: impl IntoIterator<Item = Event<E>> + Send,
        stream: &Stream,
        expected_version: ExpectedVersion,
    ) -> StoreResult<()> {
        self.publish_with(events.into_iter().collect(), stream, expected_version, None)
            .await
    }

    /// Stores events in `stream` without notifying subscribers.
    #[instrument(name = "client.append", skip_all, fields(stream = %stream, expected_version = %expected_version))]
    pub async fn append(
        &self,
        events: impl IntoIterator<Item = Event<E>> + Send,
        stream: &Stream,
        expected_version: ExpectedVersion,
    ) -> StoreResult<()> {
        self.store(events.into_iter().collect(), stream, expected_version, None)
            .await
            .map(|_| ())
    }

    /// Adds already stored events to `stream`.
    #[instrument(name = "client.link", skip_all, fields(stream = %stream, expected_version = %expected_version))]
    pub async fn link(
        &self,
        event_ids: &[EventId],
        stream: &Stream,
        expected_version: ExpectedVersion,
    ) -> StoreResult<()> {
        self.repository
            .link_to_stream(event_ids, stream, expected_version)
            .await
    }

    /// Removes every membership of `stream`; the events stay in the global stream.
    pub async fn delete_stream(&self, stream: &Stream) -> StoreResult<()> {
        self.repository.delete_stream(stream).await
    }

    /// Starts a read of the global stream.
    pub fn read(&self) -> Specification<E> {
        Specification::new(Arc::clone(&self.repository), Arc::clone(&self.mapper))
    }

    /// Subscribes `subscriber` to the given event types.
    pub fn subscribe<I, S>(&self, subscriber: Subscriber<E>, event_types: I) -> StoreResult<Subscription>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.broker.subscribe(subscriber, event_types)
    }

    /// Subscribes `subscriber` to every event.
    pub fn subscribe_to_all_events(&self, subscriber: Subscriber<E>) -> StoreResult<Subscription> {
        self.broker.subscribe_to_all_events(subscriber)
    }

    /// Subscribes a background job; needs a dispatcher with a scheduler.
    pub fn subscribe_job<I, S>(&self, job: JobName, event_types: I) -> StoreResult<Subscription>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.broker.subscribe(Subscriber::job(job), event_types)
    }

    /// Runs `future` with temporary subscriptions.
    ///
    /// The subscriptions only see events published by `future` itself, not
    /// by other tasks sharing this client or tasks spawned from `future`.
    pub fn within<F: Future>(&self, future: F) -> Within<'_, E, F> {
        Within {
            client: self,
            future,
            subscriptions: Vec::new(),
        }
    }

    /// Publishes with `metadata` as processing context.
    ///
    /// Fields already set on an event win over the context.
    pub fn with_metadata(&self, metadata: Metadata) -> MetadataScope<'_, E> {
        MetadataScope {
            client: self,
            metadata,
        }
    }

    /// Rewrites stored events in place by id.
    #[instrument(name = "client.overwrite", skip_all)]
    pub async fn overwrite(&self, events: impl IntoIterator<Item = Event<E>> + Send) -> StoreResult<()> {
        let events: Vec<Event<E>> = events.into_iter().collect();
        let records = self.mapper.dump_all(&events)?;
        self.repository.update_messages(records).await?;
        self.mapper.remember(&events);
        Ok(())
    }

    /// Returns the named streams the event is a member of.
    pub async fn streams_of(&self, event_id: EventId) -> StoreResult<Vec<Stream>> {
        self.repository.streams_of(event_id).await
    }

    /// Returns the zero-based position of the event in `stream`.
    pub async fn position_in_stream(&self, event_id: EventId, stream: &Stream) -> StoreResult<u64> {
        self.repository.position_in_stream(event_id, stream).await
    }

    /// Returns the position of the event in the global order.
    pub async fn global_position(&self, event_id: EventId) -> StoreResult<u64> {
        self.repository.global_position(event_id).await
    }

    /// Returns whether the event is a member of `stream`.
    pub async fn event_in_stream(&self, event_id: EventId, stream: &Stream) -> StoreResult<bool> {
        self.repository.event_in_stream(event_id, stream).await
    }

    /// Returns whether the event exists.
    pub async fn has_event(&self, event_id: EventId) -> StoreResult<bool> {
        self.repository.has_event(event_id).await
    }

    /// Turns a record handed to a background job back into an event.
    pub fn deserialize(&self, record: &Record) -> StoreResult<Event<E>> {
        self.mapper.load(record)
    }
}

/// Temporary subscriptions around a future, built by [`Client::within`].
pub struct Within<'a, E, F> {
    client: &'a Client<E>,
    future: F,
    subscriptions: Vec<(Subscriber<E>, Option<Vec<String>>)>,
}

impl<'a, E: DomainEvent, F: Future> Within<'a, E, F> {
    /// Adds a subscription to the given event types.
    #[must_use]
    pub fn subscribe<I, S>(mut self, subscriber: Subscriber<E>, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscriptions.push((
            subscriber,
            Some(event_types.into_iter().map(Into::into).collect()),
        ));
        self
    }

    /// Adds a subscription to every event.
    #[must_use]
    pub fn subscribe_to_all_events(mut self, subscriber: Subscriber<E>) -> Self {
        self.subscriptions.push((subscriber, None));
        self
    }

    /// Registers the subscriptions in a fresh delivery scope, runs the future
    /// inside that scope, then removes them.
    ///
    /// Removal also happens when the future panics or the returned future is
    /// dropped before completion.
    ///
    /// # Errors
    /// * `InvalidHandler` - a subscription could not be registered; the
    ///   future is not run
    pub async fn call(self) -> StoreResult<F::Output> {
        let broker = &self.client.broker;
        let scope = broker.open_scope();
        let mut guards = Vec::with_capacity(self.subscriptions.len());
        for (subscriber, event_types) in self.subscriptions {
            let subscription = broker.subscribe_in_scope(scope, subscriber, event_types)?;
            guards.push(subscription.into_guard());
        }
        let output = broker.run_in_scope(scope, self.future).await;
        drop(guards);
        Ok(output)
    }
}

/// Publishing with a processing context, built by [`Client::with_metadata`].
pub struct MetadataScope<'a, E> {
    client: &'a Client<E>,
    metadata: Metadata,
}

impl<'a, E: DomainEvent> MetadataScope<'a, E> {
    /// The context merged into published events.
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Nests another context; its values win over this one's.
    #[must_use]
    pub fn with_metadata(mut self, mut metadata: Metadata) -> Self {
        metadata.merge_missing(&self.metadata);
        self.metadata = metadata;
        self
    }

    /// Like [`Client::publish`], with the context merged into each event.
    pub async fn publish(
        &self,
        events: impl IntoIterator<Item = Event<E>> + Send,
        stream: &Stream,
        expected_version: ExpectedVersion,
    ) -> StoreResult<()> {
        self.client
            .publish_with(
                events.into_iter().collect(),
                stream,
                expected_version,
                Some(&self.metadata),
            )
            .await
    }

    /// Like [`Client::append`], with the context merged into each event.
    pub async fn append(
        &self,
        events: impl IntoIterator<Item = Event<E>> + Send,
        stream: &Stream,
        expected_version: ExpectedVersion,
    ) -> StoreResult<()> {
        self.client
            .store(
                events.into_iter().collect(),
                stream,
                expected_version,
                Some(&self.metadata),
            )
            .await
            .map(|_| ())
    }
}
