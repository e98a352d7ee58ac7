//! Strategies for delivering an event to one subscriber.

use std::sync::Arc;

use crate::errors::HandlerError;
use crate::event::Event;
use crate::record::Record;

use super::scheduler::Scheduler;
use super::Subscriber;

/// Delivers published events to subscribers it accepts.
pub trait Dispatcher<E>: Send + Sync {
    /// Returns whether this strategy can deliver to `subscriber`.
    fn verify(&self, subscriber: &Subscriber<E>) -> bool;

    /// Delivers `event` (stored as `record`) to `subscriber`.
    ///
    /// # Errors
    /// Returns the subscriber's error, or an error when `subscriber` is not
    /// accepted by this strategy.
    fn call(
        &self,
        subscriber: &Subscriber<E>,
        event: &Event<E>,
        record: &Record,
    ) -> Result<(), HandlerError>;
}

fn not_accepted<E>(subscriber: &Subscriber<E>) -> HandlerError {
    format!("subscriber {} is not accepted by this dispatcher", subscriber.describe()).into()
}

/// Calls in-process handlers inline, in the publishing task.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncDispatcher;

impl<E> Dispatcher<E> for SyncDispatcher {
    fn verify(&self, subscriber: &Subscriber<E>) -> bool {
        matches!(subscriber, Subscriber::Handler(_))
    }

    fn call(
        &self,
        subscriber: &Subscriber<E>,
        event: &Event<E>,
        _record: &Record,
    ) -> Result<(), HandlerError> {
        match subscriber {
            Subscriber::Handler(handler) => handler.handle(event),
            Subscriber::Job(_) => Err(not_accepted(subscriber)),
        }
    }
}

/// Hands records for named jobs to a [`Scheduler`] and returns immediately.
#[derive(Debug, Clone)]
pub struct AsyncDispatcher<S> {
    scheduler: S,
}

impl<S: Scheduler> AsyncDispatcher<S> {
    /// Creates a dispatcher enqueueing through `scheduler`.
    pub const fn new(scheduler: S) -> Self {
        Self { scheduler }
    }

    /// The scheduler used for delivery.
    pub const fn scheduler(&self) -> &S {
        &self.scheduler
    }
}

impl<E, S: Scheduler> Dispatcher<E> for AsyncDispatcher<S> {
    fn verify(&self, subscriber: &Subscriber<E>) -> bool {
        match subscriber {
            Subscriber::Job(job) => self.scheduler.verify(job),
            Subscriber::Handler(_) => false,
        }
    }

    fn call(
        &self,
        subscriber: &Subscriber<E>,
        _event: &Event<E>,
        record: &Record,
    ) -> Result<(), HandlerError> {
        match subscriber {
            Subscriber::Job(job) => self.scheduler.call(job, record),
            Subscriber::Handler(_) => Err(not_accepted(subscriber)),
        }
    }
}

/// Delegates each subscriber to the first strategy that accepts it.
pub struct ComposedDispatcher<E> {
    dispatchers: Vec<Arc<dyn Dispatcher<E>>>,
}

impl<E> std::fmt::Debug for ComposedDispatcher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComposedDispatcher")
            .field("dispatchers", &self.dispatchers.len())
            .finish()
    }
}

impl<E> Default for ComposedDispatcher<E> {
    fn default() -> Self {
        Self {
            dispatchers: Vec::new(),
        }
    }
}

impl<E> ComposedDispatcher<E> {
    /// Creates a dispatcher with no strategies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a strategy, tried after the ones already added.
    #[must_use]
    pub fn with(mut self, dispatcher: impl Dispatcher<E> + 'static) -> Self {
        self.dispatchers.push(Arc::new(dispatcher));
        self
    }

    fn select(&self, subscriber: &Subscriber<E>) -> Option<&Arc<dyn Dispatcher<E>>> {
        self.dispatchers
            .iter()
            .find(|dispatcher| dispatcher.verify(subscriber))
    }
}

impl<E> Dispatcher<E> for ComposedDispatcher<E> {
    fn verify(&self, subscriber: &Subscriber<E>) -> bool {
        self.select(subscriber).is_some()
    }

    fn call(
        &self,
        subscriber: &Subscriber<E>,
        event: &Event<E>,
        record: &Record,
    ) -> Result<(), HandlerError> {
        self.select(subscriber)
            .ok_or_else(|| not_accepted(subscriber))?
            .call(subscriber, event, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ChannelScheduler, JobName};
    use crate::types::{EventId, EventType, Timestamp};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record() -> Record {
        Record::new(
            EventId::generate(),
            EventType::try_new("Ping").unwrap(),
            Vec::new(),
            Vec::new(),
            Timestamp::now(),
        )
    }

    fn counting_handler(counter: &Arc<AtomicUsize>) -> Subscriber<()> {
        let counter = Arc::clone(counter);
        Subscriber::handler(move |_: &Event<()>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn sync_dispatcher_calls_handlers_inline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let subscriber = counting_handler(&counter);

        assert!(SyncDispatcher.verify(&subscriber));
        SyncDispatcher
            .call(&subscriber, &Event::new(()), &record())
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sync_dispatcher_rejects_jobs() {
        let job = Subscriber::<()>::job(JobName::try_new("mailer").unwrap());
        assert!(!SyncDispatcher.verify(&job));
        assert!(SyncDispatcher.call(&job, &Event::new(()), &record()).is_err());
    }

    #[test]
    fn composed_dispatcher_routes_by_subscriber_kind() {
        let (scheduler, mut receiver) = ChannelScheduler::new();
        let dispatcher = ComposedDispatcher::new()
            .with(SyncDispatcher)
            .with(AsyncDispatcher::new(scheduler));
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(&counter);
        let job = Subscriber::job(JobName::try_new("mailer").unwrap());
        let record = record();

        dispatcher.call(&handler, &Event::new(()), &record).unwrap();
        dispatcher.call(&job, &Event::new(()), &record).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(receiver.try_recv().unwrap().record, record);
    }

    #[test]
    fn empty_composition_accepts_nothing() {
        let dispatcher = ComposedDispatcher::<()>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(!dispatcher.verify(&counting_handler(&counter)));
    }
}
