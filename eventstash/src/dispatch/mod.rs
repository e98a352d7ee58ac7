//! Publish/subscribe dispatch after successful writes.
//!
//! The [`Broker`] keeps a registry of subscriptions and, once a publish has
//! been committed, delivers each event to every matching subscriber through a
//! [`Dispatcher`] strategy. Each client owns its broker; there is no
//! process-wide registry.
//!
//! Subscriptions can be tied to a delivery scope opened with
//! [`Broker::open_scope`]. A scoped subscription only receives events
//! published by a task running inside [`Broker::run_in_scope`] for that
//! scope. Tasks spawned from inside the scope do not inherit it.

mod dispatcher;
mod scheduler;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, error};

pub use self::dispatcher::{AsyncDispatcher, ComposedDispatcher, Dispatcher, SyncDispatcher};
pub use self::scheduler::{ChannelScheduler, JobName, ScheduledJob, Scheduler};

use crate::errors::{HandlerError, StoreError, StoreResult};
use crate::event::{DomainEvent, Event};
use crate::record::Record;
use crate::types::EventType;

/// An in-process event handler.
///
/// Closures taking `&Event<E>` and returning `Result<(), HandlerError>`
/// implement this trait.
pub trait Handler<E>: Send + Sync {
    /// Handles one published event.
    ///
    /// # Errors
    /// Any error is reported to the publisher as `SubscriberFailed`.
    fn handle(&self, event: &Event<E>) -> Result<(), HandlerError>;

    /// Name used in logs and errors.
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

impl<E, F> Handler<E> for F
where
    F: Fn(&Event<E>) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, event: &Event<E>) -> Result<(), HandlerError> {
        self(event)
    }
}

/// Something events can be delivered to.
pub enum Subscriber<E> {
    /// Called inline by the [`SyncDispatcher`].
    Handler(Arc<dyn Handler<E>>),
    /// Enqueued by the [`AsyncDispatcher`] for a background worker.
    Job(JobName),
}

impl<E> Clone for Subscriber<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Handler(handler) => Self::Handler(Arc::clone(handler)),
            Self::Job(job) => Self::Job(job.clone()),
        }
    }
}

impl<E> std::fmt::Debug for Subscriber<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handler(handler) => f.debug_tuple("Handler").field(&handler.name()).finish(),
            Self::Job(job) => f.debug_tuple("Job").field(job).finish(),
        }
    }
}

impl<E> Subscriber<E> {
    /// Wraps a handler closure.
    pub fn handler<F>(handler: F) -> Self
    where
        F: Fn(&Event<E>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::Handler(Arc::new(handler))
    }

    /// Wraps any [`Handler`] implementation.
    pub fn from_handler(handler: impl Handler<E> + 'static) -> Self {
        Self::Handler(Arc::new(handler))
    }

    /// Names a background job.
    pub const fn job(job: JobName) -> Self {
        Self::Job(job)
    }

    /// Human-readable description for logs and errors.
    pub fn describe(&self) -> String {
        match self {
            Self::Handler(handler) => format!("handler {}", handler.name()),
            Self::Job(job) => format!("job {job}"),
        }
    }
}

tokio::task_local! {
    // Delivery scopes entered by the current task, innermost last.
    static ACTIVE_SCOPES: Arc<[ScopeId]>;
}

fn active_scopes() -> Option<Arc<[ScopeId]>> {
    ACTIVE_SCOPES.try_with(Arc::clone).ok()
}

/// Identifies a delivery scope opened with [`Broker::open_scope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

struct Entry<E> {
    id: u64,
    // `None` subscribes to every event type.
    event_types: Option<Vec<EventType>>,
    scope: Option<ScopeId>,
    subscriber: Subscriber<E>,
}

impl<E> Entry<E> {
    fn accepts(&self, event_type: &str) -> bool {
        self.event_types.as_ref().map_or(true, |types| {
            types.iter().any(|accepted| accepted.as_ref() == event_type)
        })
    }

    fn visible_in(&self, scopes: Option<&[ScopeId]>) -> bool {
        self.scope.map_or(true, |scope| {
            scopes.is_some_and(|scopes| scopes.contains(&scope))
        })
    }
}

struct Registry<E> {
    next_id: u64,
    entries: Vec<Entry<E>>,
}

trait Unsubscribe: Send + Sync {
    fn remove(&self, id: u64) -> bool;
    fn contains(&self, id: u64) -> bool;
}

impl<E: Send + Sync> Unsubscribe for RwLock<Registry<E>> {
    fn remove(&self, id: u64) -> bool {
        let mut registry = self.write();
        let before = registry.entries.len();
        registry.entries.retain(|entry| entry.id != id);
        registry.entries.len() != before
    }

    fn contains(&self, id: u64) -> bool {
        self.read().entries.iter().any(|entry| entry.id == id)
    }
}

/// Token returned by a subscribe call.
///
/// Dropping the token keeps the subscription; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Unsubscribe>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Subscription {
    /// Removes the subscription. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.id) {
                debug!(subscription = self.id, "[broker.unsubscribe] removed");
            }
        }
    }

    /// Returns whether the subscription still receives events.
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.contains(self.id))
    }

    /// Turns the token into a guard that unsubscribes when dropped.
    pub const fn into_guard(self) -> SubscriptionGuard {
        SubscriptionGuard(self)
    }
}

/// Removes its subscription when dropped, including on panic or cancellation.
#[derive(Debug)]
pub struct SubscriptionGuard(Subscription);

impl SubscriptionGuard {
    /// The guarded subscription.
    pub const fn subscription(&self) -> &Subscription {
        &self.0
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

fn parse_event_types<I, S>(event_types: I) -> StoreResult<Vec<EventType>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let event_types = event_types
        .into_iter()
        .map(|name| {
            let name = name.into();
            EventType::try_new(name.clone()).map_err(|error| {
                StoreError::InvalidHandler(format!("invalid event type `{name}`: {error}"))
            })
        })
        .collect::<StoreResult<Vec<_>>>()?;
    if event_types.is_empty() {
        return Err(StoreError::InvalidHandler(
            "subscribe needs at least one event type".to_string(),
        ));
    }
    Ok(event_types)
}

/// Subscription registry and delivery loop.
pub struct Broker<E> {
    dispatcher: Arc<dyn Dispatcher<E>>,
    registry: Arc<RwLock<Registry<E>>>,
    next_scope: AtomicU64,
}

impl<E> std::fmt::Debug for Broker<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("subscriptions", &self.registry.read().entries.len())
            .finish_non_exhaustive()
    }
}

impl<E: DomainEvent> Broker<E> {
    /// Creates a broker delivering through `dispatcher`.
    pub fn new(dispatcher: Arc<dyn Dispatcher<E>>) -> Self {
        Self {
            dispatcher,
            registry: Arc::new(RwLock::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
            next_scope: AtomicU64::new(0),
        }
    }

    fn register(
        &self,
        subscriber: Subscriber<E>,
        event_types: Option<Vec<EventType>>,
        scope: Option<ScopeId>,
    ) -> StoreResult<Subscription> {
        if !self.dispatcher.verify(&subscriber) {
            return Err(StoreError::InvalidHandler(format!(
                "no dispatch strategy accepts {}",
                subscriber.describe()
            )));
        }

        let mut registry = self.registry.write();
        let id = registry.next_id;
        registry.next_id += 1;
        debug!(
            subscription = id,
            subscriber = %subscriber.describe(),
            event_types = ?event_types,
            scope = ?scope,
            "[broker.subscribe] registered"
        );
        registry.entries.push(Entry {
            id,
            event_types,
            scope,
            subscriber,
        });
        drop(registry);

        let registry: Arc<dyn Unsubscribe> = self.registry.clone();
        Ok(Subscription {
            id,
            registry: Arc::downgrade(&registry),
        })
    }

    /// Subscribes to the given event types.
    ///
    /// # Errors
    /// * `InvalidHandler` - no strategy accepts `subscriber`, or no valid
    ///   event type was given
    pub fn subscribe<I, S>(&self, subscriber: Subscriber<E>, event_types: I) -> StoreResult<Subscription>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register(subscriber, Some(parse_event_types(event_types)?), None)
    }

    /// Subscribes to every event type.
    ///
    /// # Errors
    /// * `InvalidHandler` - no strategy accepts `subscriber`
    pub fn subscribe_to_all_events(&self, subscriber: Subscriber<E>) -> StoreResult<Subscription> {
        self.register(subscriber, None, None)
    }

    /// Opens a new delivery scope.
    pub fn open_scope(&self) -> ScopeId {
        ScopeId(self.next_scope.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribes within `scope`; `None` event types means every type.
    ///
    /// # Errors
    /// * `InvalidHandler` - no strategy accepts `subscriber`, or an empty or
    ///   invalid event type list was given
    pub fn subscribe_in_scope<S: Into<String>>(
        &self,
        scope: ScopeId,
        subscriber: Subscriber<E>,
        event_types: Option<Vec<S>>,
    ) -> StoreResult<Subscription> {
        let event_types = event_types.map(parse_event_types).transpose()?;
        self.register(subscriber, event_types, Some(scope))
    }

    /// Runs `future` with `scope` entered, on top of any scopes the current
    /// task is already in.
    pub async fn run_in_scope<F: Future>(&self, scope: ScopeId, future: F) -> F::Output {
        let mut scopes = active_scopes().map(|scopes| scopes.to_vec()).unwrap_or_default();
        scopes.push(scope);
        ACTIVE_SCOPES.scope(Arc::from(scopes), future).await
    }

    /// Returns the subscribers that would receive an event of `event_type`
    /// published from the current task, in registration order.
    pub fn subscribers_for(&self, event_type: &str) -> Vec<Subscriber<E>> {
        let scopes = active_scopes();
        self.registry
            .read()
            .entries
            .iter()
            .filter(|entry| entry.accepts(event_type) && entry.visible_in(scopes.as_deref()))
            .map(|entry| entry.subscriber.clone())
            .collect()
    }

    /// Delivers a committed event to every matching subscriber.
    ///
    /// Every subscriber is called even when an earlier one fails; all
    /// failures are logged and the first one is returned.
    ///
    /// # Errors
    /// * `SubscriberFailed` - the first failure was a handler's
    /// * `SchedulerFailed` - the first failure was a job that could not be
    ///   enqueued
    pub fn notify(&self, event: &Event<E>, record: &Record) -> StoreResult<()> {
        // Snapshot first: handlers may subscribe or unsubscribe while running.
        let subscribers = self.subscribers_for(event.event_type());

        let mut first_failure = None;
        for subscriber in subscribers {
            if let Err(source) = self.dispatcher.call(&subscriber, event, record) {
                error!(
                    subscriber = %subscriber.describe(),
                    event_id = %event.event_id,
                    event_type = %event.event_type(),
                    error = %source,
                    "[broker.notify] subscriber failed"
                );
                if first_failure.is_none() {
                    first_failure = Some(match &subscriber {
                        Subscriber::Handler(_) => StoreError::SubscriberFailed {
                            subscriber: subscriber.describe(),
                            event_id: event.event_id,
                            source,
                        },
                        Subscriber::Job(job) => StoreError::SchedulerFailed {
                            job: job.to_string(),
                            event_id: event.event_id,
                            source,
                        },
                    });
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde::Serialize;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    enum Shop {
        OrderPlaced,
        OrderShipped,
    }

    impl DomainEvent for Shop {
        fn event_type(&self) -> &str {
            match self {
                Self::OrderPlaced => "OrderPlaced",
                Self::OrderShipped => "OrderShipped",
            }
        }
    }

    fn broker() -> Broker<Shop> {
        Broker::new(Arc::new(SyncDispatcher))
    }

    fn record_for(event: &Event<Shop>) -> Record {
        Record::new(
            event.event_id,
            EventType::try_new(event.event_type()).unwrap(),
            Vec::new(),
            Vec::new(),
            crate::types::Timestamp::now(),
        )
    }

    fn publish(broker: &Broker<Shop>, data: Shop) -> StoreResult<()> {
        let event = Event::new(data);
        broker.notify(&event, &record_for(&event))
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Subscriber<Shop> {
        let log = Arc::clone(log);
        Subscriber::handler(move |event: &Event<Shop>| {
            log.lock().push(format!("{name}:{}", event.event_type()));
            Ok(())
        })
    }

    #[test]
    fn delivers_to_matching_and_wildcard_subscribers_in_order() {
        let broker = broker();
        let log = Arc::new(Mutex::new(Vec::new()));
        broker
            .subscribe_to_all_events(recorder(&log, "audit"))
            .unwrap();
        broker
            .subscribe(recorder(&log, "shipping"), ["OrderShipped"])
            .unwrap();
        broker
            .subscribe(recorder(&log, "billing"), ["OrderPlaced"])
            .unwrap();

        publish(&broker, Shop::OrderPlaced).unwrap();
        publish(&broker, Shop::OrderShipped).unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "audit:OrderPlaced",
                "billing:OrderPlaced",
                "audit:OrderShipped",
                "shipping:OrderShipped",
            ]
        );
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let broker = broker();
        let log = Arc::new(Mutex::new(Vec::new()));
        let subscription = broker
            .subscribe(recorder(&log, "billing"), ["OrderPlaced"])
            .unwrap();
        assert!(subscription.is_active());

        subscription.unsubscribe();
        subscription.unsubscribe();
        publish(&broker, Shop::OrderPlaced).unwrap();

        assert!(!subscription.is_active());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn guard_unsubscribes_on_drop() {
        let broker = broker();
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let _guard = broker
                .subscribe_to_all_events(recorder(&log, "scoped"))
                .unwrap()
                .into_guard();
            publish(&broker, Shop::OrderPlaced).unwrap();
        }
        publish(&broker, Shop::OrderPlaced).unwrap();

        assert_eq!(*log.lock(), vec!["scoped:OrderPlaced"]);
    }

    #[test]
    fn failing_handler_does_not_stop_the_others() {
        let broker = broker();
        let log = Arc::new(Mutex::new(Vec::new()));
        broker
            .subscribe_to_all_events(Subscriber::handler(|_: &Event<Shop>| {
                Err("first failure".into())
            }))
            .unwrap();
        broker
            .subscribe_to_all_events(Subscriber::handler(|_: &Event<Shop>| {
                Err("second failure".into())
            }))
            .unwrap();
        broker
            .subscribe_to_all_events(recorder(&log, "after"))
            .unwrap();

        let error = publish(&broker, Shop::OrderPlaced).unwrap_err();

        assert!(matches!(
            &error,
            StoreError::SubscriberFailed { source, .. } if source.to_string() == "first failure"
        ));
        assert_eq!(*log.lock(), vec!["after:OrderPlaced"]);
    }

    #[test]
    fn jobs_need_a_scheduler() {
        let broker = broker();
        let job = Subscriber::job(JobName::try_new("mailer").unwrap());
        assert!(matches!(
            broker.subscribe_to_all_events(job),
            Err(StoreError::InvalidHandler(_))
        ));
    }

    #[test]
    fn closed_job_queue_is_a_scheduler_failure() {
        let (scheduler, receiver) = ChannelScheduler::new();
        drop(receiver);
        let broker = Broker::new(Arc::new(AsyncDispatcher::new(scheduler)));
        broker
            .subscribe_to_all_events(Subscriber::job(JobName::try_new("mailer").unwrap()))
            .unwrap();

        let error = publish(&broker, Shop::OrderPlaced).unwrap_err();

        assert!(matches!(
            &error,
            StoreError::SchedulerFailed { job, .. } if job == "mailer"
        ));
    }

    #[test]
    fn scoped_subscriptions_only_see_their_scope() {
        let broker = broker();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = broker.open_scope();
        let other = broker.open_scope();
        broker
            .subscribe_in_scope(scope, recorder(&log, "scoped"), Some(vec!["OrderPlaced"]))
            .unwrap();

        publish(&broker, Shop::OrderPlaced).unwrap();
        tokio_test::block_on(broker.run_in_scope(other, async {
            publish(&broker, Shop::OrderPlaced)
        }))
        .unwrap();
        assert!(log.lock().is_empty());

        tokio_test::block_on(broker.run_in_scope(scope, async {
            publish(&broker, Shop::OrderPlaced)
        }))
        .unwrap();
        tokio_test::block_on(broker.run_in_scope(
            scope,
            broker.run_in_scope(other, async { publish(&broker, Shop::OrderPlaced) }),
        ))
        .unwrap();

        assert_eq!(*log.lock(), vec!["scoped:OrderPlaced", "scoped:OrderPlaced"]);
    }

    #[test]
    fn scoped_subscriptions_validate_event_types() {
        let broker = broker();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = broker.open_scope();
        assert!(matches!(
            broker.subscribe_in_scope(scope, recorder(&log, "none"), Some(Vec::<String>::new())),
            Err(StoreError::InvalidHandler(_))
        ));
        assert!(broker
            .subscribe_in_scope::<String>(scope, recorder(&log, "all"), None)
            .is_ok());
    }

    #[test]
    fn subscribe_requires_event_types() {
        let broker = broker();
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(matches!(
            broker.subscribe(recorder(&log, "none"), Vec::<String>::new()),
            Err(StoreError::InvalidHandler(_))
        ));
    }

    #[test]
    fn handlers_may_subscribe_while_being_notified() {
        let broker = Arc::new(broker());
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner_broker = Arc::downgrade(&broker);
        let inner_log = Arc::clone(&log);
        broker
            .subscribe(
                Subscriber::handler(move |_: &Event<Shop>| {
                    if let Some(broker) = inner_broker.upgrade() {
                        broker.subscribe(recorder(&inner_log, "late"), ["OrderShipped"])?;
                    }
                    Ok(())
                }),
                ["OrderPlaced"],
            )
            .unwrap();

        publish(&broker, Shop::OrderPlaced).unwrap();
        publish(&broker, Shop::OrderShipped).unwrap();

        assert_eq!(*log.lock(), vec!["late:OrderShipped"]);
    }
}
