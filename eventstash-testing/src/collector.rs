//! A handler that records every event it is notified of.
//!
//! Clones share the same storage, so one clone can be subscribed while the
//! test keeps another to inspect what arrived:
//!
//! ```ignore
//! let collector = EventCollector::new();
//! client.subscribe_to_all_events(collector.subscriber())?;
//! client.publish(events, &stream, ExpectedVersion::Any).await?;
//! assert_eq!(collector.len(), 2);
//! ```

use std::sync::Arc;

use eventstash::{Event, EventId, Handler, HandlerError, Subscriber};
use parking_lot::Mutex;

/// Handler that keeps every event it receives.
#[derive(Debug)]
pub struct EventCollector<E> {
    events: Arc<Mutex<Vec<Event<E>>>>,
    failing: bool,
}

impl<E> Clone for EventCollector<E> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
            failing: self.failing,
        }
    }
}

impl<E> Default for EventCollector<E> {
    fn default() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            failing: false,
        }
    }
}

impl<E: Clone + Send + Sync + 'static> EventCollector<E> {
    /// An empty collector whose handler always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records events like [`EventCollector::new`] and then reports a failure.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// A subscriber delivering into this collector.
    pub fn subscriber(&self) -> Subscriber<E> {
        Subscriber::from_handler(self.clone())
    }

    /// The received events, in delivery order.
    pub fn events(&self) -> Vec<Event<E>> {
        self.events.lock().clone()
    }

    /// Ids of the received events, in delivery order.
    pub fn event_ids(&self) -> Vec<EventId> {
        self.events.lock().iter().map(|event| event.event_id).collect()
    }

    /// Number of received events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns whether nothing was received.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl<E: Clone + Send + Sync> Handler<E> for EventCollector<E> {
    fn handle(&self, event: &Event<E>) -> Result<(), HandlerError> {
        self.events.lock().push(event.clone());
        if self.failing {
            return Err(format!("collector rejected {}", event.event_id).into());
        }
        Ok(())
    }

    fn name(&self) -> String {
        if self.failing {
            "failing-collector".to_string()
        } else {
            "collector".to_string()
        }
    }
}
