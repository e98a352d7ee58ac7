//! Schedulers hand stored records to background jobs.

use std::collections::HashSet;

use nutype::nutype;
use tokio::sync::mpsc;

use crate::errors::HandlerError;
use crate::record::Record;

/// Name of a background job subscribed to events.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct JobName(String);

/// A record queued for a background job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    /// The job that should process the record
    pub job: JobName,
    /// The stored record; workers deserialize it with the client's mapper
    pub record: Record,
}

/// Accepts records for asynchronous processing.
///
/// `call` must only enqueue; the job runs later, outside the publishing call.
pub trait Scheduler: Send + Sync {
    /// Returns whether this scheduler can run `job`.
    fn verify(&self, job: &JobName) -> bool;

    /// Enqueues `record` for `job`.
    ///
    /// # Errors
    /// Returns an error when the record cannot be enqueued.
    fn call(&self, job: &JobName, record: &Record) -> Result<(), HandlerError>;
}

/// Scheduler backed by an unbounded tokio channel.
///
/// A worker owns the receiving half and processes [`ScheduledJob`]s at its
/// own pace.
#[derive(Debug, Clone)]
pub struct ChannelScheduler {
    sender: mpsc::UnboundedSender<ScheduledJob>,
    accepted: Option<HashSet<JobName>>,
}

impl ChannelScheduler {
    /// Creates a scheduler accepting every job, and the worker's receiver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScheduledJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                accepted: None,
            },
            receiver,
        )
    }

    /// Restricts the scheduler to the given jobs.
    #[must_use]
    pub fn accepting(mut self, jobs: impl IntoIterator<Item = JobName>) -> Self {
        self.accepted = Some(jobs.into_iter().collect());
        self
    }
}

impl Scheduler for ChannelScheduler {
    fn verify(&self, job: &JobName) -> bool {
        self.accepted
            .as_ref()
            .map_or(true, |accepted| accepted.contains(job))
    }

    fn call(&self, job: &JobName, record: &Record) -> Result<(), HandlerError> {
        self.sender
            .send(ScheduledJob {
                job: job.clone(),
                record: record.clone(),
            })
            .map_err(|_| format!("job queue for `{job}` is closed").into())
    }
}
