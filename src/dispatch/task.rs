//! Deferred units of work
//!
//! A [`Task`] is a boxed closure with an optional expiry. A [`ScheduledTask`]
//! adds an absolute fire time and the event id the scheduler hands out for
//! cancellation.

use std::cmp::Ordering;
use std::fmt;
use std::time::{Duration, Instant};

/// How long a task created from a network packet stays worth running
pub const DISPATCHER_TASK_EXPIRATION: Duration = Duration::from_millis(2000);

/// Smallest delay a scheduled task may use
pub const SCHEDULER_MINTICKS: Duration = Duration::from_millis(50);

type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// A closure queued on the dispatcher
pub struct Task {
    func: TaskFn,
    expiration: Option<Instant>,
}

impl Task {
    /// Create a task that never expires
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            func: Box::new(func),
            expiration: None,
        }
    }

    /// Create a task that is discarded if not started within `timeout`
    pub fn with_expiration<F>(timeout: Duration, func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            func: Box::new(func),
            expiration: Some(Instant::now() + timeout),
        }
    }

    /// Check whether the task went stale before it could run
    pub fn has_expired(&self) -> bool {
        self.has_expired_at(Instant::now())
    }

    /// Check expiry against a given instant
    pub fn has_expired_at(&self, now: Instant) -> bool {
        self.expiration.is_some_and(|deadline| deadline < now)
    }

    /// Clear the expiry
    pub fn set_dont_expire(&mut self) {
        self.expiration = None;
    }

    /// Run the closure
    pub fn execute(self) {
        (self.func)();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// A task bound to an absolute fire time
pub struct ScheduledTask {
    task: Task,
    fire_at: Instant,
    event_id: u32,
    sequence: u64,
}

impl ScheduledTask {
    /// Create a task that fires `delay` from now (at least [`SCHEDULER_MINTICKS`])
    pub fn new<F>(delay: Duration, func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::at(Instant::now() + delay.max(SCHEDULER_MINTICKS), func)
    }

    /// Create a task that fires at an exact instant
    pub fn at<F>(fire_at: Instant, func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            task: Task::new(func),
            fire_at,
            event_id: 0,
            sequence: 0,
        }
    }

    /// When the task is due
    pub fn fire_at(&self) -> Instant {
        self.fire_at
    }

    /// Event id assigned by the scheduler (0 until scheduled)
    pub fn event_id(&self) -> u32 {
        self.event_id
    }

    pub(crate) fn assign(&mut self, event_id: u32, sequence: u64) {
        self.event_id = event_id;
        self.sequence = sequence;
    }

    /// Unwrap into a dispatcher task that will not expire
    pub fn into_task(self) -> Task {
        let mut task = self.task;
        task.set_dont_expire();
        task
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("event_id", &self.event_id)
            .field("fire_at", &self.fire_at)
            .finish_non_exhaustive()
    }
}

// Ordered by fire time, then by insertion order for equal deadlines
impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledTask {}
