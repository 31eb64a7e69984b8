//! Single-writer task dispatcher
//!
//! One dedicated OS thread drains a FIFO queue of [`Task`]s. Every packet
//! handler, protocol release and fired scheduler event runs here, so state
//! touched only from dispatcher tasks needs no further locking.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use super::task::Task;
use crate::error::NetworkError;

/// Window over which utilization is measured
const UTILIZATION_WINDOW: Duration = Duration::from_secs(10);

/// Lifecycle of a worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, accepting tasks, worker not yet started
    Idle,
    Running,
    Closing,
    Terminated,
}

struct DispatcherQueue {
    tasks: VecDeque<Task>,
    state: ThreadState,
}

#[derive(Debug)]
struct Utilization {
    window_start: Instant,
    busy: Duration,
    last_ratio: f64,
}

struct DispatcherShared {
    queue: Mutex<DispatcherQueue>,
    signal: Condvar,
    cycle: AtomicU64,
    utilization: Mutex<Utilization>,
}

/// FIFO task executor on a dedicated thread
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: Mutex<Option<ThreadId>>,
}

impl Dispatcher {
    /// Create a dispatcher; tasks may be queued before [`start`](Self::start)
    pub fn new() -> Self {
        Self {
            shared: Arc::new(DispatcherShared {
                queue: Mutex::new(DispatcherQueue {
                    tasks: VecDeque::new(),
                    state: ThreadState::Idle,
                }),
                signal: Condvar::new(),
                cycle: AtomicU64::new(0),
                utilization: Mutex::new(Utilization {
                    window_start: Instant::now(),
                    busy: Duration::ZERO,
                    last_ratio: 0.0,
                }),
            }),
            worker: Mutex::new(None),
            worker_id: Mutex::new(None),
        }
    }

    /// Launch the worker thread
    pub fn start(&self) -> std::io::Result<()> {
        {
            let mut queue = self.shared.queue.lock();
            if queue.state != ThreadState::Idle {
                return Ok(());
            }
            queue.state = ThreadState::Running;
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || shared.run())?;

        *self.worker_id.lock() = Some(handle.thread().id());
        *self.worker.lock() = Some(handle);
        info!("Dispatcher started");
        Ok(())
    }

    /// Queue a task, at the back or (for urgent work) at the front
    pub fn add(&self, task: Task, front: bool) -> Result<(), NetworkError> {
        let mut queue = self.shared.queue.lock();
        match queue.state {
            ThreadState::Idle | ThreadState::Running => {}
            ThreadState::Closing | ThreadState::Terminated => {
                return Err(NetworkError::DispatcherStopped);
            }
        }

        let was_empty = queue.tasks.is_empty();
        if front {
            queue.tasks.push_front(task);
        } else {
            queue.tasks.push_back(task);
        }
        drop(queue);

        if was_empty {
            self.shared.signal.notify_one();
        }
        Ok(())
    }

    /// Queue a closure at the back; returns false if the dispatcher is stopped
    pub fn dispatch<F>(&self, func: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.add(Task::new(func), false).is_ok()
    }

    /// Number of tasks executed so far
    pub fn cycle(&self) -> u64 {
        self.shared.cycle.load(Ordering::Relaxed)
    }

    /// Fraction of the last full window spent running tasks
    pub fn utilization(&self) -> f64 {
        self.shared.utilization.lock().last_ratio
    }

    /// Tasks waiting to run
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    pub fn state(&self) -> ThreadState {
        self.shared.queue.lock().state
    }

    /// Check whether the caller is the worker thread
    pub fn is_current_thread(&self) -> bool {
        *self.worker_id.lock() == Some(thread::current().id())
    }

    /// Discard queued tasks and stop the worker
    pub fn shutdown(&self) {
        let discarded = {
            let mut queue = self.shared.queue.lock();
            if matches!(queue.state, ThreadState::Closing | ThreadState::Terminated) {
                return;
            }
            queue.state = ThreadState::Closing;
            std::mem::take(&mut queue.tasks)
        };
        self.shared.signal.notify_all();

        if !discarded.is_empty() {
            debug!(count = discarded.len(), "Discarding queued dispatcher tasks");
        }
        // Task captures are dropped outside the queue lock
        drop(discarded);

        // A task calling shutdown cannot join its own thread
        if !self.is_current_thread() {
            if let Some(handle) = self.worker.lock().take() {
                if handle.join().is_err() {
                    error!("Dispatcher thread terminated abnormally");
                }
            }
        }

        self.shared.queue.lock().state = ThreadState::Terminated;
        info!("Dispatcher stopped");
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DispatcherShared {
    fn run(&self) {
        loop {
            let task = {
                let mut queue = self.queue.lock();
                while queue.tasks.is_empty() && queue.state == ThreadState::Running {
                    self.signal.wait(&mut queue);
                }
                if queue.state != ThreadState::Running {
                    break;
                }
                queue.tasks.pop_front()
            };

            let Some(task) = task else { continue };
            if task.has_expired() {
                debug!("Skipping expired dispatcher task");
                continue;
            }

            let started = Instant::now();
            self.cycle.fetch_add(1, Ordering::Relaxed);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.execute())) {
                error!(panic = %panic_message(&*payload), "Dispatcher task panicked");
            }
            self.record_busy(started);
        }
    }

    fn record_busy(&self, started: Instant) {
        let now = Instant::now();
        let mut stats = self.utilization.lock();
        stats.busy += now - started;

        let window = now - stats.window_start;
        if window >= UTILIZATION_WINDOW {
            stats.last_ratio = stats.busy.as_secs_f64() / window.as_secs_f64();
            stats.busy = Duration::ZERO;
            stats.window_start = now;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
