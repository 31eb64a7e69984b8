//! Time-ordered task scheduler
//!
//! Keeps a min-heap of [`ScheduledTask`]s on its own thread and forwards
//! each one to the [`Dispatcher`] when its deadline passes. Cancellation
//! removes the event id from the active set; the heap entry is skipped
//! when it surfaces.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::dispatcher::{Dispatcher, ThreadState};
use super::task::ScheduledTask;

struct SchedulerState {
    heap: BinaryHeap<Reverse<ScheduledTask>>,
    active: HashSet<u32>,
    last_event_id: u32,
    sequence: u64,
    thread_state: ThreadState,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    signal: Condvar,
    dispatcher: Arc<Dispatcher>,
}

/// Delayed-event scheduler feeding the dispatcher
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                state: Mutex::new(SchedulerState {
                    heap: BinaryHeap::new(),
                    active: HashSet::new(),
                    last_event_id: 0,
                    sequence: 0,
                    thread_state: ThreadState::Idle,
                }),
                signal: Condvar::new(),
                dispatcher,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Launch the worker thread
    pub fn start(&self) -> std::io::Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.thread_state != ThreadState::Idle {
                return Ok(());
            }
            state.thread_state = ThreadState::Running;
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || shared.run())?;
        *self.worker.lock() = Some(handle);
        info!("Scheduler started");
        Ok(())
    }

    /// Schedule a task; returns its event id, or 0 if the scheduler is stopped
    pub fn add(&self, mut task: ScheduledTask) -> u32 {
        let mut state = self.shared.state.lock();
        if matches!(state.thread_state, ThreadState::Closing | ThreadState::Terminated) {
            warn!("Scheduler is stopped, dropping event");
            return 0;
        }

        let event_id = next_event_id(&mut state);
        state.sequence += 1;
        let sequence = state.sequence;
        task.assign(event_id, sequence);
        state.active.insert(event_id);
        state.heap.push(Reverse(task));

        // Only a new earliest deadline changes how long the worker sleeps
        let is_earliest = state
            .heap
            .peek()
            .is_some_and(|Reverse(top)| top.event_id() == event_id);
        drop(state);

        if is_earliest {
            self.shared.signal.notify_one();
        }
        event_id
    }

    /// Schedule a closure to run on the dispatcher after `delay`
    pub fn schedule<F>(&self, delay: Duration, func: F) -> u32
    where
        F: FnOnce() + Send + 'static,
    {
        self.add(ScheduledTask::new(delay, func))
    }

    /// Cancel a pending event; returns false if it already fired or never existed
    pub fn stop_event(&self, event_id: u32) -> bool {
        if event_id == 0 {
            return false;
        }
        self.shared.state.lock().active.remove(&event_id)
    }

    /// Number of events that are still due to fire
    pub fn pending(&self) -> usize {
        self.shared.state.lock().active.len()
    }

    /// Drop every pending event and stop the worker
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if matches!(state.thread_state, ThreadState::Closing | ThreadState::Terminated) {
                return;
            }
            state.thread_state = ThreadState::Closing;
            let heap = std::mem::take(&mut state.heap);
            state.active.clear();
            // Task captures are dropped outside the lock
            MutexGuard::unlocked(&mut state, || drop(heap));
        }
        self.shared.signal.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Scheduler thread terminated abnormally");
            }
        }

        self.shared.state.lock().thread_state = ThreadState::Terminated;
        info!("Scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Ids wrap around but skip 0 and any id that is still pending
fn next_event_id(state: &mut SchedulerState) -> u32 {
    loop {
        state.last_event_id = state.last_event_id.wrapping_add(1);
        if state.last_event_id != 0 && !state.active.contains(&state.last_event_id) {
            return state.last_event_id;
        }
    }
}

impl SchedulerShared {
    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            if state.thread_state != ThreadState::Running {
                break;
            }

            let deadline = state.heap.peek().map(|Reverse(task)| task.fire_at());
            match deadline {
                None => {
                    self.signal.wait(&mut state);
                    continue;
                }
                Some(deadline) if Instant::now() < deadline => {
                    self.signal.wait_until(&mut state, deadline);
                    continue;
                }
                Some(_) => {}
            }

            let Some(Reverse(task)) = state.heap.pop() else { continue };
            if !state.active.remove(&task.event_id()) {
                // Cancelled
                continue;
            }

            let event_id = task.event_id();
            MutexGuard::unlocked(&mut state, || {
                if self.dispatcher.add(task.into_task(), false).is_err() {
                    debug!(event_id, "Dispatcher stopped, dropping fired event");
                }
            });
        }
    }
}
