//! Task dispatch
//!
//! The dispatcher runs all application logic on one thread; the scheduler
//! feeds it time-delayed work.

pub mod dispatcher;
pub mod scheduler;
pub mod task;

pub use dispatcher::{Dispatcher, ThreadState};
pub use scheduler::Scheduler;
pub use task::{ScheduledTask, Task, DISPATCHER_TASK_EXPIRATION};
