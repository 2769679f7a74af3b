//! Fiber Scheduler
//!
//! N fibers over M OS threads. Each worker thread runs the same loop: take the
//! first queue entry it may run, switch into it, and fall back to a per-thread
//! idle fiber when nothing is runnable. What "idle" means is pluggable through
//! [`Driver`](driver::Driver): the base scheduler parks on a condition variable,
//! the IoManager waits in epoll.

mod driver;
#[allow(clippy::module_inception)]
mod scheduler;
mod task;

pub(crate) use driver::{Driver, ParkDriver};
pub use scheduler::{Scheduler, SchedulerStats};
pub(crate) use scheduler::WeakScheduler;
pub(crate) use task::{Entry, Task};
