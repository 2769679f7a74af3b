//! I/O manager
//!
//! A [`Scheduler`](crate::Scheduler) whose idle fibers run an epoll reactor,
//! plus the timers that bound how long the reactor may sleep.

mod epoll;
mod event;
mod manager;
mod reactor;

pub use event::{Event, Readiness};
pub use manager::IoManager;
