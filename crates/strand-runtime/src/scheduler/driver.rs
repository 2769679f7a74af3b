//! Idle behaviour of a scheduler's worker threads

use super::Scheduler;
use crate::fiber::Fiber;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// What a worker does when its queue scan comes up empty.
///
/// `idle` runs on the per-thread idle fiber. It must yield back to the run
/// loop (`Fiber::yield_to_hold`) whenever new work may be available and
/// return only once `stopping` holds; returning ends the worker thread.
pub(crate) trait Driver: Send + Sync + 'static {
    /// Wake idle workers because the queue changed
    fn tickle(&self);

    /// Body of the idle fiber
    fn idle(&self, scheduler: &Scheduler);

    /// Whether a worker may leave its loop
    fn stopping(&self, scheduler: &Scheduler) -> bool {
        scheduler.queue_drained()
    }

    /// Recover the concrete driver (`IoManager::current`)
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Longest a parked worker sleeps before re-checking the queue
const PARK_TIMEOUT: Duration = Duration::from_millis(1);

/// Base driver: park on a condition variable, wake on tickle
#[derive(Default)]
pub(crate) struct ParkDriver {
    tickled: Mutex<bool>,
    wakeup: Condvar,
}

impl ParkDriver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn park(&self, timeout: Duration) {
        let mut tickled = self.tickled.lock();
        if !*tickled {
            self.wakeup.wait_for(&mut tickled, timeout);
        }
        *tickled = false;
    }
}

impl Driver for ParkDriver {
    fn tickle(&self) {
        *self.tickled.lock() = true;
        self.wakeup.notify_all();
    }

    fn idle(&self, scheduler: &Scheduler) {
        while !self.stopping(scheduler) {
            self.park(PARK_TIMEOUT);
            Fiber::yield_to_hold();
        }
        // let peers parked in the same driver see the stop as well
        self.tickle();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
