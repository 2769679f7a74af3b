//! Queue entries

use crate::fiber::{Callback, Fiber};
use crate::thread::Tid;
use std::fmt;
use std::sync::Arc;

/// Something the scheduler can run
pub(crate) enum Task {
    /// A fiber to resume where it left off
    Fiber(Arc<Fiber>),

    /// A callback, run on a (recycled) callback fiber
    Call(Callback),
}

/// One queued task and the thread it is pinned to
pub(crate) struct Entry {
    pub(crate) task: Task,

    /// None = any worker thread
    pub(crate) thread: Option<Tid>,
}

impl Entry {
    pub(crate) fn new(task: Task, thread: Option<Tid>) -> Self {
        Self { task, thread }
    }

    /// Whether the worker `tid` may take this entry now
    pub(crate) fn runnable_on(&self, tid: Tid) -> bool {
        if self.thread.is_some_and(|pinned| pinned != tid) {
            return false;
        }
        match &self.task {
            // still switching out on another thread
            Task::Fiber(fiber) => fiber.state() != crate::fiber::FiberState::Exec,
            Task::Call(_) => true,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Task::Call(_) => f.write_str("Call"),
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("task", &self.task)
            .field("thread", &self.thread)
            .finish()
    }
}
