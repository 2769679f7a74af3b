//! Per-thread runtime context.
//!
//! Tracks, for the calling OS thread:
//! - the fiber currently executing (non-owning)
//! - the thread's root fiber (owning; created on first use)
//! - the scheduler driving the thread (non-owning)
//!
//! Entries are installed through scope guards so a nested switch always
//! restores what the outer level saw. Accessors are `#[inline(never)]`: a fiber
//! may resume on another thread, and the thread-local address must be looked
//! up again after every switch.

use crate::fiber::Fiber;
use crate::scheduler::{Scheduler, WeakScheduler};
use std::cell::RefCell;
use std::sync::{Arc, Weak};

#[derive(Default)]
struct ThreadContext {
    current: Option<Weak<Fiber>>,
    root: Option<Arc<Fiber>>,
    scheduler: Option<WeakScheduler>,
}

thread_local! {
    static CONTEXT: RefCell<ThreadContext> = RefCell::new(ThreadContext::default());
}

/// Fiber currently executing on this thread, if any
#[inline(never)]
pub(crate) fn current_fiber() -> Option<Arc<Fiber>> {
    CONTEXT.with(|ctx| ctx.borrow().current.as_ref().and_then(Weak::upgrade))
}

/// Root fiber of this thread, if it was created
#[inline(never)]
pub(crate) fn thread_root() -> Option<Arc<Fiber>> {
    CONTEXT.with(|ctx| ctx.borrow().root.clone())
}

/// Install the thread's root fiber and make it current
#[inline(never)]
pub(crate) fn install_root(root: Arc<Fiber>) {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        debug_assert!(ctx.root.is_none(), "thread root fiber installed twice");
        ctx.current = Some(Arc::downgrade(&root));
        ctx.root = Some(root);
    });
}

#[inline(never)]
fn replace_current(fiber: Option<Weak<Fiber>>) -> Option<Weak<Fiber>> {
    CONTEXT.with(|ctx| std::mem::replace(&mut ctx.borrow_mut().current, fiber))
}

/// Marks a fiber as current for the duration of one switch into it
pub(crate) struct FiberScope {
    previous: Option<Weak<Fiber>>,
}

impl FiberScope {
    pub(crate) fn enter(fiber: &Arc<Fiber>) -> Self {
        Self {
            previous: replace_current(Some(Arc::downgrade(fiber))),
        }
    }
}

impl Drop for FiberScope {
    fn drop(&mut self) {
        replace_current(self.previous.take());
    }
}

/// Scheduler driving this thread, if any
#[inline(never)]
pub(crate) fn current_scheduler() -> Option<Scheduler> {
    CONTEXT.with(|ctx| ctx.borrow().scheduler.as_ref().and_then(WeakScheduler::upgrade))
}

#[inline(never)]
fn replace_scheduler(scheduler: Option<WeakScheduler>) -> Option<WeakScheduler> {
    CONTEXT.with(|ctx| std::mem::replace(&mut ctx.borrow_mut().scheduler, scheduler))
}

/// Bind a scheduler to this thread with no scope (use_caller construction)
pub(crate) fn bind_scheduler(scheduler: &Scheduler) {
    replace_scheduler(Some(scheduler.downgrade()));
}

/// Drop the thread binding if it still points at `scheduler`
pub(crate) fn unbind_scheduler(scheduler: &Scheduler) {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        if ctx.scheduler.as_ref().is_some_and(|weak| weak.ptr_eq(scheduler)) {
            ctx.scheduler = None;
        }
    });
}

/// Binds a scheduler to this thread until dropped
pub(crate) struct SchedulerScope {
    previous: Option<WeakScheduler>,
}

impl SchedulerScope {
    pub(crate) fn enter(scheduler: &Scheduler) -> Self {
        Self {
            previous: replace_scheduler(Some(scheduler.downgrade())),
        }
    }
}

impl Drop for SchedulerScope {
    fn drop(&mut self) {
        replace_scheduler(self.previous.take());
    }
}
