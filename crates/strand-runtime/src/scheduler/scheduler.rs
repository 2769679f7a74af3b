//! Scheduler coordinating worker threads

use super::{Driver, Entry, ParkDriver, Task};
use crate::config::{self, RuntimeConfig};
use crate::context::{self, SchedulerScope};
use crate::fiber::{Callback, Fiber, FiberPool, FiberState};
use crate::thread::{current_tid, Tid};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Scheduler name
    pub name: String,

    /// Worker threads, including the caller thread in use_caller mode
    pub threads: usize,

    /// Workers currently running a task
    pub active: usize,

    /// Workers currently inside their idle fiber
    pub idle: usize,

    /// Entries waiting in the queue
    pub queued: usize,

    /// Whether stop has been requested
    pub stopping: bool,
}

pub(crate) struct Shared {
    /// Name, also the prefix of worker thread names
    name: String,

    /// Pending tasks, FIFO per producer
    queue: Mutex<VecDeque<Entry>>,

    /// Spawned worker threads
    threads: Mutex<Vec<JoinHandle<()>>>,

    /// Kernel ids of all workers (root thread first)
    thread_ids: Mutex<Vec<Tid>>,

    /// Threads to spawn (excludes the caller thread)
    thread_count: usize,

    /// Workers currently running a task
    active: AtomicUsize,

    /// Workers currently inside their idle fiber
    idle: AtomicUsize,

    /// Set by stop, cleared by start
    stopping: AtomicBool,

    /// Workers may leave their loop once drained
    auto_stop: AtomicBool,

    started: AtomicBool,
    stop_requested: AtomicBool,

    /// Caller thread participating in use_caller mode
    root_thread: Option<Tid>,

    /// Fiber running the loop on the caller thread in use_caller mode
    root_fiber: Mutex<Option<Arc<Fiber>>>,

    /// Recycled callback fibers
    pool: FiberPool,

    /// Stack size of idle and root fibers
    stack_size: usize,

    /// Idle behaviour
    driver: Arc<dyn Driver>,
}

/// N:M fiber scheduler
///
/// A cheap handle; clones drive the same scheduler. Call [`Scheduler::stop`]
/// before the last handle goes away: running workers keep their own handle
/// until the scheduler is stopped.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

/// Non-owning scheduler handle
#[derive(Clone)]
pub(crate) struct WeakScheduler {
    shared: Weak<Shared>,
}

impl WeakScheduler {
    pub(crate) fn upgrade(&self) -> Option<Scheduler> {
        self.shared.upgrade().map(|shared| Scheduler { shared })
    }

    pub(crate) fn ptr_eq(&self, scheduler: &Scheduler) -> bool {
        std::ptr::eq(self.shared.as_ptr(), Arc::as_ptr(&scheduler.shared))
    }
}

impl Scheduler {
    /// Create a scheduler with `threads` workers (0 = one per CPU).
    ///
    /// With `use_caller`, the calling thread counts as one of the workers: it
    /// joins the loop when [`Scheduler::stop`] is called from it.
    ///
    /// # Panics
    /// Panics if `use_caller` is set on a thread that already drives a scheduler.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Self {
        Self::with_config(threads, use_caller, name, &config::current())
    }

    /// Like [`Scheduler::new`], with fiber settings taken from `config`
    pub fn with_config(
        threads: usize,
        use_caller: bool,
        name: &str,
        config: &RuntimeConfig,
    ) -> Self {
        Self::with_driver(threads, use_caller, name, Arc::new(ParkDriver::new()), config)
    }

    pub(crate) fn with_driver(
        threads: usize,
        use_caller: bool,
        name: &str,
        driver: Arc<dyn Driver>,
        config: &RuntimeConfig,
    ) -> Self {
        let mut thread_count = if threads == 0 {
            num_cpus::get()
        } else {
            threads
        };

        let mut root_thread = None;
        if use_caller {
            assert!(
                Scheduler::current().is_none(),
                "use_caller: thread already drives a scheduler"
            );
            Fiber::current();
            thread_count -= 1;
            root_thread = Some(current_tid());
        }

        let stack_size = config.fiber.stack_size;

        let shared = Arc::new_cyclic(|this: &Weak<Shared>| {
            let root_fiber = use_caller.then(|| {
                let this = this.clone();
                Fiber::with_stack_size(
                    move || {
                        if let Some(shared) = this.upgrade() {
                            Scheduler { shared }.run();
                        }
                    },
                    stack_size,
                )
            });

            Shared {
                name: name.to_string(),
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_ids: Mutex::new(root_thread.into_iter().collect()),
                thread_count,
                active: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                stopping: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                started: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                root_thread,
                root_fiber: Mutex::new(root_fiber),
                pool: FiberPool::new(config.fiber.pool_size, stack_size),
                stack_size,
                driver,
            }
        });

        let scheduler = Scheduler { shared };
        if use_caller {
            context::bind_scheduler(&scheduler);
        }

        debug!(
            scheduler = %scheduler.shared.name,
            threads = thread_count,
            use_caller,
            "scheduler created"
        );
        scheduler
    }

    /// Scheduler driving the calling thread
    pub fn current() -> Option<Scheduler> {
        context::current_scheduler()
    }

    /// Name given at construction
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Kernel ids of the worker threads, caller thread first in use_caller mode
    pub fn thread_ids(&self) -> Vec<Tid> {
        self.shared.thread_ids.lock().clone()
    }

    /// Whether both handles drive the same scheduler
    pub fn ptr_eq(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.shared.driver
    }

    /// Spawn the worker threads.
    ///
    /// Idempotent: a second call while running does nothing. Returns once
    /// every spawned worker has reported its thread id.
    ///
    /// If a thread cannot be spawned, the workers started before it keep
    /// running and are listed in [`Scheduler::thread_ids`]; call
    /// [`Scheduler::stop`] to drain and join them.
    pub fn start(&self) -> Result<()> {
        self.spawn_workers(|name, body| thread::Builder::new().name(name).spawn(body))
    }

    fn spawn_workers<S>(&self, mut spawn: S) -> Result<()>
    where
        S: FnMut(String, Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>,
    {
        let shared = &self.shared;
        if shared.stop_requested.load(Ordering::Acquire) {
            warn!(scheduler = %shared.name, "start after stop ignored");
            return Ok(());
        }
        if shared.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        shared.stopping.store(false, Ordering::Release);

        let (tx, rx) = crossbeam::channel::bounded(shared.thread_count.max(1));
        let mut failure = None;
        let spawned = {
            let mut threads = shared.threads.lock();
            for i in 0..shared.thread_count {
                let name = format!("{}_{}", shared.name, i);
                let scheduler = self.clone();
                let tx = tx.clone();
                let body = Box::new(move || {
                    let _ = tx.send(current_tid());
                    scheduler.run();
                });
                match spawn(name.clone(), body) {
                    Ok(handle) => threads.push(handle),
                    Err(source) => {
                        failure = Some(Error::Spawn { name, source });
                        break;
                    }
                }
            }
            threads.len()
        };
        drop(tx);

        let mut ids = shared.thread_ids.lock();
        ids.extend(rx.iter().take(spawned));

        if let Some(err) = failure {
            error!(
                scheduler = %shared.name,
                running = spawned,
                %err,
                "scheduler started partially"
            );
            return Err(err);
        }

        info!(scheduler = %shared.name, threads = ids.len(), "scheduler started");
        Ok(())
    }

    /// Stop the scheduler and join its threads.
    ///
    /// Workers finish every queued task first. In use_caller mode this must be
    /// called from the caller thread, which runs the loop itself until the
    /// queue is drained. A second call does nothing.
    ///
    /// # Panics
    /// Panics when called from a thread the scheduler cannot join from.
    pub fn stop(&self) {
        let shared = &self.shared;
        if shared.stop_requested.swap(true, Ordering::AcqRel) {
            debug!(scheduler = %shared.name, "scheduler already stopped");
            return;
        }
        shared.auto_stop.store(true, Ordering::Release);

        let root_fiber = shared.root_fiber.lock().clone();
        if let Some(root) = &root_fiber {
            if shared.thread_count == 0
                && matches!(root.state(), FiberState::Term | FiberState::Init)
            {
                shared.stopping.store(true, Ordering::Release);
                if self.stopping() {
                    self.finish_stop();
                    return;
                }
            }
        }

        match shared.root_thread {
            Some(root) => assert_eq!(
                current_tid(),
                root,
                "stop on a use_caller scheduler must run on its caller thread"
            ),
            None => assert!(
                !Scheduler::current().is_some_and(|current| current.ptr_eq(self)),
                "stop called from one of the scheduler's own workers"
            ),
        }

        shared.stopping.store(true, Ordering::Release);
        for _ in 0..shared.thread_count {
            self.tickle();
        }
        if root_fiber.is_some() {
            self.tickle();
        }

        if let Some(root) = root_fiber {
            if !root.state().is_terminal() && !self.stopping() {
                root.call();
            }
        }

        self.finish_stop();
    }

    fn finish_stop(&self) {
        let shared = &self.shared;
        let threads = std::mem::take(&mut *shared.threads.lock());
        for handle in threads {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(scheduler = %shared.name, thread = %name, "worker thread panicked");
            }
        }

        if shared.root_thread.is_some() {
            context::unbind_scheduler(self);
            shared.root_fiber.lock().take();
        }
        info!(scheduler = %shared.name, "scheduler stopped");
    }

    /// Schedule a callback on any worker
    pub fn schedule<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Task::Call(Box::new(cb)), None);
    }

    /// Schedule a callback, pinned to worker `thread` when given
    pub fn schedule_on<F>(&self, cb: F, thread: Option<Tid>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Task::Call(Box::new(cb)), thread);
    }

    pub(crate) fn schedule_boxed(&self, cb: Callback, thread: Option<Tid>) {
        self.push(Task::Call(cb), thread);
    }

    /// Schedule a fiber to be resumed, pinned to worker `thread` when given
    ///
    /// # Panics
    /// Panics if `fiber` is a thread root fiber.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: Option<Tid>) {
        assert!(
            !fiber.is_root(),
            "fiber {} is a thread root fiber and cannot be scheduled",
            fiber.id()
        );
        self.push(Task::Fiber(fiber), thread);
    }

    /// Schedule several callbacks under one lock, waking workers at most once
    pub fn schedule_batch<I, F>(&self, tasks: I)
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        let need_tickle = {
            let mut queue = self.shared.queue.lock();
            let was_empty = queue.is_empty();
            queue.extend(
                tasks
                    .into_iter()
                    .map(|cb| Entry::new(Task::Call(Box::new(cb)), None)),
            );
            was_empty && !queue.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    fn push(&self, task: Task, thread: Option<Tid>) {
        let need_tickle = {
            let mut queue = self.shared.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(Entry::new(task, thread));
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Move the calling fiber onto this scheduler, pinned to `thread` when given.
    ///
    /// Does nothing if the fiber already runs on this scheduler and on the
    /// requested thread.
    ///
    /// # Panics
    /// Panics when not called from inside a fiber.
    pub fn switch_to(&self, thread: Option<Tid>) {
        let on_self = Scheduler::current().is_some_and(|current| current.ptr_eq(self));
        if on_self && thread.map_or(true, |tid| tid == current_tid()) {
            return;
        }

        let fiber = Fiber::current();
        assert!(!fiber.is_root(), "switch_to must be called from inside a fiber");
        self.schedule_fiber(fiber, thread);
        Fiber::yield_to_hold();
    }

    /// Wake idle workers
    pub fn tickle(&self) {
        self.shared.driver.tickle();
    }

    /// Whether workers may leave their loops: stop requested, queue drained,
    /// no task running (and, for an IoManager, nothing pending in the reactor)
    pub fn stopping(&self) -> bool {
        self.shared.driver.stopping(self)
    }

    pub(crate) fn queue_drained(&self) -> bool {
        let shared = &self.shared;
        let queue = shared.queue.lock();
        shared.auto_stop.load(Ordering::Acquire)
            && shared.stopping.load(Ordering::Acquire)
            && queue.is_empty()
            && shared.active.load(Ordering::Acquire) == 0
    }

    /// Whether any worker is inside its idle fiber
    pub fn has_idle_threads(&self) -> bool {
        self.shared.idle.load(Ordering::Relaxed) > 0
    }

    /// Snapshot of counters
    pub fn stats(&self) -> SchedulerStats {
        let shared = &self.shared;
        SchedulerStats {
            name: shared.name.clone(),
            threads: shared.thread_count + usize::from(shared.root_thread.is_some()),
            active: shared.active.load(Ordering::Relaxed),
            idle: shared.idle.load(Ordering::Relaxed),
            queued: shared.queue.lock().len(),
            stopping: shared.stopping.load(Ordering::Relaxed),
        }
    }

    /// Take the first entry this worker may run
    fn take_next(&self, tid: Tid) -> (Option<Entry>, bool) {
        let mut queue = self.shared.queue.lock();
        let mut tickle_me = false;

        let mut found = None;
        for (index, entry) in queue.iter().enumerate() {
            if entry.runnable_on(tid) {
                found = Some(index);
                break;
            }
            // pinned elsewhere or still switching out: someone must look again
            tickle_me = true;
        }

        let entry = found.and_then(|index| queue.remove(index));
        if entry.is_some() {
            self.shared.active.fetch_add(1, Ordering::AcqRel);
            tickle_me |= !queue.is_empty();
        }
        (entry, tickle_me)
    }

    /// Worker loop, run by every spawned thread and by the root fiber
    pub(crate) fn run(&self) {
        let shared = &self.shared;
        let tid = current_tid();
        let _scope = SchedulerScope::enter(self);
        debug!(scheduler = %shared.name, tid, "worker loop started");

        let idle_fiber = {
            let scheduler = self.clone();
            Fiber::with_stack_size(
                move || scheduler.shared.driver.idle(&scheduler),
                shared.stack_size,
            )
        };
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let (entry, tickle_me) = self.take_next(tid);
            if tickle_me {
                self.tickle();
            }

            let Some(Entry { task, thread }) = entry else {
                if idle_fiber.state().is_terminal() {
                    if let Some(failure) = idle_fiber.failure() {
                        error!(scheduler = %shared.name, tid, %failure, "idle fiber failed");
                    }
                    break;
                }
                shared.idle.fetch_add(1, Ordering::AcqRel);
                idle_fiber.swap_in();
                shared.idle.fetch_sub(1, Ordering::AcqRel);
                continue;
            };

            match task {
                Task::Fiber(fiber) => {
                    let state = if fiber.state().is_terminal() {
                        fiber.state()
                    } else {
                        fiber.swap_in()
                    };

                    match state {
                        FiberState::Ready => self.schedule_fiber(fiber, thread),
                        state if state.is_terminal() => {
                            shared.pool.release(fiber);
                        }
                        // parked: whoever holds it resumes it
                        _ => {}
                    }
                    shared.active.fetch_sub(1, Ordering::AcqRel);
                }
                Task::Call(cb) => {
                    let fiber = match cb_fiber.take() {
                        Some(fiber) => {
                            fiber.rearm(Some(cb));
                            fiber
                        }
                        None => shared.pool.acquire_boxed(cb),
                    };
                    let state = fiber.swap_in();

                    match state {
                        FiberState::Ready => self.schedule_fiber(fiber, thread),
                        state if state.is_terminal() && Arc::strong_count(&fiber) == 1 => {
                            cb_fiber = Some(fiber);
                        }
                        _ => {}
                    }
                    shared.active.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        if let Some(fiber) = cb_fiber {
            shared.pool.release(fiber);
        }
        debug!(scheduler = %shared.name, tid, "worker loop finished");
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.shared.name)
            .field("threads", &self.shared.thread_count)
            .field("root_thread", &self.shared.root_thread)
            .finish()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if !self.stopping.load(Ordering::Relaxed) {
            warn!(scheduler = %self.name, "scheduler dropped while running");
        }
    }
}
