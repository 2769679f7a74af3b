//! Fiber structure and execution state
//!
//! A fiber is a stackful execution context that runs until it yields or its
//! callback returns. Stack switching is delegated to `generator`: resuming the
//! generator is "swap in", `yield_with` is "swap out".
//!
//! Each fiber's generator runs an entry loop: take the callback, run it, record
//! TERM/EXCEPT, yield. `reset` arms a new callback so the next resume reuses
//! the same stack instead of allocating another one.

mod pool;

pub use pool::FiberPool;

use crate::config;
use crate::context::{self, FiberScope};
use generator::{Generator, Gn};
use parking_lot::Mutex;
use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// Entry callback of a fiber
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Unique identifier for a Fiber
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);
static PANICKED_FIBERS: AtomicU64 = AtomicU64::new(0);

impl FiberId {
    fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a Fiber
///
/// ```text
/// INIT -> EXEC -> HOLD | READY | TERM | EXCEPT
/// HOLD, READY -> EXEC
/// TERM, EXCEPT, INIT -> INIT   (reset)
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created or reset, not yet run
    Init,
    /// Parked until something external schedules it again
    Hold,
    /// Running on some thread
    Exec,
    /// Callback returned
    Term,
    /// Gave up its turn, wants to be re-queued
    Ready,
    /// Callback panicked
    Except,
}

impl FiberState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FiberState::Init,
            1 => FiberState::Hold,
            2 => FiberState::Exec,
            3 => FiberState::Term,
            4 => FiberState::Ready,
            _ => FiberState::Except,
        }
    }

    /// TERM or EXCEPT
    pub fn is_terminal(self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// States `reset` accepts
    pub fn is_resettable(self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }
}

/// A stackful, cooperatively scheduled execution context
pub struct Fiber {
    /// Unique identifier
    id: FiberId,

    /// Current state, only written by the thread running or resuming the fiber
    state: AtomicU8,

    /// Stack size in bytes (0 for a thread root fiber)
    stack_size: usize,

    /// Callback the entry loop runs next
    callback: Mutex<Option<Callback>>,

    /// Saved execution context; None for a thread's root fiber
    routine: Option<Mutex<Generator<'static, (), ()>>>,

    /// Panic message of the last run that ended in EXCEPT
    failure: Mutex<Option<String>>,
}

impl Fiber {
    /// Create a fiber with the configured default stack size
    pub fn new<F>(cb: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(cb, config::fiber_stack_size())
    }

    /// Create a fiber with an explicit stack size in bytes
    pub fn with_stack_size<F>(cb: F, stack_size: usize) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(Some(Box::new(cb)), stack_size)
    }

    pub(crate) fn spawn(cb: Option<Callback>, stack_size: usize) -> Arc<Self> {
        let stack_size = stack_size.max(config::MIN_STACK_SIZE);
        let fiber = Arc::new_cyclic(|this: &Weak<Fiber>| {
            let entry = this.clone();
            let words = stack_size / std::mem::size_of::<usize>();
            let routine = Gn::<()>::new_opt(words, move || fiber_main(entry));

            Fiber {
                id: FiberId::next(),
                state: AtomicU8::new(FiberState::Init as u8),
                stack_size,
                callback: Mutex::new(cb),
                routine: Some(Mutex::new(routine)),
                failure: Mutex::new(None),
            }
        });

        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        debug!(fiber_id = %fiber.id, stack_size, "fiber created");
        fiber
    }

    /// Root fiber of an OS thread: no stack of its own, always EXEC
    fn new_root() -> Arc<Self> {
        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Exec as u8),
            stack_size: 0,
            callback: Mutex::new(None),
            routine: None,
            failure: Mutex::new(None),
        });

        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        debug!(fiber_id = %fiber.id, "thread root fiber created");
        fiber
    }

    /// Get the Fiber's unique ID
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Get the current state
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Stack size in bytes
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// True for the implicit per-thread root fiber
    pub fn is_root(&self) -> bool {
        self.routine.is_none()
    }

    /// Panic message of the last run, if it ended in EXCEPT
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Re-arm a finished fiber with a new callback, keeping its stack
    ///
    /// # Panics
    /// Panics on a thread root fiber or unless the state is INIT, TERM or EXCEPT.
    pub fn reset<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.rearm(Some(Box::new(cb)));
    }

    pub(crate) fn rearm(&self, cb: Option<Callback>) {
        assert!(
            self.routine.is_some(),
            "reset: fiber {} is a thread root fiber",
            self.id
        );
        let state = self.state();
        assert!(
            state.is_resettable(),
            "reset: fiber {} is {:?}, expected INIT, TERM or EXCEPT",
            self.id,
            state
        );

        *self.callback.lock() = cb;
        *self.failure.lock() = None;
        self.set_state(FiberState::Init);
    }

    /// Switch from the calling context into this fiber.
    ///
    /// Returns once the fiber yields or finishes, with the state it parked in.
    /// A fiber that gave up control through [`Fiber::swap_out`] without
    /// choosing HOLD or READY is recorded as HOLD.
    ///
    /// If another thread is still switching out of this fiber, the call waits
    /// for that switch to complete.
    pub fn swap_in(self: &Arc<Self>) -> FiberState {
        self.resume("swap_in")
    }

    /// Switch from the thread's root fiber into this fiber (use_caller mode)
    pub fn call(self: &Arc<Self>) -> FiberState {
        debug_assert!(
            context::current_fiber().map_or(true, |cur| cur.is_root()),
            "call must be made from the thread root fiber"
        );
        self.resume("call")
    }

    fn resume(self: &Arc<Self>, op: &'static str) -> FiberState {
        let Some(routine) = &self.routine else {
            panic!("{}: fiber {} is a thread root fiber", op, self.id);
        };
        if let Some(current) = context::current_fiber() {
            assert!(
                !Arc::ptr_eq(&current, self),
                "{}: fiber {} cannot resume itself",
                op,
                self.id
            );
        }

        let mut routine = routine.lock();
        let state = self.state();
        assert!(
            matches!(
                state,
                FiberState::Init | FiberState::Hold | FiberState::Ready
            ),
            "{}: fiber {} cannot run from {:?}",
            op,
            self.id,
            state
        );

        let scope = FiberScope::enter(self);
        self.set_state(FiberState::Exec);
        routine.resume();
        drop(scope);

        if self.state() == FiberState::Exec {
            self.set_state(FiberState::Hold);
        }
        self.state()
    }

    /// Switch from this fiber back to whoever resumed it, state unchanged
    ///
    /// # Panics
    /// Panics unless called by this fiber on its own stack.
    pub fn swap_out(&self) {
        self.suspend("swap_out");
    }

    /// Return from a [`Fiber::call`] to the thread's root fiber
    pub fn back(&self) {
        self.suspend("back");
    }

    fn suspend(&self, op: &'static str) {
        assert!(
            self.routine.is_some(),
            "{}: fiber {} is a thread root fiber",
            op,
            self.id
        );
        let is_current = context::current_fiber().is_some_and(|cur| cur.id == self.id);
        assert!(is_current, "{}: fiber {} is not running here", op, self.id);

        #[allow(deprecated)]
        generator::yield_with(());
    }

    /// Fiber running on this thread; creates the thread root fiber on first use
    pub fn current() -> Arc<Fiber> {
        if let Some(fiber) = context::current_fiber() {
            return fiber;
        }

        let root = Fiber::new_root();
        context::install_root(root.clone());
        root
    }

    /// ID of the fiber running on this thread, 0 if none
    pub fn current_id() -> u64 {
        context::current_fiber().map_or(0, |fiber| fiber.id.as_u64())
    }

    /// The calling thread's root fiber, if one was created
    pub fn thread_root() -> Option<Arc<Fiber>> {
        context::thread_root()
    }

    /// Park the current fiber (EXEC -> HOLD) until something schedules it
    pub fn yield_to_hold() {
        Self::yield_as(FiberState::Hold);
    }

    /// Give up the current turn (EXEC -> READY); the scheduler re-queues it
    pub fn yield_to_ready() {
        Self::yield_as(FiberState::Ready);
    }

    fn yield_as(state: FiberState) {
        let current = Fiber::current();
        assert!(
            !current.is_root(),
            "fiber {} is a thread root fiber and cannot yield",
            current.id
        );
        assert_eq!(
            current.state(),
            FiberState::Exec,
            "fiber {} yielded while not executing",
            current.id
        );
        current.set_state(state);
        // the stack must not own its fiber while parked
        drop(current);

        #[allow(deprecated)]
        generator::yield_with(());
    }

    /// Live fibers in the process
    pub fn total() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }
}

/// Fiber runs that ended in a panic since process start
pub fn panicked_total() -> u64 {
    PANICKED_FIBERS.load(Ordering::Relaxed)
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        let total = LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!(fiber_id = %self.id, state = ?self.state(), total, "fiber dropped");
    }
}

fn fiber_main(this: Weak<Fiber>) {
    loop {
        let (id, callback) = match this.upgrade() {
            Some(fiber) => (fiber.id, fiber.callback.lock().take()),
            None => return,
        };

        let outcome = match callback {
            Some(cb) => panic::catch_unwind(AssertUnwindSafe(cb)),
            None => Ok(()),
        };

        match outcome {
            Ok(()) => {
                if let Some(fiber) = this.upgrade() {
                    fiber.set_state(FiberState::Term);
                }
            }
            Err(payload) => {
                // dropping a parked fiber unwinds it with generator's cancel panic
                if is_cancel(payload.as_ref()) {
                    panic::resume_unwind(payload);
                }

                let message = panic_message(payload.as_ref());
                PANICKED_FIBERS.fetch_add(1, Ordering::Relaxed);
                error!(
                    fiber_id = %id,
                    %message,
                    backtrace = %Backtrace::force_capture(),
                    "fiber panicked"
                );

                if let Some(fiber) = this.upgrade() {
                    *fiber.failure.lock() = Some(message);
                    fiber.set_state(FiberState::Except);
                }
            }
        }

        #[allow(deprecated)]
        generator::yield_with(());
    }
}

fn is_cancel(payload: &(dyn Any + Send)) -> bool {
    matches!(
        payload.downcast_ref::<generator::Error>(),
        Some(generator::Error::Cancel)
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
