//! IoManager: scheduler + epoll reactor + timers

use super::event::{Event, Readiness, Waiter};
use super::reactor::Reactor;
use crate::config::{self, RuntimeConfig};
use crate::context;
use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use crate::timer::{Timer, TimerManager};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::info;

/// Scheduler that resumes fibers on fd readiness and timer expiry.
///
/// Dereferences to its [`Scheduler`] for `schedule`, `stop` and friends.
#[derive(Clone)]
pub struct IoManager {
    scheduler: Scheduler,
    reactor: Arc<Reactor>,
}

impl IoManager {
    /// Create and start an IoManager with `threads` workers (0 = one per CPU)
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Self> {
        Self::with_config(threads, use_caller, name, &config::current())
    }

    /// Like [`IoManager::new`], with fiber, reactor and timer settings taken from `config`
    pub fn with_config(
        threads: usize,
        use_caller: bool,
        name: &str,
        config: &RuntimeConfig,
    ) -> Result<Self> {
        let reactor = Arc::new(Reactor::new(config)?);
        let scheduler =
            Scheduler::with_driver(threads, use_caller, name, reactor.clone(), config);
        scheduler.start()?;

        info!(
            scheduler = %name,
            max_events = config.reactor.max_events,
            "io manager started"
        );
        Ok(Self { scheduler, reactor })
    }

    /// IoManager driving the calling thread
    pub fn current() -> Option<IoManager> {
        let scheduler = Scheduler::current()?;
        let reactor = scheduler
            .driver()
            .clone()
            .into_any()
            .downcast::<Reactor>()
            .ok()?;
        Some(IoManager { scheduler, reactor })
    }

    /// The underlying scheduler
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run `cb` once `fd` reports `event` (or the registration is cancelled).
    ///
    /// Registrations are one-shot: re-register to wait again.
    ///
    /// # Panics
    /// Panics if `event` is not exactly READ or WRITE, or if `fd` already has
    /// a registration for it.
    pub fn add_event<F>(&self, fd: RawFd, event: Event, cb: F) -> Result<()>
    where
        F: FnOnce(Readiness) + Send + 'static,
    {
        self.reactor
            .register(fd, event, Waiter::Callback(Box::new(cb)))
    }

    /// Re-schedule the calling fiber once `fd` reports `event`.
    ///
    /// The caller is expected to park (`Fiber::yield_to_hold`) right after.
    pub fn add_event_fiber(&self, fd: RawFd, event: Event) -> Result<()> {
        let fiber = running_fiber("add_event_fiber")?;
        self.reactor.register(
            fd,
            event,
            Waiter::Fiber {
                fiber,
                outcome: None,
            },
        )
    }

    /// Park the calling fiber until `fd` reports `event` or the wait is cancelled
    pub fn wait_event(&self, fd: RawFd, event: Event) -> Result<Readiness> {
        let fiber = running_fiber("wait_event")?;
        let outcome = Arc::new(Mutex::new(None));
        self.reactor.register(
            fd,
            event,
            Waiter::Fiber {
                fiber,
                outcome: Some(outcome.clone()),
            },
        )?;

        Fiber::yield_to_hold();
        let readiness = outcome.lock().take();
        Ok(readiness.unwrap_or(Readiness::Cancelled))
    }

    /// Remove a registration without resuming its waiter
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.del_event(fd, event)
    }

    /// Remove a registration and resume its waiter with [`Readiness::Cancelled`]
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.cancel(fd, event, &self.scheduler)
    }

    /// Cancel every registration of `fd`
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.reactor.cancel(fd, Event::all(), &self.scheduler)
    }

    /// Registrations that have neither fired nor been removed
    pub fn pending_events(&self) -> usize {
        self.reactor.pending()
    }

    /// Timers driving this reactor
    pub fn timers(&self) -> &TimerManager {
        &self.reactor.timers
    }

    /// Arm a timer whose callback is scheduled on this IoManager
    pub fn add_timer<F>(&self, delay: Duration, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reactor.timers.add_timer(delay, cb, recurring)
    }

    /// Arm a timer that only fires while `condition` is alive
    pub fn add_condition_timer<F, T>(
        &self,
        delay: Duration,
        cb: F,
        condition: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.reactor
            .timers
            .add_condition_timer(delay, cb, condition, recurring)
    }

    /// Whether any timer is armed
    pub fn has_timer(&self) -> bool {
        self.reactor.timers.has_timer()
    }

    /// Park the calling fiber for `delay`
    pub fn sleep(&self, delay: Duration) -> Result<()> {
        let fiber = running_fiber("sleep")?;
        let scheduler = self.scheduler.clone();
        let slot = Mutex::new(Some(fiber));
        self.add_timer(
            delay,
            move || {
                if let Some(fiber) = slot.lock().take() {
                    scheduler.schedule_fiber(fiber, None);
                }
            },
            false,
        );
        Fiber::yield_to_hold();
        Ok(())
    }
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.scheduler)
            .field("pending", &self.pending_events())
            .field("timers", &self.reactor.timers.len())
            .finish()
    }
}

fn running_fiber(op: &'static str) -> Result<Arc<Fiber>> {
    match context::current_fiber() {
        Some(fiber) if !fiber.is_root() => Ok(fiber),
        _ => Err(Error::NotInFiber(op)),
    }
}
