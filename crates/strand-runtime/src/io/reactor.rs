//! Reactor: the IoManager's idle fiber
//!
//! Every worker of an IoManager spends its idle time here: it sleeps in
//! `epoll_wait` for at most the time until the next timer deadline, schedules
//! expired timers, hands ready fds' waiters back to their schedulers and
//! yields to the run loop. An eventfd (the tickler) interrupts the wait when
//! new work or an earlier deadline arrives.

use super::epoll::{Epoll, Tickler};
use super::event::{Event, EventContext, FdContext, Readiness, Waiter};
use crate::config::RuntimeConfig;
use crate::fiber::Fiber;
use crate::scheduler::{Driver, Scheduler};
use crate::timer::TimerManager;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::any::Any;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Slots in the fd table before the first registration grows it
const INITIAL_FD_SLOTS: usize = 32;

const EDGE: u32 = libc::EPOLLET as u32;

// ============================================================================
// Reactor
// ============================================================================

pub(crate) struct Reactor {
    epoll: Epoll,

    /// Shared with the timer manager's front hook
    tickler: Arc<Tickler>,

    pub(crate) timers: TimerManager,

    /// Registrations that have not fired or been removed
    pending: AtomicUsize,

    /// Indexed by fd
    contexts: RwLock<Vec<Arc<FdContext>>>,

    /// Events collected by one `epoll_wait`
    max_events: usize,

    /// Wait cap when no timer is armed
    max_wait: Option<Duration>,
}

impl Reactor {
    pub(crate) fn new(config: &RuntimeConfig) -> Result<Self> {
        let epoll = Epoll::new().map_err(Error::EpollCreate)?;
        let tickler = Arc::new(Tickler::new().map_err(Error::Tickle)?);

        let events = libc::EPOLLIN as u32 | EDGE;
        epoll
            .ctl(libc::EPOLL_CTL_ADD, tickler.fd(), events)
            .map_err(|source| Error::Register {
                fd: tickler.fd(),
                op: libc::EPOLL_CTL_ADD,
                events,
                source,
            })?;

        let hook = tickler.clone();
        let timers = TimerManager::new(config.timer.rebase, move || hook.notify());

        let reactor = Self {
            epoll,
            tickler,
            timers,
            pending: AtomicUsize::new(0),
            contexts: RwLock::new(Vec::new()),
            max_events: config.reactor.max_events.max(1),
            max_wait: config.reactor.max_wait_ms.map(Duration::from_millis),
        };
        reactor.grow(INITIAL_FD_SLOTS);
        Ok(reactor)
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn grow(&self, len: usize) {
        let mut contexts = self.contexts.write();
        let start = contexts.len();
        if len <= start {
            return;
        }
        contexts.extend((start..len).map(|fd| Arc::new(FdContext::new(fd as RawFd))));
    }

    /// FdContext for `fd`, growing the table to 1.5x when `create` is set
    fn context(&self, fd: RawFd, create: bool) -> Option<Arc<FdContext>> {
        let index = usize::try_from(fd).ok()?;
        if let Some(ctx) = self.contexts.read().get(index) {
            return Some(ctx.clone());
        }
        if !create {
            return None;
        }

        self.grow((index + 1).max(index * 3 / 2));
        self.contexts.read().get(index).cloned()
    }

    fn ctl(&self, op: i32, fd: RawFd, events: Event) -> Result<()> {
        let events = events.bits() | EDGE;
        self.epoll
            .ctl(op, fd, events)
            .map_err(|source| Error::Register {
                fd,
                op,
                events,
                source,
            })
    }

    /// Register `waiter` for one event of `fd`
    ///
    /// # Panics
    /// Panics if `event` is not exactly READ or WRITE, or if the fd already
    /// waits for it.
    pub(crate) fn register(&self, fd: RawFd, event: Event, waiter: Waiter) -> Result<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event: expected READ or WRITE, got {:?}",
            event
        );

        let Some(ctx) = self.context(fd, true) else {
            return Err(Error::Register {
                fd,
                op: libc::EPOLL_CTL_ADD,
                events: event.bits() | EDGE,
                source: io::Error::from_raw_os_error(libc::EBADF),
            });
        };

        let mut state = ctx.state.lock();
        assert!(
            !state.events.contains(event),
            "add_event: fd {} already waits for {:?}",
            fd,
            event
        );

        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        if let Err(err) = self.ctl(op, fd, state.events | event) {
            error!(fd, ?event, %err, "event registration failed");
            return Err(err);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        state.arm(event, EventContext::new(waiter));
        trace!(fd, ?event, "event registered");
        Ok(())
    }

    /// Remove registrations in `events` from `fd`, returning their contexts.
    /// The pending count is left to the caller.
    fn disarm(&self, fd: RawFd, events: Event) -> Vec<EventContext> {
        let Some(ctx) = self.context(fd, false) else {
            return Vec::new();
        };

        let mut state = ctx.state.lock();
        let removing = state.events & events;
        if removing.is_empty() {
            return Vec::new();
        }

        let left = state.events - removing;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if let Err(err) = self.ctl(op, fd, left) {
            error!(fd, ?events, %err, "event removal failed");
            return Vec::new();
        }

        state.disarm(removing)
    }

    /// Drop the registration without resuming its waiter
    pub(crate) fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let removed = self.disarm(fd, event);
        if removed.is_empty() {
            return false;
        }
        self.pending.fetch_sub(removed.len(), Ordering::AcqRel);
        // dropped outside the fd lock: a parked fiber unwinds here
        drop(removed);
        true
    }

    /// Remove registrations and resume their waiters with `Cancelled`
    pub(crate) fn cancel(&self, fd: RawFd, events: Event, fallback: &Scheduler) -> bool {
        let removed = self.disarm(fd, events);
        if removed.is_empty() {
            return false;
        }
        let count = removed.len();
        for ctx in removed {
            ctx.trigger(Readiness::Cancelled, fallback);
        }
        self.pending.fetch_sub(count, Ordering::AcqRel);
        debug!(fd, ?events, count, "events cancelled");
        true
    }

    // ------------------------------------------------------------------------
    // idle loop
    // ------------------------------------------------------------------------

    fn wait_timeout_ms(&self, next_timer: Option<Duration>) -> i32 {
        let wait = match (next_timer, self.max_wait) {
            (Some(timer), Some(cap)) => Some(timer.min(cap)),
            (Some(timer), None) => Some(timer),
            (None, cap) => cap,
        };
        match wait {
            // round up: a timer must never fire early
            Some(wait) => i32::try_from(wait.as_nanos().div_ceil(1_000_000)).unwrap_or(i32::MAX),
            None => -1,
        }
    }

    fn dispatch(&self, scheduler: &Scheduler, event: libc::epoll_event) {
        let (bits, data) = (event.events, event.u64);
        let fd = data as RawFd;
        if fd == self.tickler.fd() {
            self.tickler.drain();
            return;
        }

        let Some(ctx) = self.context(fd, false) else {
            return;
        };

        let fired = {
            let mut state = ctx.state.lock();
            let mut real = bits;
            if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                real |= state.events.bits();
            }
            let real = Event::from_bits_truncate(real) & state.events;
            if real.is_empty() {
                return;
            }

            let left = state.events - real;
            let op = if left.is_empty() {
                libc::EPOLL_CTL_DEL
            } else {
                libc::EPOLL_CTL_MOD
            };
            if let Err(err) = self.ctl(op, ctx.fd, left) {
                error!(fd, %err, "failed to re-arm fd after readiness");
                return;
            }
            state.disarm(real)
        };

        let count = fired.len();
        for ctx in fired {
            ctx.trigger(Readiness::Ready, scheduler);
        }
        self.pending.fetch_sub(count, Ordering::AcqRel);
    }
}

impl Driver for Reactor {
    fn tickle(&self) {
        self.tickler.notify();
    }

    fn idle(&self, scheduler: &Scheduler) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];

        loop {
            let next_timer = self.timers.next_timeout();
            if next_timer.is_none() && self.stopping(scheduler) {
                debug!(scheduler = %scheduler.name(), "reactor idle loop exiting");
                // wake the next worker so it sees the stop too
                self.tickler.notify();
                break;
            }

            let timeout_ms = self.wait_timeout_ms(next_timer);
            let ready = match self.epoll.wait(&mut events, timeout_ms) {
                Ok(ready) => ready,
                Err(err) => {
                    error!(scheduler = %scheduler.name(), %err, "epoll_wait failed");
                    0
                }
            };

            for cb in self.timers.take_expired() {
                scheduler.schedule_boxed(cb, None);
            }

            for event in &events[..ready] {
                self.dispatch(scheduler, *event);
            }

            Fiber::yield_to_hold();
        }
    }

    fn stopping(&self, scheduler: &Scheduler) -> bool {
        !self.timers.has_timer() && self.pending() == 0 && scheduler.queue_drained()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
