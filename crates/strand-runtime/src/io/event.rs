//! Readiness bookkeeping per file descriptor

use crate::fiber::Fiber;
use crate::scheduler::{Scheduler, WeakScheduler};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::sync::Arc;

bitflags! {
    /// I/O interest of a registration (epoll bits)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Event: u32 {
        /// Readable (`EPOLLIN`)
        const READ = libc::EPOLLIN as u32;
        /// Writable (`EPOLLOUT`)
        const WRITE = libc::EPOLLOUT as u32;
    }
}

/// How a waiter was resumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The fd reported the event (or an error/hang-up)
    Ready,
    /// The registration was cancelled
    Cancelled,
}

/// Where a wake-up is reported by `wait_event`
pub(crate) type Outcome = Arc<Mutex<Option<Readiness>>>;

/// What to resume when the event fires
pub(crate) enum Waiter {
    /// Re-schedule a parked fiber
    Fiber {
        fiber: Arc<Fiber>,
        outcome: Option<Outcome>,
    },
    /// Schedule a callback
    Callback(Box<dyn FnOnce(Readiness) + Send + 'static>),
}

/// One registered event of one fd
pub(crate) struct EventContext {
    /// Scheduler current at registration time
    pub(crate) scheduler: Option<WeakScheduler>,
    pub(crate) waiter: Waiter,
}

impl EventContext {
    pub(crate) fn new(waiter: Waiter) -> Self {
        Self {
            scheduler: Scheduler::current().map(|scheduler| scheduler.downgrade()),
            waiter,
        }
    }

    /// Hand the waiter to its scheduler (or `fallback` if it is gone)
    pub(crate) fn trigger(self, readiness: Readiness, fallback: &Scheduler) {
        let scheduler = self
            .scheduler
            .as_ref()
            .and_then(WeakScheduler::upgrade)
            .unwrap_or_else(|| fallback.clone());

        match self.waiter {
            Waiter::Fiber { fiber, outcome } => {
                if let Some(outcome) = outcome {
                    *outcome.lock() = Some(readiness);
                }
                scheduler.schedule_fiber(fiber, None);
            }
            Waiter::Callback(cb) => {
                scheduler.schedule_boxed(Box::new(move || cb(readiness)), None);
            }
        }
    }
}

/// Registered events and waiters of a fd
#[derive(Default)]
pub(crate) struct FdState {
    pub(crate) events: Event,
    read: Option<EventContext>,
    write: Option<EventContext>,
}

impl FdState {
    fn slot(&mut self, event: Event) -> &mut Option<EventContext> {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            panic!("expected a single event, got {:?}", event)
        }
    }

    /// Record a registration for `event`
    pub(crate) fn arm(&mut self, event: Event, ctx: EventContext) {
        self.events |= event;
        *self.slot(event) = Some(ctx);
    }

    /// Remove the registrations in `events`, returning their contexts
    pub(crate) fn disarm(&mut self, events: Event) -> Vec<EventContext> {
        let mut taken = Vec::with_capacity(2);
        for event in [Event::READ, Event::WRITE] {
            if events.contains(event) && self.events.contains(event) {
                self.events.remove(event);
                if let Some(ctx) = self.slot(event).take() {
                    taken.push(ctx);
                }
            }
        }
        taken
    }
}

/// Per-fd record, created lazily and kept for the reactor's lifetime
pub(crate) struct FdContext {
    pub(crate) fd: RawFd,
    pub(crate) state: Mutex<FdState>,
}

impl FdContext {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: Mutex::new(FdState::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callback_context() -> EventContext {
        EventContext::new(Waiter::Callback(Box::new(|_| {})))
    }

    #[test]
    fn test_event_bits_match_epoll() {
        assert_eq!(Event::READ.bits(), 0x1);
        assert_eq!(Event::WRITE.bits(), 0x4);
        let hup = (libc::EPOLLIN | libc::EPOLLHUP) as u32;
        assert_eq!(Event::from_bits_truncate(hup), Event::READ);
    }

    #[test]
    fn test_arm_and_disarm() {
        let mut state = FdState::default();
        state.arm(Event::READ, callback_context());
        state.arm(Event::WRITE, callback_context());
        assert_eq!(state.events, Event::READ | Event::WRITE);

        assert_eq!(state.disarm(Event::WRITE).len(), 1);
        assert_eq!(state.events, Event::READ);
        assert!(state.disarm(Event::WRITE).is_empty());

        assert_eq!(state.disarm(Event::all()).len(), 1);
        assert!(state.events.is_empty());
    }

    #[test]
    #[should_panic(expected = "expected a single event")]
    fn test_arm_rejects_combined_events() {
        let mut state = FdState::default();
        state.arm(Event::READ | Event::WRITE, callback_context());
    }
}
