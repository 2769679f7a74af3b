//! Deadline-ordered timers
//!
//! The reactor asks [`TimerManager::next_timeout`] how long it may sleep and
//! collects due work with [`TimerManager::take_expired`], once per iteration.
//! A timer that becomes the earliest deadline calls the manager's front hook
//! so a thread already blocked with a longer timeout re-evaluates it.

use crate::config::{self, TimerRebase};
use crate::fiber::Callback;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::trace;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Ordering key: deadline first, creation order breaks ties
type TimerKey = (Instant, u64);

struct TimerState {
    /// Armed timers, earliest first
    timers: BTreeMap<TimerKey, Arc<Timer>>,

    /// Front hook fired since the last `next_timeout`
    tickled: bool,
}

struct TimerShared {
    state: RwLock<TimerState>,
    on_front: Box<dyn Fn() + Send + Sync + 'static>,
    rebase: TimerRebase,
}

impl TimerShared {
    /// Insert and report whether the caller must fire the front hook
    fn insert(&self, state: &mut TimerState, timer: Arc<Timer>, next: Instant) -> bool {
        let key = (next, timer.id);
        state.timers.insert(key, timer);

        let at_front = state.timers.keys().next() == Some(&key);
        let notify = at_front && !state.tickled;
        if notify {
            state.tickled = true;
        }
        notify
    }
}

/// Registry of timers ordered by deadline
#[derive(Clone)]
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

/// Deadline and period of an armed timer
struct Schedule {
    interval: Duration,
    next: Instant,
}

/// A one-shot or recurring timer handle
pub struct Timer {
    id: u64,
    recurring: bool,

    /// Only changed under the manager's write lock
    schedule: Mutex<Schedule>,

    cancelled: AtomicBool,
    callback: TimerCallback,
    manager: Weak<TimerShared>,
}

impl TimerManager {
    /// Create a manager; `on_front` runs whenever a new timer becomes the
    /// earliest deadline (at most once between two `next_timeout` calls)
    pub fn new<F>(rebase: TimerRebase, on_front: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(TimerShared {
                state: RwLock::new(TimerState {
                    timers: BTreeMap::new(),
                    tickled: false,
                }),
                on_front: Box::new(on_front),
                rebase,
            }),
        }
    }

    /// Arm a timer firing `cb` after `delay` (and every `delay` if `recurring`)
    pub fn add_timer<F>(&self, delay: Duration, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let next = Instant::now() + delay;
        let timer = Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            recurring,
            schedule: Mutex::new(Schedule {
                interval: delay,
                next,
            }),
            cancelled: AtomicBool::new(false),
            callback: Arc::new(cb),
            manager: Arc::downgrade(&self.shared),
        });

        let notify = {
            let mut state = self.shared.state.write();
            self.shared.insert(&mut state, timer.clone(), next)
        };
        if notify {
            (self.shared.on_front)();
        }

        trace!(timer_id = timer.id, ?delay, recurring, "timer added");
        timer
    }

    /// Arm a timer that only fires while `condition` is still alive
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
        self.add_timer(
            delay,
            move || {
                if condition.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Time until the earliest deadline: None without timers, zero if overdue
    pub fn next_timeout(&self) -> Option<Duration> {
        let mut state = self.shared.state.write();
        state.tickled = false;

        let ((deadline, _), _) = state.timers.first_key_value()?;
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    /// Remove every due timer and return their callbacks in deadline order.
    ///
    /// Recurring timers are re-armed before this returns. A callback whose
    /// timer is cancelled before it runs does nothing.
    pub fn take_expired(&self) -> Vec<Callback> {
        let now = Instant::now();
        let mut state = self.shared.state.write();

        let due = match state.timers.first_key_value() {
            Some(((deadline, _), _)) => *deadline <= now,
            None => false,
        };
        if !due {
            return Vec::new();
        }

        let later = state.timers.split_off(&(now, u64::MAX));
        let expired = std::mem::replace(&mut state.timers, later);

        let mut callbacks: Vec<Callback> = Vec::with_capacity(expired.len());
        for ((deadline, _), timer) in expired {
            if timer.recurring && !timer.is_cancelled() {
                let next = {
                    let mut schedule = timer.schedule.lock();
                    schedule.next = next_deadline(self.shared.rebase, deadline, schedule.interval, now);
                    schedule.next
                };
                state.timers.insert((next, timer.id), timer.clone());
            }

            callbacks.push(Box::new(move || {
                if !timer.is_cancelled() {
                    (timer.callback)();
                }
            }));
        }

        trace!(expired = callbacks.len(), "timers expired");
        callbacks
    }

    /// Whether any timer is armed
    pub fn has_timer(&self) -> bool {
        !self.shared.state.read().timers.is_empty()
    }

    /// Armed timers
    pub fn len(&self) -> usize {
        self.shared.state.read().timers.len()
    }

    /// True if no timer is armed
    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }

    /// Rebase mode of recurring timers
    pub fn rebase(&self) -> TimerRebase {
        self.shared.rebase
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new(config::current().timer.rebase, || {})
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("timers", &self.len())
            .field("rebase", &self.shared.rebase)
            .finish()
    }
}

fn next_deadline(rebase: TimerRebase, deadline: Instant, interval: Duration, now: Instant) -> Instant {
    match rebase {
        TimerRebase::Now => now + interval,
        TimerRebase::Schedule => {
            if interval.is_zero() {
                return now;
            }
            let next = deadline + interval;
            if next > now {
                return next;
            }
            // skip the periods that were missed entirely
            let missed = (now - deadline).as_nanos() / interval.as_nanos();
            u32::try_from(missed + 1)
                .ok()
                .and_then(|periods| interval.checked_mul(periods))
                .map_or(now + interval, |step| deadline + step)
        }
    }
}

impl Timer {
    /// Unique timer id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the timer re-arms after firing
    pub fn is_recurring(&self) -> bool {
        self.recurring
    }

    /// Current period / delay
    pub fn interval(&self) -> Duration {
        self.schedule.lock().interval
    }

    /// Whether `cancel` was called
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Disarm the timer. A callback already collected by the reactor but not
    /// yet run is skipped. Returns whether the timer was still armed.
    pub fn cancel(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            self.cancelled.store(true, Ordering::Release);
            return false;
        };

        let mut state = manager.state.write();
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let next = self.schedule.lock().next;
        state.timers.remove(&(next, self.id)).is_some()
    }

    /// Re-arm at `now + interval`. Returns false if the timer is no longer armed.
    pub fn refresh(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };

        let mut state = manager.state.write();
        if self.is_cancelled() {
            return false;
        }

        let mut schedule = self.schedule.lock();
        let Some(timer) = state.timers.remove(&(schedule.next, self.id)) else {
            return false;
        };
        schedule.next = Instant::now() + schedule.interval;
        let next = schedule.next;
        drop(schedule);

        // moved later, never becomes a new front
        state.timers.insert((next, self.id), timer);
        true
    }

    /// Change the delay to `delay`, counted from now (`from_now`) or from the
    /// timer's original start. Returns false if the timer is no longer armed.
    pub fn reset(&self, delay: Duration, from_now: bool) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };

        let notify = {
            let mut state = manager.state.write();
            if self.is_cancelled() {
                return false;
            }

            let mut schedule = self.schedule.lock();
            if delay == schedule.interval && !from_now {
                return state.timers.contains_key(&(schedule.next, self.id));
            }
            let Some(timer) = state.timers.remove(&(schedule.next, self.id)) else {
                return false;
            };

            let start = if from_now {
                Instant::now()
            } else {
                schedule.next.checked_sub(schedule.interval).unwrap_or(schedule.next)
            };
            schedule.interval = delay;
            schedule.next = start + delay;
            let next = schedule.next;
            drop(schedule);

            manager.insert(&mut state, timer, next)
        };
        if notify {
            (manager.on_front)();
        }
        true
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("recurring", &self.recurring)
            .field("interval", &self.interval())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;

    fn manager() -> TimerManager {
        TimerManager::new(TimerRebase::Now, || {})
    }

    fn run_all(callbacks: Vec<Callback>) -> usize {
        let count = callbacks.len();
        for cb in callbacks {
            cb();
        }
        count
    }

    #[test]
    fn test_next_timeout() {
        let timers = manager();
        assert_eq!(timers.next_timeout(), None);

        timers.add_timer(Duration::from_millis(500), || {}, false);
        timers.add_timer(Duration::from_millis(50), || {}, false);

        let timeout = timers.next_timeout().unwrap();
        assert!(timeout <= Duration::from_millis(50));
        assert!(timeout > Duration::from_millis(0));
        assert_eq!(timers.len(), 2);
    }

    #[test]
    fn test_take_expired_in_deadline_order() {
        let timers = manager();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in [(20, 'b'), (10, 'a'), (200, 'z'), (30, 'c')] {
            let order = order.clone();
            timers.add_timer(
                Duration::from_millis(delay),
                move || order.lock().push(tag),
                false,
            );
        }

        assert!(timers.take_expired().is_empty());
        sleep(Duration::from_millis(40));
        assert_eq!(run_all(timers.take_expired()), 3);
        assert_eq!(*order.lock(), vec!['a', 'b', 'c']);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_cancel() {
        let timers = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = timers.add_timer(
            Duration::from_millis(5),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(timer.is_cancelled());
        assert!(!timers.has_timer());

        sleep(Duration::from_millis(10));
        assert_eq!(run_all(timers.take_expired()), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_after_collection_skips_callback() {
        let timers = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = timers.add_timer(
            Duration::ZERO,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );

        let callbacks = timers.take_expired();
        assert_eq!(callbacks.len(), 1);
        assert!(timer.cancel());
        run_all(callbacks);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recurring_timer_rearms() {
        let timers = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = timers.add_timer(
            Duration::from_millis(5),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );

        for _ in 0..3 {
            sleep(Duration::from_millis(6));
            run_all(timers.take_expired());
        }

        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(timers.has_timer());
        assert!(timer.cancel());
        assert!(!timers.has_timer());
    }

    #[test]
    fn test_one_shot_is_consumed() {
        let timers = manager();
        let timer = timers.add_timer(Duration::ZERO, || {}, false);

        assert_eq!(run_all(timers.take_expired()), 1);
        assert!(!timers.has_timer());
        assert!(!timer.refresh());
        assert!(!timer.reset(Duration::from_millis(5), true));
        assert!(!timer.cancel());
    }

    #[test]
    fn test_refresh_pushes_deadline() {
        let timers = manager();
        let timer = timers.add_timer(Duration::from_millis(30), || {}, false);

        sleep(Duration::from_millis(20));
        assert!(timer.refresh());
        let timeout = timers.next_timeout().unwrap();
        assert!(timeout > Duration::from_millis(20));
    }

    #[test]
    fn test_reset_changes_delay() {
        let timers = manager();
        let timer = timers.add_timer(Duration::from_secs(10), || {}, false);

        assert!(timer.reset(Duration::from_millis(5), true));
        assert_eq!(timer.interval(), Duration::from_millis(5));
        assert!(timers.next_timeout().unwrap() <= Duration::from_millis(5));

        // same delay from the original start is a no-op
        assert!(timer.reset(Duration::from_millis(5), false));
        sleep(Duration::from_millis(6));
        assert_eq!(run_all(timers.take_expired()), 1);
    }

    #[test]
    fn test_front_hook_debounced() {
        let hooks = Arc::new(AtomicUsize::new(0));
        let counter = hooks.clone();
        let timers = TimerManager::new(TimerRebase::Now, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        timers.add_timer(Duration::from_secs(10), || {}, false);
        assert_eq!(hooks.load(Ordering::SeqCst), 1);

        // new front, but not yet observed by next_timeout
        timers.add_timer(Duration::from_secs(5), || {}, false);
        assert_eq!(hooks.load(Ordering::SeqCst), 1);

        timers.next_timeout();
        timers.add_timer(Duration::from_secs(1), || {}, false);
        assert_eq!(hooks.load(Ordering::SeqCst), 2);

        // not at the front
        timers.next_timeout();
        timers.add_timer(Duration::from_secs(20), || {}, false);
        assert_eq!(hooks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_condition_timer() {
        let timers = manager();
        let fired = Arc::new(AtomicUsize::new(0));

        let alive = Arc::new(());
        let counter = fired.clone();
        timers.add_condition_timer(
            Duration::ZERO,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&alive),
            false,
        );

        let gone = Arc::new(());
        let counter = fired.clone();
        timers.add_condition_timer(
            Duration::ZERO,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&gone),
            false,
        );
        drop(gone);

        run_all(timers.take_expired());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_next_deadline_rebase() {
        let start = Instant::now();
        let interval = Duration::from_millis(10);
        let deadline = start + interval;

        // swept 3ms late
        let now = deadline + Duration::from_millis(3);
        assert_eq!(
            next_deadline(TimerRebase::Now, deadline, interval, now),
            now + interval
        );
        assert_eq!(
            next_deadline(TimerRebase::Schedule, deadline, interval, now),
            deadline + interval
        );

        // swept 25ms late: two periods missed
        let now = deadline + Duration::from_millis(25);
        assert_eq!(
            next_deadline(TimerRebase::Schedule, deadline, interval, now),
            deadline + Duration::from_millis(30)
        );
    }

    #[test]
    fn test_manager_dropped_before_timer() {
        let timers = manager();
        let timer = timers.add_timer(Duration::from_secs(1), || {}, false);
        drop(timers);

        assert!(!timer.cancel());
        assert!(!timer.refresh());
        assert!(timer.is_cancelled());
    }
}
