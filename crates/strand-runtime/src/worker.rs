//! Named worker pools
//!
//! A [`WorkerManager`] owns groups of IoManagers keyed by name, usually built
//! from the `[workers.<name>]` sections of the runtime config. Code that wants
//! to offload work asks for a group by name and gets one of its IoManagers in
//! round-robin order.
//!
//! A [`WorkerGroup`] caps how many callbacks one producer keeps in flight on a
//! scheduler and lets it wait for all of them.

use crate::config::{self, WorkerSpec};
use crate::io::IoManager;
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::thread::Tid;
use crate::Result;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Registry of named IoManager groups
pub struct WorkerManager {
    groups: RwLock<FxHashMap<String, Vec<IoManager>>>,
    next: AtomicUsize,
    stopped: AtomicBool,
}

static GLOBAL: Lazy<WorkerManager> = Lazy::new(WorkerManager::new);

impl WorkerManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(FxHashMap::default()),
            next: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Process-wide manager
    pub fn global() -> &'static WorkerManager {
        &GLOBAL
    }

    /// Add an IoManager to the group `name`
    pub fn add(&self, name: &str, io: IoManager) {
        self.groups
            .write()
            .entry(name.to_string())
            .or_default()
            .push(io);
    }

    /// Build one group per entry: `worker_num` IoManagers of `thread_num`
    /// threads each, named `name`, `name-1`, `name-2`, ...
    pub fn init(&self, workers: &BTreeMap<String, WorkerSpec>) -> Result<()> {
        for (name, spec) in workers {
            for x in 0..spec.worker_num {
                let instance = if x == 0 {
                    name.clone()
                } else {
                    format!("{}-{}", name, x)
                };
                let io = IoManager::new(spec.thread_num, false, &instance)?;
                self.add(name, io);
            }
            info!(
                group = %name,
                thread_num = spec.thread_num,
                worker_num = spec.worker_num,
                "worker group created"
            );
        }

        let empty = self.groups.read().is_empty();
        self.stopped.store(empty, Ordering::Release);
        Ok(())
    }

    /// Build groups from the installed runtime config
    pub fn init_from_config(&self) -> Result<()> {
        self.init(&config::current().workers)
    }

    /// One IoManager of group `name`, round-robin
    pub fn get(&self, name: &str) -> Option<IoManager> {
        let groups = self.groups.read();
        let group = groups.get(name)?;
        match group.len() {
            0 => None,
            1 => Some(group[0].clone()),
            len => {
                let index = self.next.fetch_add(1, Ordering::Relaxed) % len;
                Some(group[index].clone())
            }
        }
    }

    /// Schedule `cb` on group `name`; false (and an error log) if it doesn't exist
    pub fn schedule<F>(&self, name: &str, cb: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_on(name, cb, None)
    }

    /// Schedule `cb` on group `name`, pinned to `thread` when given
    pub fn schedule_on<F>(&self, name: &str, cb: F, thread: Option<Tid>) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.get(name) {
            Some(io) => {
                io.schedule_on(cb, thread);
                true
            }
            None => {
                error!(group = %name, "schedule: worker group does not exist");
                false
            }
        }
    }

    /// Schedule several callbacks on one IoManager of group `name`
    pub fn schedule_batch<I, F>(&self, name: &str, tasks: I) -> bool
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        match self.get(name) {
            Some(io) => {
                io.schedule_batch(tasks);
                true
            }
            None => {
                error!(group = %name, "schedule_batch: worker group does not exist");
                false
            }
        }
    }

    /// Stop every IoManager and forget all groups. A second call does nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let groups = std::mem::take(&mut *self.groups.write());
        for (name, group) in groups {
            for io in group {
                io.stop();
            }
            info!(group = %name, "worker group stopped");
        }
    }

    /// Whether `stop` ran (or `init` found nothing to build)
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Number of groups
    pub fn count(&self) -> usize {
        self.groups.read().len()
    }

    /// Stats of every IoManager, grouped by name
    pub fn stats(&self) -> BTreeMap<String, Vec<SchedulerStats>> {
        self.groups
            .read()
            .iter()
            .map(|(name, group)| {
                let stats: Vec<_> = group.iter().map(|io| io.stats()).collect();
                (name.clone(), stats)
            })
            .collect()
    }
}

impl Default for WorkerManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// WorkerGroup
// ============================================================================

/// Counting semaphore
struct Permits {
    available: Mutex<usize>,
    released: Condvar,
}

impl Permits {
    fn acquire(&self) {
        let mut available = self.available.lock();
        while *available == 0 {
            self.released.wait(&mut available);
        }
        *available -= 1;
    }

    fn release(&self) {
        *self.available.lock() += 1;
        self.released.notify_all();
    }

    fn wait_for(&self, count: usize) {
        let mut available = self.available.lock();
        while *available < count {
            self.released.wait(&mut available);
        }
    }
}

/// Returns a permit when the callback finishes, even by panic
struct PermitGuard(Arc<Permits>);

impl Drop for PermitGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// At most `batch_size` callbacks in flight on one scheduler.
///
/// `schedule` blocks the calling OS thread while the batch is full, so it
/// must not be called from a fiber of the same scheduler. Dropping the group
/// waits for everything it scheduled.
pub struct WorkerGroup {
    batch_size: usize,
    permits: Arc<Permits>,
    scheduler: Scheduler,
}

impl WorkerGroup {
    /// Create a group admitting `batch_size` callbacks at a time onto `scheduler`
    pub fn new(batch_size: usize, scheduler: Scheduler) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            permits: Arc::new(Permits {
                available: Mutex::new(batch_size),
                released: Condvar::new(),
            }),
            scheduler,
        }
    }

    /// Schedule `cb`, waiting for a free slot first
    pub fn schedule<F>(&self, cb: F, thread: Option<Tid>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.permits.acquire();
        let guard = PermitGuard(self.permits.clone());
        self.scheduler.schedule_on(
            move || {
                let _guard = guard;
                cb();
            },
            thread,
        );
    }

    /// Block until every scheduled callback has finished
    pub fn wait_all(&self) {
        self.permits.wait_for(self.batch_size);
    }

    /// Callbacks currently in flight
    pub fn in_flight(&self) -> usize {
        self.batch_size - *self.permits.available.lock()
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        self.wait_all();
    }
}
