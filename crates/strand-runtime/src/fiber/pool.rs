//! Fiber pool for reusing fiber stacks across callbacks.
//!
//! When a callback fiber finishes, the fiber (and the stack mapped for it) is
//! returned to the pool. The next scheduled callback acquires the recycled
//! fiber and re-arms it with `reset`, skipping a fresh stack allocation.

use super::{Callback, Fiber};
use parking_lot::Mutex;
use std::sync::Arc;

/// Pool of reusable, finished fibers sharing one stack size
pub struct FiberPool {
    fibers: Mutex<Vec<Arc<Fiber>>>,
    max_size: usize,
    stack_size: usize,
}

impl FiberPool {
    /// Create a pool that holds up to `max_size` fibers of `stack_size` bytes
    pub fn new(max_size: usize, stack_size: usize) -> Self {
        Self {
            fibers: Mutex::new(Vec::with_capacity(max_size.min(64))),
            max_size,
            stack_size,
        }
    }

    /// Get a fiber armed with `cb`, recycled if one is available
    pub fn acquire<F>(&self, cb: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        self.acquire_boxed(Box::new(cb))
    }

    pub(crate) fn acquire_boxed(&self, cb: Callback) -> Arc<Fiber> {
        let recycled = self.fibers.lock().pop();
        match recycled {
            Some(fiber) => {
                fiber.rearm(Some(cb));
                fiber
            }
            None => Fiber::spawn(Some(cb), self.stack_size),
        }
    }

    /// Return a finished fiber for reuse.
    ///
    /// Returns false (and lets the fiber drop) when it is still referenced
    /// elsewhere, not finished, of another stack size, or the pool is full.
    pub fn release(&self, fiber: Arc<Fiber>) -> bool {
        if fiber.is_root()
            || !fiber.state().is_resettable()
            || fiber.stack_size() != self.stack_size
            || Arc::strong_count(&fiber) != 1
        {
            return false;
        }

        fiber.rearm(None);
        let mut pool = self.fibers.lock();
        if pool.len() < self.max_size {
            pool.push(fiber);
            true
        } else {
            false
        }
    }

    /// Fibers currently pooled
    pub fn len(&self) -> usize {
        self.fibers.lock().len()
    }

    /// True if no fiber is pooled
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stack size of pooled fibers
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }
}
