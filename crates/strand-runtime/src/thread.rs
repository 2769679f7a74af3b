//! OS thread identity

use std::cell::Cell;

/// Kernel thread id (`gettid`)
pub type Tid = i32;

thread_local! {
    static TID: Cell<Tid> = const { Cell::new(0) };
}

/// Kernel id of the calling thread, cached after the first call
#[inline(never)]
pub fn current_tid() -> Tid {
    TID.with(|cached| {
        let tid = cached.get();
        if tid != 0 {
            return tid;
        }
        // SAFETY: gettid has no preconditions and cannot fail.
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as Tid;
        cached.set(tid);
        tid
    })
}
