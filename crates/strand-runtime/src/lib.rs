//! Strand Runtime
//!
//! User-space concurrency runtime the strand servers are built on:
//! - Fibers (stackful, cooperatively scheduled execution contexts)
//! - Scheduler (N fibers over M OS threads, thread affinity, use_caller mode)
//! - IoManager (epoll reactor that resumes fibers on fd readiness)
//! - TimerManager (deadline-ordered callbacks driving the reactor's wait)
//! - WorkerManager (named IoManager groups built from configuration)

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(not(target_os = "linux"))]
compile_error!("strand-runtime requires Linux (epoll and eventfd)");

pub mod config;
mod context;
pub mod fiber;
pub mod io;
pub mod scheduler;
pub mod thread;
pub mod timer;
pub mod worker;

pub use config::{ConfigError, RuntimeConfig, TimerRebase};
pub use fiber::{Fiber, FiberId, FiberPool, FiberState};
pub use io::{Event, IoManager, Readiness};
pub use scheduler::{Scheduler, SchedulerStats};
pub use thread::Tid;
pub use timer::{Timer, TimerManager};
pub use worker::{WorkerGroup, WorkerManager};

/// Runtime errors surfaced to callers
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `epoll_create1` failed
    #[error("Failed to create epoll instance: {0}")]
    EpollCreate(#[source] std::io::Error),

    /// The tickle eventfd could not be created
    #[error("Failed to create tickle eventfd: {0}")]
    Tickle(#[source] std::io::Error),

    /// `epoll_ctl` rejected a registration
    #[error("epoll_ctl(op={op}, fd={fd}, events={events:#x}) failed: {source}")]
    Register {
        /// File descriptor being registered
        fd: i32,
        /// EPOLL_CTL_* operation
        op: i32,
        /// Requested epoll event mask
        events: u32,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// A worker thread could not be spawned
    #[error("Failed to spawn worker thread {name}: {source}")]
    Spawn {
        /// Thread name
        name: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// The operation parks the calling fiber but no fiber is running
    #[error("{0} must be called from inside a fiber")]
    NotInFiber(&'static str),

    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Runtime result
pub type Result<T> = std::result::Result<T, Error>;
