/*!
 * Strand — an M:N user-level threading runtime.
 *
 * Many lightweight fibres, each with its own stack, are multiplexed over
 * a pool of OS worker threads. Scheduling is cooperative with work
 * stealing; synchronization primitives block fibres, not threads; and
 * blocking-style I/O wrappers park the calling fibre on epoll readiness
 * while the worker keeps running other fibres.
 *
 * Typical use:
 *
 * ```no_run
 * let scope = strand::bootstrap(1, 4);
 * let worker = strand::Fibre::spawn(|| {
 *     strand::sleep(std::time::Duration::from_millis(10));
 * });
 * worker.join();
 * let _ = scope;
 * ```
 *
 * Linux only (epoll, eventfd, timerfd); x86_64 and aarch64.
 */

#[cfg(all(feature = "eager-registration", feature = "oneshot-registration"))]
compile_error!("eager-registration and oneshot-registration are mutually exclusive");

mod config;
mod context;
mod event_scope;
mod fibre;
pub mod io;
mod sched;
mod stack;
pub mod sync;
mod timer;
mod utils;

pub use event_scope::{default_scope, EventScope};
pub use fibre::{
    current_id, migrate_to_cluster, preempt, sleep, yield_global, yield_now, Fibre, FibreBuilder,
    FibreId, Priority, SpinPolicy,
};
pub use sched::cluster::Cluster;
pub use sync::{Barrier, Condition, Mutex, OwnerMutex, RwLock, Semaphore, SemaphoreResult, SyncPoint};

/// Bootstrap the default event scope; the calling thread becomes the
/// first worker and the caller continues as the main fibre.
pub fn bootstrap(poller_count: usize, worker_count: usize) -> &'static EventScope {
    EventScope::bootstrap(poller_count, worker_count)
}
