/*
 * Blocking Synchronization
 *
 * Fibre-level synchronization primitives. All of them are built from one
 * mechanism: a spin-locked piece of state plus a `BlockingQueue` of
 * stack-allocated wait nodes, with the suspend/resume race protocol
 * arbitrating between competing wakers (unblock vs. timeout).
 *
 * Everything here suspends fibres, never OS threads; the only OS-level
 * blocking in the runtime is the idle-worker halt semaphore and the
 * poller threads.
 */

pub(crate) mod wait_list;
pub(crate) mod blocking_queue;
pub mod sync_point;
pub mod semaphore;
pub mod mutex;
pub mod condition;
pub mod rwlock;
pub mod barrier;

pub use barrier::Barrier;
pub use condition::Condition;
pub use mutex::{Mutex, OwnerMutex};
pub use rwlock::RwLock;
pub use semaphore::{Semaphore, SemaphoreResult};
pub use sync_point::SyncPoint;
