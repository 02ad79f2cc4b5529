/*
 * Semaphore
 *
 * Counting (or binary) semaphore with baton passing: a V that finds a
 * waiter hands the permit straight through the blocking queue and leaves
 * the counter untouched; the woken waiter has consumed the permit by the
 * time it runs. This keeps `value + waiting` conserved across arbitrary
 * schedules.
 */

use std::sync::atomic::{AtomicIsize, Ordering};
use std::time::Duration;

use spin::Mutex as SpinMutex;

use crate::fibre::SpinPolicy;
use crate::sync::blocking_queue::BlockingQueue;
use crate::timer::Time;

/// Outcome of a P operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreResult {
    /// Timed wait expired before a permit arrived.
    Timeout,
    /// Blocked and was handed a permit by a V.
    Success,
    /// A permit was available; no blocking happened.
    WasOpen,
}

impl SemaphoreResult {
    pub fn acquired(self) -> bool {
        self != SemaphoreResult::Timeout
    }
}

pub struct Semaphore {
    counter: SpinMutex<isize>,
    bq: BlockingQueue,
    binary: bool,
    spin: SpinPolicy,
}

impl Semaphore {
    /// Counting semaphore with the given initial value.
    pub const fn new(initial: isize) -> Semaphore {
        Semaphore {
            counter: SpinMutex::new(initial),
            bq: BlockingQueue::new(),
            binary: false,
            spin: SpinPolicy::none(),
        }
    }

    /// Binary semaphore; V saturates the value at one.
    pub const fn binary(open: bool) -> Semaphore {
        Semaphore {
            counter: SpinMutex::new(if open { 1 } else { 0 }),
            bq: BlockingQueue::new(),
            binary: true,
            spin: SpinPolicy::none(),
        }
    }

    /// Spin briefly for an early V before parking.
    pub fn with_spin(mut self, spin: SpinPolicy) -> Semaphore {
        self.spin = spin;
        self
    }

    pub fn value(&self) -> isize {
        *self.counter.lock()
    }

    fn p_internal(&self, deadline: Option<Time>, wait: bool) -> SemaphoreResult {
        let guard = self.counter.lock();
        if *guard < 1 {
            if !wait {
                return SemaphoreResult::Timeout;
            }
            return if self.bq.block(&self.counter, guard, deadline, self.spin) {
                SemaphoreResult::Success
            } else {
                SemaphoreResult::Timeout
            };
        }
        let mut guard = guard;
        *guard -= 1;
        SemaphoreResult::WasOpen
    }

    /// Acquire a permit, blocking the fibre if none is available.
    pub fn p(&self) -> SemaphoreResult {
        self.p_internal(None, true)
    }

    /// Acquire without blocking.
    pub fn try_p(&self) -> bool {
        self.p_internal(None, false).acquired()
    }

    /// Acquire with a timeout.
    pub fn p_timeout(&self, timeout: Duration) -> SemaphoreResult {
        self.p_internal(Some(Time::now() + timeout), true)
    }

    /// Release a permit. A waiter, if present, is handed the permit
    /// directly (baton passing) and the counter stays untouched.
    pub fn v(&self) {
        let mut guard = self.counter.lock();
        if unsafe { self.bq.unblock() }.is_some() {
            return;
        }
        if self.binary {
            *guard = 1;
        } else {
            *guard += 1;
        }
    }

    /// Consume permits without blocking semantics (fork re-init path).
    pub(crate) fn reset(&self, value: isize) {
        let mut guard = self.counter.lock();
        assert!(unsafe { self.bq.is_empty() }, "semaphore reset with waiters");
        *guard = value;
    }
}

/// Atomic-counter fast path in front of a slower semaphore: P and V only
/// touch the inner semaphore when the counter says someone must block.
pub(crate) struct Benaphore {
    counter: AtomicIsize,
}

impl Benaphore {
    pub(crate) const fn new(initial: isize) -> Benaphore {
        Benaphore {
            counter: AtomicIsize::new(initial),
        }
    }

    /// True: acquired on the fast path. False: caller must P the backing
    /// semaphore.
    pub(crate) fn p(&self) -> bool {
        self.counter.fetch_sub(1, Ordering::SeqCst) - 1 >= 0
    }

    pub(crate) fn try_p(&self) -> bool {
        let mut c = self.counter.load(Ordering::SeqCst);
        while c >= 1 {
            match self.counter.compare_exchange(c, c - 1, Ordering::SeqCst, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(actual) => c = actual,
            }
        }
        false
    }

    /// True: nobody was blocked. False: caller must V the backing
    /// semaphore to hand the permit through.
    pub(crate) fn v(&self) -> bool {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1 >= 1
    }

    pub(crate) fn value(&self) -> isize {
        self.counter.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benaphore_counter_laws() {
        let b = Benaphore::new(1);
        assert!(b.p()); // 1 -> 0, fast
        assert!(!b.p()); // 0 -> -1, must block
        assert!(!b.v()); // -1 -> 0, must hand through
        assert!(b.v()); // 0 -> 1, nobody blocked
        assert_eq!(b.value(), 1);
    }

    #[test]
    fn benaphore_try_p_never_goes_negative() {
        let b = Benaphore::new(1);
        assert!(b.try_p());
        assert!(!b.try_p());
        assert_eq!(b.value(), 0);
    }
}
