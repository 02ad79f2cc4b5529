/*
 * Mutexes
 *
 * `Mutex` is the general fibre mutex: an owner slot plus a blocking
 * queue, in barging or FIFO flavour. FIFO release passes the owner slot
 * directly to the head waiter (no barging); barging release clears the
 * slot and lets the woken waiter re-contend. An optional spin policy
 * bounds busy attempts before parking (barging only; spinning would break
 * FIFO ordering).
 *
 * `FastMutex` is the runtime-internal short-hold mutex used by the
 * descriptor registry: an atomic counter fast path with an MPSC parking
 * queue behind it.
 *
 * `OwnerMutex` adds acquisition counting and optional recursion on top.
 */

use std::cell::UnsafeCell;
use std::ptr;
use std::time::Duration;

use spin::Mutex as SpinMutex;

use crate::context;
use crate::fibre::{Fred, SpinPolicy};
use crate::sched::queues::StubQueue;
use crate::sync::blocking_queue::BlockingQueue;
use crate::timer::Time;

struct Owner(*mut Fred);

unsafe impl Send for Owner {}

pub struct Mutex {
    state: SpinMutex<Owner>,
    bq: BlockingQueue,
    fifo: bool,
    spin: SpinPolicy,
}

impl Mutex {
    /// Barging mutex: released ownership is up for grabs.
    pub const fn new() -> Mutex {
        Mutex {
            state: SpinMutex::new(Owner(ptr::null_mut())),
            bq: BlockingQueue::new(),
            fifo: false,
            spin: SpinPolicy::none(),
        }
    }

    /// FIFO mutex: release hands the lock to the head waiter.
    pub const fn new_fifo() -> Mutex {
        Mutex {
            state: SpinMutex::new(Owner(ptr::null_mut())),
            bq: BlockingQueue::new(),
            fifo: true,
            spin: SpinPolicy::none(),
        }
    }

    /// Busy-try attempts before parking; ignored for the FIFO variant.
    pub fn with_spin(mut self, spin: SpinPolicy) -> Mutex {
        self.spin = spin;
        self
    }

    pub(crate) fn acquire_internal(
        &self,
        deadline: Option<Time>,
        wait: bool,
        owner_ok: bool,
    ) -> bool {
        let cs = context::curr_fred();
        if !self.fifo && wait && self.spin.count > 0 {
            let mut round = 0;
            let mut backoff = self.spin.start.max(1);
            while round < self.spin.count {
                if self.try_claim(cs, owner_ok) {
                    return true;
                }
                for _ in 0..backoff {
                    std::hint::spin_loop();
                }
                if backoff < self.spin.end {
                    backoff += backoff;
                } else {
                    round += 1;
                }
            }
        }
        loop {
            let mut g = self.state.lock();
            if g.0.is_null() {
                g.0 = cs;
                return true;
            }
            if owner_ok && g.0 == cs {
                return true;
            }
            assert!(g.0 != cs, "mutex relocked by its owner");
            if !wait {
                return false;
            }
            if !self.bq.block(&self.state, g, deadline, self.spin) {
                return false; // timeout
            }
            if self.fifo {
                return true; // owner slot was handed to us on release
            }
        }
    }

    fn try_claim(&self, cs: *mut Fred, owner_ok: bool) -> bool {
        let mut g = self.state.lock();
        if g.0.is_null() {
            g.0 = cs;
            true
        } else {
            owner_ok && g.0 == cs
        }
    }

    pub fn lock(&self) {
        let ok = self.acquire_internal(None, true, false);
        debug_assert!(ok);
    }

    pub fn try_lock(&self) -> bool {
        self.acquire_internal(None, false, false)
    }

    pub fn lock_timeout(&self, timeout: Duration) -> bool {
        self.acquire_internal(Some(Time::now() + timeout), true, false)
    }

    pub fn unlock(&self) {
        let cs = context::curr_fred();
        let mut g = self.state.lock();
        assert!(g.0 == cs, "mutex released by a non-owner");
        if self.fifo {
            g.0 = match unsafe { self.bq.unblock() } {
                Some(fred) => fred.as_ptr(),
                None => ptr::null_mut(),
            };
        } else {
            g.0 = ptr::null_mut();
            unsafe { self.bq.unblock() };
        }
    }

    /// Run a closure under the mutex.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let r = f();
        self.unlock();
        r
    }

    pub(crate) fn holds(&self) -> bool {
        self.state.lock().0 == context::curr_fred()
    }
}

impl Default for Mutex {
    fn default() -> Mutex {
        Mutex::new()
    }
}

/// Internal short-hold mutex: atomic fast path, MPSC park queue slow
/// path. Must be `init`ed in place before use (the park queue carries a
/// resident stub node).
pub(crate) struct FastMutex {
    ben: crate::sync::semaphore::Benaphore,
    waiters: StubQueue,
}

impl FastMutex {
    pub(crate) const fn new() -> FastMutex {
        FastMutex {
            ben: crate::sync::semaphore::Benaphore::new(1),
            waiters: StubQueue::new(),
        }
    }

    pub(crate) fn init(&mut self) {
        self.waiters.init();
    }

    pub(crate) fn lock(&self) {
        if self.ben.p() {
            return;
        }
        let cs = unsafe { &*context::curr_fred() };
        self.waiters.push(cs.as_link());
        cs.suspend(SpinPolicy::none());
    }

    pub(crate) fn try_lock(&self) -> bool {
        self.ben.try_p()
    }

    pub(crate) fn unlock(&self) {
        if self.ben.v() {
            return;
        }
        // A waiter has committed to parking; its push may still be in
        // flight.
        loop {
            if let Some(link) = unsafe { self.waiters.pop() } {
                unsafe { Fred::from_link(link).as_ref() }.resume();
                return;
            }
            std::hint::spin_loop();
        }
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let r = f();
        self.unlock();
        r
    }
}

/// Counting (optionally recursive) wrapper. `acquire` returns the new
/// depth, zero on timeout; `release` returns the remaining depth.
pub struct OwnerMutex {
    base: Mutex,
    depth: UnsafeCell<usize>,
    recursion: bool,
}

unsafe impl Send for OwnerMutex {}
unsafe impl Sync for OwnerMutex {}

impl OwnerMutex {
    pub const fn new(recursion: bool) -> OwnerMutex {
        OwnerMutex {
            base: Mutex::new(),
            depth: UnsafeCell::new(0),
            recursion,
        }
    }

    pub fn acquire(&self) -> usize {
        if self.base.acquire_internal(None, true, self.recursion) {
            unsafe {
                *self.depth.get() += 1;
                *self.depth.get()
            }
        } else {
            0
        }
    }

    pub fn try_acquire(&self) -> usize {
        if self.base.acquire_internal(None, false, self.recursion) {
            unsafe {
                *self.depth.get() += 1;
                *self.depth.get()
            }
        } else {
            0
        }
    }

    pub fn release(&self) -> usize {
        unsafe {
            debug_assert!(self.base.holds(), "owner mutex released by non-owner");
            *self.depth.get() -= 1;
            let left = *self.depth.get();
            if left == 0 {
                self.base.unlock();
            }
            left
        }
    }
}
