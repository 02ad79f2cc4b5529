/*
 * Reader/Writer Lock
 *
 * State: -1 writer, 0 open, >0 reader count. Writers have priority over
 * new readers: arriving readers park while any writer waits. Release
 * alternates between the two queues.
 *
 * Ownership is handed as a baton: the waker adjusts the state on behalf
 * of each fibre it unblocks, so a woken waiter holds the lock the moment
 * it wins the resume race, and barging between wake and wakeup is
 * impossible.
 */

use std::time::Duration;

use spin::Mutex as SpinMutex;

use crate::fibre::SpinPolicy;
use crate::sync::blocking_queue::BlockingQueue;
use crate::timer::Time;

pub struct RwLock {
    state: SpinMutex<isize>,
    readers: BlockingQueue,
    writers: BlockingQueue,
}

impl RwLock {
    pub const fn new() -> RwLock {
        RwLock {
            state: SpinMutex::new(0),
            readers: BlockingQueue::new(),
            writers: BlockingQueue::new(),
        }
    }

    fn acquire_read_internal(&self, deadline: Option<Time>, wait: bool) -> bool {
        let mut g = self.state.lock();
        if *g < 0 || !unsafe { self.writers.is_empty() } {
            if !wait {
                return false;
            }
            if !self.readers.block(&self.state, g, deadline, SpinPolicy::none()) {
                return false;
            }
            // The waker counted us in already; chain to the next reader.
            let mut g = self.state.lock();
            if let Some(_next) = unsafe { self.readers.unblock() } {
                *g += 1;
            }
            return true;
        }
        *g += 1;
        true
    }

    fn acquire_write_internal(&self, deadline: Option<Time>, wait: bool) -> bool {
        let mut g = self.state.lock();
        if *g != 0 || !unsafe { self.writers.is_empty() } {
            if !wait {
                return false;
            }
            // State is adjusted by the waker before we resume.
            return self.writers.block(&self.state, g, deadline, SpinPolicy::none());
        }
        *g = -1;
        true
    }

    pub fn lock_read(&self) {
        let ok = self.acquire_read_internal(None, true);
        debug_assert!(ok);
    }

    pub fn try_read(&self) -> bool {
        self.acquire_read_internal(None, false)
    }

    pub fn read_timeout(&self, timeout: Duration) -> bool {
        self.acquire_read_internal(Some(Time::now() + timeout), true)
    }

    pub fn lock_write(&self) {
        let ok = self.acquire_write_internal(None, true);
        debug_assert!(ok);
    }

    pub fn try_write(&self) -> bool {
        self.acquire_write_internal(None, false)
    }

    pub fn write_timeout(&self, timeout: Duration) -> bool {
        self.acquire_write_internal(Some(Time::now() + timeout), true)
    }

    pub fn unlock(&self) {
        let mut g = self.state.lock();
        assert!(*g != 0, "rwlock released while open");
        if *g > 0 {
            // Reader leaves.
            *g -= 1;
            if *g > 0 {
                return;
            }
            if unsafe { self.writers.unblock() }.is_some() {
                *g = -1;
            } else if unsafe { self.readers.unblock() }.is_some() {
                *g = 1;
            }
        } else {
            // Writer leaves; readers have the next turn.
            *g = 0;
            if unsafe { self.readers.unblock() }.is_some() {
                *g = 1;
            } else if unsafe { self.writers.unblock() }.is_some() {
                *g = -1;
            }
        }
    }
}

impl Default for RwLock {
    fn default() -> RwLock {
        RwLock::new()
    }
}
