/*
 * Descriptor Registry
 *
 * Fixed-size table indexed by file descriptor, sized from RLIMIT_NOFILE
 * at scope initialization. Each entry carries the read- and write-side
 * binary semaphores the wrappers park on, the per-side serialization
 * mutexes, the user-visible non-blocking flag, and the registration
 * bookkeeping for the lazy/one-shot policies. There is no global
 * descriptor lock.
 */

use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(not(feature = "oneshot-registration"))]
use spin::Mutex as SpinMutex;

#[cfg(not(feature = "oneshot-registration"))]
use crate::io::poller::{ClusterPoller, PollFlags};
use crate::io::Side;
use crate::sync::mutex::FastMutex;
use crate::sync::semaphore::Semaphore;

/// Per-descriptor registration state (lazy and eager policies).
#[cfg(not(feature = "oneshot-registration"))]
pub(crate) struct RegState {
    pub(crate) bits: PollFlags,
    pub(crate) poller: Option<&'static ClusterPoller>,
}

pub(crate) struct FdEntry {
    rd_sem: Semaphore,
    wr_sem: Semaphore,
    rd_mutex: FastMutex,
    wr_mutex: FastMutex,
    nonblocking: AtomicBool,
    #[cfg(not(feature = "oneshot-registration"))]
    pub(crate) reg: SpinMutex<RegState>,
    #[cfg(feature = "oneshot-registration")]
    pub(crate) poll_mod: AtomicBool,
}

impl FdEntry {
    fn new() -> FdEntry {
        FdEntry {
            rd_sem: Semaphore::binary(false),
            wr_sem: Semaphore::binary(false),
            rd_mutex: FastMutex::new(),
            wr_mutex: FastMutex::new(),
            nonblocking: AtomicBool::new(false),
            #[cfg(not(feature = "oneshot-registration"))]
            reg: SpinMutex::new(RegState {
                bits: PollFlags::empty(),
                poller: None,
            }),
            #[cfg(feature = "oneshot-registration")]
            poll_mod: AtomicBool::new(false),
        }
    }

    fn init(&mut self) {
        self.rd_mutex.init();
        self.wr_mutex.init();
    }

    pub(crate) fn sem(&self, side: Side) -> &Semaphore {
        match side {
            Side::Input => &self.rd_sem,
            Side::Output => &self.wr_sem,
        }
    }

    pub(crate) fn serial_mutex(&self, side: Side) -> &FastMutex {
        match side {
            Side::Input => &self.rd_mutex,
            Side::Output => &self.wr_mutex,
        }
    }

    pub(crate) fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Relaxed)
    }

    pub(crate) fn set_nonblocking(&self, nb: bool) {
        self.nonblocking.store(nb, Ordering::Relaxed);
    }

    pub(crate) fn sem_value(&self, side: Side) -> isize {
        self.sem(side).value()
    }

    /// Reset on close; asserts no fibre is still parked here.
    pub(crate) fn reset(&self) {
        self.rd_sem.reset(0);
        self.wr_sem.reset(0);
        self.nonblocking.store(false, Ordering::Relaxed);
        #[cfg(not(feature = "oneshot-registration"))]
        {
            let mut reg = self.reg.lock();
            reg.bits = PollFlags::empty();
            reg.poller = None;
        }
        #[cfg(feature = "oneshot-registration")]
        self.poll_mod.store(false, Ordering::Relaxed);
    }
}

pub(crate) struct FdRegistry {
    entries: Vec<FdEntry>,
}

impl FdRegistry {
    /// Build the table with `count` slots. Entries are finalized in place
    /// after the vector stops moving (the fast mutexes carry resident
    /// queue nodes).
    pub(crate) fn new(count: usize) -> FdRegistry {
        let mut entries = Vec::with_capacity(count);
        entries.resize_with(count, FdEntry::new);
        for e in entries.iter_mut() {
            e.init();
        }
        FdRegistry { entries }
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entry(&self, fd: libc::c_int) -> Option<&FdEntry> {
        if fd < 0 {
            return None;
        }
        self.entries.get(fd as usize)
    }
}
