/*
 * Worker
 *
 * One OS thread bound to a ready queue and an idle-loop fibre. The idle
 * loop asks the load manager for work, falls back to the local/stage/
 * steal selector, and parks on the halt semaphore when the cluster has
 * nothing runnable. A producer that wakes a parked worker passes the
 * fibre through the handover slot so it never touches a queue.
 *
 * The staging pseudo-worker is a Worker without a thread: its ready queue
 * holds fibres not pinned to any worker, drained by `try_stage`.
 */

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex as StdMutex};

use crate::fibre::{self, Fred};
use crate::sched::cluster::Cluster;
use crate::sched::ready_queue::ReadyQueue;

/// Counting semaphore at the OS level; parks the worker *thread*.
pub(crate) struct OsSemaphore {
    count: StdMutex<isize>,
    cond: Condvar,
}

impl OsSemaphore {
    pub(crate) fn new(initial: isize) -> OsSemaphore {
        OsSemaphore {
            count: StdMutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn p(&self) {
        let mut c = self.count.lock().expect("halt semaphore poisoned");
        while *c < 1 {
            c = self.cond.wait(c).expect("halt semaphore poisoned");
        }
        *c -= 1;
    }

    pub(crate) fn v(&self) {
        let mut c = self.count.lock().expect("halt semaphore poisoned");
        *c += 1;
        self.cond.notify_one();
    }
}

pub struct Worker {
    ready: ReadyQueue,
    cluster: &'static Cluster,
    idle_fred: AtomicPtr<Fred>,
    halt: OsSemaphore,
    handover: AtomicPtr<Fred>,
    ring_slot: AtomicUsize,
    sys_tid: AtomicUsize,
}

unsafe impl Send for Worker {}
unsafe impl Sync for Worker {}

impl Worker {
    /// Leaked allocation: workers live for the process.
    pub(crate) fn new_leaked(cluster: &'static Cluster) -> &'static Worker {
        let mut w = Box::new(Worker {
            ready: ReadyQueue::new(),
            cluster,
            idle_fred: AtomicPtr::new(ptr::null_mut()),
            halt: OsSemaphore::new(0),
            handover: AtomicPtr::new(ptr::null_mut()),
            ring_slot: AtomicUsize::new(usize::MAX),
            sys_tid: AtomicUsize::new(0),
        });
        w.ready.init();
        Box::leak(w)
    }

    pub(crate) fn set_ring_slot(&self, slot: usize) {
        self.ring_slot.store(slot, Ordering::Relaxed);
    }

    pub(crate) fn ring_slot(&self) -> usize {
        self.ring_slot.load(Ordering::Relaxed)
    }

    pub(crate) fn record_sys_tid(&self) {
        self.sys_tid
            .store(unsafe { libc::pthread_self() } as usize, Ordering::Relaxed);
    }

    pub(crate) fn sys_tid(&self) -> libc::pthread_t {
        self.sys_tid.load(Ordering::Relaxed) as libc::pthread_t
    }

    pub(crate) fn set_idle_fred(&self, fred: &Fred) {
        self.idle_fred
            .store(fred as *const Fred as *mut Fred, Ordering::Release);
    }

    fn idle_fred(&self) -> NonNull<Fred> {
        NonNull::new(self.idle_fred.load(Ordering::Acquire)).expect("worker has no idle fibre")
    }

    pub(crate) fn idle_fred_raw(&self) -> *mut Fred {
        self.idle_fred.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // enqueue side
    // ------------------------------------------------------------------

    /// Queue without load-manager involvement (yield path).
    pub(crate) fn enqueue_direct(&self, fred: NonNull<Fred>) {
        log::debug!(target: "scheduling", "fibre {:p} queued on {:p}", fred.as_ptr(), self);
        self.ready.enqueue(fred);
    }

    /// Queue through the load manager (resume path): a parked worker may
    /// take the fibre instead.
    pub(crate) fn enqueue_resume(&self, fred: NonNull<Fred>) {
        if !self.cluster.load_manager().add_ready(fred) {
            self.enqueue_direct(fred);
        }
    }

    pub(crate) fn try_dequeue(&self) -> Option<NonNull<Fred>> {
        self.ready.try_dequeue()
    }

    // ------------------------------------------------------------------
    // selector
    // ------------------------------------------------------------------

    fn try_local(&self) -> Option<NonNull<Fred>> {
        self.ready.dequeue()
    }

    fn try_stage(&'static self) -> Option<NonNull<Fred>> {
        let fred = self.cluster.stage()?;
        if !unsafe { fred.as_ref() }.affinity() {
            // Adopted: future resumes land here.
            unsafe { fred.as_ref() }.change_worker(self);
        }
        log::debug!(target: "scheduling", "staged {:p} -> {:p}", fred.as_ptr(), self);
        Some(fred)
    }

    fn try_steal(&'static self) -> Option<NonNull<Fred>> {
        self.cluster.steal_for(self)
    }

    pub(crate) fn schedule_internal(&'static self) -> Option<NonNull<Fred>> {
        self.try_local()
            .or_else(|| self.try_stage())
            .or_else(|| self.try_steal())
    }

    // ------------------------------------------------------------------
    // scheduling decisions
    // ------------------------------------------------------------------

    /// Next fibre for a suspending or terminating caller; falls back to
    /// the idle fibre when nothing is runnable.
    pub(crate) fn schedule_full(&'static self) -> NonNull<Fred> {
        #[cfg(feature = "optimistic-idle")]
        {
            if let Some(next) = self.schedule_internal() {
                self.cluster.load_manager().report_ready();
                return next;
            }
        }
        #[cfg(not(feature = "optimistic-idle"))]
        {
            if self.cluster.load_manager().try_get_ready() {
                loop {
                    if let Some(next) = self.schedule_internal() {
                        return next;
                    }
                    // The claimed fibre is still being published.
                    std::hint::spin_loop();
                }
            }
        }
        self.idle_fred()
    }

    /// Local yield: never stages or steals. Yield swaps a queued fibre
    /// for the yielding one, so the ready count stays untouched.
    pub(crate) fn schedule_yield(&'static self) -> Option<NonNull<Fred>> {
        self.try_local()
    }

    /// Global yield: full selector, no parking.
    pub(crate) fn schedule_yield_global(&'static self) -> Option<NonNull<Fred>> {
        self.schedule_internal()
    }

    /// Preemption point; the idle fibre is never preempted.
    pub(crate) fn schedule_preempt(&'static self, curr: &Fred) -> Option<NonNull<Fred>> {
        if ptr::eq(curr, self.idle_fred().as_ptr()) {
            return None;
        }
        self.schedule_yield_global()
    }

    // ------------------------------------------------------------------
    // halt / handover
    // ------------------------------------------------------------------

    /// Park the worker thread until a producer wakes it; returns the
    /// fibre passed through the handover slot, if any.
    pub(crate) fn halt(&self) -> Option<NonNull<Fred>> {
        self.halt.p();
        NonNull::new(self.handover.swap(ptr::null_mut(), Ordering::AcqRel))
    }

    pub(crate) fn wake_with(&self, fred: Option<NonNull<Fred>>) {
        let p = fred.map_or(ptr::null_mut(), |f| f.as_ptr());
        self.handover.store(p, Ordering::Release);
        self.halt.v();
    }

    /// The worker's main loop; runs as the idle fibre forever.
    pub(crate) fn idle_loop(&'static self) -> ! {
        loop {
            if let Some(next) = self.cluster.load_manager().get_ready(self) {
                fibre::idle_yield_to(next);
                continue;
            }
            #[cfg(feature = "optimistic-idle")]
            {
                if let Some(next) = self.schedule_internal() {
                    fibre::idle_yield_to(next);
                } else {
                    self.cluster.load_manager().correct_ready();
                }
            }
            #[cfg(not(feature = "optimistic-idle"))]
            {
                let next = loop {
                    if let Some(next) = self.schedule_internal() {
                        break next;
                    }
                    std::hint::spin_loop();
                };
                fibre::idle_yield_to(next);
            }
        }
    }
}
