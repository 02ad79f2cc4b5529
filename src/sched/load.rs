/*
 * Load Manager
 *
 * Idle-worker parking. The signed `ready_count` tracks runnable fibres
 * not yet consumed minus workers currently waiting for work; producers
 * and consumers adjust it atomically. A consumer whose decrement goes
 * negative parks on the waiting list; the producer whose increment
 * crosses back hands its fibre directly to a parked worker through the
 * handover slot, skipping the ready queue.
 *
 * Two claiming disciplines, selected by the `optimistic-idle` feature:
 * the default CAS-claims a token before searching, the optimistic variant
 * searches first and corrects the counter when the search comes up empty.
 */

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, Ordering};

use spin::Mutex as SpinMutex;

use crate::fibre::Fred;
use crate::sched::queues::LinkQueue;
use crate::sched::worker::Worker;

struct LmInner {
    waiting_workers: VecDeque<&'static Worker>,
    waiting_fibres: LinkQueue,
}

pub(crate) struct LoadManager {
    ready_count: AtomicIsize,
    inner: SpinMutex<LmInner>,
}

impl LoadManager {
    pub(crate) fn new() -> LoadManager {
        LoadManager {
            ready_count: AtomicIsize::new(0),
            inner: SpinMutex::new(LmInner {
                waiting_workers: VecDeque::with_capacity(16),
                waiting_fibres: LinkQueue::new(),
            }),
        }
    }

    /// Claim one runnable fibre token without parking. Default variant
    /// only: succeeds iff the count was positive.
    #[cfg(not(feature = "optimistic-idle"))]
    pub(crate) fn try_get_ready(&self) -> bool {
        let mut c = self.ready_count.load(Ordering::SeqCst);
        while c > 0 {
            match self.ready_count.compare_exchange(
                c,
                c - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => c = actual,
            }
        }
        false
    }

    /// Optimistic variant: account for a fibre the caller already found.
    #[cfg(feature = "optimistic-idle")]
    pub(crate) fn report_ready(&self) {
        self.ready_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Optimistic variant: undo a claim whose search found nothing (the
    /// fibre lives on a queue another worker drained first).
    #[cfg(feature = "optimistic-idle")]
    pub(crate) fn correct_ready(&self) {
        self.ready_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Idle-loop entry: consume one token, parking the worker when none
    /// is available. Returns a fibre when one was handed over directly;
    /// `None` means a token was claimed and the caller must find the
    /// fibre through the local/stage/steal selector.
    pub(crate) fn get_ready(&self, worker: &'static Worker) -> Option<NonNull<Fred>> {
        let blocked = -(self.ready_count.fetch_sub(1, Ordering::SeqCst) - 1);
        if blocked > 0 {
            return self.park(worker);
        }
        None
    }

    fn park(&self, worker: &'static Worker) -> Option<NonNull<Fred>> {
        let mut g = self.inner.lock();
        if let Some(link) = g.waiting_fibres.pop() {
            return Some(unsafe { Fred::from_link(link) });
        }
        g.waiting_workers.push_back(worker);
        drop(g);
        log::debug!(target: "scheduling", "worker {:p} parking", worker);
        worker.halt()
    }

    /// Producer entry: account for a new runnable fibre. Returns true
    /// when the fibre was consumed here (stashed for or handed to a
    /// parked worker); false means the caller enqueues it itself.
    pub(crate) fn add_ready(&self, fred: NonNull<Fred>) -> bool {
        if self.ready_count.fetch_add(1, Ordering::SeqCst) + 1 > 0 {
            return false;
        }
        let mut g = self.inner.lock();
        match g.waiting_workers.pop_front() {
            None => {
                g.waiting_fibres.push(unsafe { fred.as_ref() }.as_link());
            }
            Some(worker) => {
                drop(g);
                log::debug!(target: "scheduling",
                    "handover {:p} -> worker {:p}", fred.as_ptr(), worker);
                worker.wake_with(Some(fred));
            }
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> isize {
        self.ready_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "optimistic-idle"))]
    #[test]
    fn token_claim_accounting() {
        let lm = LoadManager::new();
        assert!(!lm.try_get_ready());
        assert_eq!(lm.count(), 0);
        // Producer side: count rises only while no worker is in deficit.
        lm.ready_count.fetch_add(2, Ordering::SeqCst);
        assert!(lm.try_get_ready());
        assert!(lm.try_get_ready());
        assert!(!lm.try_get_ready());
        assert_eq!(lm.count(), 0);
    }
}
