/*
 * Barrier
 *
 * Cyclic rendezvous for a fixed number of fibres. The final arriver of
 * each cycle wakes everyone and is the one arrival that returns the
 * "serial" marker, mirroring PTHREAD_BARRIER_SERIAL_THREAD.
 */

use spin::Mutex as SpinMutex;

use crate::fibre::SpinPolicy;
use crate::sync::blocking_queue::BlockingQueue;

pub struct Barrier {
    target: usize,
    count: SpinMutex<usize>,
    bq: BlockingQueue,
}

impl Barrier {
    /// `target` fibres per cycle; must be at least one.
    pub fn new(target: usize) -> Barrier {
        assert!(target > 0, "barrier width must be positive");
        Barrier {
            target,
            count: SpinMutex::new(0),
            bq: BlockingQueue::new(),
        }
    }

    /// Wait for the cycle to fill. Returns true for exactly one arriver
    /// per cycle (the last one), false for the others.
    pub fn wait(&self) -> bool {
        let mut g = self.count.lock();
        *g += 1;
        if *g == self.target {
            while *g > 0 {
                unsafe { self.bq.unblock() };
                *g -= 1;
            }
            true
        } else {
            let woken = self.bq.block(&self.count, g, None, SpinPolicy::none());
            debug_assert!(woken, "barrier wait cancelled");
            false
        }
    }
}
