/*
 * Condition Variable
 *
 * Works with an external `Mutex`: the caller holds it around `wait` and
 * `signal`. `wait` releases the mutex, parks, and returns WITHOUT the
 * mutex held; the caller re-acquires it. The wait list itself is
 * protected by the external mutex.
 */

use std::ptr::NonNull;
use std::time::Duration;

use crate::context;
use crate::fibre::{Fred, SpinPolicy};
use crate::sync::blocking_queue::BlockingQueue;
use crate::sync::mutex::Mutex;
use crate::sync::wait_list::WaitNode;
use crate::timer::Time;

pub struct Condition {
    bq: BlockingQueue,
}

impl Condition {
    pub const fn new() -> Condition {
        Condition {
            bq: BlockingQueue::new(),
        }
    }

    fn block(&self, mutex: &Mutex, deadline: Option<Time>) -> bool {
        debug_assert!(mutex.holds(), "condition wait without the mutex");
        let cs = unsafe { &*context::curr_fred() };
        let mut node =
            WaitNode::new(unsafe { NonNull::new_unchecked(cs as *const Fred as *mut Fred) });
        cs.prepare_race();
        unsafe { self.bq.push_node(&mut node) };
        mutex.unlock();

        let winner = match deadline {
            None => cs.suspend(SpinPolicy::none()),
            Some(abs) => context::curr_scope().timer_queue().block_until(cs, abs),
        };
        if winner == self.bq.token() {
            return true;
        }
        mutex.lock();
        unsafe { self.bq.remove_node(&mut node) };
        mutex.unlock();
        false
    }

    /// Release the mutex and wait for a signal. The mutex is NOT held on
    /// return.
    pub fn wait(&self, mutex: &Mutex) {
        self.block(mutex, None);
    }

    /// As `wait`, with a timeout. Returns false on expiry.
    pub fn wait_timeout(&self, mutex: &Mutex, timeout: Duration) -> bool {
        self.block(mutex, Some(Time::now() + timeout))
    }

    /// Wake one waiter. Caller must hold the external mutex.
    pub fn signal(&self) {
        unsafe { self.bq.unblock() };
    }

    /// Wake all current waiters. Caller must hold the external mutex.
    pub fn broadcast(&self) {
        while unsafe { self.bq.unblock() }.is_some() {}
    }
}

impl Default for Condition {
    fn default() -> Condition {
        Condition::new()
    }
}
