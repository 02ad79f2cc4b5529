/*
 * Blocking Queue
 *
 * The wait-list half of every synchronization primitive. The queue itself
 * is not locked: the owning primitive's lock protects it, and every
 * method states on which side of that lock it must be called.
 *
 * `block` parks the calling fibre with the resume race armed; a winning
 * `unblock` removes the node and resumes the fibre, while a lost race
 * (timeout or competing waker) leaves the node for the waiter itself to
 * unlink after re-acquiring the lock.
 */

use std::cell::UnsafeCell;
use std::ptr::NonNull;

use spin::{Mutex as SpinMutex, MutexGuard as SpinMutexGuard};

use crate::context;
use crate::fibre::{Fred, SpinPolicy};
use crate::sync::wait_list::{WaitList, WaitNode};
use crate::timer::Time;

pub(crate) struct BlockingQueue {
    list: UnsafeCell<WaitList>,
}

unsafe impl Send for BlockingQueue {}
unsafe impl Sync for BlockingQueue {}

impl BlockingQueue {
    pub(crate) const fn new() -> BlockingQueue {
        BlockingQueue {
            list: UnsafeCell::new(WaitList::new()),
        }
    }

    /// Token recorded in `resume_info` when this queue wins the race.
    pub(crate) fn token(&self) -> *mut () {
        self as *const BlockingQueue as *mut ()
    }

    /// Caller must hold the owning lock.
    pub(crate) unsafe fn is_empty(&self) -> bool {
        unsafe { (*self.list.get()).is_empty() }
    }

    /// Caller must hold the owning lock.
    pub(crate) unsafe fn push_node(&self, node: *mut WaitNode) {
        unsafe { (*self.list.get()).push_back(node) };
    }

    /// Caller must hold the owning lock.
    pub(crate) unsafe fn remove_node(&self, node: *mut WaitNode) {
        unsafe { (*self.list.get()).remove(node) };
    }

    /// Park the current fibre on this queue. The caller holds the guard of
    /// the primitive's lock; it is released after the node is enqueued.
    /// Returns true when a waker handed the fibre through `unblock`, false
    /// on timeout (the lock is NOT held on return in either case).
    pub(crate) fn block<T>(
        &self,
        lock: &SpinMutex<T>,
        guard: SpinMutexGuard<'_, T>,
        deadline: Option<Time>,
        policy: SpinPolicy,
    ) -> bool {
        if let Some(abs) = deadline {
            if abs <= Time::now() {
                drop(guard);
                return false;
            }
        }
        let cs = unsafe { &*context::curr_fred() };
        let mut node = WaitNode::new(unsafe { NonNull::new_unchecked(cs as *const Fred as *mut Fred) });
        log::debug!(target: "blocking", "fibre {:p} blocking on {:p}", cs, self);
        cs.prepare_race();
        unsafe { self.push_node(&mut node) };
        drop(guard);

        let winner = match deadline {
            None => cs.suspend(policy),
            Some(abs) => context::curr_scope().timer_queue().block_until(cs, abs),
        };
        if winner == self.token() {
            return true;
        }
        // Timed out (or cancelled): the node is still queued and is ours
        // to unlink.
        let cleanup = lock.lock();
        unsafe { self.remove_node(&mut node) };
        drop(cleanup);
        false
    }

    /// Hand one waiter through: the first node whose resume race this
    /// queue wins is removed and resumed. Caller must hold the owning
    /// lock. Returns the fibre handed through, if any.
    pub(crate) unsafe fn unblock(&self) -> Option<NonNull<Fred>> {
        unsafe {
            let list = &mut *self.list.get();
            let mut node = list.front();
            while !node.is_null() {
                let fred = (*node).fred;
                if fred.as_ref().race_resume(self.token()) {
                    list.remove(node);
                    log::debug!(target: "blocking",
                        "fibre {:p} resumed from {:p}", fred.as_ptr(), self);
                    fred.as_ref().resume();
                    return Some(fred);
                }
                node = WaitList::next(node);
            }
            None
        }
    }
}

impl Drop for BlockingQueue {
    fn drop(&mut self) {
        assert!(
            self.list.get_mut().is_empty(),
            "synchronization primitive destroyed with waiters"
        );
    }
}
