/*
 * Wait List
 *
 * Doubly-linked list of wait nodes. A node lives on the stack of the
 * waiting fibre for the duration of its block call: the waker removes it
 * under the owning primitive's lock, or the cancelled waiter re-locks and
 * removes it itself before its frame goes away. The list never owns the
 * nodes.
 */

use std::ptr::{self, NonNull};

use crate::fibre::Fred;

pub(crate) struct WaitNode {
    pub(crate) fred: NonNull<Fred>,
    next: *mut WaitNode,
    prev: *mut WaitNode,
}

impl WaitNode {
    pub(crate) fn new(fred: NonNull<Fred>) -> WaitNode {
        WaitNode {
            fred,
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
        }
    }
}

pub(crate) struct WaitList {
    head: *mut WaitNode,
    tail: *mut WaitNode,
}

unsafe impl Send for WaitList {}

impl WaitList {
    pub(crate) const fn new() -> WaitList {
        WaitList {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub(crate) fn front(&self) -> *mut WaitNode {
        self.head
    }

    pub(crate) unsafe fn next(node: *mut WaitNode) -> *mut WaitNode {
        unsafe { (*node).next }
    }

    pub(crate) unsafe fn push_back(&mut self, node: *mut WaitNode) {
        unsafe {
            (*node).next = ptr::null_mut();
            (*node).prev = self.tail;
            if self.tail.is_null() {
                self.head = node;
            } else {
                (*self.tail).next = node;
            }
        }
        self.tail = node;
    }

    /// Unlink a node known to be on this list.
    pub(crate) unsafe fn remove(&mut self, node: *mut WaitNode) {
        unsafe {
            if (*node).prev.is_null() {
                debug_assert_eq!(self.head, node);
                self.head = (*node).next;
            } else {
                (*(*node).prev).next = (*node).next;
            }
            if (*node).next.is_null() {
                debug_assert_eq!(self.tail, node);
                self.tail = (*node).prev;
            } else {
                (*(*node).next).prev = (*node).prev;
            }
            (*node).next = ptr::null_mut();
            (*node).prev = ptr::null_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dangling() -> NonNull<Fred> {
        NonNull::dangling()
    }

    #[test]
    fn push_remove_middle() {
        let mut list = WaitList::new();
        let mut a = WaitNode::new(dangling());
        let mut b = WaitNode::new(dangling());
        let mut c = WaitNode::new(dangling());
        unsafe {
            list.push_back(&mut a);
            list.push_back(&mut b);
            list.push_back(&mut c);
            list.remove(&mut b);
            assert_eq!(list.front(), &mut a as *mut WaitNode);
            assert_eq!(WaitList::next(&mut a), &mut c as *mut WaitNode);
            list.remove(&mut a);
            list.remove(&mut c);
        }
        assert!(list.is_empty());
    }

    #[test]
    fn fifo_order_preserved() {
        let mut list = WaitList::new();
        let mut nodes: Vec<WaitNode> = (0..4).map(|_| WaitNode::new(dangling())).collect();
        unsafe {
            for n in nodes.iter_mut() {
                list.push_back(n);
            }
            let mut walk = list.front();
            for n in nodes.iter_mut() {
                assert_eq!(walk, n as *mut WaitNode);
                walk = WaitList::next(walk);
            }
            assert!(walk.is_null());
            for n in nodes.iter_mut() {
                list.remove(n);
            }
        }
        assert!(list.is_empty());
    }
}
