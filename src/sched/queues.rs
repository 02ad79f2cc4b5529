/*
 * Intrusive Queues
 *
 * Queue nodes are embedded in the entities they carry (fibres), so the hot
 * scheduling paths never allocate. Two shapes are provided:
 *
 * - `StubQueue`: multi-producer single-consumer queue with a resident stub
 *   node. Producers are lock-free; the single consumer is enforced by the
 *   caller (the ready queue serializes consumers with a spin lock). The
 *   queue carries an explicit `empty` flag maintained by the consumer and
 *   cleared by producers; "marked empty" implies the stub is the tail and
 *   no producer has completed a push since the mark was taken.
 *
 * - `LinkQueue`: plain FIFO for use under an external lock.
 *
 * Both operate on `Link` nodes; the owner of a node converts back to the
 * containing entity.
 */

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// Intrusive queue link. Embedded as the first field of the entity
/// (`repr(C)`) so node and entity addresses coincide.
#[repr(C)]
pub(crate) struct Link {
    next: AtomicPtr<Link>,
}

impl Link {
    pub(crate) const fn new() -> Link {
        Link {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// MPSC queue with resident stub node.
///
/// Must be pinned in place and initialized with `init` before first use;
/// the stub is self-referential.
pub(crate) struct StubQueue {
    stub: Link,
    head: UnsafeCell<*mut Link>,
    tail: AtomicPtr<Link>,
    empty: AtomicBool,
}

unsafe impl Send for StubQueue {}
unsafe impl Sync for StubQueue {}

impl StubQueue {
    pub(crate) const fn new() -> StubQueue {
        StubQueue {
            stub: Link::new(),
            head: UnsafeCell::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            empty: AtomicBool::new(true),
        }
    }

    /// Finish construction once the queue has its final address.
    pub(crate) fn init(&mut self) {
        let stub = &self.stub as *const Link as *mut Link;
        self.stub.next.store(ptr::null_mut(), Ordering::Relaxed);
        *self.head.get_mut() = stub;
        *self.tail.get_mut() = stub;
        self.empty.store(true, Ordering::Relaxed);
    }

    fn stub_ptr(&self) -> *mut Link {
        &self.stub as *const Link as *mut Link
    }

    /// Enqueue a node. Safe for any number of concurrent producers.
    /// Returns whether the queue was marked empty at push time.
    pub(crate) fn push(&self, node: *mut Link) -> bool {
        debug_assert!(!node.is_null());
        unsafe {
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
        }
        let prev = self.tail.swap(node, Ordering::AcqRel);
        debug_assert!(!prev.is_null(), "stub queue used before init");
        let was_empty = if prev == self.stub_ptr() {
            self.empty.swap(false, Ordering::AcqRel)
        } else {
            false
        };
        unsafe {
            (*prev).next.store(node, Ordering::Release);
        }
        was_empty
    }

    /// Dequeue a node.
    ///
    /// # Safety
    ///
    /// The caller must be the sole consumer for the duration of the call.
    pub(crate) unsafe fn pop(&self) -> Option<*mut Link> {
        let stub = self.stub_ptr();
        unsafe {
            loop {
                let head = *self.head.get();
                debug_assert!(!head.is_null(), "stub queue used before init");
                if head == stub {
                    let next = (*head).next.load(Ordering::Acquire);
                    if next.is_null() {
                        if self.tail.load(Ordering::Acquire) == stub {
                            // Drained. Take the empty mark, then confirm no
                            // producer slipped in between.
                            self.empty.store(true, Ordering::SeqCst);
                            if self.tail.load(Ordering::SeqCst) == stub {
                                return None;
                            }
                            self.empty.store(false, Ordering::SeqCst);
                        }
                        // A producer is mid-push; wait for the link.
                        std::hint::spin_loop();
                        continue;
                    }
                    // Skip past the stub.
                    *self.head.get() = next;
                    continue;
                }
                let next = (*head).next.load(Ordering::Acquire);
                if !next.is_null() {
                    *self.head.get() = next;
                    return Some(head);
                }
                // Head is the last visible element. If the tail agrees,
                // recycle the stub behind it so the head can be released.
                if self.tail.load(Ordering::Acquire) == head {
                    self.push(stub);
                }
                let next = (*head).next.load(Ordering::Acquire);
                if !next.is_null() {
                    *self.head.get() = next;
                    return Some(head);
                }
                // Producer between tail swap and link store.
                std::hint::spin_loop();
            }
        }
    }

    /// Whether the consumer has marked the queue drained.
    #[cfg(test)]
    pub(crate) fn is_marked_empty(&self) -> bool {
        self.empty.load(Ordering::SeqCst)
    }
}

/// Plain intrusive FIFO; all access must be under one external lock.
pub(crate) struct LinkQueue {
    head: *mut Link,
    tail: *mut Link,
}

unsafe impl Send for LinkQueue {}

impl LinkQueue {
    pub(crate) const fn new() -> LinkQueue {
        LinkQueue {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub(crate) fn push(&mut self, node: *mut Link) {
        debug_assert!(!node.is_null());
        unsafe {
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
            if self.head.is_null() {
                self.head = node;
            } else {
                (*self.tail).next.store(node, Ordering::Relaxed);
            }
        }
        self.tail = node;
    }

    pub(crate) fn pop(&mut self) -> Option<*mut Link> {
        if self.head.is_null() {
            return None;
        }
        let node = self.head;
        unsafe {
            self.head = (*node).next.load(Ordering::Relaxed);
        }
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn boxed_links(n: usize) -> Vec<Box<Link>> {
        (0..n).map(|_| Box::new(Link::new())).collect()
    }

    #[test]
    fn stub_queue_fifo_order() {
        let mut q = Box::new(StubQueue::new());
        q.init();
        let nodes = boxed_links(8);
        for n in &nodes {
            q.push(&**n as *const Link as *mut Link);
        }
        for n in &nodes {
            let got = unsafe { q.pop() }.expect("queue lost an element");
            assert_eq!(got, &**n as *const Link as *mut Link);
        }
        assert!(unsafe { q.pop() }.is_none());
    }

    #[test]
    fn stub_queue_empty_mark_invariant() {
        let mut q = Box::new(StubQueue::new());
        q.init();
        // Fresh queue: marked empty, and pop confirms the mark.
        assert!(q.is_marked_empty());
        assert!(unsafe { q.pop() }.is_none());
        assert!(q.is_marked_empty());

        let node = Box::new(Link::new());
        // First push after the mark observes and clears it.
        assert!(q.push(&*node as *const Link as *mut Link));
        assert!(!q.is_marked_empty());

        // Pushing onto a non-empty queue does not observe the mark.
        let node2 = Box::new(Link::new());
        assert!(!q.push(&*node2 as *const Link as *mut Link));

        assert!(unsafe { q.pop() }.is_some());
        assert!(unsafe { q.pop() }.is_some());
        // Drained pop re-establishes the mark.
        assert!(unsafe { q.pop() }.is_none());
        assert!(q.is_marked_empty());
    }

    #[test]
    fn stub_queue_concurrent_producers() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1000;

        let mut q = Box::new(StubQueue::new());
        q.init();
        let q: &'static StubQueue = Box::leak(q);
        let popped = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                std::thread::spawn(move || {
                    for _ in 0..PER_PRODUCER {
                        let node = Box::into_raw(Box::new(Link::new()));
                        q.push(node as *mut Link);
                    }
                })
            })
            .collect();

        let mut seen = 0;
        while seen < PRODUCERS * PER_PRODUCER {
            if let Some(node) = unsafe { q.pop() } {
                drop(unsafe { Box::from_raw(node) });
                seen += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        popped.store(seen, Ordering::Relaxed);
        assert_eq!(popped.load(Ordering::Relaxed), PRODUCERS * PER_PRODUCER);
        assert!(unsafe { q.pop() }.is_none());
    }

    #[test]
    fn link_queue_fifo() {
        let mut q = LinkQueue::new();
        assert!(q.is_empty());
        let nodes = boxed_links(4);
        for n in &nodes {
            q.push(&**n as *const Link as *mut Link);
        }
        for n in &nodes {
            assert_eq!(q.pop().unwrap(), &**n as *const Link as *mut Link);
        }
        assert!(q.pop().is_none() && q.is_empty());
    }
}
