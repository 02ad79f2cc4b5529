/*
 * Ready Queue
 *
 * Per-worker multi-priority queue of runnable fibres. Two layouts behind
 * one interface:
 *
 * - default: one MPSC stub queue per priority; producers push lock-free,
 *   consumers (the owner and stealing workers) are serialized by a spin
 *   lock;
 * - `locked-ready-queue`: plain intrusive FIFOs with one lock around
 *   everything.
 *
 * Priority rule: strictly higher priority first, FIFO within a priority.
 */

use std::ptr::NonNull;

use spin::Mutex as SpinMutex;

use crate::fibre::{Fred, NUM_PRIORITY};

#[cfg(not(feature = "locked-ready-queue"))]
mod imp {
    use super::*;
    use crate::sched::queues::StubQueue;

    pub(crate) struct ReadyQueue {
        queues: [StubQueue; NUM_PRIORITY],
        consumer: SpinMutex<()>,
    }

    impl ReadyQueue {
        pub(crate) fn new() -> ReadyQueue {
            ReadyQueue {
                queues: [StubQueue::new(), StubQueue::new(), StubQueue::new()],
                consumer: SpinMutex::new(()),
            }
        }

        pub(crate) fn init(&mut self) {
            for q in self.queues.iter_mut() {
                q.init();
            }
        }

        pub(crate) fn enqueue(&self, fred: NonNull<Fred>) {
            let prio = unsafe { fred.as_ref() }.priority().index();
            self.queues[prio].push(unsafe { fred.as_ref() }.as_link());
        }

        fn dequeue_internal(&self) -> Option<NonNull<Fred>> {
            for q in self.queues.iter() {
                if let Some(link) = unsafe { q.pop() } {
                    return Some(unsafe { Fred::from_link(link) });
                }
            }
            None
        }

        pub(crate) fn dequeue(&self) -> Option<NonNull<Fred>> {
            let _g = self.consumer.lock();
            self.dequeue_internal()
        }

        pub(crate) fn try_dequeue(&self) -> Option<NonNull<Fred>> {
            let _g = self.consumer.try_lock()?;
            self.dequeue_internal()
        }
    }
}

#[cfg(feature = "locked-ready-queue")]
mod imp {
    use super::*;
    use crate::sched::queues::LinkQueue;

    pub(crate) struct ReadyQueue {
        queues: SpinMutex<[LinkQueue; NUM_PRIORITY]>,
    }

    impl ReadyQueue {
        pub(crate) fn new() -> ReadyQueue {
            ReadyQueue {
                queues: SpinMutex::new([LinkQueue::new(), LinkQueue::new(), LinkQueue::new()]),
            }
        }

        pub(crate) fn init(&mut self) {}

        pub(crate) fn enqueue(&self, fred: NonNull<Fred>) {
            let prio = unsafe { fred.as_ref() }.priority().index();
            self.queues.lock()[prio].push(unsafe { fred.as_ref() }.as_link());
        }

        fn dequeue_locked(queues: &mut [LinkQueue; NUM_PRIORITY]) -> Option<NonNull<Fred>> {
            for q in queues.iter_mut() {
                if let Some(link) = q.pop() {
                    return Some(unsafe { Fred::from_link(link) });
                }
            }
            None
        }

        pub(crate) fn dequeue(&self) -> Option<NonNull<Fred>> {
            Self::dequeue_locked(&mut self.queues.lock())
        }

        pub(crate) fn try_dequeue(&self) -> Option<NonNull<Fred>> {
            let mut g = self.queues.try_lock()?;
            Self::dequeue_locked(&mut g)
        }
    }
}

pub(crate) use imp::ReadyQueue;
