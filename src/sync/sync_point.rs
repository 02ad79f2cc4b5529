/*
 * Sync Point
 *
 * Single-use synchronization flag used for fibre join and bootstrap
 * rendezvous. Exactly one fibre may wait; exactly one post happens; the
 * owner side may detach instead of joining, in which case the runtime
 * reclaims the fibre object at termination.
 */

use std::ptr::NonNull;

use spin::Mutex as SpinMutex;

use crate::context;
use crate::fibre::{Fred, SpinPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagState {
    Running,
    Waiting(NonNull<Fred>),
    Posted,
    Detached,
}

unsafe impl Send for FlagState {}

pub struct SyncPoint {
    state: SpinMutex<FlagState>,
}

unsafe impl Sync for SyncPoint {}

impl SyncPoint {
    pub const fn new() -> SyncPoint {
        SyncPoint {
            state: SpinMutex::new(FlagState::Running),
        }
    }

    pub fn posted(&self) -> bool {
        *self.state.lock() == FlagState::Posted
    }

    /// Wait for the post. Returns false if the flag was detached instead.
    pub fn wait(&self) -> bool {
        let mut g = self.state.lock();
        if *g == FlagState::Running {
            let cs = context::curr_fred();
            *g = FlagState::Waiting(unsafe { NonNull::new_unchecked(cs) });
            drop(g);
            unsafe { (*cs).suspend(SpinPolicy::none()) };
            g = self.state.lock();
        }
        match *g {
            FlagState::Posted => true,
            FlagState::Detached => false,
            state => panic!("sync point woken in state {:?}", state),
        }
    }

    /// Post the flag, waking the waiter if present. Returns false if the
    /// flag was already detached (the poster then owns cleanup).
    pub fn post(&self) -> bool {
        let mut g = self.state.lock();
        match *g {
            FlagState::Posted => panic!("sync point posted twice"),
            FlagState::Detached => false,
            FlagState::Running => {
                *g = FlagState::Posted;
                true
            }
            FlagState::Waiting(fred) => {
                *g = FlagState::Posted;
                drop(g);
                unsafe { fred.as_ref() }.resume();
                true
            }
        }
    }

    /// Detach: nobody will wait. Returns false if the flag was already
    /// posted (the detacher then owns cleanup).
    pub fn detach(&self) -> bool {
        let mut g = self.state.lock();
        match *g {
            FlagState::Posted => false,
            FlagState::Running => {
                *g = FlagState::Detached;
                true
            }
            FlagState::Waiting(_) => panic!("detach raced with a joiner"),
            FlagState::Detached => panic!("sync point detached twice"),
        }
    }
}

impl Default for SyncPoint {
    fn default() -> SyncPoint {
        SyncPoint::new()
    }
}
