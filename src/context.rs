/*
 * Per-Thread Runtime Context
 *
 * Every worker thread carries the identity of the fibre it is running and
 * the worker/cluster/scope it belongs to. The slots are written only by
 * the owning thread (at worker startup and on every context switch), so
 * plain thread-local cells are sufficient.
 *
 * Poller threads are not workers; they install a "fake" context that
 * carries only the event scope so the notification path can reach the
 * descriptor registry.
 */

use std::cell::Cell;
use std::ptr;

use crate::event_scope::EventScope;
use crate::fibre::Fred;
use crate::sched::cluster::Cluster;
use crate::sched::worker::Worker;

#[derive(Clone, Copy)]
struct State {
    fred: *mut Fred,
    worker: *const Worker,
    cluster: *const Cluster,
    scope: *const EventScope,
}

thread_local! {
    static STATE: Cell<State> = const {
        Cell::new(State {
            fred: ptr::null_mut(),
            worker: ptr::null(),
            cluster: ptr::null(),
            scope: ptr::null(),
        })
    };
}

/// Install the full worker context at thread startup.
pub(crate) fn install(
    fred: *mut Fred,
    worker: &'static Worker,
    cluster: &'static Cluster,
    scope: &'static EventScope,
) {
    STATE.with(|s| {
        s.set(State {
            fred,
            worker,
            cluster,
            scope,
        })
    });
}

/// Install a scope-only context for a poller thread.
pub(crate) fn install_fake(scope: &'static EventScope) {
    STATE.with(|s| {
        s.set(State {
            fred: ptr::null_mut(),
            worker: ptr::null(),
            cluster: ptr::null(),
            scope,
        })
    });
}

/// Record the fibre now running on this thread. Called on the incoming
/// side of every context switch.
pub(crate) fn set_curr_fred(fred: *mut Fred) {
    STATE.with(|s| {
        let mut st = s.get();
        st.fred = fred;
        s.set(st);
    });
}

pub(crate) fn curr_fred() -> *mut Fred {
    let f = STATE.with(|s| s.get().fred);
    debug_assert!(!f.is_null(), "no current fibre on this thread");
    f
}

pub(crate) fn curr_worker() -> &'static Worker {
    let w = STATE.with(|s| s.get().worker);
    debug_assert!(!w.is_null(), "not a worker thread");
    unsafe { &*w }
}

pub(crate) fn curr_cluster() -> &'static Cluster {
    let c = STATE.with(|s| s.get().cluster);
    debug_assert!(!c.is_null(), "not a worker thread");
    unsafe { &*c }
}

pub(crate) fn curr_scope() -> &'static EventScope {
    let e = STATE.with(|s| s.get().scope);
    assert!(!e.is_null(), "strand runtime not bootstrapped on this thread");
    unsafe { &*e }
}
