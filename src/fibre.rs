/*
 * Fibre Control
 *
 * `Fred` is the runtime-internal control block of a fibre: saved stack
 * pointer, scheduling attributes, the suspend/resume race state, and the
 * intrusive queue link. The public `Fibre` type is the owner-side handle
 * with join/detach semantics.
 *
 * Run-state protocol: `run_state` counts outstanding resumes minus
 * suspends, starting at Running (1). A suspending fibre decrements *after*
 * the context switch (in the post function, on the next fibre's stack); a
 * resumer increments and only enqueues the fibre when it observes Parked.
 * A resume that lands before the suspend completes leaves the counter at
 * ResumedEarly and the post function re-enqueues the fibre instead of
 * parking it.
 *
 * Competing wakers (timeout vs. unblock vs. fd readiness) arbitrate
 * through `resume_info`: the parking fibre arms the slot, each waker tries
 * to compare-exchange its own identity in, and only the one that wins the
 * exchange may resume the fibre.
 */

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::time::Duration;

use crate::context;
use crate::sched::cluster::Cluster;
use crate::sched::queues::Link;
use crate::sched::worker::Worker;
use crate::stack::{self, arch, StackRegion};
use crate::sync::sync_point::SyncPoint;

/// Scheduling priority of a fibre. Higher priorities are drained strictly
/// before lower ones on every ready queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Top = 0,
    Default = 1,
    Low = 2,
}

pub(crate) const NUM_PRIORITY: usize = 3;

impl Priority {
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    fn from_index(i: usize) -> Priority {
        match i {
            0 => Priority::Top,
            1 => Priority::Default,
            _ => Priority::Low,
        }
    }
}

/// Spin behaviour applied before a fibre actually parks: `start`/`end`
/// bound the exponential backoff spent waiting for an early resume, and
/// `count` bounds lock-acquisition rounds in the spin mutex.
#[derive(Debug, Clone, Copy)]
pub struct SpinPolicy {
    pub start: usize,
    pub end: usize,
    pub count: usize,
}

impl SpinPolicy {
    /// No spinning: park immediately.
    pub const fn none() -> SpinPolicy {
        SpinPolicy { start: 1, end: 0, count: 0 }
    }

    /// Exponential backoff between `start` and `end` pause rounds.
    pub const fn new(start: usize, end: usize, count: usize) -> SpinPolicy {
        SpinPolicy { start, end, count }
    }
}

impl Default for SpinPolicy {
    fn default() -> SpinPolicy {
        SpinPolicy::none()
    }
}

const PARKED: usize = 0;
const RUNNING: usize = 1;
const RESUMED_EARLY: usize = 2;

/// Runtime-internal fibre control block. The queue link is the first field
/// so link and control-block addresses coincide (`repr(C)`).
#[repr(C)]
pub(crate) struct Fred {
    link: Link,
    stack_ptr: UnsafeCell<usize>,
    worker: AtomicPtr<Worker>,
    priority: AtomicUsize,
    affinity: AtomicBool,
    run_state: AtomicUsize,
    resume_info: AtomicPtr<()>,
}

unsafe impl Send for Fred {}
unsafe impl Sync for Fred {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchCode {
    Idle,
    Yield,
    Resume,
    Suspend,
    Terminate,
}

impl Fred {
    pub(crate) fn new(worker: &'static Worker, affinity: bool) -> Fred {
        Fred {
            link: Link::new(),
            stack_ptr: UnsafeCell::new(0),
            worker: AtomicPtr::new(worker as *const Worker as *mut Worker),
            priority: AtomicUsize::new(Priority::Default.index()),
            affinity: AtomicBool::new(affinity),
            run_state: AtomicUsize::new(RUNNING),
            resume_info: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn as_link(&self) -> *mut Link {
        self as *const Fred as *mut Link
    }

    /// Recover the control block from its queue link.
    pub(crate) unsafe fn from_link(link: *mut Link) -> NonNull<Fred> {
        unsafe { NonNull::new_unchecked(link as *mut Fred) }
    }

    pub(crate) fn priority(&self) -> Priority {
        Priority::from_index(self.priority.load(Ordering::Relaxed))
    }

    pub(crate) fn set_priority(&self, p: Priority) {
        self.priority.store(p.index(), Ordering::Relaxed);
    }

    pub(crate) fn affinity(&self) -> bool {
        self.affinity.load(Ordering::Relaxed)
    }

    pub(crate) fn set_affinity(&self, a: bool) {
        self.affinity.store(a, Ordering::Relaxed);
    }

    pub(crate) fn worker(&self) -> &'static Worker {
        unsafe { &*self.worker.load(Ordering::Acquire) }
    }

    /// Update the resume-target worker; only the scheduler (stage
    /// adoption, migration) does this.
    pub(crate) fn change_worker(&self, w: &'static Worker) {
        self.worker
            .store(w as *const Worker as *mut Worker, Ordering::Release);
    }

    pub(crate) unsafe fn set_stack_ptr(&self, sp: usize) {
        unsafe { *self.stack_ptr.get() = sp };
    }

    // ------------------------------------------------------------------
    // resume race
    // ------------------------------------------------------------------

    fn armed_token(&self) -> *mut () {
        self as *const Fred as *mut ()
    }

    /// Arm the resume race before parking on a queue that can be woken by
    /// more than one source.
    pub(crate) fn prepare_race(&self) {
        self.resume_info.store(self.armed_token(), Ordering::Release);
    }

    /// Waker-side arbitration: claim the right to resume this fibre,
    /// recording `token` as the winning source. Exactly one waker per
    /// suspend succeeds.
    pub(crate) fn race_resume(&self, token: *mut ()) -> bool {
        self.resume_info
            .compare_exchange(self.armed_token(), token, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn take_resume_info(&self) -> *mut () {
        let t = self.resume_info.swap(ptr::null_mut(), Ordering::AcqRel);
        debug_assert!(t != self.armed_token(), "fibre resumed with race still armed");
        t
    }

    // ------------------------------------------------------------------
    // suspend / resume
    // ------------------------------------------------------------------

    /// Park the calling fibre (which must be `self`). Returns the winning
    /// waker token, or null for a suspend that was not raced.
    pub(crate) fn suspend(&self, policy: SpinPolicy) -> *mut () {
        let mut spin = policy.start;
        while spin <= policy.end {
            for _ in 0..spin {
                std::hint::spin_loop();
            }
            // Resumed before we ever left? Skip the park entirely.
            if self
                .run_state
                .compare_exchange(RESUMED_EARLY, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return self.take_resume_info();
            }
            spin += spin;
        }
        let worker = context::curr_worker();
        let next = worker.schedule_full();
        unsafe { self.switch(SwitchCode::Suspend, next.as_ref()) };
        self.take_resume_info()
    }

    /// Make a parked fibre runnable. Absorbed into ResumedEarly if the
    /// fibre has not finished suspending yet.
    pub(crate) fn resume(&self) {
        if self.run_state.fetch_add(1, Ordering::AcqRel) == PARKED {
            self.resume_internal();
        }
    }

    pub(crate) fn resume_internal(&self) {
        self.worker().enqueue_resume(unsafe { NonNull::new_unchecked(self.as_ptr()) });
    }

    fn as_ptr(&self) -> *mut Fred {
        self as *const Fred as *mut Fred
    }

    // ------------------------------------------------------------------
    // context switching
    // ------------------------------------------------------------------

    unsafe fn switch(&self, code: SwitchCode, next: &Fred) {
        debug_assert!(ptr::eq(self.as_ptr(), context::curr_fred()));
        debug_assert!(!ptr::eq(self, next), "switch to self");
        log::debug!(target: "scheduling",
            "switch <{:?}> {:p} -> {:p}", code, self, next);
        let post: stack::PostFn = match code {
            SwitchCode::Idle => post_idle,
            SwitchCode::Yield => post_yield,
            SwitchCode::Resume => post_resume,
            SwitchCode::Suspend => post_suspend,
            SwitchCode::Terminate => post_terminate,
        };
        let next_sp = unsafe { *next.stack_ptr.get() };
        debug_assert!(next_sp != 0, "switch to a running fibre");
        unsafe {
            *next.stack_ptr.get() = 0; // mark in use
            arch::switch(self.as_ptr() as *mut (), post, self.stack_ptr.get(), next_sp);
        }
        context::set_curr_fred(self.as_ptr());
    }
}

// Post functions run on the incoming stack, immediately after the switch,
// with the outgoing fibre as argument. They must not touch the outgoing
// fibre's stack.

unsafe extern "C" fn post_idle(_prev: *mut ()) {}

unsafe extern "C" fn post_yield(prev: *mut ()) {
    let prev = unsafe { &*(prev as *mut Fred) };
    prev.worker()
        .enqueue_direct(unsafe { NonNull::new_unchecked(prev.as_ptr()) });
}

unsafe extern "C" fn post_resume(prev: *mut ()) {
    let prev = unsafe { &*(prev as *mut Fred) };
    prev.resume_internal();
}

unsafe extern "C" fn post_suspend(prev: *mut ()) {
    let prev = unsafe { &*(prev as *mut Fred) };
    let old = prev.run_state.fetch_sub(1, Ordering::AcqRel);
    if old == RESUMED_EARLY {
        // A resume raced ahead of the park; put the fibre straight back.
        prev.resume_internal();
    } else {
        debug_assert_eq!(old, RUNNING);
    }
}

unsafe extern "C" fn post_terminate(prev: *mut ()) {
    unsafe { FibreInner::destroy(prev as *mut FibreInner) };
}

// ----------------------------------------------------------------------
// scheduling entry points for the current fibre
// ----------------------------------------------------------------------

/// Yield to the next fibre on the local ready queue, if any.
pub fn yield_now() -> bool {
    let worker = context::curr_worker();
    match worker.schedule_yield() {
        Some(next) => {
            let curr = unsafe { &*context::curr_fred() };
            unsafe { curr.switch(SwitchCode::Yield, next.as_ref()) };
            true
        }
        None => false,
    }
}

/// Yield running the full local/stage/steal selector.
pub fn yield_global() -> bool {
    let worker = context::curr_worker();
    match worker.schedule_yield_global() {
        Some(next) => {
            let curr = unsafe { &*context::curr_fred() };
            unsafe { curr.switch(SwitchCode::Yield, next.as_ref()) };
            true
        }
        None => false,
    }
}

/// Preemption point: like `yield_global`, but a no-op on the idle fibre.
pub fn preempt() {
    let worker = context::curr_worker();
    let curr = unsafe { &*context::curr_fred() };
    if let Some(next) = worker.schedule_preempt(curr) {
        unsafe { curr.switch(SwitchCode::Yield, next.as_ref()) };
    }
}

/// Forced reschedule through the resume protocol; used by migration.
pub(crate) fn yield_force() {
    let worker = context::curr_worker();
    let curr = unsafe { &*context::curr_fred() };
    let next = worker.schedule_full();
    unsafe { curr.switch(SwitchCode::Resume, next.as_ref()) };
}

/// Idle-loop handoff into a fibre chosen by the scheduler.
pub(crate) fn idle_yield_to(next: NonNull<Fred>) {
    let curr = unsafe { &*context::curr_fred() };
    unsafe { curr.switch(SwitchCode::Idle, next.as_ref()) };
}

/// Final switch of a dying fibre; the next fibre destroys the corpse.
pub(crate) fn terminate() -> ! {
    let worker = context::curr_worker();
    let curr = unsafe { &*context::curr_fred() };
    let next = worker.schedule_full();
    unsafe { curr.switch(SwitchCode::Terminate, next.as_ref()) };
    unreachable!("terminated fibre was resumed");
}

/// Opaque identity of a fibre, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FibreId(usize);

/// Identity of the calling fibre (including main and idle fibres).
pub fn current_id() -> FibreId {
    FibreId(context::curr_fred() as usize)
}

/// Suspend the calling fibre until its sleep deadline passes.
pub fn sleep(duration: Duration) {
    let curr = unsafe { &*context::curr_fred() };
    log::debug!(target: "blocking", "fibre {:p} sleep {:?}", curr, duration);
    curr.prepare_race();
    let tq = context::curr_scope().timer_queue();
    let winner = tq.block_timeout(curr, duration);
    debug_assert!(winner == tq.token(), "sleep cancelled by a foreign waker");
}

/// Migrate the calling fibre to another cluster (clears fixed affinity);
/// the fibre continues on a worker of the target cluster.
pub fn migrate_to_cluster(cluster: &'static Cluster) {
    let curr = unsafe { &*context::curr_fred() };
    curr.set_affinity(false);
    curr.change_worker(cluster.staging());
    yield_force();
}

/// Migration for unpollable I/O: move to the target cluster, keeping
/// affinity, and report the worker to return to afterwards.
pub(crate) fn migrate_for_io(cluster: &'static Cluster) -> &'static Worker {
    let curr = unsafe { &*context::curr_fred() };
    let prev = curr.worker();
    curr.change_worker(cluster.staging());
    yield_force();
    prev
}

/// Return leg of `migrate_for_io`.
pub(crate) fn migrate_to_worker(worker: &'static Worker) {
    let curr = unsafe { &*context::curr_fred() };
    curr.change_worker(worker);
    yield_force();
}

// ----------------------------------------------------------------------
// fibre objects
// ----------------------------------------------------------------------

/// Full fibre object: control block plus stack and lifecycle state. The
/// control block is the first field so `*mut Fred` doubles as the object
/// address (`repr(C)`).
#[repr(C)]
pub(crate) struct FibreInner {
    pub(crate) fred: Fred,
    stack: Option<StackRegion>,
    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send + 'static>>>,
    done: SyncPoint,
}

unsafe impl Send for FibreInner {}
unsafe impl Sync for FibreInner {}

impl FibreInner {
    /// Fibre on a fresh stack running a boxed closure.
    fn with_entry(
        worker: &'static Worker,
        affinity: bool,
        stack_size: usize,
        guard_size: usize,
        entry: Box<dyn FnOnce() + Send + 'static>,
    ) -> Box<FibreInner> {
        let region = StackRegion::allocate(stack_size, guard_size);
        let mut inner = Box::new(FibreInner {
            fred: Fred::new(worker, affinity),
            stack: None,
            entry: UnsafeCell::new(Some(entry)),
            done: SyncPoint::new(),
        });
        let arg = &*inner as *const FibreInner as usize;
        let sp = unsafe { arch::init(region.top(), fibre_main, arg, 0, 0) };
        unsafe { inner.fred.set_stack_ptr(sp) };
        inner.stack = Some(region);
        inner
    }

    /// Fibre on a fresh stack entering a raw runtime routine (idle loops,
    /// poller fibres with non-closure entries are still closures; only the
    /// idle loop uses this).
    pub(crate) fn with_raw_entry(
        worker: &'static Worker,
        entry: stack::EntryFn,
        arg: usize,
    ) -> Box<FibreInner> {
        let region = StackRegion::allocate(stack::DEFAULT_STACK_SIZE, stack::DEFAULT_GUARD_SIZE);
        let mut inner = Box::new(FibreInner {
            fred: Fred::new(worker, true),
            stack: None,
            entry: UnsafeCell::new(None),
            done: SyncPoint::new(),
        });
        let sp = unsafe { arch::init(region.top(), entry, arg, 0, 0) };
        unsafe { inner.fred.set_stack_ptr(sp) };
        inner.stack = Some(region);
        inner
    }

    /// Fibre borrowing the OS thread's own stack (bootstrap main fibre,
    /// idle context of spawned workers).
    pub(crate) fn borrowed(worker: &'static Worker) -> Box<FibreInner> {
        Box::new(FibreInner {
            fred: Fred::new(worker, true),
            stack: None,
            entry: UnsafeCell::new(None),
            done: SyncPoint::new(),
        })
    }

    /// Corpse handling after the final switch; runs on the next fibre's
    /// stack. Frees the stack, posts join, and reclaims the control block
    /// when the fibre was detached.
    unsafe fn destroy(this: *mut FibreInner) {
        unsafe {
            (*this).stack = None;
            if !(*this).done.post() {
                drop(Box::from_raw(this));
            }
        }
    }
}

/// Build a detached runtime fibre without enqueueing it; the caller
/// switches to it directly (worker init fibres).
pub(crate) fn make_detached(
    worker: &'static Worker,
    entry: Box<dyn FnOnce() + Send + 'static>,
) -> NonNull<Fred> {
    let inner = FibreInner::with_entry(
        worker,
        true,
        stack::DEFAULT_STACK_SIZE,
        stack::DEFAULT_GUARD_SIZE,
        entry,
    );
    inner.done.detach();
    let ptr = NonNull::from(Box::leak(inner));
    unsafe { NonNull::new_unchecked(ptr.as_ptr() as *mut Fred) }
}

unsafe extern "C" fn fibre_main(inner: usize, _a2: usize, _a3: usize) {
    let inner = inner as *mut FibreInner;
    context::set_curr_fred(inner as *mut Fred);
    let entry = unsafe { (*(*inner).entry.get()).take().expect("fibre started twice") };
    if panic::catch_unwind(AssertUnwindSafe(entry)).is_err() {
        log::error!(target: "warning", "fibre panicked; aborting process");
        std::process::abort();
    }
    terminate();
}

/// Owner-side handle of a spawned fibre. Dropping the handle joins; use
/// [`Fibre::detach`] to let the fibre outlive the handle.
pub struct Fibre {
    inner: Option<NonNull<FibreInner>>,
}

unsafe impl Send for Fibre {}

impl Fibre {
    /// Spawn with default attributes on the current cluster.
    pub fn spawn<F>(f: F) -> Fibre
    where
        F: FnOnce() + Send + 'static,
    {
        FibreBuilder::new().spawn(f)
    }

    /// Builder for stack size, priority, and placement.
    pub fn builder() -> FibreBuilder {
        FibreBuilder::new()
    }

    /// Wait for the fibre to finish.
    pub fn join(mut self) {
        self.join_inner();
    }

    /// Let the fibre run to completion on its own; the runtime reclaims
    /// it when it terminates.
    pub fn detach(mut self) {
        if let Some(p) = self.inner.take() {
            unsafe {
                if !(*p.as_ptr()).done.detach() {
                    // Already finished; nothing will look at it again.
                    drop(Box::from_raw(p.as_ptr()));
                }
            }
        }
    }

    fn join_inner(&mut self) {
        if let Some(p) = self.inner.take() {
            unsafe {
                (*p.as_ptr()).done.wait();
                drop(Box::from_raw(p.as_ptr()));
            }
        }
    }
}

impl Drop for Fibre {
    fn drop(&mut self) {
        self.join_inner();
    }
}

/// Placement and attribute builder for new fibres.
pub struct FibreBuilder {
    stack_size: usize,
    guard_size: usize,
    priority: Priority,
    background: bool,
    cluster: Option<&'static Cluster>,
    worker: Option<&'static Worker>,
}

impl FibreBuilder {
    fn new() -> FibreBuilder {
        FibreBuilder {
            stack_size: stack::DEFAULT_STACK_SIZE,
            guard_size: stack::DEFAULT_GUARD_SIZE,
            priority: Priority::Default,
            background: false,
            cluster: None,
            worker: None,
        }
    }

    pub fn stack_size(mut self, bytes: usize) -> FibreBuilder {
        self.stack_size = bytes;
        self
    }

    pub fn guard_size(mut self, bytes: usize) -> FibreBuilder {
        self.guard_size = bytes;
        self
    }

    pub fn priority(mut self, p: Priority) -> FibreBuilder {
        self.priority = p;
        self
    }

    /// Background fibres go to the cluster's staging queue and are adopted
    /// by whichever worker runs dry first.
    pub fn background(mut self, bg: bool) -> FibreBuilder {
        self.background = bg;
        self
    }

    pub fn on_cluster(mut self, cluster: &'static Cluster) -> FibreBuilder {
        self.cluster = Some(cluster);
        self
    }

    /// Pin to a specific worker (fixed affinity: never migrated).
    pub(crate) fn on_worker(mut self, worker: &'static Worker) -> FibreBuilder {
        self.worker = Some(worker);
        self
    }

    pub fn spawn<F>(self, f: F) -> Fibre
    where
        F: FnOnce() + Send + 'static,
    {
        let (worker, affinity) = match (self.worker, self.cluster) {
            (Some(w), _) => (w, true),
            (None, Some(c)) => (c.placement(self.background), false),
            (None, None) => (context::curr_cluster().placement(self.background), false),
        };
        let inner = FibreInner::with_entry(
            worker,
            affinity,
            self.stack_size,
            self.guard_size,
            Box::new(f),
        );
        inner.fred.set_priority(self.priority);
        let ptr = NonNull::from(Box::leak(inner));
        log::debug!(target: "threads", "fibre {:p} spawned on worker {:p}", ptr, worker);
        unsafe { (*ptr.as_ptr()).fred.resume_internal() };
        Fibre { inner: Some(ptr) }
    }
}
