/*
 * Cluster
 *
 * A scheduling scope: a ring of workers sharing placement, stealing, and
 * one load manager, plus the cluster's I/O pollers and the staging
 * pseudo-worker whose queue holds fibres not yet pinned anywhere.
 *
 * Clusters are leaked on creation: workers, pollers, and parked fibres
 * hold references for the life of the process.
 */

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use spin::RwLock as SpinRwLock;

use crate::context;
use crate::event_scope::EventScope;
use crate::fibre::{self, Fibre, FibreInner, Fred, Priority};
use crate::io::poller::ClusterPoller;
use crate::sched::load::LoadManager;
use crate::sched::worker::{OsSemaphore, Worker};
use crate::stack::EntryFn;
use crate::sync::mutex::Mutex;

pub struct Cluster {
    scope: &'static EventScope,
    load: LoadManager,
    ring: SpinRwLock<Vec<&'static Worker>>,
    place_cursor: AtomicUsize,
    staging: spin::Once<&'static Worker>,
    pollers: SpinRwLock<Vec<&'static ClusterPoller>>,
    poller_count: usize,
    // stop-the-world support; the held workers block at the OS level so
    // they cannot pick up other fibres meanwhile
    pause_lock: Mutex,
    pause_sem: OsSemaphore,
    confirm_sem: OsSemaphore,
    paused: AtomicUsize,
}

impl Cluster {
    /// Create a cluster in the current event scope with the scope's
    /// default poller count.
    pub fn new() -> &'static Cluster {
        let scope = context::curr_scope();
        let cluster = Cluster::new_in(scope, scope.default_pollers());
        cluster.start_polling();
        cluster
    }

    /// Scope-internal constructor; pollers are created but not started.
    pub(crate) fn new_in(scope: &'static EventScope, poller_count: usize) -> &'static Cluster {
        let cluster: &'static Cluster = Box::leak(Box::new(Cluster {
            scope,
            load: LoadManager::new(),
            ring: SpinRwLock::new(Vec::new()),
            place_cursor: AtomicUsize::new(0),
            staging: spin::Once::new(),
            pollers: SpinRwLock::new(Vec::new()),
            poller_count,
            pause_lock: Mutex::new(),
            pause_sem: OsSemaphore::new(0),
            confirm_sem: OsSemaphore::new(0),
            paused: AtomicUsize::new(0),
        }));
        cluster.staging.call_once(|| Worker::new_leaked(cluster));
        cluster.make_pollers();
        log::debug!(target: "basic", "cluster {:p} created ({} pollers)", cluster, poller_count);
        cluster
    }

    fn make_pollers(&'static self) {
        let mut v = self.pollers.write();
        v.clear();
        for _ in 0..self.poller_count {
            v.push(ClusterPoller::new_leaked(self.scope));
        }
    }

    /// Start the cluster's pollers (deferred during scope bootstrap until
    /// the descriptor registry exists).
    pub(crate) fn start_polling(&'static self) {
        for p in self.pollers.read().iter() {
            p.start(self);
        }
    }

    pub(crate) fn event_scope(&self) -> &'static EventScope {
        self.scope
    }

    pub(crate) fn load_manager(&self) -> &LoadManager {
        &self.load
    }

    pub(crate) fn staging(&self) -> &'static Worker {
        *self.staging.get().expect("cluster staging worker missing")
    }

    /// Poller owning a descriptor's registrations within this cluster.
    pub(crate) fn poller_for(&self, fd: libc::c_int) -> &'static ClusterPoller {
        let v = self.pollers.read();
        v[fd as usize % v.len()]
    }

    // ------------------------------------------------------------------
    // ring & placement
    // ------------------------------------------------------------------

    fn ring_add(&self, worker: &'static Worker) {
        let mut ring = self.ring.write();
        worker.set_ring_slot(ring.len());
        ring.push(worker);
    }

    /// Round-robin placement for new non-background fibres; background
    /// fibres go to staging and are adopted lazily.
    pub(crate) fn placement(&self, background: bool) -> &'static Worker {
        if background {
            return self.staging();
        }
        let ring = self.ring.read();
        assert!(!ring.is_empty(), "placement on a cluster without workers");
        let slot = self.place_cursor.fetch_add(1, Ordering::Relaxed) % ring.len();
        ring[slot]
    }

    /// Non-blocking pop from the staging queue.
    pub(crate) fn stage(&self) -> Option<NonNull<Fred>> {
        self.staging().try_dequeue()
    }

    /// Walk the ring from the thief's successor, trying each victim once.
    pub(crate) fn steal_for(&self, thief: &Worker) -> Option<NonNull<Fred>> {
        let ring = self.ring.read();
        let n = ring.len();
        if n < 2 {
            return None;
        }
        let start = thief.ring_slot().min(n - 1);
        for i in 1..n {
            let victim = ring[(start + i) % n];
            if std::ptr::eq(victim, thief) {
                continue;
            }
            if let Some(fred) = victim.try_dequeue() {
                log::debug!(target: "scheduling",
                    "steal {:p}: {:p} <- {:p}", fred.as_ptr(), thief, victim);
                return Some(fred);
            }
        }
        None
    }

    pub fn worker_count(&self) -> usize {
        self.ring.read().len()
    }

    /// System-level thread ids of the cluster's workers.
    pub fn worker_ids(&self) -> Vec<libc::pthread_t> {
        self.ring.read().iter().map(|w| w.sys_tid()).collect()
    }

    // ------------------------------------------------------------------
    // worker creation
    // ------------------------------------------------------------------

    /// Register the calling OS thread as a worker; the caller's context
    /// becomes the main fibre (on the thread's own stack) and a fresh
    /// stack is set up for the idle loop.
    pub(crate) fn register_worker(&'static self) -> NonNull<FibreInner> {
        let worker = Worker::new_leaked(self);
        self.ring_add(worker);
        worker.record_sys_tid();
        let main = NonNull::from(Box::leak(FibreInner::borrowed(worker)));
        context::install(main.as_ptr() as *mut Fred, worker, self, self.scope);
        let idle = Box::leak(FibreInner::with_raw_entry(
            worker,
            idle_main as EntryFn,
            worker as *const Worker as usize,
        ));
        worker.set_idle_fred(&idle.fred);
        log::debug!(target: "threads", "registered worker {:p}", worker);
        main
    }

    /// Create one new worker thread. `init` (if any) runs as a dedicated
    /// fibre on the new worker before anything else.
    pub fn add_worker(&'static self) {
        self.add_worker_init(None);
    }

    pub(crate) fn add_worker_init(&'static self, init: Option<Box<dyn FnOnce() + Send + 'static>>) {
        let worker = Worker::new_leaked(self);
        self.ring_add(worker);
        let _ = std::thread::Builder::new()
            .name("strand-worker".into())
            .spawn(move || run_worker(self, worker, init))
            .expect("worker thread creation failed");
    }

    pub fn add_workers(&'static self, count: usize) {
        for _ in 0..count {
            self.add_worker();
        }
    }

    // ------------------------------------------------------------------
    // pause / resume
    // ------------------------------------------------------------------

    /// Stop the world within this cluster: returns once every other
    /// worker is held in a top-priority blocking fibre. Maintenance
    /// primitive, not a hot path.
    pub fn pause(&'static self) {
        self.pause_lock.lock();
        let me = context::curr_worker();
        let targets: Vec<&'static Worker> = self
            .ring
            .read()
            .iter()
            .copied()
            .filter(|w| !std::ptr::eq(*w, me))
            .collect();
        self.paused.store(targets.len(), Ordering::Relaxed);
        for &worker in targets.iter() {
            Fibre::builder()
                .on_worker(worker)
                .priority(Priority::Top)
                .spawn(move || {
                    let cluster: &'static Cluster = context::curr_cluster();
                    cluster.confirm_sem.v();
                    cluster.pause_sem.p();
                })
                .detach();
        }
        for _ in 0..targets.len() {
            self.confirm_sem.p();
        }
        log::debug!(target: "scheduling", "cluster {:p} paused", self);
    }

    /// Release the workers held by `pause`.
    pub fn resume(&'static self) {
        let count = self.paused.swap(0, Ordering::Relaxed);
        for _ in 0..count {
            self.pause_sem.v();
        }
        self.pause_lock.unlock();
        log::debug!(target: "scheduling", "cluster {:p} resumed", self);
    }

    // ------------------------------------------------------------------
    // fork support
    // ------------------------------------------------------------------

    pub(crate) fn pre_fork_check(&self) {
        assert_eq!(
            self.worker_count(),
            1,
            "fork requires a single-worker cluster"
        );
    }

    /// Child-side re-initialization: poller threads/fibres did not
    /// survive the fork; build fresh ones.
    pub(crate) fn post_fork_reinit(&'static self) {
        self.make_pollers();
    }

    pub(crate) fn post_fork_start(&'static self) {
        self.start_polling();
    }
}

/// Body of a spawned worker thread: the thread's own context becomes the
/// idle fibre, the init fibre (if any) runs first via a direct switch.
fn run_worker(
    cluster: &'static Cluster,
    worker: &'static Worker,
    init: Option<Box<dyn FnOnce() + Send + 'static>>,
) {
    worker.record_sys_tid();
    let idle = NonNull::from(Box::leak(FibreInner::borrowed(worker)));
    worker.set_idle_fred(unsafe { &(*idle.as_ptr()).fred });
    context::install(idle.as_ptr() as *mut Fred, worker, cluster, cluster.event_scope());
    log::debug!(target: "threads", "worker {:p} online", worker);
    if let Some(f) = init {
        // Run the init fibre before any queued work can be picked up.
        let fred = fibre::make_detached(worker, f);
        fibre::idle_yield_to(fred);
    }
    worker.idle_loop();
}

unsafe extern "C" fn idle_main(worker: usize, _a2: usize, _a3: usize) {
    let worker = unsafe { &*(worker as *const Worker) };
    context::set_curr_fred(worker.idle_fred_raw());
    worker.idle_loop();
}
