/*
 * Event Scope
 *
 * An event scope is an I/O isolation domain: it owns the descriptor
 * registry (sized by RLIMIT_NOFILE), the master poller and its timerfd,
 * the scope-global timer queue, the main cluster, and an optional disk
 * cluster for unpollable I/O.
 *
 * Bootstrap turns the calling thread into the first worker of the main
 * cluster; its context becomes the main fibre. A cloned scope starts
 * with one fresh worker that unshares the kernel descriptor table
 * (Linux) before initializing the scope's I/O state.
 *
 * Scopes and their clusters are leaked: every fibre, poller, and parked
 * worker holds references for the life of the process.
 */

use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;

use spin::Mutex as SpinMutex;

use crate::config::Config;
use crate::context;
use crate::fibre::{self, Fibre, FibreInner};
use crate::io::poller::{ClusterPoller, MasterPoller, PollFlags};
use crate::io::registry::FdRegistry;
use crate::io::Side;
use crate::sched::cluster::Cluster;
use crate::timer::{Time, TimerQueue};
use crate::utils::{logger, sys};

lazy_static::lazy_static! {
    static ref DEFAULT_SCOPE: SpinMutex<Option<&'static EventScope>> = SpinMutex::new(None);
}

/// The process-default scope installed by the first `bootstrap`.
pub fn default_scope() -> Option<&'static EventScope> {
    *DEFAULT_SCOPE.lock()
}

pub struct EventScope {
    registry: spin::Once<FdRegistry>,
    master: SpinMutex<Option<&'static MasterPoller>>,
    timer_queue: TimerQueue,
    main_cluster: spin::Once<&'static Cluster>,
    disk_cluster: SpinMutex<Option<&'static Cluster>>,
    main_fibre: SpinMutex<Option<Fibre>>,
    main_inner: AtomicPtr<FibreInner>,
    client_data: AtomicPtr<()>,
    default_pollers: usize,
}

impl EventScope {
    fn empty(default_pollers: usize) -> EventScope {
        EventScope {
            registry: spin::Once::new(),
            master: SpinMutex::new(None),
            timer_queue: TimerQueue::new(),
            main_cluster: spin::Once::new(),
            disk_cluster: SpinMutex::new(None),
            main_fibre: SpinMutex::new(None),
            main_inner: AtomicPtr::new(ptr::null_mut()),
            client_data: AtomicPtr::new(ptr::null_mut()),
            default_pollers,
        }
    }

    /// Bootstrap the runtime: create the scope and its main cluster,
    /// register the calling thread as the first worker, start additional
    /// workers and the pollers. Environment overrides apply (see
    /// `config`).
    pub fn bootstrap(poller_count: usize, worker_count: usize) -> &'static EventScope {
        logger::init();
        let cfg = Config::from_env(poller_count, worker_count);
        let scope: &'static EventScope = Box::leak(Box::new(EventScope::empty(cfg.default_pollers)));
        let cluster = Cluster::new_in(scope, cfg.poller_count);
        scope.main_cluster.call_once(|| cluster);
        let main = cluster.register_worker();
        scope.main_inner.store(main.as_ptr(), Ordering::Release);
        if cfg.worker_count > 1 {
            cluster.add_workers(cfg.worker_count - 1);
        }
        scope.init_io();
        let _ = DEFAULT_SCOPE.lock().get_or_insert(scope);
        log::debug!(target: "basic",
            "scope {:p} bootstrapped: {} workers, {} pollers",
            scope, cfg.worker_count, cfg.poller_count);
        scope
    }

    /// Create a scope with its own single-worker cluster and (on Linux) a
    /// private kernel descriptor table; `main` runs as its main fibre.
    pub fn clone_scope<F>(&'static self, main: F) -> &'static EventScope
    where
        F: FnOnce() + Send + 'static,
    {
        let dp = self.default_pollers;
        let scope: &'static EventScope = Box::leak(Box::new(EventScope::empty(dp)));
        let cluster = Cluster::new_in(scope, dp);
        scope.main_cluster.call_once(|| cluster);
        cluster.add_worker_init(Some(Box::new(move || {
            unsafe {
                libc::unshare(libc::CLONE_FILES);
            }
            scope.init_io();
        })));
        let fib = Fibre::builder().on_cluster(cluster).spawn(main);
        *scope.main_fibre.lock() = Some(fib);
        scope
    }

    /// Wait for a cloned scope's main fibre.
    pub fn join(&self) {
        let fib = { self.main_fibre.lock().take() };
        if let Some(f) = fib {
            f.join();
        }
    }

    fn init_io(&'static self) {
        let mut rl = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        sys::check(
            unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) },
            "getrlimit",
        );
        // Firm up the soft limit; the registry is indexed by fd number.
        rl.rlim_max = rl.rlim_cur;
        sys::check(
            unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rl) },
            "setrlimit",
        );
        self.registry.call_once(|| FdRegistry::new(rl.rlim_cur as usize));
        let master = MasterPoller::new_leaked(self);
        *self.master.lock() = Some(master);
        master.start();
        self.main_cluster().start_polling();
    }

    pub(crate) fn registry(&self) -> &FdRegistry {
        self.registry.get().expect("event scope I/O not initialized")
    }

    pub fn main_cluster(&self) -> &'static Cluster {
        *self.main_cluster.get().expect("event scope has no cluster")
    }

    pub(crate) fn default_pollers(&self) -> usize {
        self.default_pollers
    }

    fn master(&self) -> &'static MasterPoller {
        self.master.lock().expect("master poller not running")
    }

    fn poller_for(&self, fd: libc::c_int) -> &'static ClusterPoller {
        context::curr_cluster().poller_for(fd)
    }

    // ------------------------------------------------------------------
    // scope-local data
    // ------------------------------------------------------------------

    pub fn set_client_data(&self, data: *mut ()) {
        self.client_data.store(data, Ordering::Release);
    }

    pub fn client_data(&self) -> *mut () {
        self.client_data.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // timers
    // ------------------------------------------------------------------

    pub(crate) fn timer_queue(&self) -> &TimerQueue {
        &self.timer_queue
    }

    pub(crate) fn set_timer(&self, rel: Duration) {
        self.master().set_timer(rel);
    }

    pub(crate) fn check_timers(&self, now: Time) {
        if let Some(next) = self.timer_queue.check_expiry(now) {
            self.set_timer(next);
        }
    }

    // ------------------------------------------------------------------
    // descriptor registration
    // ------------------------------------------------------------------

    /// Register interest bits for `fd` with its cluster poller. Under the
    /// lazy policy this happens on the first EAGAIN (`now` distinguishes
    /// the deferred creation-time calls, which are no-ops). Returns true
    /// when the registration actually changed.
    #[cfg(not(feature = "oneshot-registration"))]
    pub(crate) fn register_fd(&'static self, fd: libc::c_int, flags: PollFlags, now: bool) -> bool {
        if !now {
            return false;
        }
        let entry = match self.registry().entry(fd) {
            Some(e) => e,
            None => return false,
        };
        let mut reg = entry.reg.lock();
        if reg.bits.contains(flags) {
            return false;
        }
        reg.bits |= flags;
        let bits = reg.bits;
        match reg.poller {
            Some(p) => p.base().setup_fd(fd, bits, true),
            None => {
                let p = self.poller_for(fd);
                p.base().setup_fd(fd, bits, false);
                reg.poller = Some(p);
            }
        }
        true
    }

    /// One-shot policy: arm a single notification for both sides; the
    /// waiter re-arms before every blocking wait (serialized by the
    /// per-side mutex; both sides are armed so a MOD from one side never
    /// drops the other's interest).
    #[cfg(feature = "oneshot-registration")]
    pub(crate) fn register_fd_oneshot(&'static self, fd: libc::c_int) {
        let entry = match self.registry().entry(fd) {
            Some(e) => e,
            None => return,
        };
        let modify = entry.poll_mod.swap(true, Ordering::SeqCst);
        self.poller_for(fd)
            .base()
            .setup_fd_oneshot(fd, PollFlags::INPUT | PollFlags::OUTPUT, modify);
    }

    /// Creation-time registration: a real registration under the eager
    /// policy, a no-op otherwise.
    pub(crate) fn register_fd_on_create(&'static self, fd: libc::c_int) {
        #[cfg(feature = "eager-registration")]
        {
            self.register_fd(fd, PollFlags::INPUT | PollFlags::OUTPUT, true);
        }
        #[cfg(not(feature = "eager-registration"))]
        {
            let _ = fd;
        }
    }

    /// Listen sockets only ever need input-side readiness.
    pub(crate) fn register_server_fd(&'static self, fd: libc::c_int) {
        #[cfg(feature = "eager-registration")]
        {
            self.register_fd(fd, PollFlags::INPUT, true);
        }
        #[cfg(not(feature = "eager-registration"))]
        {
            let _ = fd;
        }
    }

    /// Close-side teardown; the kernel drops the epoll membership with
    /// the descriptor itself.
    pub(crate) fn deregister_fd(&'static self, fd: libc::c_int) {
        if let Some(entry) = self.registry().entry(fd) {
            entry.reset();
        }
    }

    /// Await an in-progress bind/connect on the write side, then collect
    /// the outcome from SO_ERROR.
    pub(crate) fn check_async_completion(&'static self, fd: libc::c_int) -> io::Result<()> {
        #[cfg(not(feature = "oneshot-registration"))]
        self.register_fd(fd, PollFlags::INPUT | PollFlags::OUTPUT, true);
        #[cfg(feature = "oneshot-registration")]
        self.register_fd_oneshot(fd);

        let entry = self
            .registry()
            .entry(fd)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        entry.sem(Side::Output).p();

        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        sys::cvt(unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        })?;

        // Revert to lazy bookkeeping; the connection-established event
        // set is wrong for the data phase.
        #[cfg(not(any(feature = "eager-registration", feature = "oneshot-registration")))]
        {
            let mut reg = entry.reg.lock();
            if let Some(p) = reg.poller.take() {
                p.base().reset_fd(fd);
            }
            reg.bits = PollFlags::empty();
        }

        if err != 0 {
            return Err(io::Error::from_raw_os_error(err));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // poller plumbing
    // ------------------------------------------------------------------

    /// Readiness notification: signal the per-fd semaphore for `side`.
    pub(crate) fn unblock_fd(&self, fd: libc::c_int, side: Side) {
        if let Some(entry) = self.registry().entry(fd) {
            entry.sem(side).v();
        }
    }

    /// Non-blocking claim of a pending readiness signal (timerfd path).
    pub(crate) fn try_consume_ready(&self, fd: libc::c_int) -> bool {
        self.registry()
            .entry(fd)
            .map(|e| e.sem(Side::Input).try_p())
            .unwrap_or(false)
    }

    /// First-time ONESHOT registration of a cluster poller's epoll fd
    /// with the master poller.
    pub(crate) fn register_poll_fd(&self, fd: libc::c_int) {
        self.master().setup_poll_fd(fd, false);
    }

    /// Park a cluster-poller fibre until its epoll fd has events.
    pub(crate) fn block_poll_fd(&self, fd: libc::c_int) {
        self.master().setup_poll_fd(fd, true);
        if let Some(entry) = self.registry().entry(fd) {
            entry.sem(Side::Input).p();
        }
    }

    // ------------------------------------------------------------------
    // disk cluster
    // ------------------------------------------------------------------

    /// Create the disk cluster used by `direct_io`.
    pub fn add_disk_cluster(&'static self, workers: usize) -> &'static Cluster {
        let cluster = Cluster::new_in(self, 1);
        cluster.start_polling();
        cluster.add_workers(workers.max(1));
        let mut slot = self.disk_cluster.lock();
        assert!(slot.is_none(), "disk cluster already exists");
        *slot = Some(cluster);
        cluster
    }

    /// Run `f` on the disk cluster, migrating the calling fibre there and
    /// back again.
    pub fn direct_io<T>(&'static self, f: impl FnOnce() -> T) -> T {
        let disk = { *self.disk_cluster.lock() }.expect("no disk cluster in this scope");
        let prev = fibre::migrate_for_io(disk);
        let result = f();
        fibre::migrate_to_worker(prev);
        result
    }

    // ------------------------------------------------------------------
    // fork support
    // ------------------------------------------------------------------

    /// Fork is only defined for a quiesced single-worker scope.
    pub fn pre_fork(&'static self) {
        if let Some(main) = self.main_fred() {
            assert!(
                ptr::eq(context::curr_fred(), main.as_ptr() as *mut _),
                "fork from a non-main fibre"
            );
        }
        assert!(
            self.timer_queue.is_empty(),
            "fork with pending timed waits"
        );
        assert!(
            self.disk_cluster.lock().is_none(),
            "fork with a disk cluster"
        );
        self.main_cluster().pre_fork_check();
    }

    /// Child-side re-initialization: fresh master poller and cluster
    /// pollers (threads and poller fibres do not survive the fork).
    pub fn post_fork(&'static self) {
        self.timer_queue.reinit();
        // The parent's poller threads do not exist in the child; retire
        // the old master object and build a fresh one.
        if let Some(old) = self.master.lock().take() {
            old.shutdown();
        }
        let master = MasterPoller::new_leaked(self);
        *self.master.lock() = Some(master);
        master.start();
        let cluster = self.main_cluster();
        cluster.post_fork_reinit();
        let registry = self.registry();
        for fd in 0..registry.count() as libc::c_int {
            if let Some(e) = registry.entry(fd) {
                debug_assert!(e.sem_value(Side::Input) >= 0);
                debug_assert!(e.sem_value(Side::Output) >= 0);
                // Pre-fork registrations refer to the parent's epoll
                // sets; force re-registration against the new pollers.
                #[cfg(not(feature = "oneshot-registration"))]
                {
                    let mut reg = e.reg.lock();
                    reg.bits = PollFlags::empty();
                    reg.poller = None;
                }
                #[cfg(feature = "oneshot-registration")]
                e.poll_mod.store(false, Ordering::Relaxed);
            }
        }
        cluster.post_fork_start();
    }

    /// Fork the process with runtime bracketing (pre_fork / post_fork in
    /// the child).
    pub fn fork(&'static self) -> io::Result<libc::pid_t> {
        self.pre_fork();
        let pid = sys::cvt(unsafe { libc::fork() })?;
        if pid == 0 {
            self.post_fork();
        }
        Ok(pid)
    }

    pub(crate) fn main_fred(&self) -> Option<NonNull<FibreInner>> {
        NonNull::new(self.main_inner.load(Ordering::Acquire))
    }
}
