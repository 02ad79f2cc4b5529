/*
 * Pollers
 *
 * All pollers wrap one edge-triggered epoll instance plus an eventfd
 * waker and feed readiness into the descriptor registry. Variants:
 *
 * - MasterPoller: one dedicated OS thread per event scope; owns the
 *   timerfd driving the timer queue and parks cluster-poller epoll fds
 *   with ONESHOT registrations.
 * - ClusterPoller: per cluster. By default a low-priority background
 *   fibre that polls without blocking and, when idle, parks on its own
 *   epoll fd through the master poller; the `poller-thread` feature
 *   turns it into a dedicated blocking thread instead.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bitflags::bitflags;

use crate::context;
use crate::event_scope::EventScope;
#[cfg(not(feature = "poller-thread"))]
use crate::fibre::{self, Fibre, Priority};
use crate::io::Side;
use crate::sched::cluster::Cluster;
use crate::timer::Time;
use crate::utils::sys;

bitflags! {
    /// Readiness interest bits, expressed directly in epoll terms.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct PollFlags: u32 {
        const INPUT =
            (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32;
        const OUTPUT = libc::EPOLLOUT as u32;
    }
}

const INPUT_EVENTS: u32 = (libc::EPOLLIN
    | libc::EPOLLPRI
    | libc::EPOLLRDHUP
    | libc::EPOLLHUP
    | libc::EPOLLERR) as u32;
const OUTPUT_EVENTS: u32 = (libc::EPOLLOUT | libc::EPOLLERR) as u32;

/// Events drained per poll round.
pub(crate) const MAX_POLL: usize = 1024;

pub(crate) struct BasePoller {
    epfd: libc::c_int,
    waker: libc::c_int,
    terminate: AtomicBool,
    scope: &'static EventScope,
}

impl BasePoller {
    fn new(scope: &'static EventScope) -> BasePoller {
        let epfd = sys::check(
            unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) },
            "epoll_create1",
        );
        let waker = sys::check(
            unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) },
            "eventfd",
        );
        let poller = BasePoller {
            epfd,
            waker,
            terminate: AtomicBool::new(false),
            scope,
        };
        poller.setup_fd(waker, PollFlags::INPUT, false);
        log::debug!(target: "polling", "poller {:p}: epoll {} waker {}", &poller, epfd, waker);
        poller
    }

    pub(crate) fn epfd(&self) -> libc::c_int {
        self.epfd
    }

    /// Arm (or re-arm with `modify`) edge-triggered readiness for `fd`.
    pub(crate) fn setup_fd(&self, fd: libc::c_int, flags: PollFlags, modify: bool) {
        log::debug!(target: "polling",
            "poller {:p}: register fd {} for {:?} (mod={})", self, fd, flags, modify);
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | flags.bits(),
            u64: fd as u64,
        };
        let op = if modify {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        sys::check(
            unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) },
            "epoll_ctl",
        );
    }

    /// One-shot variant: level-triggered, auto-disarmed after one event.
    pub(crate) fn setup_fd_oneshot(&self, fd: libc::c_int, flags: PollFlags, modify: bool) {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLONESHOT as u32 | flags.bits(),
            u64: fd as u64,
        };
        let op = if modify {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        sys::check(
            unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) },
            "epoll_ctl(oneshot)",
        );
    }

    /// Best-effort removal.
    pub(crate) fn reset_fd(&self, fd: libc::c_int) {
        unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    fn poll(&self, blocking: bool, events: &mut [libc::epoll_event]) -> usize {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                if blocking { -1 } else { 0 },
            )
        };
        if n < 0 {
            debug_assert_eq!(sys::errno(), libc::EINTR);
            return 0;
        }
        n as usize
    }

    fn notify_all(&self, events: &[libc::epoll_event], count: usize) {
        for ev in &events[..count] {
            let fd = ev.u64 as libc::c_int;
            if fd == self.waker {
                let mut val = 0u64;
                unsafe {
                    libc::read(self.waker, &mut val as *mut u64 as *mut libc::c_void, 8);
                }
                continue;
            }
            if ev.events & INPUT_EVENTS != 0 {
                self.scope.unblock_fd(fd, Side::Input);
            }
            if ev.events & OUTPUT_EVENTS != 0 {
                self.scope.unblock_fd(fd, Side::Output);
            }
        }
        if count > 0 {
            log::debug!(target: "polling", "poller {:p}: {} events", self, count);
        }
    }

    fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.waker, &val as *const u64 as *const libc::c_void, 8);
        }
    }
}

impl Drop for BasePoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.waker);
            libc::close(self.epfd);
        }
    }
}

/// Scope-wide poller thread: timer handling plus oneshot parking for
/// cluster pollers.
pub(crate) struct MasterPoller {
    base: BasePoller,
    timer_fd: libc::c_int,
}

impl MasterPoller {
    pub(crate) fn new_leaked(scope: &'static EventScope) -> &'static MasterPoller {
        let base = BasePoller::new(scope);
        let timer_fd = sys::check(
            unsafe {
                libc::timerfd_create(
                    libc::CLOCK_REALTIME,
                    libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
                )
            },
            "timerfd_create",
        );
        base.setup_fd(timer_fd, PollFlags::INPUT, false);
        Box::leak(Box::new(MasterPoller { base, timer_fd }))
    }

    pub(crate) fn start(&'static self) {
        let _ = std::thread::Builder::new()
            .name("strand-master-poller".into())
            .spawn(move || {
                context::install_fake(self.base.scope);
                let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_POLL];
                while !self.base.terminate.load(Ordering::Acquire) {
                    self.pre_poll();
                    let n = self.base.poll(true, &mut events);
                    self.base.notify_all(&events, n);
                }
            })
            .expect("master poller thread creation failed");
    }

    /// Consume a pending timer tick before blocking again.
    fn pre_poll(&self) {
        if self.base.scope.try_consume_ready(self.timer_fd) {
            let mut ticks = 0u64;
            unsafe {
                libc::read(
                    self.timer_fd,
                    &mut ticks as *mut u64 as *mut libc::c_void,
                    8,
                );
            }
            self.base.scope.check_timers(Time::now());
        }
    }

    /// Arm the scope timer for a relative timeout.
    pub(crate) fn set_timer(&self, rel: Duration) {
        let tval = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: rel.as_secs() as libc::time_t,
                tv_nsec: rel.subsec_nanos() as libc::c_long,
            },
        };
        sys::check(
            unsafe { libc::timerfd_settime(self.timer_fd, 0, &tval, std::ptr::null_mut()) },
            "timerfd_settime",
        );
    }

    /// Hierarchical parking: watch another poller's epoll fd, one event
    /// per arm.
    pub(crate) fn setup_poll_fd(&self, fd: libc::c_int, modify: bool) {
        self.base.setup_fd_oneshot(fd, PollFlags::INPUT, modify);
    }

    pub(crate) fn shutdown(&self) {
        self.base.terminate.store(true, Ordering::Release);
        self.base.wake();
    }
}

/// Per-cluster poller converting readiness into fibre resumes.
pub(crate) struct ClusterPoller {
    base: BasePoller,
}

impl ClusterPoller {
    pub(crate) fn new_leaked(scope: &'static EventScope) -> &'static ClusterPoller {
        Box::leak(Box::new(ClusterPoller {
            base: BasePoller::new(scope),
        }))
    }

    pub(crate) fn base(&self) -> &BasePoller {
        &self.base
    }

    /// Background-fibre variant: poll non-blockingly; when a round comes
    /// up empty, park on our epoll fd via the master poller.
    #[cfg(not(feature = "poller-thread"))]
    pub(crate) fn start(&'static self, cluster: &'static Cluster) {
        let scope = self.base.scope;
        Fibre::builder()
            .on_worker(cluster.staging())
            .priority(Priority::Low)
            .spawn(move || {
                scope.register_poll_fd(self.base.epfd);
                let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_POLL];
                loop {
                    let n = self.base.poll(false, &mut events);
                    if n > 0 {
                        self.base.notify_all(&events, n);
                        fibre::yield_global();
                    } else {
                        scope.block_poll_fd(self.base.epfd);
                    }
                }
            })
            .detach();
    }

    /// Dedicated-thread variant.
    #[cfg(feature = "poller-thread")]
    pub(crate) fn start(&'static self, _cluster: &'static Cluster) {
        let _ = std::thread::Builder::new()
            .name("strand-poller".into())
            .spawn(move || {
                context::install_fake(self.base.scope);
                let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_POLL];
                while !self.base.terminate.load(Ordering::Acquire) {
                    let n = self.base.poll(true, &mut events);
                    self.base.notify_all(&events, n);
                }
            })
            .expect("cluster poller thread creation failed");
    }
}
