/*
 * Timer Queue
 *
 * One per event scope: an ordered multimap from absolute deadline to
 * parked fibre. Whoever inserts the new earliest deadline (and whoever
 * drains expired entries) arms the master poller's timerfd for the next
 * relative timeout.
 *
 * Expiry and cancellation race through the fibres' `resume_info` slots:
 * `check_expiry` only removes and resumes entries whose race it wins;
 * entries it loses belong to the winning waker, and the woken fibre
 * removes its own map entry on the way out.
 */

use std::collections::BTreeMap;
use std::ops::Add;
use std::ptr::NonNull;
use std::time::Duration;

use spin::Mutex as SpinMutex;

use crate::context;
use crate::fibre::{Fred, SpinPolicy};

/// Absolute point on the timer clock (CLOCK_REALTIME, matching the
/// timerfd the master poller arms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Time(Duration);

impl Time {
    pub(crate) fn now() -> Time {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        }
        Time(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
    }

    pub(crate) fn saturating_since(self, earlier: Time) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs)
    }
}

struct TimerInner {
    queue: BTreeMap<(Time, u64), NonNull<Fred>>,
    seq: u64,
}

unsafe impl Send for TimerInner {}

pub(crate) struct TimerQueue {
    inner: SpinMutex<TimerInner>,
}

impl TimerQueue {
    pub(crate) fn new() -> TimerQueue {
        TimerQueue {
            inner: SpinMutex::new(TimerInner {
                queue: BTreeMap::new(),
                seq: 0,
            }),
        }
    }

    /// Token recorded in `resume_info` when the timer wins the race.
    pub(crate) fn token(&self) -> *mut () {
        self as *const TimerQueue as *mut ()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Reset after fork: the parent's pending entries belong to fibres
    /// that do not exist in the child.
    pub(crate) fn reinit(&self) {
        let mut g = self.inner.lock();
        g.queue.clear();
        g.seq = 0;
    }

    /// Park `fred` until `abs` passes or a competing waker wins.
    /// The caller must have armed the resume race already. Returns the
    /// winning token; equality with `self.token()` means the timer fired.
    pub(crate) fn block_until(&self, fred: &Fred, abs: Time) -> *mut () {
        let now = Time::now();
        let rel = abs.saturating_since(now).max(Duration::from_nanos(1));
        let key = {
            let mut g = self.inner.lock();
            let key = (abs, g.seq);
            g.seq += 1;
            g.queue
                .insert(key, unsafe { NonNull::new_unchecked(fred as *const Fred as *mut Fred) });
            let earliest = *g.queue.keys().next().expect("timer queue just filled");
            if earliest == key {
                // Armed under the lock so a racing insert cannot clobber
                // an earlier deadline with a later one.
                context::curr_scope().set_timer(rel);
            }
            key
        };
        log::debug!(target: "blocking", "fibre {:p} timed park {:?}", fred, rel);
        let winner = fred.suspend(SpinPolicy::none());
        if winner == self.token() {
            return winner; // expired; check_expiry removed the entry
        }
        // Cancelled by another waker; the entry is ours to clean up.
        self.inner.lock().queue.remove(&key);
        winner
    }

    /// Convenience for relative deadlines.
    pub(crate) fn block_timeout(&self, fred: &Fred, rel: Duration) -> *mut () {
        self.block_until(fred, Time::now() + rel)
    }

    /// Resume every entry whose deadline is at or before `now`; report the
    /// relative delay to the next pending entry, if any remain.
    pub(crate) fn check_expiry(&self, now: Time) -> Option<Duration> {
        let mut g = self.inner.lock();
        let mut due: Vec<(Time, u64)> = Vec::new();
        let mut next = None;
        for (&key, fred) in g.queue.iter() {
            if key.0 > now {
                next = Some(key.0.saturating_since(now));
                break;
            }
            if unsafe { fred.as_ref() }.race_resume(self.token()) {
                due.push(key);
            }
            // Lost races stay in the map; the winning waker's fibre
            // removes its own entry.
        }
        let mut count = 0usize;
        for key in due {
            let fred = g.queue.remove(&key).expect("expired entry vanished");
            unsafe { fred.as_ref() }.resume();
            count += 1;
        }
        drop(g);
        if count > 0 {
            log::debug!(target: "blocking", "timer expired {} entries", count);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_ordering() {
        let a = Time(Duration::from_millis(5));
        let b = a + Duration::from_millis(3);
        assert!(b > a);
        assert_eq!(b.saturating_since(a), Duration::from_millis(3));
        assert_eq!(a.saturating_since(b), Duration::ZERO);
    }

    #[test]
    fn multimap_keys_are_unique_per_deadline() {
        // Two entries with identical deadlines must coexist; the sequence
        // component keeps BTreeMap keys distinct.
        let t = Time(Duration::from_secs(1));
        let mut map: BTreeMap<(Time, u64), usize> = BTreeMap::new();
        map.insert((t, 0), 1);
        map.insert((t, 1), 2);
        assert_eq!(map.len(), 2);
        let first = map.keys().next().copied().unwrap();
        assert_eq!(first, (t, 0));
    }
}
