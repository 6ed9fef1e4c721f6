//! Ensure timer shared by the loop thread and anybody calling `ensure_before`.
//!
//! The deadline, the prune tick and the stop flag live under one mutex; the
//! loop thread sleeps on the condvar until the earliest of them.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Cap on timer intervals, so configured values cannot overflow an `Instant`
const MAX_INTERVAL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn after(now: Instant, d: Duration) -> Instant {
    now + d.min(MAX_INTERVAL)
}

/// What woke the loop thread up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Ensure,
    Prune,
    Stop,
}

#[derive(Debug)]
struct Schedule {
    armed: bool,
    next: Instant,
    prune_interval: Option<Duration>,
    prune_next: Option<Instant>,
    stopping: bool,
}

#[derive(Debug)]
pub(crate) struct EnsureSchedule {
    inner: Mutex<Schedule>,
    wake: Condvar,
}

impl EnsureSchedule {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Schedule {
                armed: false,
                next: Instant::now(),
                prune_interval: None,
                prune_next: None,
                stopping: false,
            }),
            wake: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Schedule> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm the timer to fire after `first`. Returns false if it was already armed.
    pub(crate) fn arm(&self, first: Duration, prune_interval: Option<Duration>) -> bool {
        let mut s = self.lock();
        if s.armed {
            return false;
        }
        let now = Instant::now();
        s.armed = true;
        s.stopping = false;
        s.next = after(now, first);
        s.prune_interval = prune_interval;
        s.prune_next = prune_interval.map(|interval| after(now, interval));
        true
    }

    pub(crate) fn disarm(&self) {
        let mut s = self.lock();
        s.armed = false;
        s.prune_interval = None;
        s.prune_next = None;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.lock().armed
    }

    /// Push the deadline to `now + interval` and return it
    pub(crate) fn reset(&self, interval: Duration) -> Instant {
        let mut s = self.lock();
        s.next = after(Instant::now(), interval);
        s.next
    }

    pub(crate) fn next(&self) -> Instant {
        self.lock().next
    }

    /// Move the deadline earlier, never later.
    ///
    /// Panics if the timer was never armed.
    pub(crate) fn ensure_before(&self, d: Duration) {
        let mut s = self.lock();
        if !s.armed {
            panic!("cannot use EnsureBefore before Overlord::run_loop");
        }
        let now = Instant::now();
        // past the end of time is never earlier
        if let Some(next) = now.checked_add(d) {
            if next < s.next {
                s.next = next;
                self.wake.notify_all();
                return;
            }
        }
        if s.next < now {
            // fired but not yet picked up by the loop
            s.next = now;
            self.wake.notify_all();
        }
    }

    pub(crate) fn stop(&self) {
        let mut s = self.lock();
        s.stopping = true;
        self.wake.notify_all();
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.lock().stopping
    }

    /// Block until the deadline, the prune tick or a stop request
    pub(crate) fn wait(&self) -> Wake {
        let mut s = self.lock();
        loop {
            if s.stopping {
                return Wake::Stop;
            }
            let now = Instant::now();
            if let (Some(prune_next), Some(interval)) = (s.prune_next, s.prune_interval) {
                if now >= prune_next {
                    s.prune_next = Some(after(now, interval));
                    return Wake::Prune;
                }
            }
            if now >= s.next {
                return Wake::Ensure;
            }
            let until = match s.prune_next {
                Some(prune_next) => s.next.min(prune_next),
                None => s.next,
            };
            s = self
                .wake
                .wait_timeout(s, until - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
