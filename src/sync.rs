//! Blocking rendezvous for driver code
//!
//! Completion callbacks run on runtime worker threads. Code that drives a
//! sequence of calls from a plain thread blocks on a [`Rendezvous`] until
//! the callbacks have fired.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A countdown guarded by a mutex and condition variable
///
/// Each `arrive` decrements the count under the lock and notifies after the
/// mutation; `wait` returns once the count reaches zero.
#[derive(Debug)]
pub struct Rendezvous {
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl Rendezvous {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Record one arrival. Extra arrivals past zero are ignored.
    pub fn arrive(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.cond.notify_all();
        }
    }

    /// Block until every party has arrived
    pub fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.cond.wait(&mut remaining);
        }
    }

    /// Block until every party has arrived or `timeout` elapses.
    /// Returns `true` when the count reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            if self.cond.wait_until(&mut remaining, deadline).timed_out() {
                return *remaining == 0;
            }
        }
        true
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.lock()
    }
}
