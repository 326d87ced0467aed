//! # Rendezvous
//!
//! A one-shot single-producer / many-consumer barrier: one thread signals
//! once, any number of threads wait for it. The engine uses one to release
//! all workers at the same instant after initialization (the start
//! rendezvous in the shared channel), and tests use it to line threads up
//! on a race window.
//!
//! This is the condvar-plus-flag triplet; the flag guards against both
//! spurious wakeups and the signal-before-wait race.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub struct Rendezvous {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl Rendezvous {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Block until the event happens.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
    }

    /// Block until the event happens or `timeout` elapses. Returns whether
    /// the event happened.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if *signaled {
            return true;
        }
        self.condvar.wait_for(&mut signaled, timeout);
        *signaled
    }

    /// Notify all current and future waiters. Only one thread may call
    /// this, and only once.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        debug_assert!(!*signaled, "rendezvous signaled twice");
        *signaled = true;
        self.condvar.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn signal_before_wait_returns_immediately() {
        let r = Rendezvous::new();
        r.signal();
        r.wait();
        assert!(r.is_signaled());
    }

    #[test]
    fn wait_for_times_out_without_signal() {
        let r = Rendezvous::new();
        assert!(!r.wait_for(Duration::from_millis(10)));
    }

    #[test]
    fn many_waiters_release_together() {
        let r = Arc::new(Rendezvous::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let r = Arc::clone(&r);
                std::thread::spawn(move || {
                    r.wait();
                    true
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(20));
        r.signal();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
