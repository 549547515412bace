//! ---
//! xmq_section: "01-core-functionality"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Shared primitives and utilities for the messaging runtime."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

/// Cooperative stop signal shared between a worker thread and its owner.
///
/// Clones observe the same flag. Waiting on the token returns as soon as it is
/// cancelled, which lets blocking receive loops bail out promptly.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter.
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Sleep for up to `timeout`, returning early with `true` once cancelled.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self
                .inner
                .signal
                .wait_until(&mut cancelled, deadline)
                .timed_out()
            {
                break;
            }
        }
        *cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_times_out_when_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.wait_for(Duration::from_millis(10)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_wakes_waiter_from_other_thread() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = thread::spawn(move || waiter.wait_for(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        token.cancel();
        assert!(handle.join().expect("waiter thread"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
