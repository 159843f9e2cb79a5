//! One-shot signals for session lifecycle and loop cancellation.
//!
//! A `Signal` is edge-triggered and single-shot: once raised it stays
//! raised, and every current and future waiter observes it. Sessions use
//! one each for `ready`, `established` and `done`, and the background
//! loops take one as a cancellation token.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Default)]
pub struct Signal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    fired: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Signal::default()
    }

    /// Raise the signal, waking every waiter. Idempotent.
    pub fn set(&self) {
        let mut fired = self.inner.fired.lock();
        if !*fired {
            *fired = true;
            self.inner.condvar.notify_all();
        }
    }

    pub fn is_set(&self) -> bool {
        *self.inner.fired.lock()
    }

    /// Block until the signal is raised.
    pub fn wait(&self) {
        let mut fired = self.inner.fired.lock();
        while !*fired {
            self.inner.condvar.wait(&mut fired);
        }
    }

    /// Block until the signal is raised or `timeout` elapses.
    /// Returns true if the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut fired = self.inner.fired.lock();
        if *fired {
            return true;
        }
        self.inner.condvar.wait_for(&mut fired, timeout);
        *fired
    }
}
