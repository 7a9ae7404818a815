use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct Shared {
    state: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// A one-shot flag that threads can wait on.
#[derive(Clone)]
pub struct DetachFlag(Arc<Shared>);

impl DetachFlag {
    pub fn new() -> Self {
        Self(Arc::new(Shared {
            state: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }))
    }

    pub fn raise(&self) {
        // The lock is held across the store so that a waiter cannot check the
        // flag, miss the store, and then sleep past the wakeup.
        let _guard = self.0.lock.lock();
        self.0.state.store(true, Ordering::Release);
        self.0.cond.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        self.0.state.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        let _guard = self.0.lock.lock();
        self.0.state.store(false, Ordering::Release);
    }

    /// Block until the flag is raised.
    pub fn wait(&self) {
        let mut guard = self.0.lock.lock();
        while !self.is_raised() {
            self.0.cond.wait(&mut guard);
        }
    }

    /// Block until the flag is raised or `timeout` elapses. Returns whether
    /// the flag was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.0.lock.lock();
        if self.is_raised() {
            return true;
        }

        self.0.cond.wait_for(&mut guard, timeout);
        self.is_raised()
    }
}

impl Default for DetachFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that raises a [`DetachFlag`] when dropped.
pub struct DetachGuard<'a>(&'a DetachFlag);

impl<'a> DetachGuard<'a> {
    pub fn new(flag: &'a DetachFlag) -> Self {
        Self(flag)
    }
}

impl<'a> Drop for DetachGuard<'a> {
    fn drop(&mut self) {
        if !self.0.is_raised() {
            tracing::warn!("runner thread shutting down without the detach flag being raised");
        }

        self.0.raise();
    }
}

struct SignalShared {
    raised: AtomicBool,
    waiters: Mutex<Vec<crate::operation::OperationId>>,
}

/// A one-shot flag for controlled code.
///
/// Unlike [`DetachFlag`], which parks OS threads, waiting on a `Signal`
/// blocks the calling operation on a user-visible resource, so the wait is
/// part of the explored schedule: an unraised signal everyone waits on is a
/// detectable deadlock.
#[derive(Clone)]
pub struct Signal(Arc<SignalShared>);

impl Signal {
    pub fn new() -> Self {
        Self(Arc::new(SignalShared {
            raised: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
        }))
    }

    pub fn is_raised(&self) -> bool {
        self.0.raised.load(Ordering::Acquire)
    }

    /// Raise the signal, waking every operation blocked in
    /// [`wait`](Self::wait). This is a scheduling point.
    pub fn raise(&self, rt: &crate::Runtime) {
        self.0.raised.store(true, Ordering::Release);

        let waiters: Vec<_> = std::mem::take(&mut *self.0.waiters.lock());
        for op in waiters {
            rt.signal_resource_waiter(op);
        }

        rt.explore_context_switch();
    }

    /// Block the current operation until the signal is raised. Returns
    /// immediately (through a scheduling point) if it already is.
    pub fn wait(&self, rt: &crate::Runtime) {
        if self.is_raised() {
            rt.explore_context_switch();
            return;
        }

        // No scheduling point separates the check above from the
        // registration below, so a raise cannot slip in between.
        rt.block_current_on_resource(|op| self.0.waiters.lock().push(op));
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}
