//! Teardown coordination for one handle: `Live → Draining → Destroyed`.
//!
//! Every host operation and every callback dispatch holds an in-flight slot
//! while it touches the handle. Release of the engine and the slot table
//! happens exactly once, when the handle is Draining, the delivery worker has
//! finished and no slot is held. Whoever observes that condition first, with
//! permission to release, wins the Draining→Destroyed transition and
//! performs the release.

use crate::bridge::handle::EngineHandle;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::time::Duration;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting operations and events
    Live,
    /// Destroy in progress; only already-accepted work is delivered
    Draining,
    /// Resources released
    Destroyed,
}

#[derive(Debug)]
struct TeardownState {
    lifecycle: Lifecycle,
    /// Operations and dispatches currently holding the handle
    inflight: usize,
    /// Shutdown marker has been queued, so nothing else may be enqueued
    sealed: bool,
    /// Delivery worker has processed the shutdown marker
    worker_done: bool,
    /// Release must be performed by whoever makes the handle idle
    release_on_idle: bool,
}

impl TeardownState {
    fn is_idle(&self) -> bool {
        self.inflight == 0 && self.worker_done
    }

    /// Claims the Draining→Destroyed transition if the handle is idle.
    fn claim_release(&mut self) -> bool {
        if self.lifecycle == Lifecycle::Draining && self.is_idle() {
            self.lifecycle = Lifecycle::Destroyed;
            true
        } else {
            false
        }
    }
}

pub(crate) struct Teardown {
    state: Mutex<TeardownState>,
    idle: Condvar,
}

impl Default for Teardown {
    fn default() -> Self {
        Self {
            state: Mutex::new(TeardownState {
                lifecycle: Lifecycle::Live,
                inflight: 0,
                sealed: false,
                worker_done: false,
                release_on_idle: false,
            }),
            idle: Condvar::new(),
        }
    }
}

impl Teardown {
    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    /// Takes an in-flight slot. Draining is only admitted for delivery of
    /// work that was accepted before destroy.
    pub(crate) fn try_enter(&self, allow_draining: bool) -> bool {
        let mut st = self.state.lock();
        let admitted = match st.lifecycle {
            Lifecycle::Live => true,
            Lifecycle::Draining => allow_draining,
            Lifecycle::Destroyed => false,
        };
        if admitted {
            st.inflight += 1;
        }
        admitted
    }

    /// Gives an in-flight slot back. Returns `true` if the caller must release.
    pub(crate) fn exit(&self) -> bool {
        let mut st = self.state.lock();
        st.inflight = st.inflight.saturating_sub(1);
        if st.is_idle() {
            self.idle.notify_all();
        }
        st.release_on_idle && st.claim_release()
    }

    /// Runs `f` only while the handle still accepts new work, atomically with
    /// respect to [`Teardown::seal`].
    pub(crate) fn with_intake<R>(&self, allow_draining: bool, f: impl FnOnce() -> R) -> Option<R> {
        let st = self.state.lock();
        let open = !st.sealed
            && match st.lifecycle {
                Lifecycle::Live => true,
                Lifecycle::Draining => allow_draining,
                Lifecycle::Destroyed => false,
            };
        open.then(f)
    }

    /// Live → Draining. Returns `false` if the handle was not live.
    pub(crate) fn begin_drain(&self) -> bool {
        let mut st = self.state.lock();
        if st.lifecycle != Lifecycle::Live {
            return false;
        }
        st.lifecycle = Lifecycle::Draining;
        true
    }

    /// Closes intake. `f` runs under the same lock, so nothing can be enqueued
    /// between it and the seal.
    pub(crate) fn seal<R>(&self, f: impl FnOnce() -> R) -> R {
        let mut st = self.state.lock();
        st.sealed = true;
        f()
    }

    /// The delivery worker has drained its queue. Returns `true` if the
    /// caller must release.
    pub(crate) fn worker_finished(&self) -> bool {
        let mut st = self.state.lock();
        st.worker_done = true;
        if st.is_idle() {
            self.idle.notify_all();
        }
        st.release_on_idle && st.claim_release()
    }

    /// Hands release over to whoever makes the handle idle. Returns `true` if
    /// it is idle already and the caller must release right away.
    pub(crate) fn defer_release(&self) -> bool {
        let mut st = self.state.lock();
        st.release_on_idle = true;
        st.claim_release()
    }

    /// Waits until the handle is idle, at most `timeout`. On success the
    /// caller owns the release. On timeout release is deferred to whoever
    /// makes the handle idle later, and `false` is returned.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let mut st = self.state.lock();
        let _ = self.idle.wait_while_for(&mut st, |st| !st.is_idle(), timeout);

        if st.claim_release() {
            return true;
        }
        st.release_on_idle = true;
        false
    }
}

thread_local! {
    /// Handles the current thread holds an in-flight slot for.
    static ACTIVE: RefCell<Vec<EngineHandle>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn mark_active(handle: EngineHandle) {
    ACTIVE.with(|a| a.borrow_mut().push(handle));
}

pub(crate) fn unmark_active(handle: EngineHandle) {
    ACTIVE.with(|a| {
        let mut active = a.borrow_mut();
        if let Some(pos) = active.iter().rposition(|h| *h == handle) {
            active.remove(pos);
        }
    });
}

/// Is the current thread inside an operation or callback of `handle`?
pub(crate) fn is_active(handle: EngineHandle) -> bool {
    ACTIVE.with(|a| a.borrow().contains(&handle))
}
