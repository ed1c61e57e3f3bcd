//! Signal watching: registered interest in a pipe's signal-state changes.
//!
//! The registry is guarded by a lock that may be held while deciding which
//! watchers to notify. Watcher callbacks are arbitrary user code that may
//! re-enter this module, so they must never run under that lock; everything
//! callback-shaped is deferred through the thread-local [`RequestContext`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::request_context::RequestContext;

/// Snapshot of a pipe's signal state at notification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalsState {
    pub readable: bool,
    pub writable: bool,
    pub peer_closed: bool,
}

impl SignalsState {
    /// Snapshot for a pipe whose peer end has gone away.
    pub fn peer_closed() -> Self {
        Self {
            peer_closed: true,
            ..Self::default()
        }
    }
}

/// Result code delivered to a watch callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchResult {
    Ok,
    Cancelled,
}

pub type WatchCallback = Box<dyn Fn(WatchResult, SignalsState) + Send + Sync>;

/// A registered interest in signal-state transitions. Shared between the
/// registry and any queued finalizers; cancelable at any time.
pub struct Watcher {
    id: u64,
    callback: WatchCallback,
    armed: AtomicBool,
}

impl Watcher {
    fn new(id: u64, callback: WatchCallback) -> Arc<Self> {
        Arc::new(Self {
            id,
            callback,
            armed: AtomicBool::new(true),
        })
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Disarm, returning whether the watcher was armed before the call.
    /// Takes effect immediately: an already-queued notify observes this.
    pub(crate) fn disarm(&self) -> bool {
        self.armed.swap(false, Ordering::AcqRel)
    }

    /// Invoke the callback unless the watcher was canceled after this
    /// notification was queued. The armed check happens immediately before
    /// the call.
    pub(crate) fn notify(&self, result: WatchResult, state: SignalsState) {
        if self.is_armed() {
            (self.callback)(result, state);
        }
    }

    /// Deliver the one final cancellation callback.
    pub(crate) fn deliver_cancelled(&self) {
        (self.callback)(WatchResult::Cancelled, SignalsState::default());
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("armed", &self.is_armed())
            .finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    // BTreeMap keeps registration order, so notifications fan out FIFO.
    watchers: BTreeMap<u64, Arc<Watcher>>,
}

/// Registry of live watchers for one pipe.
#[derive(Default)]
pub struct WatchRegistry {
    inner: Mutex<RegistryInner>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: WatchCallback) -> Arc<Watcher> {
        let mut inner = self.locked();
        let id = inner.next_id;
        inner.next_id += 1;
        let watcher = Watcher::new(id, callback);
        inner.watchers.insert(id, Arc::clone(&watcher));
        tracing::trace!(watcher_id = id, "Registered watcher");
        watcher
    }

    /// Queue a notification for every armed watcher. Callbacks fire after
    /// the registry lock is released, when the entry-point context unwinds.
    pub fn notify_all(&self, result: WatchResult, state: SignalsState) {
        let _context = RequestContext::new();
        {
            let inner = self.locked();
            for watcher in inner.watchers.values() {
                if watcher.is_armed() {
                    RequestContext::add_watch_notify_finalizer(
                        Arc::clone(watcher),
                        result,
                        state,
                    );
                }
            }
        }
        // Lock released; _context drains on exit.
    }

    /// Cancel a watcher. The watcher is marked inert at this moment, not at
    /// drain time, so an in-flight notify-action observes cancellation and
    /// suppresses its callback. One final `Cancelled` callback is delivered
    /// after lock release.
    pub fn cancel(&self, watcher: &Arc<Watcher>) {
        let _context = RequestContext::new();
        let was_armed = watcher.disarm();
        {
            let mut inner = self.locked();
            inner.watchers.remove(&watcher.id);
        }
        if was_armed {
            tracing::trace!(watcher_id = watcher.id, "Canceled watcher");
            RequestContext::add_watch_cancel_finalizer(Arc::clone(watcher));
        }
    }

    pub fn len(&self) -> usize {
        self.locked().watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().watchers.is_empty()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        // Watcher state stays consistent across a panicking callback thread;
        // recover rather than poison every later notification.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
