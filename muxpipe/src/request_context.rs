//! Thread-local, call-scoped deferral of watcher callbacks.
//!
//! A [`RequestContext`] exists for the duration of one top-level call into
//! the pipe machinery. Code holding internal locks never invokes watcher
//! callbacks directly; it queues notify/cancel finalizers on the current
//! context instead, and the context's destructor, which runs after every
//! lock has been released, performs the actual invocation.
//!
//! Constructing a context while another exists on the same thread is legal
//! (re-entrant callbacks do exactly that), but only the innermost context is
//! ever the "current" one.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::watch::{SignalsState, WatchResult, Watcher};

struct WatchNotifyFinalizer {
    watcher: Arc<Watcher>,
    result: WatchResult,
    state: SignalsState,
}

#[derive(Default)]
struct Finalizers {
    notify: Vec<WatchNotifyFinalizer>,
    cancel: Vec<Arc<Watcher>>,
}

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Rc<RefCell<Finalizers>>>> =
        const { RefCell::new(Vec::new()) };
}

/// Stack-scoped guard collecting deferred watcher actions for one top-level
/// call. Dropping it drains all notify finalizers first, then all cancel
/// finalizers, each in FIFO enqueue order.
pub struct RequestContext {
    finalizers: Rc<RefCell<Finalizers>>,
}

impl RequestContext {
    pub fn new() -> Self {
        let finalizers = Rc::new(RefCell::new(Finalizers::default()));
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(Rc::clone(&finalizers)));
        Self { finalizers }
    }

    /// Whether any context is live on this thread.
    pub fn has_current() -> bool {
        CONTEXT_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// Whether this context is the innermost one.
    pub fn is_current(&self) -> bool {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .is_some_and(|top| Rc::ptr_eq(top, &self.finalizers))
        })
    }

    /// Queue a watch callback to fire with `result` and `state` when the
    /// current context unwinds, unless the watcher is canceled first.
    ///
    /// Panics when no context is live on this thread; that is a contract
    /// violation by the calling code, not a runtime condition.
    pub fn add_watch_notify_finalizer(
        watcher: Arc<Watcher>,
        result: WatchResult,
        state: SignalsState,
    ) {
        Self::with_current(|finalizers| {
            finalizers.notify.push(WatchNotifyFinalizer {
                watcher,
                result,
                state,
            });
        });
    }

    /// Queue delivery of a watcher's final cancellation callback.
    ///
    /// Panics when no context is live on this thread.
    pub fn add_watch_cancel_finalizer(watcher: Arc<Watcher>) {
        Self::with_current(|finalizers| finalizers.cancel.push(watcher));
    }

    fn with_current(f: impl FnOnce(&mut Finalizers)) {
        CONTEXT_STACK.with(|stack| {
            let stack = stack.borrow();
            let top = stack
                .last()
                .expect("no RequestContext is active on this thread");
            f(&mut top.borrow_mut());
        });
    }

    fn take_notify(&self) -> Vec<WatchNotifyFinalizer> {
        std::mem::take(&mut self.finalizers.borrow_mut().notify)
    }

    fn take_cancel(&self) -> Vec<Arc<Watcher>> {
        std::mem::take(&mut self.finalizers.borrow_mut().cancel)
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        // Drain with this context still on the stack, re-checking the notify
        // list before each cancel pass so every notify fires before any
        // cancel even when a callback queues more work.
        loop {
            let notify = self.take_notify();
            if !notify.is_empty() {
                for finalizer in notify {
                    finalizer
                        .watcher
                        .notify(finalizer.result, finalizer.state);
                }
                continue;
            }
            let cancel = self.take_cancel();
            if cancel.is_empty() {
                break;
            }
            for watcher in cancel {
                watcher.deliver_cancelled();
            }
        }

        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(position) = stack
                .iter()
                .rposition(|entry| Rc::ptr_eq(entry, &self.finalizers))
            {
                stack.remove(position);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::WatchRegistry;
    use std::sync::Mutex;

    fn recording_watcher(
        registry: &WatchRegistry,
        log: &Arc<Mutex<Vec<(WatchResult, SignalsState)>>>,
    ) -> Arc<Watcher> {
        let log = Arc::clone(log);
        registry.register(Box::new(move |result, state| {
            log.lock().unwrap().push((result, state));
        }))
    }

    #[test]
    fn notify_finalizer_fires_on_drop() {
        let registry = WatchRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let watcher = recording_watcher(&registry, &log);

        {
            let _context = RequestContext::new();
            RequestContext::add_watch_notify_finalizer(
                Arc::clone(&watcher),
                WatchResult::Ok,
                SignalsState::peer_closed(),
            );
            assert!(log.lock().unwrap().is_empty(), "deferred until unwind");
        }

        let entries = log.lock().unwrap();
        assert_eq!(
            entries.as_slice(),
            &[(WatchResult::Ok, SignalsState::peer_closed())]
        );
    }

    #[test]
    fn notifies_drain_before_cancels_in_fifo_order() {
        let registry = WatchRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let make = |tag: &'static str| {
            let log = Arc::clone(&log);
            registry.register(Box::new(move |result, _| {
                log.lock().unwrap().push((tag, result));
            }))
        };
        let first = make("first");
        let second = make("second");
        let third = make("third");

        {
            let _context = RequestContext::new();
            RequestContext::add_watch_notify_finalizer(
                Arc::clone(&first),
                WatchResult::Ok,
                SignalsState::default(),
            );
            RequestContext::add_watch_cancel_finalizer(Arc::clone(&third));
            RequestContext::add_watch_notify_finalizer(
                Arc::clone(&second),
                WatchResult::Ok,
                SignalsState::default(),
            );
        }

        let entries = log.lock().unwrap();
        assert_eq!(
            entries.as_slice(),
            &[
                ("first", WatchResult::Ok),
                ("second", WatchResult::Ok),
                ("third", WatchResult::Cancelled),
            ]
        );
    }

    #[test]
    fn canceled_watcher_suppresses_queued_notify() {
        let registry = WatchRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let watcher = recording_watcher(&registry, &log);

        {
            let _context = RequestContext::new();
            RequestContext::add_watch_notify_finalizer(
                Arc::clone(&watcher),
                WatchResult::Ok,
                SignalsState::peer_closed(),
            );
            // Cancel takes effect at request time; the queued notify above
            // must observe it and become a no-op.
            registry.cancel(&watcher);
        }

        let entries = log.lock().unwrap();
        assert_eq!(
            entries.as_slice(),
            &[(WatchResult::Cancelled, SignalsState::default())]
        );
    }

    #[test]
    fn nested_context_drains_before_outer() {
        let registry = WatchRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = |tag: &'static str| {
            let log = Arc::clone(&log);
            registry.register(Box::new(move |_, _| {
                log.lock().unwrap().push(tag);
            }))
        };
        let outer_watcher = make("outer");
        let inner_watcher = make("inner");

        let outer = RequestContext::new();
        assert!(outer.is_current());
        RequestContext::add_watch_notify_finalizer(
            Arc::clone(&outer_watcher),
            WatchResult::Ok,
            SignalsState::default(),
        );
        {
            let inner = RequestContext::new();
            assert!(inner.is_current());
            assert!(!outer.is_current());
            RequestContext::add_watch_notify_finalizer(
                Arc::clone(&inner_watcher),
                WatchResult::Ok,
                SignalsState::default(),
            );
        }
        assert!(outer.is_current());
        assert_eq!(log.lock().unwrap().as_slice(), &["inner"]);
        drop(outer);
        assert_eq!(log.lock().unwrap().as_slice(), &["inner", "outer"]);
        assert!(!RequestContext::has_current());
    }

    #[test]
    #[should_panic(expected = "no RequestContext is active")]
    fn finalizer_without_context_panics() {
        let registry = WatchRegistry::new();
        let watcher = registry.register(Box::new(|_, _| {}));
        RequestContext::add_watch_cancel_finalizer(watcher);
    }
}
