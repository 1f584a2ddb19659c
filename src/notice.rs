//! Notice delivery.
//!
//! A [`NoticeHub`] is shared by a connection and every result it produced.
//! Results keep their clone after the connection is closed, so problems found
//! later (an out-of-range field access, for instance) still reach the same
//! observers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Receives notices before the free-form handler does.
pub trait NoticeObserver: Send + Sync {
    /// Handle one notice. Returning `true` stops propagation to observers
    /// registered earlier and to the notice handler.
    fn on_notice(&self, message: &str) -> bool;
}

/// Free-form notice callback, run when no observer handled a notice.
pub type NoticeHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct HubState {
    observers: Vec<Arc<dyn NoticeObserver>>,
    handler: Option<NoticeHandler>,
}

/// Shared, reference-counted notice dispatcher.
#[derive(Clone, Default)]
pub struct NoticeHub {
    state: Arc<Mutex<HubState>>,
}

impl std::fmt::Debug for NoticeHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("NoticeHub")
            .field("observers", &state.observers.len())
            .field("handler", &state.handler.is_some())
            .finish()
    }
}

impl NoticeHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an observer. It will be offered notices before every
    /// observer registered so far.
    pub fn add_observer(&self, observer: Arc<dyn NoticeObserver>) {
        self.lock().observers.push(observer);
    }

    /// Remove an observer by identity. Returns `false` if it was not registered.
    pub fn remove_observer(&self, observer: &Arc<dyn NoticeObserver>) -> bool {
        let mut state = self.lock();
        let before = state.observers.len();
        state
            .observers
            .retain(|o| !std::ptr::addr_eq(Arc::as_ptr(o), Arc::as_ptr(observer)));
        state.observers.len() != before
    }

    /// Remove every observer. Returns how many were removed.
    pub fn clear_observers(&self) -> usize {
        let mut state = self.lock();
        let removed = state.observers.len();
        state.observers.clear();
        removed
    }

    /// Snapshot of the registered observers, oldest first.
    pub fn observers(&self) -> Vec<Arc<dyn NoticeObserver>> {
        self.lock().observers.clone()
    }

    /// Install (or with `None`, remove) the free-form notice handler.
    pub fn set_notice_handler(&self, handler: Option<NoticeHandler>) {
        self.lock().handler = handler;
    }

    /// Deliver one notice.
    ///
    /// Observers run newest first and the first one returning `true` ends
    /// delivery. If none does, the notice handler gets the text. Empty
    /// messages are ignored. A panicking callback is contained and logged.
    pub fn process_notice(&self, message: &str) {
        if message.is_empty() {
            return;
        }

        // Callbacks run without the lock held so they may use the hub.
        let (observers, handler) = {
            let state = self.lock();
            (state.observers.clone(), state.handler.clone())
        };

        tracing::debug!(observers = observers.len(), "delivering notice");

        for observer in observers.iter().rev() {
            match catch_unwind(AssertUnwindSafe(|| observer.on_notice(message))) {
                Ok(true) => return,
                Ok(false) => {}
                Err(_) => tracing::warn!("notice observer panicked"),
            }
        }

        if let Some(handler) = handler
            && catch_unwind(AssertUnwindSafe(|| handler(message))).is_err()
        {
            tracing::warn!("notice handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        name: &'static str,
        stop: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl NoticeObserver for Recorder {
        fn on_notice(&self, message: &str) -> bool {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, message));
            self.stop
        }
    }

    fn recorder(
        name: &'static str,
        stop: bool,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn NoticeObserver> {
        Arc::new(Recorder {
            name,
            stop,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn test_newest_observer_first_and_stop() {
        let hub = NoticeHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        hub.add_observer(recorder("a", false, &log));
        hub.add_observer(recorder("b", true, &log));
        hub.add_observer(recorder("c", false, &log));

        let handled = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&handled);
        hub.set_notice_handler(Some(Arc::new(move |m: &str| {
            sink.lock().unwrap().push(m.to_string());
        })));

        hub.process_notice("hello\n");
        assert_eq!(*log.lock().unwrap(), vec!["c:hello\n", "b:hello\n"]);
        assert!(handled.lock().unwrap().is_empty());
    }

    #[test]
    fn test_handler_runs_when_unhandled() {
        let hub = NoticeHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        hub.add_observer(recorder("a", false, &log));
        let handled = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&handled);
        hub.set_notice_handler(Some(Arc::new(move |m: &str| {
            sink.lock().unwrap().push(m.to_string());
        })));

        hub.process_notice("x");
        hub.process_notice("");
        assert_eq!(*log.lock().unwrap(), vec!["a:x"]);
        assert_eq!(*handled.lock().unwrap(), vec!["x"]);
    }

    #[test]
    fn test_remove_observer_by_identity() {
        let hub = NoticeHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder("a", false, &log);
        let b = recorder("b", false, &log);
        hub.add_observer(Arc::clone(&a));
        hub.add_observer(Arc::clone(&b));

        assert!(hub.remove_observer(&a));
        assert!(!hub.remove_observer(&a));
        hub.process_notice("n");
        assert_eq!(*log.lock().unwrap(), vec!["b:n"]);
        assert_eq!(hub.clear_observers(), 1);
        assert!(hub.observers().is_empty());
    }

    #[test]
    fn test_hub_outlives_clones() {
        let hub = NoticeHub::new();
        let kept = hub.clone();
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        hub.set_notice_handler(Some(Arc::new(move |_: &str| {
            *sink.lock().unwrap() += 1;
        })));
        drop(hub);
        kept.process_notice("late\n");
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_panicking_observer_is_contained() {
        struct Boom;
        impl NoticeObserver for Boom {
            fn on_notice(&self, _: &str) -> bool {
                panic!("boom")
            }
        }
        let hub = NoticeHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        hub.add_observer(recorder("a", false, &log));
        hub.add_observer(Arc::new(Boom));
        hub.process_notice("m");
        assert_eq!(*log.lock().unwrap(), vec!["a:m"]);
    }
}
