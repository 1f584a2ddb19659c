//! Asynchronous channel notifications (LISTEN/NOTIFY).
//!
//! Two independent dispatch tables exist side by side: receivers registered by
//! shared reference (many per channel) and at most one handler closure per
//! channel. Every incoming notification is offered to both.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::notice::NoticeHub;

/// A notification received on a channel this session listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel name
    pub channel: String,
    /// Payload text (empty if the sender gave none)
    pub payload: String,
    /// Process ID of the notifying backend
    pub backend_pid: u32,
}

/// Error type receivers may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Observer for one channel, registered with
/// [`Connection::add_receiver`](crate::Connection::add_receiver).
pub trait NotificationReceiver: Send + Sync {
    /// Channel this receiver listens on.
    fn channel(&self) -> &str;

    /// Called once per notification on [`channel`](Self::channel).
    ///
    /// Errors and panics are turned into notices; they never reach the caller
    /// that polled for notifications.
    fn receive(&self, payload: &str, backend_pid: u32) -> Result<(), BoxError>;
}

/// Handler closure installed with [`Connection::listen`](crate::Connection::listen).
pub type NotificationHandler = Box<dyn FnMut(&Notification) + Send>;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn report_failure(notices: &NoticeHub, kind: &str, channel: &str, err: &dyn std::fmt::Display) {
    let text = catch_unwind(AssertUnwindSafe(|| {
        format!("Exception in notification {kind} '{channel}': {err}\n")
    }))
    .unwrap_or_else(|_| format!("Exception in notification {kind} (compounded by other error)\n"));
    tracing::warn!(channel, "notification {kind} failed");
    notices.process_notice(&text);
}

/// Both dispatch tables of one connection.
#[derive(Default)]
pub(crate) struct Listeners {
    receivers: BTreeMap<String, Vec<Arc<dyn NotificationReceiver>>>,
    handlers: BTreeMap<String, NotificationHandler>,
}

impl Listeners {
    /// Whether either table watches `channel`.
    pub(crate) fn is_watched(&self, channel: &str) -> bool {
        self.receivers.contains_key(channel) || self.handlers.contains_key(channel)
    }

    pub(crate) fn has_receivers(&self) -> bool {
        !self.receivers.is_empty()
    }

    pub(crate) fn has_receivers_on(&self, channel: &str) -> bool {
        self.receivers.contains_key(channel)
    }

    pub(crate) fn has_handler(&self, channel: &str) -> bool {
        self.handlers.contains_key(channel)
    }

    pub(crate) fn clear_receivers(&mut self) {
        self.receivers.clear();
    }

    pub(crate) fn add_receiver(&mut self, receiver: Arc<dyn NotificationReceiver>) {
        self.receivers
            .entry(receiver.channel().to_string())
            .or_default()
            .push(receiver);
    }

    /// Remove one receiver by identity. Returns `None` if it was unknown,
    /// otherwise whether its channel has no receivers left.
    pub(crate) fn remove_receiver(&mut self, receiver: &Arc<dyn NotificationReceiver>) -> Option<bool> {
        let list = self.receivers.get_mut(receiver.channel())?;
        let pos = list
            .iter()
            .position(|r| std::ptr::addr_eq(Arc::as_ptr(r), Arc::as_ptr(receiver)))?;
        list.remove(pos);
        if list.is_empty() {
            self.receivers.remove(receiver.channel());
            return Some(true);
        }
        Some(false)
    }

    /// Install or replace the handler for `channel`. Returns the previous one.
    pub(crate) fn set_handler(
        &mut self,
        channel: &str,
        handler: NotificationHandler,
    ) -> Option<NotificationHandler> {
        self.handlers.insert(channel.to_string(), handler)
    }

    pub(crate) fn remove_handler(&mut self, channel: &str) -> Option<NotificationHandler> {
        self.handlers.remove(channel)
    }

    /// Offer one notification to every matching receiver and handler.
    ///
    /// Failures are reported to `notices` and dispatch continues.
    pub(crate) fn dispatch(&mut self, notification: &Notification, notices: &NoticeHub) {
        let channel = notification.channel.as_str();
        tracing::debug!(channel, pid = notification.backend_pid, "dispatching notification");

        if let Some(list) = self.receivers.get(channel) {
            for receiver in list {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    receiver.receive(&notification.payload, notification.backend_pid)
                }));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => report_failure(notices, "receiver", channel, &err),
                    Err(panic) => {
                        report_failure(notices, "receiver", channel, &panic_message(panic.as_ref()))
                    }
                }
            }
        }

        if let Some(handler) = self.handlers.get_mut(channel)
            && let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(notification)))
        {
            report_failure(notices, "handler", channel, &panic_message(panic.as_ref()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Counter {
        channel: String,
        fail: bool,
        seen: Mutex<Vec<(String, u32)>>,
    }

    impl NotificationReceiver for Counter {
        fn channel(&self) -> &str {
            &self.channel
        }

        fn receive(&self, payload: &str, backend_pid: u32) -> Result<(), BoxError> {
            self.seen.lock().unwrap().push((payload.to_string(), backend_pid));
            if self.fail {
                return Err("receiver broke".into());
            }
            Ok(())
        }
    }

    fn counter(channel: &str, fail: bool) -> Arc<Counter> {
        Arc::new(Counter {
            channel: channel.to_string(),
            fail,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn note(channel: &str, payload: &str) -> Notification {
        Notification {
            channel: channel.to_string(),
            payload: payload.to_string(),
            backend_pid: 7,
        }
    }

    #[test]
    fn test_every_receiver_runs_even_if_one_fails() {
        let hub = NoticeHub::new();
        let notices = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notices);
        hub.set_notice_handler(Some(Arc::new(move |m: &str| {
            sink.lock().unwrap().push(m.to_string());
        })));

        let first = counter("updates", true);
        let second = counter("updates", false);
        let other = counter("other", false);
        let mut listeners = Listeners::default();
        listeners.add_receiver(first.clone());
        listeners.add_receiver(second.clone());
        listeners.add_receiver(other.clone());

        listeners.dispatch(&note("updates", "42"), &hub);

        assert_eq!(*first.seen.lock().unwrap(), vec![("42".to_string(), 7)]);
        assert_eq!(*second.seen.lock().unwrap(), vec![("42".to_string(), 7)]);
        assert!(other.seen.lock().unwrap().is_empty());
        assert_eq!(
            *notices.lock().unwrap(),
            vec!["Exception in notification receiver 'updates': receiver broke\n"]
        );
    }

    #[test]
    fn test_handler_and_receivers_both_run() {
        let hub = NoticeHub::new();
        let rx = counter("jobs", false);
        let mut listeners = Listeners::default();
        listeners.add_receiver(rx.clone());

        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        assert!(
            listeners
                .set_handler(
                    "jobs",
                    Box::new(move |n: &Notification| sink.lock().unwrap().push(n.payload.clone())),
                )
                .is_none()
        );

        listeners.dispatch(&note("jobs", "a"), &hub);
        assert_eq!(rx.seen.lock().unwrap().len(), 1);
        assert_eq!(*calls.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_panicking_handler_becomes_notice() {
        let hub = NoticeHub::new();
        let notices = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notices);
        hub.set_notice_handler(Some(Arc::new(move |m: &str| {
            sink.lock().unwrap().push(m.to_string());
        })));

        fn explode(_: &Notification) {
            panic!("handler exploded");
        }

        let mut listeners = Listeners::default();
        listeners.set_handler("ch", Box::new(explode));
        listeners.dispatch(&note("ch", ""), &hub);

        assert_eq!(
            *notices.lock().unwrap(),
            vec!["Exception in notification handler 'ch': handler exploded\n"]
        );
    }

    #[test]
    fn test_remove_receiver() {
        let a = counter("c", false);
        let b = counter("c", false);
        let stranger: Arc<dyn NotificationReceiver> = counter("c", false);
        let mut listeners = Listeners::default();
        listeners.add_receiver(a.clone());
        listeners.add_receiver(b.clone());

        let a_dyn: Arc<dyn NotificationReceiver> = a;
        let b_dyn: Arc<dyn NotificationReceiver> = b;
        assert_eq!(listeners.remove_receiver(&stranger), None);
        assert_eq!(listeners.remove_receiver(&a_dyn), Some(false));
        assert!(listeners.is_watched("c"));
        assert_eq!(listeners.remove_receiver(&b_dyn), Some(true));
        assert!(!listeners.is_watched("c"));
        assert!(!listeners.has_receivers());
    }
}
