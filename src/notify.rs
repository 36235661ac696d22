//! LISTEN/NOTIFY routing.
//!
//! Notifications are read on a connection's worker thread and matched against
//! the subscribed channels there. Matches are handed to a single delivery task
//! on the tokio runtime, which runs the callbacks one at a time in arrival
//! order. Callbacks therefore never run inside the call that registered them
//! and never block the connection's I/O.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::mpsc;

/// A notification sent with `NOTIFY channel, 'payload'` or `pg_notify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pid: u32,
    channel: String,
    payload: String,
}

impl Notification {
    pub fn new(pid: u32, channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            pid,
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Process ID of the notifying backend.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// Subscriber callback.
pub type Callback = Arc<dyn Fn(Notification) + Send + Sync>;

/// A matched notification on its way to the delivery task.
pub struct Delivery {
    callback: Callback,
    notification: Notification,
}

/// Sending half of a delivery task.
pub type Outbox = mpsc::UnboundedSender<Delivery>;

/// Spawn the delivery task on the current runtime.
///
/// The task ends once every [`Outbox`] clone is dropped.
pub fn spawn_delivery() -> Outbox {
    let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
    tokio::spawn(async move {
        while let Some(Delivery {
            callback,
            notification,
        }) = rx.recv().await
        {
            let channel = notification.channel.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(notification))).is_err() {
                tracing::warn!(%channel, "notification callback panicked");
            }
        }
    });
    tx
}

/// Channel subscriptions of one connection.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Callback>,
    outbox: Option<Outbox>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to `channel`, replacing any previous callback.
    /// Returns true if the channel was not subscribed before.
    pub fn subscribe(&mut self, channel: &str, callback: Callback, outbox: Outbox) -> bool {
        self.outbox = Some(outbox);
        self.routes.insert(channel.to_string(), callback).is_none()
    }

    /// Returns true if the channel was subscribed.
    pub fn unsubscribe(&mut self, channel: &str) -> bool {
        self.routes.remove(channel).is_some()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.routes.contains_key(channel)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Forward a notification to its subscriber. Returns false if nobody
    /// listens on the channel or the delivery task is gone.
    pub fn route(&self, notification: Notification) -> bool {
        let Some(callback) = self.routes.get(&notification.channel) else {
            tracing::debug!(channel = %notification.channel, "dropping notification for unsubscribed channel");
            return false;
        };
        let Some(outbox) = &self.outbox else {
            return false;
        };
        outbox
            .send(Delivery {
                callback: callback.clone(),
                notification,
            })
            .is_ok()
    }
}

/// Quote a channel name as an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn routes_in_order_to_matching_channel() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let outbox = spawn_delivery();
        let mut router = Router::new();
        let sink = seen.clone();
        assert!(router.subscribe(
            "ch1",
            Arc::new(move |n: Notification| {
                sink.lock().unwrap().push(n.payload().to_string());
                let _ = done_tx.send(());
            }),
            outbox.clone(),
        ));

        assert!(router.route(Notification::new(1, "ch1", "a")));
        assert!(!router.route(Notification::new(1, "other", "x")));
        assert!(router.route(Notification::new(1, "ch1", "b")));

        done_rx.recv().await.unwrap();
        done_rx.recv().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn resubscribe_replaces_callback() {
        let outbox = spawn_delivery();
        let mut router = Router::new();
        assert!(router.subscribe("ch", Arc::new(|_| {}), outbox.clone()));
        assert!(!router.subscribe("ch", Arc::new(|_| {}), outbox));
        assert!(router.unsubscribe("ch"));
        assert!(!router.unsubscribe("ch"));
        assert!(router.is_empty());
    }

    #[test]
    fn quoting() {
        assert_eq!(quote_ident("ch1"), "\"ch1\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
