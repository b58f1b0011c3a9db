// crates/progress-client/src/channel/handlers.rs
//! Registry of push-event subscribers.
//!
//! Lives outside the connection so registrations survive reconnects. Each
//! subscription is a handle that unregisters itself when dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::mpsc;

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<Vec<Value>>)>>;

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    next_id: AtomicU64,
    subscribers: Mutex<Subscribers>,
}

impl HandlerRegistry {
    /// Event names are matched case-insensitively.
    fn key(event: &str) -> String {
        event.to_ascii_lowercase()
    }

    pub(crate) fn register(self: &Arc<Self>, event: &str) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        match self.subscribers.lock() {
            Ok(mut subs) => subs.entry(Self::key(event)).or_default().push((id, tx)),
            Err(e) => tracing::error!("Mutex poisoned registering event handler: {e}"),
        }
        EventSubscription {
            event: event.to_string(),
            id,
            receiver: rx,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, event: &str, id: u64) {
        match self.subscribers.lock() {
            Ok(mut subs) => {
                let key = Self::key(event);
                if let Some(list) = subs.get_mut(&key) {
                    list.retain(|(sub_id, _)| *sub_id != id);
                    if list.is_empty() {
                        subs.remove(&key);
                    }
                }
            }
            Err(e) => tracing::error!("Mutex poisoned removing event handler: {e}"),
        }
    }

    /// Hand the invocation arguments to every subscriber of `event`.
    /// Returns how many subscribers received them.
    pub(crate) fn dispatch(&self, event: &str, arguments: &[Value]) -> usize {
        match self.subscribers.lock() {
            Ok(mut subs) => {
                let Some(list) = subs.get_mut(&Self::key(event)) else {
                    return 0;
                };
                list.retain(|(_, tx)| tx.send(arguments.to_vec()).is_ok());
                list.len()
            }
            Err(e) => {
                tracing::error!("Mutex poisoned dispatching event: {e}");
                0
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.get(&Self::key(event)).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

/// Stream of one push event's invocation arguments.
///
/// Dropping the handle (or calling [`unsubscribe`](Self::unsubscribe))
/// removes the registration.
pub struct EventSubscription {
    event: String,
    id: u64,
    receiver: mpsc::UnboundedReceiver<Vec<Value>>,
    registry: Weak<HandlerRegistry>,
}

impl EventSubscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Next event's arguments. `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Vec<Value>> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.event, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_dispatch_reaches_every_subscriber() {
        let registry = Arc::new(HandlerRegistry::default());
        let mut first = registry.register("JobStatusUpdate");
        let mut second = registry.register("jobstatusupdate");

        assert_eq!(registry.dispatch("JOBSTATUSUPDATE", &[json!({"jobId": "j1"})]), 2);
        assert_eq!(first.recv().await.unwrap()[0]["jobId"], "j1");
        assert_eq!(second.recv().await.unwrap()[0]["jobId"], "j1");
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_handler() {
        let registry = Arc::new(HandlerRegistry::default());
        let first = registry.register("JobStatusUpdate");
        let _second = registry.register("JobStatusUpdate");
        assert_eq!(registry.subscriber_count("JobStatusUpdate"), 2);

        first.unsubscribe();
        assert_eq!(registry.subscriber_count("JobStatusUpdate"), 1);
        assert_eq!(registry.dispatch("JobStatusUpdate", &[]), 1);
    }

    #[test]
    fn test_dispatch_without_subscribers() {
        let registry = Arc::new(HandlerRegistry::default());
        assert_eq!(registry.dispatch("JobStatusUpdate", &[json!(1)]), 0);
    }
}
