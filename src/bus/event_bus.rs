use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::event_types::{Event, Topic};

const TAP_CAPACITY: usize = 1024;

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Returned by [`EventBus::subscribe`]; the only way to remove a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    topic: Topic,
    id: u64,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("unknown subscription {id} on topic {topic}")]
    UnknownSubscription { topic: Topic, id: u64 },
}

/// A published event as seen by asynchronous tap consumers.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub id: Uuid,
    pub seq: i64,
    pub topic: Topic,
    pub event: Event,
    pub created_at: DateTime<Utc>,
}

pub struct EventBus {
    handlers: Mutex<HashMap<Topic, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
    seq: AtomicI64,
    tap: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            seq: AtomicI64::new(0),
            tap,
        }
    }

    /// Register `handler` for `topic`. Handlers run in registration order.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.handlers.lock().expect("event bus mutex poisoned");
        guard.entry(topic).or_default().push((id, Arc::new(handler)));
        SubscriptionHandle { topic, id }
    }

    /// Remove a handler. Removing a handle twice, or one this bus never issued,
    /// is a coordination bug and is reported as such.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BusError> {
        let mut guard = self.handlers.lock().expect("event bus mutex poisoned");
        let unknown = BusError::UnknownSubscription {
            topic: handle.topic,
            id: handle.id,
        };
        let Some(list) = guard.get_mut(&handle.topic) else {
            return Err(unknown);
        };
        let Some(pos) = list.iter().position(|(id, _)| *id == handle.id) else {
            return Err(unknown);
        };
        list.remove(pos);
        Ok(())
    }

    /// Deliver `event` to every handler of its topic on the calling task, then
    /// copy it onto the tap.
    ///
    /// The handler list is snapshotted before dispatch, so a handler may
    /// unsubscribe itself or others without disturbing this delivery. A handler
    /// must not synchronously publish to the topic it is handling.
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        let snapshot: Vec<Handler> = {
            let guard = self.handlers.lock().expect("event bus mutex poisoned");
            match guard.get(&topic) {
                Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
                None => Vec::new(),
            }
        };

        for handler in &snapshot {
            handler(&event);
        }

        let envelope = Envelope {
            id: Uuid::new_v4(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            topic,
            event,
            created_at: Utc::now(),
        };
        if self.tap.send(envelope).is_err() {
            tracing::trace!("event bus tap has no receivers for {topic}");
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let guard = self.handlers.lock().expect("event bus mutex poisoned");
        guard.get(&topic).map_or(0, Vec::len)
    }

    /// Get a receiver that sees every published event, for consumers that run
    /// on their own task. Slow receivers lose the oldest envelopes.
    pub fn tap(&self) -> broadcast::Receiver<Envelope> {
        self.tap.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::event_types::{ErrorEvent, LogLine};
    use pretty_assertions::assert_eq;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn handlers_run_once_per_publish_in_registration_order() {
        let bus = EventBus::new();
        let seen = recorder();

        for name in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.subscribe(Topic::Log, move |event| {
                if let Event::Log(LogLine { text }) = event {
                    seen.lock().unwrap().push(format!("{name}:{text}"));
                }
            });
        }
        let other = seen.clone();
        bus.subscribe(Topic::Error, move |_| {
            other.lock().unwrap().push("error-handler".into());
        });

        bus.publish(Event::log("a"));
        bus.publish(Event::log("b"));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:a", "second:a", "third:a", "first:b", "second:b", "third:b"]
        );
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish(Event::ShutdownComplete);
        assert_eq!(bus.subscriber_count(Topic::ShutdownComplete), 0);
    }

    #[test]
    fn unsubscribe_during_publish_keeps_current_delivery() {
        let bus = Arc::new(EventBus::new());
        let seen = recorder();
        let later: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

        {
            let bus_ref = Arc::downgrade(&bus);
            let later = later.clone();
            let seen = seen.clone();
            bus.subscribe(Topic::Log, move |_| {
                seen.lock().unwrap().push("remover".into());
                let handle = later.lock().unwrap().take();
                if let (Some(bus), Some(handle)) = (bus_ref.upgrade(), handle) {
                    bus.unsubscribe(handle).expect("handle should be live");
                }
            });
        }
        {
            let seen = seen.clone();
            let handle = bus.subscribe(Topic::Log, move |_| {
                seen.lock().unwrap().push("removed".into());
            });
            *later.lock().unwrap() = Some(handle);
        }

        bus.publish(Event::log("one"));
        bus.publish(Event::log("two"));

        assert_eq!(*seen.lock().unwrap(), vec!["remover", "removed", "remover"]);
        assert_eq!(bus.subscriber_count(Topic::Log), 1);
    }

    #[test]
    fn unknown_handle_is_reported() {
        let bus = EventBus::new();
        let handle = bus.subscribe(Topic::Error, |_| {});
        assert_eq!(bus.unsubscribe(handle), Ok(()));
        assert_eq!(
            bus.unsubscribe(handle),
            Err(BusError::UnknownSubscription {
                topic: Topic::Error,
                id: 1
            })
        );
    }

    #[tokio::test]
    async fn tap_sees_every_event_with_increasing_seq() {
        let bus = EventBus::new();
        let mut rx = bus.tap();

        bus.publish(Event::log("hello"));
        bus.publish(Event::Error(ErrorEvent {
            code: Some(200),
            message: "No security definition has been found".into(),
        }));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.topic, Topic::Log);
        assert_eq!(second.topic, Topic::Error);
        assert!(second.seq > first.seq);
        assert_ne!(first.id, second.id);
    }
}
