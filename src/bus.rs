//! Typed, schema-validated publish/subscribe bus.
//!
//! Declaring an event compiles its JSON Schema once; publishing validates
//! the event's properties against that compiled schema and then fans out to
//! every currently registered subscriber, in registration order. `publish`
//! only returns once every subscriber has run — a subscriber that panics or
//! errors is isolated and logged, never propagated to the publisher or to
//! other subscribers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use jsonschema::Validator;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{error, instrument};

use crate::error::{BusError, BusResult};

pub type SubscriptionToken = u64;

/// A declared, schema-validated event kind.
pub struct EventDescriptor {
    pub name: &'static str,
    schema: Validator,
}

impl EventDescriptor {
    fn validate(&self, properties: &serde_json::Value) -> BusResult<()> {
        self.schema
            .validate(properties)
            .map_err(|e| BusError::SchemaInvalid(e.to_string()))
    }
}

/// Declare an event named `name` whose published properties must validate
/// against `schema` (a JSON Schema document).
pub fn event(name: &'static str, schema: serde_json::Value) -> BusResult<EventDescriptor> {
    let validator =
        jsonschema::validator_for(&schema).map_err(|e| BusError::SchemaCompile(e.to_string()))?;
    Ok(EventDescriptor { name, schema: validator })
}

/// A materialized, published event.
#[derive(Debug, Clone)]
pub struct Event {
    pub seq: u64,
    pub timestamp: i64,
    pub name: &'static str,
    pub properties: serde_json::Value,
}

/// A bus subscriber. Subscribers observe every event published on the bus
/// they registered with and are expected to filter by `event.name`
/// themselves, the same way a single channel carries every event kind.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn on_event(&self, event: &Event);
}

type ObserverList = Vec<(SubscriptionToken, Arc<dyn Subscriber>)>;

/// A publish/subscribe bus. One instance lives per project scope; a single
/// process-global instance is available via [`global`] for cross-scope
/// signals.
pub struct Bus {
    observers: Mutex<ObserverList>,
    sequence: AtomicU64,
    observer_sequence: AtomicU64,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(1),
            observer_sequence: AtomicU64::new(1),
        }
    }

    /// Register a subscriber; returns a token usable with
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriptionToken {
        let token = self.observer_sequence.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((token, subscriber));
        token
    }

    /// Remove a previously registered subscriber. Returns `true` if a
    /// subscriber was removed.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(t, _)| *t != token);
        before != observers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Validate `properties` against `descriptor`'s schema, then dispatch
    /// synchronously to every current subscriber. Returns once every
    /// subscriber has run.
    #[instrument(skip_all, fields(event = descriptor.name))]
    pub async fn publish(
        &self,
        descriptor: &EventDescriptor,
        properties: serde_json::Value,
    ) -> BusResult<Event> {
        descriptor.validate(&properties)?;
        let event = Event {
            seq: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
            name: descriptor.name,
            properties,
        };
        self.dispatch(&event).await;
        Ok(event)
    }

    async fn dispatch(&self, event: &Event) {
        let observers: Vec<_> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        for observer in observers {
            let name = event.name;
            let owned = event.clone();
            let result = tokio::spawn(async move {
                observer.on_event(&owned).await;
            })
            .await;
            if let Err(join_err) = result {
                error!(event = name, error = %join_err, "bus subscriber panicked");
            }
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_BUS: Lazy<Bus> = Lazy::new(Bus::new);

/// The process-global bus, for signals that must cross instance scopes.
pub fn global() -> &'static Bus {
    &GLOBAL_BUS
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Mutex as TokioMutex;

    struct RecordingSubscriber {
        received: Arc<TokioMutex<Vec<Event>>>,
    }

    #[async_trait]
    impl Subscriber for RecordingSubscriber {
        async fn on_event(&self, event: &Event) {
            self.received.lock().await.push(event.clone());
        }
    }

    struct PanickingSubscriber;

    #[async_trait]
    impl Subscriber for PanickingSubscriber {
        async fn on_event(&self, _event: &Event) {
            panic!("boom");
        }
    }

    fn test_event() -> EventDescriptor {
        event(
            "test.event",
            json!({
                "type": "object",
                "properties": { "value": { "type": "number" } },
                "required": ["value"]
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn publish_validates_against_schema() {
        let bus = Bus::new();
        let descriptor = test_event();
        let err = bus.publish(&descriptor, json!({"value": "not a number"})).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn subscribers_receive_published_events_in_order() {
        let bus = Bus::new();
        let descriptor = test_event();
        let received = Arc::new(TokioMutex::new(Vec::new()));
        let subscriber = Arc::new(RecordingSubscriber { received: received.clone() });
        bus.subscribe(subscriber);

        bus.publish(&descriptor, json!({"value": 1})).await.unwrap();
        bus.publish(&descriptor, json!({"value": 2})).await.unwrap();

        let events = received.lock().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].seq, 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = Bus::new();
        let descriptor = test_event();
        let received = Arc::new(TokioMutex::new(Vec::new()));
        let subscriber = Arc::new(RecordingSubscriber { received: received.clone() });
        let token = bus.subscribe(subscriber);
        assert!(bus.unsubscribe(token));
        assert!(!bus.unsubscribe(token));

        bus.publish(&descriptor, json!({"value": 1})).await.unwrap();
        assert!(received.lock().await.is_empty());
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_block_others() {
        let bus = Bus::new();
        let descriptor = test_event();
        let received = Arc::new(TokioMutex::new(Vec::new()));
        bus.subscribe(Arc::new(PanickingSubscriber));
        bus.subscribe(Arc::new(RecordingSubscriber { received: received.clone() }));

        bus.publish(&descriptor, json!({"value": 1})).await.unwrap();

        assert_eq!(received.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = Bus::new();
        let descriptor = test_event();
        assert!(bus.publish(&descriptor, json!({"value": 1})).await.is_ok());
    }
}
