//! Observer registration and per-device update fan-out.
//!
//! External consumers subscribe to device updates; each subscriber gets an
//! initial registry snapshot before any live event, then every inbound
//! message in registration order. A failing observer is reported and
//! skipped, never aborting delivery to the others.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

/// A subscriber for per-device update events.
///
/// Ownership stays with the caller that registered the observer; the
/// registry only holds an `Arc` and identifies observers by pointer
/// identity. Observer code is untrusted: errors are contained.
pub trait UpdateObserver: Send + Sync {
    fn on_update(
        &self,
        sid: &str,
        command: &str,
        message: &Value,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Thread-safe ordered set of observers.
///
/// Catch-up snapshot delivery runs under the lock, so a new subscriber
/// always sees its snapshot strictly before any live message that races
/// with the subscribe call. Live fan-out iterates a copy of the list
/// taken outside the lock, so an observer may subscribe or unsubscribe
/// from inside its own callback.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Mutex<Vec<Arc<dyn UpdateObserver>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer, delivering the catch-up snapshot to it first.
    ///
    /// The snapshot is computed by `snapshot` while the observer lock is
    /// held: a live message racing with this call either lands in the
    /// snapshot or is fanned out after it, never lost in between. Returns
    /// `false` without delivering anything if the observer is already
    /// subscribed.
    pub fn subscribe<F>(&self, observer: Arc<dyn UpdateObserver>, snapshot: F) -> bool
    where
        F: FnOnce() -> Vec<(String, Value)>,
    {
        let mut observers = self.lock();
        if observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            return false;
        }

        for (sid, payload) in snapshot() {
            deliver(&observer, &sid, "read_ack", &payload);
        }

        observers.push(observer);
        true
    }

    /// Remove an observer. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, observer: &Arc<dyn UpdateObserver>) -> bool {
        let mut observers = self.lock();
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != before
    }

    /// Deliver an update to every subscriber in registration order.
    ///
    /// The list is cloned and the lock released before any callback runs,
    /// so observers can modify their own registration during delivery.
    pub fn publish(&self, sid: &str, command: &str, message: &Value) {
        let observers = self.lock().clone();
        for observer in &observers {
            deliver(observer, sid, command, message);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn UpdateObserver>>> {
        // A poisoned lock only means an observer panicked mid-delivery; the
        // list itself is still consistent.
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn deliver(observer: &Arc<dyn UpdateObserver>, sid: &str, command: &str, message: &Value) {
    if let Err(e) = observer.on_update(sid, command, message) {
        tracing::warn!("Observer failed to handle update for {}: {}", sid, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        label: &'static str,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl UpdateObserver for Recorder {
        fn on_update(
            &self,
            sid: &str,
            command: &str,
            _message: &Value,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:{}:{}", self.label, command, sid));
            Ok(())
        }
    }

    struct Failing;

    impl UpdateObserver for Failing {
        fn on_update(
            &self,
            _sid: &str,
            _command: &str,
            _message: &Value,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("observer is broken".into())
        }
    }

    struct Counter(AtomicUsize);

    impl UpdateObserver for Counter {
        fn on_update(
            &self,
            _sid: &str,
            _command: &str,
            _message: &Value,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_subscribe_returns_false() {
        let registry = ObserverRegistry::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));

        assert!(registry.subscribe(counter.clone(), Vec::new));
        assert!(!registry.subscribe(counter.clone(), Vec::new));

        registry.publish("DEV1", "read_ack", &json!({}));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let registry = ObserverRegistry::new();
        let counter: Arc<dyn UpdateObserver> = Arc::new(Counter(AtomicUsize::new(0)));

        assert!(!registry.unsubscribe(&counter));
        assert!(registry.subscribe(counter.clone(), Vec::new));
        assert!(registry.unsubscribe(&counter));
        assert!(!registry.unsubscribe(&counter));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_delivered_before_live_events() {
        let registry = ObserverRegistry::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::new(Recorder {
            label: "a",
            events: events.clone(),
        });

        let snapshot = vec![
            ("DEV1".to_string(), json!({"status": "on"})),
            ("DEV2".to_string(), json!({"status": "off"})),
        ];
        assert!(registry.subscribe(recorder, move || snapshot));
        registry.publish("DEV3", "report", &json!({}));

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec!["a:read_ack:DEV1", "a:read_ack:DEV2", "a:report:DEV3"]
        );
    }

    #[test]
    fn test_failing_observer_does_not_block_others() {
        let registry = ObserverRegistry::new();
        let events = Arc::new(Mutex::new(Vec::new()));

        registry.subscribe(Arc::new(Failing), Vec::new);
        registry.subscribe(
            Arc::new(Recorder {
                label: "b",
                events: events.clone(),
            }),
            Vec::new,
        );

        registry.publish("DEV1", "report", &json!({}));
        assert_eq!(*events.lock().unwrap(), vec!["b:report:DEV1"]);
    }

    struct SelfRemoving {
        registry: Arc<ObserverRegistry>,
        handle: Mutex<Option<Arc<dyn UpdateObserver>>>,
        deliveries: AtomicUsize,
    }

    impl UpdateObserver for SelfRemoving {
        fn on_update(
            &self,
            _sid: &str,
            _command: &str,
            _message: &Value,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.deliveries.fetch_add(1, Ordering::SeqCst);
            if let Some(me) = self.handle.lock().unwrap().take() {
                self.registry.unsubscribe(&me);
            }
            Ok(())
        }
    }

    #[test]
    fn test_observer_can_unsubscribe_itself_during_delivery() {
        let registry = Arc::new(ObserverRegistry::new());
        let observer = Arc::new(SelfRemoving {
            registry: registry.clone(),
            handle: Mutex::new(None),
            deliveries: AtomicUsize::new(0),
        });
        let handle: Arc<dyn UpdateObserver> = observer.clone();
        *observer.handle.lock().unwrap() = Some(handle.clone());
        assert!(registry.subscribe(handle, Vec::new));

        registry.publish("DEV1", "report", &json!({}));
        registry.publish("DEV1", "report", &json!({}));

        assert_eq!(observer.deliveries.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_publish_in_registration_order() {
        let registry = ObserverRegistry::new();
        let events = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            registry.subscribe(
                Arc::new(Recorder {
                    label,
                    events: events.clone(),
                }),
                Vec::new,
            );
        }

        registry.publish("DEV1", "report", &json!({}));
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "first:report:DEV1",
                "second:report:DEV1",
                "third:report:DEV1"
            ]
        );
    }
}
