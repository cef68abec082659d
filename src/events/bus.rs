//! In-process typed pub/sub bus
//!
//! Publishers never know their subscribers. `publish` runs handlers
//! sequentially in registration order; `publish_async` runs them
//! concurrently and returns once all have finished. Either way a handler
//! failure (error or panic) is caught, logged and counted without affecting
//! sibling handlers or the publisher.

use super::{EventKind, PharmacyEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_MAX_HISTORY: usize = 1000;

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable handler identity; duplicate subscriptions of the same name to
    /// the same event kind are ignored.
    fn name(&self) -> &str;

    async fn handle(&self, event: &PharmacyEvent) -> anyhow::Result<()>;
}

/// One history record, newest last; trimmed to `max_history`.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub event_type: &'static str,
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub events_published: u64,
    pub events_processed: u64,
    pub handler_errors: u64,
    pub active_subscriptions: usize,
    pub event_types: Vec<&'static str>,
    pub history_size: usize,
}

pub struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
    history: Mutex<VecDeque<EventRecord>>,
    max_history: usize,
    events_published: AtomicU64,
    events_processed: AtomicU64,
    handler_errors: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl EventBus {
    pub fn new(max_history: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            max_history,
            events_published: AtomicU64::new(0),
            events_processed: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
        }
    }

    /// Idempotent: a handler with the same name already registered for this
    /// kind is silently ignored.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let mut subs = self.subscribers.lock().expect("bus registry poisoned");
        let entry = subs.entry(kind).or_default();
        if entry.iter().any(|h| h.name() == handler.name()) {
            tracing::debug!(kind = %kind, handler = handler.name(), "already subscribed");
            return;
        }
        tracing::info!(kind = %kind, handler = handler.name(), "handler subscribed");
        entry.push(handler);
    }

    pub fn unsubscribe(&self, kind: EventKind, handler_name: &str) {
        let mut subs = self.subscribers.lock().expect("bus registry poisoned");
        if let Some(entry) = subs.get_mut(&kind) {
            entry.retain(|h| h.name() != handler_name);
        }
    }

    /// Publish synchronously: handlers run one after another in registration
    /// order, on the publisher's task.
    pub async fn publish(&self, event: PharmacyEvent) {
        let handlers = self.prepare(&event);
        for handler in handlers {
            self.run_isolated(&handler, &event).await;
        }
    }

    /// Publish with concurrent handler dispatch; returns after all handlers
    /// have finished.
    pub async fn publish_async(&self, event: PharmacyEvent) {
        let handlers = self.prepare(&event);
        let futures = handlers
            .iter()
            .map(|handler| self.run_isolated(handler, &event));
        futures::future::join_all(futures).await;
    }

    fn prepare(&self, event: &PharmacyEvent) -> Vec<Arc<dyn EventHandler>> {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.record(event);

        let subs = self.subscribers.lock().expect("bus registry poisoned");
        let handlers = subs.get(&event.kind()).cloned().unwrap_or_default();
        if handlers.is_empty() {
            tracing::debug!(kind = %event.kind(), "no subscribers");
        } else {
            tracing::info!(kind = %event.kind(), handlers = handlers.len(), "publishing");
        }
        handlers
    }

    async fn run_isolated(&self, handler: &Arc<dyn EventHandler>, event: &PharmacyEvent) {
        let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {
                self.events_processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                self.handler_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    kind = %event.kind(),
                    handler = handler.name(),
                    error = %e,
                    "handler failed"
                );
            }
            Err(_) => {
                self.handler_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    kind = %event.kind(),
                    handler = handler.name(),
                    "handler panicked"
                );
            }
        }
    }

    fn record(&self, event: &PharmacyEvent) {
        let mut history = self.history.lock().expect("bus history poisoned");
        history.push_back(EventRecord {
            event_type: event.kind().as_str(),
            event_id: event.event_id,
            timestamp: event.timestamp,
            data: event.data(),
        });
        while history.len() > self.max_history {
            history.pop_front();
        }
    }

    /// Recent events, optionally filtered by kind, newest last.
    pub fn history(&self, kind: Option<EventKind>, limit: usize) -> Vec<EventRecord> {
        let history = self.history.lock().expect("bus history poisoned");
        let filtered: Vec<&EventRecord> = history
            .iter()
            .filter(|r| kind.map(|k| r.event_type == k.as_str()).unwrap_or(true))
            .collect();
        let start = filtered.len().saturating_sub(limit);
        filtered[start..].iter().map(|r| (*r).clone()).collect()
    }

    pub fn stats(&self) -> BusStats {
        let subs = self.subscribers.lock().expect("bus registry poisoned");
        BusStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            active_subscriptions: subs.values().map(Vec::len).sum(),
            event_types: subs.keys().map(|k| k.as_str()).collect(),
            history_size: self.history.lock().expect("bus history poisoned").len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        name: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Counting {
        fn name(&self) -> &str {
            &self.name
        }
        async fn handle(&self, _event: &PharmacyEvent) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        async fn handle(&self, _event: &PharmacyEvent) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }
        async fn handle(&self, _event: &PharmacyEvent) -> anyhow::Result<()> {
            panic!("handler panic")
        }
    }

    fn rejected_event() -> PharmacyEvent {
        PharmacyEvent::new(EventPayload::OrderRejected {
            user_id: "PID-001001".to_string(),
            reason: "test".to_string(),
        })
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_siblings() {
        let bus = EventBus::default();
        let before = Arc::new(Counting {
            name: "before".to_string(),
            calls: AtomicUsize::new(0),
        });
        let after = Arc::new(Counting {
            name: "after".to_string(),
            calls: AtomicUsize::new(0),
        });

        bus.subscribe(EventKind::OrderRejected, before.clone());
        bus.subscribe(EventKind::OrderRejected, Arc::new(Failing));
        bus.subscribe(EventKind::OrderRejected, after.clone());

        bus.publish(rejected_event()).await;

        assert_eq!(before.calls.load(Ordering::SeqCst), 1);
        assert_eq!(after.calls.load(Ordering::SeqCst), 1);
        let stats = bus.stats();
        assert_eq!(stats.handler_errors, 1);
        assert_eq!(stats.events_processed, 2);
        assert_eq!(stats.events_published, 1);
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let bus = EventBus::default();
        let sibling = Arc::new(Counting {
            name: "sibling".to_string(),
            calls: AtomicUsize::new(0),
        });
        bus.subscribe(EventKind::OrderRejected, Arc::new(Panicking));
        bus.subscribe(EventKind::OrderRejected, sibling.clone());

        bus.publish_async(rejected_event()).await;

        assert_eq!(sibling.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().handler_errors, 1);
    }

    #[tokio::test]
    async fn duplicate_subscription_ignored() {
        let bus = EventBus::default();
        let handler = Arc::new(Counting {
            name: "dup".to_string(),
            calls: AtomicUsize::new(0),
        });
        bus.subscribe(EventKind::OrderRejected, handler.clone());
        bus.subscribe(EventKind::OrderRejected, handler.clone());
        assert_eq!(bus.stats().active_subscriptions, 1);

        bus.publish(rejected_event()).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn history_is_bounded_and_filterable() {
        let bus = EventBus::new(3);
        for _ in 0..5 {
            bus.publish(rejected_event()).await;
        }
        assert_eq!(bus.stats().history_size, 3);
        assert_eq!(bus.history(Some(EventKind::OrderRejected), 10).len(), 3);
        assert_eq!(bus.history(Some(EventKind::OrderCreated), 10).len(), 0);
        assert_eq!(bus.history(None, 2).len(), 2);
    }
}
