//! In-process publish/subscribe for appended events.
//!
//! The bus is a notification channel only. Subscribers must tolerate
//! duplicate and out-of-order delivery; the store remains the source of
//! truth and anything missed on the bus is recovered by reading it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::EventEnvelope;

/// Which events a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Events whose `event_type` equals the given name.
    Exact(String),
    /// Every event.
    All,
}

impl EventFilter {
    pub fn exact(event_type: impl Into<String>) -> Self {
        Self::Exact(event_type.into())
    }

    pub fn matches(&self, event: &EventEnvelope) -> bool {
        match self {
            Self::Exact(event_type) => &event.event_type == event_type,
            Self::All => true,
        }
    }
}

/// Receives events published on a bus.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: &EventEnvelope);
}

/// Opaque handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Registers a subscriber; it receives every matching event published afterwards.
    async fn subscribe(
        &self,
        filter: EventFilter,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionHandle;

    /// Removes a subscription. Returns false if the handle was unknown.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> bool;

    /// Delivers an event to every matching subscriber.
    async fn publish(&self, event: &EventEnvelope);
}

struct Subscription {
    handle: SubscriptionHandle,
    filter: EventFilter,
    subscriber: Arc<dyn EventSubscriber>,
}

/// Bus that calls subscribers in subscription order on the publishing task.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_handle: Arc<AtomicU64>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn subscribe(
        &self,
        filter: EventFilter,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().await.push(Subscription {
            handle,
            filter,
            subscriber,
        });
        handle
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|s| s.handle != handle);
        subscriptions.len() != before
    }

    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type, aggregate_id = %event.aggregate_id))]
    async fn publish(&self, event: &EventEnvelope) {
        // Snapshot so subscribers may (un)subscribe while being notified
        let targets: Vec<_> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.filter.matches(event))
            .map(|s| Arc::clone(&s.subscriber))
            .collect();

        for subscriber in targets {
            subscriber.on_event(event).await;
        }
    }
}
