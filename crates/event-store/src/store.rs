use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::TryStreamExt;

use crate::{AggregateId, EventEnvelope, EventQuery, EventStoreError, Result, Sequence, SequenceRange};

/// Options for appending events to the store.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected head sequence of the aggregate for optimistic concurrency control.
    /// If None, no check is performed (use with caution).
    pub expected_sequence: Option<Sequence>,
}

impl AppendOptions {
    /// Creates options with no sequence check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the aggregate head to be at a specific sequence.
    pub fn expect_sequence(sequence: Sequence) -> Self {
        Self {
            expected_sequence: Some(sequence),
        }
    }

    /// Creates options expecting the aggregate to have no events yet.
    pub fn expect_new() -> Self {
        Self {
            expected_sequence: Some(Sequence::initial()),
        }
    }
}

/// A lazily evaluated stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope>> + Send>>;

/// Core trait for event store implementations.
///
/// An event store is a durable, append-only log ordered per aggregate.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events to an aggregate's stream.
    ///
    /// Events are appended atomically - either all become visible or none do.
    /// If `options.expected_sequence` is set, the operation fails with
    /// `ConcurrencyConflict` when the current head doesn't match.
    ///
    /// Returns the range of sequences written.
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<SequenceRange>;

    /// Streams an aggregate's events with `sequence >= from_sequence`, oldest first.
    ///
    /// The stream is finite: it ends at the head observed when reading starts.
    async fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from_sequence: Sequence,
    ) -> Result<EventStream>;

    /// Streams every event with `position >= from_position` in position order.
    async fn read_all(&self, from_position: u64) -> Result<EventStream>;

    /// Gets the head sequence of an aggregate.
    ///
    /// Returns None if the aggregate has no events.
    async fn head(&self, aggregate_id: &AggregateId) -> Result<Option<Sequence>>;

    /// Retrieves events matching a query.
    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>>;

    /// Retrieves events by type, in position order.
    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<EventEnvelope>>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Appends a single event to the store.
    async fn append_event(&self, event: EventEnvelope, options: AppendOptions) -> Result<Sequence> {
        let aggregate_id = event.aggregate_id.clone();
        let range = self.append(&aggregate_id, vec![event], options).await?;
        Ok(range.last)
    }

    /// Checks if an aggregate exists (has any events).
    async fn aggregate_exists(&self, aggregate_id: &AggregateId) -> Result<bool> {
        Ok(self.head(aggregate_id).await?.is_some())
    }

    /// Collects an aggregate's full stream into memory.
    async fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<EventEnvelope>> {
        self.read_stream(aggregate_id, Sequence::first())
            .await?
            .try_collect()
            .await
    }

    /// Collects the aggregate's events in `[from, to)`.
    async fn load_range(
        &self,
        aggregate_id: &AggregateId,
        from: Sequence,
        to: Sequence,
    ) -> Result<Vec<EventEnvelope>> {
        if from >= to {
            return Ok(Vec::new());
        }
        self.read_stream(aggregate_id, from)
            .await?
            .try_take_while(|event| {
                let keep = event.sequence < to;
                async move { Ok(keep) }
            })
            .try_collect()
            .await
    }
}

// Blanket implementation for all EventStore implementations
impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Validates a batch before appending and returns the sequence range it covers.
pub fn validate_events_for_append(
    aggregate_id: &AggregateId,
    events: &[EventEnvelope],
) -> Result<SequenceRange> {
    let (first, rest) = events
        .split_first()
        .ok_or_else(|| EventStoreError::Validation("Cannot append empty event list".to_string()))?;

    if first.sequence < Sequence::first() {
        return Err(EventStoreError::Validation(format!(
            "Event sequences start at 1, got {}",
            first.sequence
        )));
    }

    for event in events {
        if &event.aggregate_id != aggregate_id {
            return Err(EventStoreError::Validation(format!(
                "Event {} belongs to aggregate {}, not {}",
                event.event_id, event.aggregate_id, aggregate_id
            )));
        }
        if event.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::Validation(
                "All events must have the same aggregate type".to_string(),
            ));
        }
    }

    // Sequences must be consecutive
    let mut expected = first.sequence;
    for event in rest {
        expected = expected.next();
        if event.sequence != expected {
            return Err(EventStoreError::Validation(format!(
                "Event sequences must be consecutive. Expected {}, got {}",
                expected, event.sequence
            )));
        }
    }

    Ok(SequenceRange::new(first.sequence, expected))
}
