use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::RwLock;

use crate::{
    AggregateId, EventEnvelope, EventQuery, EventStoreError, Result, Sequence, SequenceRange,
    store::{AppendOptions, EventStore, EventStream, validate_events_for_append},
};

#[derive(Default)]
struct Log {
    /// All events in append order; an event's position is its index + 1.
    events: Vec<EventEnvelope>,
    /// Per-aggregate indexes into `events`, in sequence order.
    streams: HashMap<AggregateId, Vec<usize>>,
}

impl Log {
    fn head(&self, aggregate_id: &AggregateId) -> Sequence {
        self.streams
            .get(aggregate_id)
            .and_then(|indexes| indexes.last())
            .map(|&idx| self.events[idx].sequence)
            .unwrap_or_else(Sequence::initial)
    }
}

/// In-memory event store implementation.
///
/// Provides the same interface and guarantees as the PostgreSQL
/// implementation; used by tests, benches and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.log.read().await.events.len()
    }

    /// Clears all events.
    pub async fn clear(&self) {
        let mut log = self.log.write().await;
        log.events.clear();
        log.streams.clear();
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<SequenceRange> {
        let range = validate_events_for_append(aggregate_id, &events)?;

        let mut log = self.log.write().await;
        let current = log.head(aggregate_id);

        if let Some(expected) = options.expected_sequence
            && current != expected
        {
            metrics::counter!("event_store_append_conflicts_total").increment(1);
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id: aggregate_id.clone(),
                expected,
                actual: current,
            });
        }

        // Unique (aggregate, sequence) constraint
        if range.first <= current {
            metrics::counter!("event_store_append_conflicts_total").increment(1);
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id: aggregate_id.clone(),
                expected: options.expected_sequence.unwrap_or(range.first.prev()),
                actual: current,
            });
        }
        if range.first != current.next() {
            return Err(EventStoreError::Validation(format!(
                "Sequence gap for aggregate {aggregate_id}: head is {current}, batch starts at {}",
                range.first
            )));
        }

        let count = events.len();
        for mut event in events {
            let idx = log.events.len();
            event.position = idx as u64 + 1;
            log.events.push(event);
            log.streams.entry(aggregate_id.clone()).or_default().push(idx);
        }

        metrics::counter!("event_store_events_appended_total").increment(count as u64);
        Ok(range)
    }

    async fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from_sequence: Sequence,
    ) -> Result<EventStream> {
        let log = self.log.read().await;
        let events: Vec<_> = log
            .streams
            .get(aggregate_id)
            .map(|indexes| {
                indexes
                    .iter()
                    .map(|&idx| &log.events[idx])
                    .filter(|e| e.sequence >= from_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }

    async fn read_all(&self, from_position: u64) -> Result<EventStream> {
        let log = self.log.read().await;
        let skip = from_position.saturating_sub(1) as usize;
        let events: Vec<_> = log.events.iter().skip(skip).cloned().collect();

        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }

    async fn head(&self, aggregate_id: &AggregateId) -> Result<Option<Sequence>> {
        let log = self.log.read().await;
        let head = log.head(aggregate_id);
        Ok((head != Sequence::initial()).then_some(head))
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);

        // Append order is position order, which is already the required output order
        Ok(log
            .events
            .iter()
            .filter(|e| query.matches(e))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        Ok(log
            .events
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventStoreExt;
    use futures_util::StreamExt;

    fn create_test_event(aggregate_id: &str, sequence: i64, event_type: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(aggregate_id)
            .aggregate_type("TestAggregate")
            .event_type(event_type)
            .sequence(Sequence::new(sequence))
            .payload_raw(serde_json::json!({"test": true}))
            .build()
    }

    fn id(value: &str) -> AggregateId {
        AggregateId::from(value)
    }

    #[tokio::test]
    async fn append_single_event() {
        let store = InMemoryEventStore::new();
        let event = create_test_event("X", 1, "Created");

        let range = store
            .append(&id("X"), vec![event], AppendOptions::expect_new())
            .await
            .unwrap();
        assert_eq!(range.last, Sequence::first());

        let events = store.load_stream(&id("X")).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].position, 1);
    }

    #[tokio::test]
    async fn append_multiple_events() {
        let store = InMemoryEventStore::new();

        let events = vec![
            create_test_event("X", 1, "Event1"),
            create_test_event("X", 2, "Event2"),
            create_test_event("X", 3, "Event3"),
        ];

        let range = store
            .append(&id("X"), events, AppendOptions::expect_new())
            .await
            .unwrap();
        assert_eq!(range, SequenceRange::new(Sequence::new(1), Sequence::new(3)));

        let stored = store.load_stream(&id("X")).await.unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn concurrency_conflict_on_wrong_expected_sequence() {
        let store = InMemoryEventStore::new();

        store
            .append(
                &id("X"),
                vec![create_test_event("X", 1, "Event1")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        let result = store
            .append(
                &id("X"),
                vec![create_test_event("X", 2, "Event2")],
                AppendOptions::expect_sequence(Sequence::initial()),
            )
            .await;

        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_sequence_without_expectation_conflicts() {
        let store = InMemoryEventStore::new();
        store
            .append(
                &id("X"),
                vec![create_test_event("X", 1, "Event1")],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        let result = store
            .append(
                &id("X"),
                vec![create_test_event("X", 1, "Event1")],
                AppendOptions::new(),
            )
            .await;
        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn gap_after_head_is_rejected() {
        let store = InMemoryEventStore::new();
        let result = store
            .append(
                &id("X"),
                vec![create_test_event("X", 2, "Event2")],
                AppendOptions::new(),
            )
            .await;
        assert!(matches!(result, Err(EventStoreError::Validation(_))));
    }

    #[tokio::test]
    async fn failed_batch_is_not_partially_visible() {
        let store = InMemoryEventStore::new();
        let result = store
            .append(
                &id("X"),
                vec![
                    create_test_event("X", 1, "Event1"),
                    create_test_event("Y", 2, "Event2"),
                ],
                AppendOptions::expect_new(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn read_stream_from_sequence() {
        let store = InMemoryEventStore::new();

        let events = vec![
            create_test_event("X", 1, "Event1"),
            create_test_event("X", 2, "Event2"),
            create_test_event("X", 3, "Event3"),
        ];
        store
            .append(&id("X"), events, AppendOptions::new())
            .await
            .unwrap();

        let from_2: Vec<_> = store
            .read_stream(&id("X"), Sequence::new(2))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(from_2.len(), 2);
        assert_eq!(from_2[0].as_ref().unwrap().sequence, Sequence::new(2));
        assert_eq!(from_2[1].as_ref().unwrap().sequence, Sequence::new(3));
    }

    #[tokio::test]
    async fn load_range_is_half_open() {
        let store = InMemoryEventStore::new();
        let events = (1..=5)
            .map(|s| create_test_event("X", s, "Event"))
            .collect();
        store
            .append(&id("X"), events, AppendOptions::new())
            .await
            .unwrap();

        let range = store
            .load_range(&id("X"), Sequence::new(2), Sequence::new(4))
            .await
            .unwrap();
        let sequences: Vec<_> = range.iter().map(|e| e.sequence.as_i64()).collect();
        assert_eq!(sequences, vec![2, 3]);
    }

    #[tokio::test]
    async fn get_events_by_type() {
        let store = InMemoryEventStore::new();

        store
            .append(
                &id("X"),
                vec![create_test_event("X", 1, "Created")],
                AppendOptions::new(),
            )
            .await
            .unwrap();
        store
            .append(
                &id("Y"),
                vec![create_test_event("Y", 1, "Renamed")],
                AppendOptions::new(),
            )
            .await
            .unwrap();
        store
            .append(
                &id("X"),
                vec![create_test_event("X", 2, "Created")],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        let created = store.get_events_by_type("Created").await.unwrap();
        assert_eq!(created.len(), 2);

        let renamed = store.get_events_by_type("Renamed").await.unwrap();
        assert_eq!(renamed.len(), 1);
    }

    #[tokio::test]
    async fn query_events_with_filters() {
        let store = InMemoryEventStore::new();

        let events = vec![
            create_test_event("X", 1, "Event1"),
            create_test_event("X", 2, "Event2"),
            create_test_event("X", 3, "Event3"),
        ];
        store
            .append(&id("X"), events, AppendOptions::new())
            .await
            .unwrap();

        let query = EventQuery::new()
            .aggregate_id("X")
            .from_sequence(Sequence::new(2))
            .to_sequence(Sequence::new(2));

        let results = store.query_events(query).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].sequence, Sequence::new(2));
    }

    #[tokio::test]
    async fn read_all_resumes_from_position() {
        let store = InMemoryEventStore::new();

        store
            .append(
                &id("X"),
                vec![create_test_event("X", 1, "Event1")],
                AppendOptions::new(),
            )
            .await
            .unwrap();
        store
            .append(
                &id("Y"),
                vec![create_test_event("Y", 1, "Event2")],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        let all: Vec<_> = store.read_all(0).await.unwrap().collect().await;
        assert_eq!(all.len(), 2);

        let tail: Vec<_> = store.read_all(2).await.unwrap().collect().await;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].as_ref().unwrap().aggregate_id, id("Y"));
    }

    #[tokio::test]
    async fn head_tracks_latest_sequence() {
        let store = InMemoryEventStore::new();

        assert!(store.head(&id("X")).await.unwrap().is_none());

        let events = vec![
            create_test_event("X", 1, "Event1"),
            create_test_event("X", 2, "Event2"),
        ];
        store
            .append(&id("X"), events, AppendOptions::new())
            .await
            .unwrap();

        assert_eq!(store.head(&id("X")).await.unwrap(), Some(Sequence::new(2)));
        assert!(store.aggregate_exists(&id("X")).await.unwrap());
    }
}
