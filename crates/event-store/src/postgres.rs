use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::{TryStreamExt, stream};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, EventEnvelope, EventId, EventQuery, EventStoreError, Result, Sequence,
    SequenceRange,
    store::{AppendOptions, EventStore, EventStream, validate_events_for_append},
};

const SELECT_COLUMNS: &str = "SELECT id, event_type, aggregate_id, aggregate_type, sequence, position, occurred_at, payload, metadata FROM events";

/// Rows fetched per round trip when streaming.
const PAGE_SIZE: i64 = 500;

/// PostgreSQL-backed event store implementation.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_event(row: PgRow) -> Result<EventEnvelope> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;
        let position: i64 = row.try_get("position")?;

        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_type: row.try_get("event_type")?,
            aggregate_id: AggregateId::new(row.try_get::<String, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            sequence: Sequence::new(row.try_get("sequence")?),
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
            metadata,
            position: position as u64,
        })
    }

    /// Fetches one page of a stream and the cursor for the following page.
    ///
    /// With an aggregate the cursor is a sequence, otherwise a global position.
    async fn next_page(
        pool: &PgPool,
        aggregate_id: Option<&AggregateId>,
        cursor: i64,
    ) -> Result<Option<(Vec<EventEnvelope>, Option<i64>)>> {
        let rows = match aggregate_id {
            Some(id) => {
                sqlx::query(&format!(
                    "{SELECT_COLUMNS} WHERE aggregate_id = $1 AND sequence >= $2 ORDER BY sequence ASC LIMIT $3"
                ))
                .bind(id.as_str())
                .bind(cursor)
                .bind(PAGE_SIZE)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "{SELECT_COLUMNS} WHERE position >= $1 ORDER BY position ASC LIMIT $2"
                ))
                .bind(cursor)
                .bind(PAGE_SIZE)
                .fetch_all(pool)
                .await?
            }
        };

        let batch = rows
            .into_iter()
            .map(Self::row_to_event)
            .collect::<Result<Vec<_>>>()?;

        let Some(last) = batch.last() else {
            return Ok(None);
        };
        let next = if (batch.len() as i64) < PAGE_SIZE {
            None
        } else if aggregate_id.is_some() {
            Some(last.sequence.as_i64() + 1)
        } else {
            Some(last.position as i64 + 1)
        };

        Ok(Some((batch, next)))
    }

    fn paged(&self, aggregate_id: Option<AggregateId>, start: i64) -> EventStream {
        let pool = self.pool.clone();
        let pages = stream::try_unfold(Some(start), move |cursor| {
            let pool = pool.clone();
            let aggregate_id = aggregate_id.clone();
            async move {
                match cursor {
                    Some(cursor) => Self::next_page(&pool, aggregate_id.as_ref(), cursor).await,
                    None => Ok(None),
                }
            }
        });

        Box::pin(
            pages
                .map_ok(|batch| stream::iter(batch.into_iter().map(Ok::<_, EventStoreError>)))
                .try_flatten(),
        )
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<SequenceRange> {
        let range = validate_events_for_append(aggregate_id, &events)?;

        let mut tx = self.pool.begin().await?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id.as_str())
                .fetch_one(&mut *tx)
                .await?;
        let current = Sequence::new(current.unwrap_or(0));

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
        if range.first > current.next() {
            return Err(EventStoreError::Validation(format!(
                "Sequence gap for aggregate {aggregate_id}: head is {current}, batch starts at {}",
                range.first
            )));
        }

        for event in &events {
            let metadata_json = serde_json::to_value(&event.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO events (id, event_type, aggregate_id, aggregate_type, sequence, occurred_at, payload, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(&event.event_type)
            .bind(event.aggregate_id.as_str())
            .bind(&event.aggregate_type)
            .bind(event.sequence.as_i64())
            .bind(event.occurred_at)
            .bind(&event.payload)
            .bind(metadata_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // A concurrent writer took this sequence between our read and insert
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_aggregate_sequence")
                {
                    metrics::counter!("event_store_append_conflicts_total").increment(1);
                    return EventStoreError::ConcurrencyConflict {
                        aggregate_id: aggregate_id.clone(),
                        expected: options.expected_sequence.unwrap_or(current),
                        actual: event.sequence,
                    };
                }
                EventStoreError::Database(e)
            })?;
        }

        tx.commit().await?;

        metrics::counter!("event_store_events_appended_total").increment(events.len() as u64);
        Ok(range)
    }

    async fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from_sequence: Sequence,
    ) -> Result<EventStream> {
        Ok(self.paged(Some(aggregate_id.clone()), from_sequence.as_i64()))
    }

    async fn read_all(&self, from_position: u64) -> Result<EventStream> {
        Ok(self.paged(None, from_position as i64))
    }

    async fn head(&self, aggregate_id: &AggregateId) -> Result<Option<Sequence>> {
        let sequence: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(sequence.map(Sequence::new))
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>> {
        let mut sql = format!("{SELECT_COLUMNS} WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.aggregate_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND aggregate_id = ${param_count}"));
        }
        if query.aggregate_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND aggregate_type = ${param_count}"));
        }
        if query.event_types.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND event_type = ANY(${param_count})"));
        }
        if query.from_sequence.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND sequence >= ${param_count}"));
        }
        if query.to_sequence.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND sequence <= ${param_count}"));
        }
        if query.from_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND occurred_at >= ${param_count}"));
        }
        if query.to_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND occurred_at <= ${param_count}"));
        }

        sql.push_str(" ORDER BY position ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(id) = query.aggregate_id {
            sqlx_query = sqlx_query.bind(id.into_inner());
        }
        if let Some(agg_type) = query.aggregate_type {
            sqlx_query = sqlx_query.bind(agg_type);
        }
        if let Some(event_types) = query.event_types {
            sqlx_query = sqlx_query.bind(event_types);
        }
        if let Some(from) = query.from_sequence {
            sqlx_query = sqlx_query.bind(from.as_i64());
        }
        if let Some(to) = query.to_sequence {
            sqlx_query = sqlx_query.bind(to.as_i64());
        }
        if let Some(from_ts) = query.from_timestamp {
            sqlx_query = sqlx_query.bind(from_ts);
        }
        if let Some(to_ts) = query.to_timestamp {
            sqlx_query = sqlx_query.bind(to_ts);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE event_type = $1 ORDER BY position ASC"
        ))
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }
}
