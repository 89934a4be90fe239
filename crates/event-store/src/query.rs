use chrono::{DateTime, Utc};

use crate::{AggregateId, EventEnvelope, Sequence};

/// Builder for constructing event queries.
///
/// Allows filtering events by aggregate ID, event type, sequence range,
/// and time range.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Filter by aggregate ID.
    pub aggregate_id: Option<AggregateId>,

    /// Filter by aggregate type.
    pub aggregate_type: Option<String>,

    /// Filter by event types (any of these types).
    pub event_types: Option<Vec<String>>,

    /// Filter by minimum sequence (inclusive).
    pub from_sequence: Option<Sequence>,

    /// Filter by maximum sequence (inclusive).
    pub to_sequence: Option<Sequence>,

    /// Filter by events that occurred at or after this time.
    pub from_timestamp: Option<DateTime<Utc>>,

    /// Filter by events that occurred at or before this time.
    pub to_timestamp: Option<DateTime<Utc>>,

    /// Maximum number of events to return.
    pub limit: Option<usize>,

    /// Number of events to skip.
    pub offset: Option<usize>,
}

impl EventQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for a specific aggregate.
    pub fn for_aggregate(aggregate_id: impl Into<AggregateId>) -> Self {
        Self {
            aggregate_id: Some(aggregate_id.into()),
            ..Default::default()
        }
    }

    /// Creates a query for events of a specific type.
    pub fn for_event_type(event_type: impl Into<String>) -> Self {
        Self {
            event_types: Some(vec![event_type.into()]),
            ..Default::default()
        }
    }

    /// Filters by aggregate ID.
    pub fn aggregate_id(mut self, id: impl Into<AggregateId>) -> Self {
        self.aggregate_id = Some(id.into());
        self
    }

    /// Filters by aggregate type.
    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    /// Filters by event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types = Some(vec![event_type.into()]);
        self
    }

    /// Filters by multiple event types (any of these).
    pub fn event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// Filters to events starting from this sequence (inclusive).
    pub fn from_sequence(mut self, sequence: Sequence) -> Self {
        self.from_sequence = Some(sequence);
        self
    }

    /// Filters to events up to this sequence (inclusive).
    pub fn to_sequence(mut self, sequence: Sequence) -> Self {
        self.to_sequence = Some(sequence);
        self
    }

    /// Filters to events at or after this timestamp.
    pub fn from_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.from_timestamp = Some(timestamp);
        self
    }

    /// Filters to events at or before this timestamp.
    pub fn to_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.to_timestamp = Some(timestamp);
        self
    }

    /// Limits the number of events returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips this many events before returning results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if the event satisfies every filter of this query.
    ///
    /// Limit and offset are not part of matching.
    pub fn matches(&self, event: &EventEnvelope) -> bool {
        if let Some(ref id) = self.aggregate_id
            && &event.aggregate_id != id
        {
            return false;
        }
        if let Some(ref agg_type) = self.aggregate_type
            && &event.aggregate_type != agg_type
        {
            return false;
        }
        if let Some(ref types) = self.event_types
            && !types.contains(&event.event_type)
        {
            return false;
        }
        if let Some(from) = self.from_sequence
            && event.sequence < from
        {
            return false;
        }
        if let Some(to) = self.to_sequence
            && event.sequence > to
        {
            return false;
        }
        if let Some(from) = self.from_timestamp
            && event.occurred_at < from
        {
            return false;
        }
        if let Some(to) = self.to_timestamp
            && event.occurred_at > to
        {
            return false;
        }
        true
    }
}
