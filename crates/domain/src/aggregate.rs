//! Core aggregate and domain event traits.

use common::AggregateId;
use event_store::Sequence;
use serde::{Serialize, de::DeserializeOwned};

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event type name.
    ///
    /// Projections are registered against this name.
    fn event_type(&self) -> &'static str;
}

/// Trait for aggregates in an event-sourced system.
///
/// In event sourcing, aggregates:
/// - Are rebuilt by replaying events
/// - Generate events from commands
/// - Apply events to update state (pure, deterministic)
pub trait Aggregate: Default + Send + Sync + Sized {
    /// The type of events this aggregate produces and consumes.
    type Event: DomainEvent;

    /// The type of errors this aggregate can produce.
    type Error: std::error::Error + Send + Sync;

    /// Returns the aggregate type name.
    fn aggregate_type() -> &'static str;

    /// Returns the aggregate's identifier; None until its first event.
    fn id(&self) -> Option<&AggregateId>;

    /// Sequence of the last applied event; `Sequence::initial()` when new.
    fn sequence(&self) -> Sequence;

    /// Called by the command handler after each replayed or appended event.
    fn set_sequence(&mut self, sequence: Sequence);

    /// Applies an event to the aggregate, updating its state.
    ///
    /// Must be pure and must not fail: events are facts that already
    /// happened.
    fn apply(&mut self, event: Self::Event);

    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            self.apply(event);
        }
    }
}
