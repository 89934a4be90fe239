//! Command handling infrastructure.

use std::marker::PhantomData;

use common::AggregateId;
use event_store::{
    AppendOptions, EventEnvelope, EventStore, EventStoreExt, Sequence, SequenceRange,
};

use crate::aggregate::{Aggregate, DomainEvent};
use crate::error::{DomainError, Result};

/// Result of command execution.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The aggregate after applying the new events.
    pub aggregate: A,

    /// The events that were generated and persisted.
    pub events: Vec<A::Event>,

    /// The persisted envelopes, as read back from the store.
    pub envelopes: Vec<EventEnvelope>,

    /// Sequences written; None when the command produced no events.
    pub range: Option<SequenceRange>,
}

/// Trait for commands that can be executed against an aggregate.
///
/// Commands represent an intention to perform an action. They may be rejected
/// if the aggregate's current state doesn't allow the action.
pub trait Command: Send + Sync {
    /// The type of aggregate this command targets.
    type Aggregate: Aggregate;

    /// Returns the ID of the aggregate this command targets.
    fn aggregate_id(&self) -> AggregateId;

    /// Decides which events the command produces against the current state.
    fn decide(
        &self,
        aggregate: &Self::Aggregate,
    ) -> std::result::Result<
        Vec<<Self::Aggregate as Aggregate>::Event>,
        <Self::Aggregate as Aggregate>::Error,
    >;
}

/// Handler for executing commands against aggregates.
///
/// The handler is responsible for:
/// 1. Rebuilding the aggregate by replaying its stream
/// 2. Executing the command to produce events
/// 3. Appending all events in one call, guarded by the loaded sequence
pub struct CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    _phantom: PhantomData<A>,
}

impl<S, A> CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            _phantom: PhantomData,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads an aggregate from the event store.
    ///
    /// If the aggregate doesn't exist, returns a default instance.
    pub async fn load(&self, aggregate_id: &AggregateId) -> Result<A> {
        let mut aggregate = A::default();
        for envelope in self.store.load_stream(aggregate_id).await? {
            let event: A::Event = envelope.payload_as()?;
            aggregate.apply(event);
            aggregate.set_sequence(envelope.sequence);
        }
        Ok(aggregate)
    }

    /// Loads an aggregate, returning None if it doesn't exist.
    pub async fn load_existing(&self, aggregate_id: &AggregateId) -> Result<Option<A>> {
        let aggregate = self.load(aggregate_id).await?;
        Ok((aggregate.sequence() > Sequence::initial()).then_some(aggregate))
    }

    /// Executes a command through its `decide` implementation.
    pub async fn handle<C>(&self, command: &C) -> Result<CommandResult<A>>
    where
        C: Command<Aggregate = A>,
    {
        self.execute(&command.aggregate_id(), |aggregate| command.decide(aggregate))
            .await
    }

    /// Executes a command and persists the resulting events.
    ///
    /// The command function receives the current aggregate state and returns
    /// either a list of events to apply, or an error.
    #[tracing::instrument(
        skip(self, command_fn),
        fields(aggregate_type = A::aggregate_type(), aggregate_id = %aggregate_id)
    )]
    pub async fn execute<F>(&self, aggregate_id: &AggregateId, command_fn: F) -> Result<CommandResult<A>>
    where
        F: FnOnce(&A) -> std::result::Result<Vec<A::Event>, A::Error>,
    {
        let mut aggregate = self.load(aggregate_id).await?;
        let current = aggregate.sequence();

        let events =
            command_fn(&aggregate).map_err(|e| DomainError::Rejected(e.to_string()))?;

        if events.is_empty() {
            return Ok(CommandResult {
                aggregate,
                events: vec![],
                envelopes: vec![],
                range: None,
            });
        }

        let envelopes = self.build_envelopes(aggregate_id, current, &events)?;
        let range = self
            .store
            .append(aggregate_id, envelopes, AppendOptions::expect_sequence(current))
            .await?;
        tracing::debug!(first = %range.first, last = %range.last, "Events appended");

        for event in &events {
            aggregate.apply(event.clone());
        }
        aggregate.set_sequence(range.last);

        let envelopes = self
            .store
            .load_range(aggregate_id, range.first, range.last.next())
            .await?;

        Ok(CommandResult {
            aggregate,
            events,
            envelopes,
            range: Some(range),
        })
    }

    /// Builds event envelopes from domain events.
    fn build_envelopes(
        &self,
        aggregate_id: &AggregateId,
        current: Sequence,
        events: &[A::Event],
    ) -> Result<Vec<EventEnvelope>> {
        let mut envelopes = Vec::with_capacity(events.len());
        let mut sequence = current;

        for event in events {
            sequence = sequence.next();
            let envelope = EventEnvelope::builder()
                .aggregate_id(aggregate_id.clone())
                .aggregate_type(A::aggregate_type())
                .event_type(event.event_type())
                .sequence(sequence)
                .payload(event)?
                .build();
            envelopes.push(envelope);
        }

        Ok(envelopes)
    }
}
