pub mod bus;
pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use bus::{EventBus, EventFilter, EventSubscriber, InMemoryEventBus, SubscriptionHandle};
pub use common::AggregateId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Sequence, SequenceRange};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use query::EventQuery;
pub use store::{AppendOptions, EventStore, EventStoreExt, EventStream};
