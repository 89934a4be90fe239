//! The projector: drives stored events through registered projections into
//! read models.
//!
//! Every `(projection, event)` pair is a *unit*. A unit moves through
//! `Pending -> Applying -> Applied`, possibly via `Retrying`, or ends
//! `DeadLettered`. Units that never reach `Applying` end as `Skipped`,
//! `Blocked`, `Paused` or `Queued`.
//!
//! Events of one aggregate are serialized through a *lane*: an async mutex
//! holding the highest sequence seen for that aggregate and the set of
//! projections known to be caught up with it. An event arriving ahead of
//! the lane cursor pulls the missing range from the event store first, and
//! a projection that is not caught up (newly registered, resumed, released
//! from a dead letter) is filled from its checkpoint before it sees a later
//! event.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, ProjectionId};
use dashmap::{DashMap, DashSet};
use event_store::{
    EventBus, EventEnvelope, EventFilter, EventId, EventStore, EventStoreExt, EventSubscriber,
    Sequence, SubscriptionHandle,
};
use futures_util::TryStreamExt;
use read_model::{Document, ModelUpdate, ReadModel, ReadModelStore, Version};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::dead_letter::{DeadLetter, DeadLetterStore, InMemoryDeadLetterStore};
use crate::projection::{
    OrderingMode, OverflowPolicy, Projection, ProjectionDefinition, ProjectionOutcome,
};
use crate::registry::{ProjectionRegistry, RegisteredProjection};
use crate::{FailureKind, ProjectionError, ProjectorConfig, Result};

/// Metadata key under which read models record the last applied sequence
/// per projection and aggregate.
const APPLIED_KEY: &str = "applied";

/// State of a `(projection, event)` unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Applying,
    Retrying,
    Applied,
    /// Already covered by the checkpoint or the model's applied marker.
    Skipped,
    /// A strict projection is held back by a dead letter for this aggregate.
    Blocked,
    Paused,
    DeadLettered,
    /// Handed to a best-effort projection's ring.
    Queued,
}

impl UnitState {
    /// Whether the unit has finished; `Pending`, `Applying` and `Retrying`
    /// are the only non-terminal states.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Applying | Self::Retrying)
    }
}

/// Outcome of one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub projection_id: ProjectionId,
    pub event_id: EventId,
    pub aggregate_id: AggregateId,
    pub sequence: Sequence,
    pub state: UnitState,
    pub attempts: u32,
}

impl UnitReport {
    fn new(projection_id: &ProjectionId, event: &EventEnvelope, state: UnitState, attempts: u32) -> Self {
        Self {
            projection_id: projection_id.clone(),
            event_id: event.event_id,
            aggregate_id: event.aggregate_id.clone(),
            sequence: event.sequence,
            state,
            attempts,
        }
    }
}

/// Operator view of a projection's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointStatus {
    pub projection_id: ProjectionId,
    pub active: bool,
    pub paused: bool,
    pub ordering: OrderingMode,
    pub positions: HashMap<AggregateId, Sequence>,
    pub events_applied: u64,
    pub dead_letters: usize,
    pub dropped: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Lane {
    /// Highest sequence dispatched for the aggregate in this process.
    cursor: Option<Sequence>,
    /// Projections caught up with the cursor.
    current: HashSet<ProjectionId>,
}

/// Bounded queue of a best-effort projection; full pushes evict the oldest.
struct Ring {
    capacity: usize,
    events: parking_lot::Mutex<VecDeque<EventEnvelope>>,
    notify: Notify,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: parking_lot::Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    fn push(&self, event: EventEnvelope) -> Option<EventEnvelope> {
        let evicted = {
            let mut events = self.events.lock();
            let evicted = if events.len() >= self.capacity {
                events.pop_front()
            } else {
                None
            };
            events.push_back(event);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    fn pop(&self) -> Option<EventEnvelope> {
        self.events.lock().pop_front()
    }
}

struct Runtime {
    shards: Vec<mpsc::Sender<EventEnvelope>>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

struct Inner<S> {
    store: S,
    registry: Arc<ProjectionRegistry>,
    read_models: Arc<dyn ReadModelStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    config: ProjectorConfig,
    paused: DashSet<ProjectionId>,
    lanes: DashMap<AggregateId, Arc<Mutex<Lane>>>,
    rings: DashMap<ProjectionId, Arc<Ring>>,
    dropped: DashMap<ProjectionId, u64>,
    runtime: parking_lot::Mutex<Option<Runtime>>,
}

/// Builder for [`Projector`]; stores not supplied default to in-memory ones.
pub struct ProjectorBuilder<S> {
    store: S,
    read_models: Arc<dyn ReadModelStore>,
    registry: Option<Arc<ProjectionRegistry>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
    config: ProjectorConfig,
}

impl<S: EventStore + 'static> ProjectorBuilder<S> {
    /// Shares an existing registry instead of creating an empty one.
    pub fn registry(mut self, registry: Arc<ProjectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the checkpoint store.
    pub fn checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Sets the dead-letter store.
    pub fn dead_letters(mut self, dead_letters: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Sets worker, queue and retry settings.
    pub fn config(mut self, config: ProjectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Creates the projector. It is not running until [`Projector::start`].
    pub fn build(self) -> Projector<S> {
        Projector {
            inner: Arc::new(Inner {
                store: self.store,
                registry: self.registry.unwrap_or_default(),
                read_models: self.read_models,
                checkpoints: self
                    .checkpoints
                    .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
                dead_letters: self
                    .dead_letters
                    .unwrap_or_else(|| Arc::new(InMemoryDeadLetterStore::new())),
                config: self.config,
                paused: DashSet::new(),
                lanes: DashMap::new(),
                rings: DashMap::new(),
                dropped: DashMap::new(),
                runtime: parking_lot::Mutex::new(None),
            }),
        }
    }
}

/// Applies events to read models through the registered projections.
///
/// Cheap to clone; clones share lanes, workers and stores.
pub struct Projector<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Projector<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: EventStore + 'static> Projector<S> {
    /// Creates a builder reading events from `store` and writing to
    /// `read_models`.
    pub fn builder(store: S, read_models: Arc<dyn ReadModelStore>) -> ProjectorBuilder<S> {
        ProjectorBuilder {
            store,
            read_models,
            registry: None,
            checkpoints: None,
            dead_letters: None,
            config: ProjectorConfig::default(),
        }
    }

    /// The event store events are read from when filling gaps.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// The projection registry.
    pub fn registry(&self) -> &Arc<ProjectionRegistry> {
        &self.inner.registry
    }

    /// The read-model store projections write to.
    pub fn read_models(&self) -> &Arc<dyn ReadModelStore> {
        &self.inner.read_models
    }

    /// The projector settings.
    pub fn config(&self) -> &ProjectorConfig {
        &self.inner.config
    }

    /// Whether worker shards are running.
    pub fn is_running(&self) -> bool {
        self.inner.runtime.lock().is_some()
    }

    /// Registers a projection and creates its checkpoint.
    pub async fn register_projection(
        &self,
        definition: ProjectionDefinition,
        projection: Arc<dyn Projection>,
    ) -> Result<()> {
        let id = definition.id.clone();
        let overflow = definition.config.overflow;
        self.inner.registry.register(definition, projection)?;
        self.inner.checkpoints.ensure(&id).await?;

        if let OverflowPolicy::DropOldest { capacity } = overflow {
            let mut runtime = self.inner.runtime.lock();
            if let Some(runtime) = runtime.as_mut() {
                spawn_ring(&self.inner, runtime, id, capacity);
            }
        }
        Ok(())
    }

    /// Spawns the worker shards and best-effort rings. Calling it again
    /// while running does nothing.
    pub fn start(&self) {
        let mut slot = self.inner.runtime.lock();
        if slot.is_some() {
            return;
        }

        let workers = self.inner.config.workers.max(1);
        let (shutdown, _) = watch::channel(false);
        let mut runtime = Runtime {
            shards: Vec::with_capacity(workers),
            shutdown,
            handles: Vec::with_capacity(workers),
        };
        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));
            runtime.shards.push(tx);
            let handle = tokio::spawn(run_worker(
                Arc::clone(&self.inner),
                shard,
                rx,
                runtime.shutdown.subscribe(),
            ));
            runtime.handles.push(handle);
        }

        for definition in self.inner.registry.list() {
            if let OverflowPolicy::DropOldest { capacity } = definition.config.overflow {
                spawn_ring(&self.inner, &mut runtime, definition.id, capacity);
            }
        }

        *slot = Some(runtime);
        tracing::info!(workers, "Projector started");
    }

    /// Stops pulling events and waits for in-flight units to finish.
    ///
    /// Events still queued are dropped from memory; they remain in the
    /// event store and are picked up by [`catch_up`](Self::catch_up).
    pub async fn stop(&self) {
        let runtime = { self.inner.runtime.lock().take() };
        let Some(runtime) = runtime else {
            return;
        };

        let _ = runtime.shutdown.send(true);
        drop(runtime.shards);
        for handle in runtime.handles {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "Projector task ended abnormally");
            }
        }
        self.inner.rings.clear();
        tracing::info!("Projector stopped");
    }

    /// Hands an event to its aggregate's worker shard, waiting while the
    /// shard queue is full.
    pub async fn enqueue(&self, event: EventEnvelope) -> Result<()> {
        let sender = {
            let runtime = self.inner.runtime.lock();
            let runtime = runtime.as_ref().ok_or(ProjectionError::NotRunning)?;
            runtime.shards[shard_for(&event.aggregate_id, runtime.shards.len())].clone()
        };
        sender
            .send(event)
            .await
            .map_err(|_| ProjectionError::NotRunning)
    }

    /// Projects an event on the calling task and returns once every
    /// matching projection has reached a terminal state.
    #[tracing::instrument(
        skip(self, event),
        fields(
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            sequence = %event.sequence
        )
    )]
    pub async fn process(&self, event: &EventEnvelope) -> Result<Vec<UnitReport>> {
        self.inner.deliver(event).await
    }

    /// Replays the whole event store through the projections. Events the
    /// checkpoints already cover are skipped. Returns the number of events
    /// read.
    #[tracing::instrument(skip(self))]
    pub async fn catch_up(&self) -> Result<u64> {
        let mut events = self.inner.store.read_all(0).await?;
        let mut count = 0u64;
        while let Some(event) = events.try_next().await? {
            self.inner.deliver(&event).await?;
            count += 1;
        }
        tracing::info!(events = count, "Catch-up complete");
        Ok(count)
    }

    /// Pauses a projection. Its units report `Paused` until it is resumed;
    /// the checkpoint stays where it is.
    pub fn pause(&self, id: &ProjectionId) -> Result<()> {
        self.require(id)?;
        self.inner.paused.insert(id.clone());
        tracing::info!(projection = %id, "Projection paused");
        Ok(())
    }

    /// Resumes a projection and catches it up on every aggregate this
    /// projector has seen.
    #[tracing::instrument(skip(self, id), fields(projection = %id))]
    pub async fn resume(&self, id: &ProjectionId) -> Result<()> {
        let entry = self.require(id)?;
        self.inner.paused.remove(id);

        let lanes: Vec<_> = self
            .inner
            .lanes
            .iter()
            .map(|lane| (lane.key().clone(), Arc::clone(lane.value())))
            .collect();
        for (aggregate_id, handle) in lanes {
            let mut lane = handle.lock().await;
            if lane.current.contains(id) {
                continue;
            }
            let Some(cursor) = lane.cursor else {
                continue;
            };
            if self.inner.fill(&entry, &aggregate_id, cursor.next()).await?.is_none() {
                lane.current.insert(id.clone());
            }
        }
        tracing::info!("Projection resumed");
        Ok(())
    }

    /// Whether a projection is paused.
    pub fn is_paused(&self, id: &ProjectionId) -> bool {
        self.inner.paused.contains(id)
    }

    /// Reports a projection's checkpoint, dead-letter count and dropped
    /// events.
    pub async fn checkpoint_status(&self, id: &ProjectionId) -> Result<CheckpointStatus> {
        let entry = self.require(id)?;
        let checkpoint = self.inner.checkpoints.load(id).await?;
        let dead_letters = self.inner.dead_letters.count(id).await?;
        let dropped = self.inner.dropped.get(id).map(|n| *n).unwrap_or(0);

        let (positions, events_applied, updated_at) = match checkpoint {
            Some(cp) => (cp.positions, cp.events_applied, Some(cp.updated_at)),
            None => (HashMap::new(), 0, None),
        };
        Ok(CheckpointStatus {
            projection_id: id.clone(),
            active: entry.definition.active,
            paused: self.inner.paused.contains(id),
            ordering: entry.definition.config.ordering,
            positions,
            events_applied,
            dead_letters,
            dropped,
            updated_at,
        })
    }

    /// Dead letters of a projection in the order they were recorded.
    pub async fn dead_letters(&self, id: &ProjectionId) -> Result<Vec<DeadLetter>> {
        self.inner.dead_letters.list(Some(id)).await
    }

    /// Retries a dead-lettered unit, bypassing the checkpoint.
    ///
    /// The letter is removed once the unit reaches a terminal state; a unit
    /// that fails again is recorded under a new letter. If the replay
    /// errors or the projection is paused, the letter stays.
    ///
    /// A strict projection that gets past the letter is then caught up on
    /// the events it was blocked on.
    #[tracing::instrument(skip(self))]
    pub async fn replay_dead_letter(&self, id: Uuid) -> Result<UnitReport> {
        let letter = self
            .inner
            .dead_letters
            .get(id)
            .await?
            .ok_or(ProjectionError::UnknownDeadLetter(id))?;
        let entry = self.require(&letter.projection_id)?;
        if self.inner.paused.contains(entry.id()) {
            return Ok(UnitReport::new(entry.id(), &letter.event, UnitState::Paused, 0));
        }

        let aggregate_id = letter.event.aggregate_id.clone();
        let handle = self.inner.lane(&aggregate_id);
        let mut lane = handle.lock().await;
        if self.inner.dead_letters.get(id).await?.is_none() {
            return Err(ProjectionError::UnknownDeadLetter(id));
        }

        let report = self.inner.run_unit(&entry, &letter.event, true).await?;
        if report.state == UnitState::Paused {
            return Ok(report);
        }
        self.inner.dead_letters.take(id).await?;
        if matches!(report.state, UnitState::Applied | UnitState::Skipped)
            && let Some(cursor) = lane.cursor
            && self.inner.fill(&entry, &aggregate_id, cursor.next()).await?.is_none()
        {
            lane.current.insert(entry.id().clone());
        }
        tracing::info!(
            projection = %entry.id(),
            aggregate_id = %aggregate_id,
            sequence = %letter.event.sequence,
            state = ?report.state,
            "Replayed dead letter"
        );
        Ok(report)
    }

    /// Replays every dead letter of a projection in the order they were
    /// recorded.
    pub async fn replay_dead_letters(&self, id: &ProjectionId) -> Result<Vec<UnitReport>> {
        self.require(id)?;
        let mut reports = Vec::new();
        for letter in self.inner.dead_letters.list(Some(id)).await? {
            reports.push(self.replay_dead_letter(letter.id).await?);
        }
        Ok(reports)
    }

    /// Subscribes the projector to a live bus. Events are enqueued while
    /// running and projected inline otherwise.
    pub async fn attach(&self, bus: &dyn EventBus) -> SubscriptionHandle {
        bus.subscribe(
            EventFilter::All,
            Arc::new(ProjectorSubscriber {
                projector: self.clone(),
            }),
        )
        .await
    }

    fn require(&self, id: &ProjectionId) -> Result<RegisteredProjection> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| ProjectionError::UnknownProjection(id.clone()))
    }
}

impl<S: EventStore + 'static> Inner<S> {
    fn lane(&self, aggregate_id: &AggregateId) -> Arc<Mutex<Lane>> {
        Arc::clone(&self.lanes.entry(aggregate_id.clone()).or_default())
    }

    /// Dispatches an event under its aggregate lane, first dispatching any
    /// events between the lane cursor and this one.
    async fn deliver(&self, event: &EventEnvelope) -> Result<Vec<UnitReport>> {
        let handle = self.lane(&event.aggregate_id);
        let mut lane = handle.lock().await;

        let from = match lane.cursor {
            Some(cursor) => cursor.next(),
            None => self.lowest_position(&event.aggregate_id).await?.next(),
        };
        if event.sequence > from {
            let missing = self
                .store
                .load_range(&event.aggregate_id, from, event.sequence)
                .await?;
            tracing::debug!(
                aggregate_id = %event.aggregate_id,
                %from,
                count = missing.len(),
                "Dispatching events missing from the lane"
            );
            for earlier in &missing {
                self.dispatch(&mut lane, earlier).await?;
                lane.cursor = Some(earlier.sequence);
            }
        }

        let reports = self.dispatch(&mut lane, event).await?;
        lane.cursor = Some(lane.cursor.map_or(event.sequence, |c| c.max(event.sequence)));
        Ok(reports)
    }

    /// Lowest checkpoint any projection holds for the aggregate; where a
    /// lane seen for the first time starts dispatching.
    async fn lowest_position(&self, aggregate_id: &AggregateId) -> Result<Sequence> {
        let mut lowest: Option<Sequence> = None;
        for definition in self.registry.list() {
            let position = self.checkpoints.position(&definition.id, aggregate_id).await?;
            lowest = Some(lowest.map_or(position, |l| l.min(position)));
        }
        Ok(lowest.unwrap_or_else(Sequence::initial))
    }

    async fn dispatch(&self, lane: &mut Lane, event: &EventEnvelope) -> Result<Vec<UnitReport>> {
        let at_head = lane.cursor.is_none_or(|cursor| event.sequence >= cursor);
        let mut reports = Vec::new();

        // A deactivated projection misses this event; it has to be filled
        // from its checkpoint once it is activated again.
        lane.current.retain(|id| self.registry.is_active(id));

        for entry in self.registry.projections_for(&event.event_type) {
            let id = entry.id().clone();

            if self.paused.contains(&id) {
                lane.current.remove(&id);
                reports.push(UnitReport::new(&id, event, UnitState::Paused, 0));
                continue;
            }

            let ring = self.rings.get(&id).map(|ring| Arc::clone(ring.value()));
            if let Some(ring) = ring {
                self.queue(&id, &ring, event.clone());
                reports.push(UnitReport::new(&id, event, UnitState::Queued, 0));
                continue;
            }

            if !lane.current.contains(&id)
                && let Some(stopped) = self.fill(&entry, &event.aggregate_id, event.sequence).await?
            {
                let state = match stopped {
                    UnitState::Paused => UnitState::Paused,
                    _ => UnitState::Blocked,
                };
                reports.push(UnitReport::new(&id, event, state, 0));
                continue;
            }

            let report = self.run_unit(&entry, event, false).await?;
            if advances(entry.definition.config.ordering, report.state) {
                if at_head {
                    lane.current.insert(id);
                }
            } else {
                lane.current.remove(&id);
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Runs a projection over its events in `(checkpoint, before)`.
    ///
    /// Returns the state of the unit it stopped at, or `None` when the
    /// projection is caught up.
    async fn fill(
        &self,
        entry: &RegisteredProjection,
        aggregate_id: &AggregateId,
        before: Sequence,
    ) -> Result<Option<UnitState>> {
        let from = self
            .checkpoints
            .position(entry.id(), aggregate_id)
            .await?
            .next();
        let events = self.store.load_range(aggregate_id, from, before).await?;
        let source = &entry.definition.source_event_type;

        for event in events.iter().filter(|event| &event.event_type == source) {
            tracing::debug!(
                projection = %entry.id(),
                aggregate_id = %aggregate_id,
                sequence = %event.sequence,
                "Filling projection"
            );
            let report = self.run_unit(entry, event, false).await?;
            if !advances(entry.definition.config.ordering, report.state) {
                return Ok(Some(report.state));
            }
        }
        Ok(None)
    }

    /// Runs one unit to a terminal state.
    ///
    /// `force` bypasses the checkpoint and dead-letter checks; used when
    /// replaying a dead letter.
    async fn run_unit(
        &self,
        entry: &RegisteredProjection,
        event: &EventEnvelope,
        force: bool,
    ) -> Result<UnitReport> {
        let id = entry.id();
        let config = &entry.definition.config;

        if self.paused.contains(id) {
            return Ok(UnitReport::new(id, event, UnitState::Paused, 0));
        }
        if !force {
            let position = self.checkpoints.position(id, &event.aggregate_id).await?;
            if event.sequence <= position {
                metrics::counter!("projector_units_skipped_total", "projection" => id.to_string())
                    .increment(1);
                tracing::debug!(projection = %id, sequence = %event.sequence, %position, "Unit already covered by checkpoint");
                return Ok(UnitReport::new(id, event, UnitState::Skipped, 0));
            }
            if config.ordering == OrderingMode::Strict
                && self
                    .dead_letters
                    .is_blocking(id, &event.aggregate_id)
                    .await?
            {
                tracing::debug!(projection = %id, aggregate_id = %event.aggregate_id, "Unit blocked by dead letter");
                return Ok(UnitReport::new(id, event, UnitState::Blocked, 0));
            }
        }

        let max_attempts = config
            .max_attempts
            .unwrap_or(self.config.retry.max_attempts)
            .max(1);
        let started = Instant::now();
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            tracing::debug!(
                projection = %id,
                aggregate_id = %event.aggregate_id,
                sequence = %event.sequence,
                attempt,
                state = ?UnitState::Applying,
                "Applying unit"
            );
            match self.attempt(entry, event).await {
                Ok(written) => break Ok(written),
                Err(error) => {
                    let kind = error.kind();
                    if kind == FailureKind::Permanent || attempt >= max_attempts {
                        break Err((error, kind));
                    }
                    let delay = self.config.retry.delay_for(attempt);
                    tracing::warn!(
                        projection = %id,
                        aggregate_id = %event.aggregate_id,
                        sequence = %event.sequence,
                        attempt,
                        ?kind,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        state = ?UnitState::Retrying,
                        "Retrying unit"
                    );
                    metrics::counter!("projector_units_retried_total", "projection" => id.to_string())
                        .increment(1);
                    tokio::time::sleep(delay).await;
                }
            }
        };
        metrics::histogram!("projector_apply_duration_seconds", "projection" => id.to_string())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(true) => {
                metrics::counter!("projector_units_applied_total", "projection" => id.to_string())
                    .increment(1);
                Ok(UnitReport::new(id, event, UnitState::Applied, attempt))
            }
            Ok(false) => {
                metrics::counter!("projector_units_skipped_total", "projection" => id.to_string())
                    .increment(1);
                Ok(UnitReport::new(id, event, UnitState::Skipped, attempt))
            }
            Err((error, kind)) => {
                tracing::error!(
                    projection = %id,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    aggregate_id = %event.aggregate_id,
                    sequence = %event.sequence,
                    attempts = attempt,
                    ?kind,
                    %error,
                    "Dead-lettering unit"
                );
                metrics::counter!("projector_units_dead_lettered_total", "projection" => id.to_string())
                    .increment(1);
                self.dead_letters
                    .record(DeadLetter::new(
                        id.clone(),
                        event.clone(),
                        error.to_string(),
                        kind,
                        attempt,
                    ))
                    .await?;
                if config.ordering == OrderingMode::Relaxed {
                    self.checkpoints
                        .advance(id, &event.aggregate_id, event.sequence, false)
                        .await?;
                }
                Ok(UnitReport::new(id, event, UnitState::DeadLettered, attempt))
            }
        }
    }

    /// One application attempt followed by the checkpoint advance. Returns
    /// whether the projection ran (as opposed to the model already covering
    /// the event).
    async fn attempt(&self, entry: &RegisteredProjection, event: &EventEnvelope) -> Result<bool> {
        let written = self.apply_once(entry, event).await?;
        self.checkpoints
            .advance(entry.id(), &event.aggregate_id, event.sequence, written)
            .await?;
        Ok(written)
    }

    async fn apply_once(&self, entry: &RegisteredProjection, event: &EventEnvelope) -> Result<bool> {
        let id = entry.id();
        let target = entry.projection.target_id(event);
        let current = self.read_models.get(&target).await?;

        if let Some(model) = &current
            && applied_marker(model, id, &event.aggregate_id).is_some_and(|seen| seen >= event.sequence)
        {
            tracing::debug!(projection = %id, model = %target, sequence = %event.sequence, "Model already covers event");
            return Ok(false);
        }

        match entry.projection.apply(current.as_ref(), event)? {
            ProjectionOutcome::Upsert(data) => {
                let (expected, mut metadata) = match &current {
                    Some(model) => (model.version, model.metadata.clone()),
                    None => (Version::initial(), Document::new()),
                };
                mark_applied(&mut metadata, id, &event.aggregate_id, event.sequence);
                let update = ModelUpdate::new(entry.definition.target_model_type.clone(), data)
                    .with_metadata(metadata);
                self.read_models.upsert(&target, expected, update).await?;
            }
            ProjectionOutcome::Delete => {
                if let Some(model) = &current {
                    self.read_models.delete(&target, Some(model.version)).await?;
                }
            }
            ProjectionOutcome::NoOp => {}
        }
        Ok(true)
    }

    fn queue(&self, id: &ProjectionId, ring: &Ring, event: EventEnvelope) {
        if let Some(evicted) = ring.push(event) {
            *self.dropped.entry(id.clone()).or_insert(0) += 1;
            metrics::counter!("projector_events_dropped_total", "projection" => id.to_string())
                .increment(1);
            tracing::warn!(
                projection = %id,
                event_id = %evicted.event_id,
                aggregate_id = %evicted.aggregate_id,
                sequence = %evicted.sequence,
                "Best-effort ring full, dropped oldest event"
            );
        }
    }
}

/// Whether a unit leaves the projection able to take the next event.
fn advances(ordering: OrderingMode, state: UnitState) -> bool {
    match state {
        UnitState::Applied | UnitState::Skipped => true,
        UnitState::DeadLettered => ordering == OrderingMode::Relaxed,
        _ => false,
    }
}

fn shard_for(aggregate_id: &AggregateId, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    aggregate_id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

fn applied_marker(model: &ReadModel, id: &ProjectionId, aggregate_id: &AggregateId) -> Option<Sequence> {
    model
        .metadata
        .get(APPLIED_KEY)?
        .get(id.as_str())?
        .get(aggregate_id.as_str())?
        .as_i64()
        .map(Sequence::new)
}

fn mark_applied(
    metadata: &mut Document,
    id: &ProjectionId,
    aggregate_id: &AggregateId,
    sequence: Sequence,
) {
    let mut applied = match metadata.remove(APPLIED_KEY) {
        Some(Value::Object(applied)) => applied,
        _ => Document::new(),
    };
    let mut positions = match applied.remove(id.as_str()) {
        Some(Value::Object(positions)) => positions,
        _ => Document::new(),
    };
    positions.insert(aggregate_id.to_string(), Value::from(sequence.as_i64()));
    applied.insert(id.to_string(), Value::Object(positions));
    metadata.insert(APPLIED_KEY.to_string(), Value::Object(applied));
}

fn spawn_ring<S: EventStore + 'static>(
    inner: &Arc<Inner<S>>,
    runtime: &mut Runtime,
    id: ProjectionId,
    capacity: usize,
) {
    let ring = Arc::new(Ring::new(capacity));
    inner.rings.insert(id.clone(), Arc::clone(&ring));
    let handle = tokio::spawn(run_ring(
        Arc::clone(inner),
        id,
        ring,
        runtime.shutdown.subscribe(),
    ));
    runtime.handles.push(handle);
}

async fn run_worker<S: EventStore + 'static>(
    inner: Arc<Inner<S>>,
    shard: usize,
    mut events: mpsc::Receiver<EventEnvelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Err(error) = inner.deliver(&event).await {
                    tracing::error!(
                        shard,
                        event_id = %event.event_id,
                        aggregate_id = %event.aggregate_id,
                        sequence = %event.sequence,
                        %error,
                        "Failed to project event"
                    );
                }
            }
        }
    }
    tracing::debug!(shard, "Projector worker stopped");
}

async fn run_ring<S: EventStore + 'static>(
    inner: Arc<Inner<S>>,
    id: ProjectionId,
    ring: Arc<Ring>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        while let Some(event) = ring.pop() {
            let stopping = *shutdown.borrow();
            if stopping {
                return;
            }
            let Some(entry) = inner.registry.get(&id) else {
                continue;
            };
            if !entry.definition.active {
                continue;
            }
            if let Err(error) = inner.run_unit(&entry, &event, false).await {
                tracing::error!(
                    projection = %id,
                    event_id = %event.event_id,
                    %error,
                    "Failed to project best-effort event"
                );
            }
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ring.notify.notified() => {}
        }
    }
    tracing::debug!(projection = %id, "Best-effort ring stopped");
}

struct ProjectorSubscriber<S> {
    projector: Projector<S>,
}

#[async_trait]
impl<S: EventStore + 'static> EventSubscriber for ProjectorSubscriber<S> {
    async fn on_event(&self, event: &EventEnvelope) {
        let result = match self.projector.enqueue(event.clone()).await {
            Err(ProjectionError::NotRunning) => self.projector.process(event).await.map(|_| ()),
            other => other,
        };
        if let Err(error) = result {
            tracing::error!(
                event_id = %event.event_id,
                aggregate_id = %event.aggregate_id,
                %error,
                "Failed to project published event"
            );
        }
    }
}
