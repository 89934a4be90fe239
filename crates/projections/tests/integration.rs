//! Integration tests: event store → projector → read models → query engine.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use async_trait::async_trait;
use common::{AggregateId, ProjectionId};
use event_store::{
    AppendOptions, EventBus, EventEnvelope, EventStore, EventStoreExt, InMemoryEventBus,
    InMemoryEventStore, Sequence,
};
use projections::{
    DeadLetter, DeadLetterStore, FnProjection, InMemoryDeadLetterStore, MergeFields, Projection,
    ProjectionConfig, ProjectionDefinition, ProjectionError, ProjectionOutcome, Projector,
    ProjectorConfig, RetryPolicy, UnitState,
};
use read_model::{
    CacheConfig, CachedReadModelStore, Document, InMemoryReadModelStore, QueryConfig,
    QueryEngine, ReadModel, ReadModelId, ReadModelStore, Version,
};
use serde_json::{Value, json};

fn projector(
    store: &InMemoryEventStore,
    models: Arc<dyn ReadModelStore>,
    config: ProjectorConfig,
) -> Projector<InMemoryEventStore> {
    Projector::builder(store.clone(), models)
        .config(config.with_retry(RetryPolicy::immediate(3)))
        .build()
}

async fn register_customer_views(projector: &Projector<InMemoryEventStore>) {
    projector
        .register_projection(
            ProjectionDefinition::new("customer-created", "Created", "customer"),
            Arc::new(MergeFields::required(["name"])),
        )
        .await
        .unwrap();
    projector
        .register_projection(
            ProjectionDefinition::new("customer-renamed", "Renamed", "customer"),
            Arc::new(MergeFields::required(["name"])),
        )
        .await
        .unwrap();
}

/// Appends events to the end of an aggregate's stream and returns them as stored.
async fn record(
    store: &InMemoryEventStore,
    aggregate: &str,
    events: &[(&str, Value)],
) -> Vec<EventEnvelope> {
    let aggregate_id = aggregate.into();
    let head = store.head(&aggregate_id).await.unwrap();
    let mut sequence = head.unwrap_or_else(Sequence::initial);
    let batch: Vec<_> = events
        .iter()
        .map(|(event_type, payload)| {
            sequence = sequence.next();
            EventEnvelope::builder()
                .event_type(*event_type)
                .aggregate_id(aggregate)
                .aggregate_type("Customer")
                .sequence(sequence)
                .payload_raw(payload.clone())
                .build()
        })
        .collect();
    let range = store
        .append(
            &aggregate_id,
            batch,
            AppendOptions::expect_sequence(head.unwrap_or_else(Sequence::initial)),
        )
        .await
        .unwrap();
    store
        .load_range(&aggregate_id, range.first, range.last.next())
        .await
        .unwrap()
}

/// Increments `count` on the target model.
fn count_events(
    current: Option<&ReadModel>,
    _: &EventEnvelope,
) -> projections::Result<ProjectionOutcome> {
    let count = current
        .and_then(|m| m.data.get("count"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let mut data = Document::new();
    data.insert("count".into(), json!(count + 1));
    Ok(ProjectionOutcome::Upsert(data))
}

async fn model(models: &dyn ReadModelStore, id: &str) -> Option<ReadModel> {
    models.get(&ReadModelId::from(id)).await.unwrap()
}

/// Polls until `check` holds or two seconds pass.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn created_then_renamed_projects_latest_name() {
    let store = InMemoryEventStore::new();
    let models = Arc::new(InMemoryReadModelStore::new());
    let projector = projector(&store, models.clone(), ProjectorConfig::default());
    register_customer_views(&projector).await;

    let events = record(
        &store,
        "X",
        &[
            ("Created", json!({"name": "foo"})),
            ("Renamed", json!({"name": "bar"})),
        ],
    )
    .await;
    for event in &events {
        projector.process(event).await.unwrap();
    }

    let x = model(models.as_ref(), "X").await.unwrap();
    assert_eq!(x.data["name"], json!("bar"));
    assert_eq!(x.version, Version::new(2));
    assert_eq!(x.model_type, "customer");

    // Redelivering the first event after checkpoint 2 changes nothing.
    let reports = projector.process(&events[0]).await.unwrap();
    assert_eq!(reports[0].state, UnitState::Skipped);
    let x = model(models.as_ref(), "X").await.unwrap();
    assert_eq!(x.version, Version::new(2));
}

#[tokio::test]
async fn second_event_delivered_first_still_applies_in_order() {
    let store = InMemoryEventStore::new();
    let models = Arc::new(InMemoryReadModelStore::new());
    let projector = projector(&store, models.clone(), ProjectorConfig::default());
    register_customer_views(&projector).await;

    let events = record(
        &store,
        "X",
        &[
            ("Created", json!({"name": "foo"})),
            ("Renamed", json!({"name": "bar"})),
        ],
    )
    .await;

    projector.process(&events[1]).await.unwrap();
    projector.process(&events[0]).await.unwrap();

    let x = model(models.as_ref(), "X").await.unwrap();
    assert_eq!(x.data["name"], json!("bar"));
    assert_eq!(x.version, Version::new(2));
}

#[tokio::test]
async fn catch_up_rebuilds_from_the_store() {
    let store = InMemoryEventStore::new();
    let models = Arc::new(InMemoryReadModelStore::new());
    for (id, name) in [("X", "bar"), ("Y", "qux")] {
        record(
            &store,
            id,
            &[
                ("Created", json!({"name": "foo"})),
                ("Renamed", json!({"name": name})),
            ],
        )
        .await;
    }

    let projector = projector(&store, models.clone(), ProjectorConfig::default());
    register_customer_views(&projector).await;
    assert_eq!(projector.catch_up().await.unwrap(), 4);
    // A second pass is a no-op.
    assert_eq!(projector.catch_up().await.unwrap(), 4);

    assert_eq!(model(models.as_ref(), "X").await.unwrap().data["name"], json!("bar"));
    let y = model(models.as_ref(), "Y").await.unwrap();
    assert_eq!(y.data["name"], json!("qux"));
    assert_eq!(y.version, Version::new(2));
}

#[tokio::test]
async fn dead_letter_blocks_only_its_projection_and_aggregate() {
    let store = InMemoryEventStore::new();
    let models = Arc::new(InMemoryReadModelStore::new());
    let projector = projector(&store, models.clone(), ProjectorConfig::default());

    let broken = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&broken);
    projector
        .register_projection(
            ProjectionDefinition::new("profile", "Renamed", "customer"),
            Arc::new(FnProjection::new(
                move |current: Option<&ReadModel>, event: &EventEnvelope| {
                    if flag.load(Ordering::SeqCst) && event.aggregate_id.as_str() == "X" {
                        return Err(ProjectionError::Rejected("profile store refused".into()));
                    }
                    MergeFields::new().apply(current, event)
                },
            )),
        )
        .await
        .unwrap();
    projector
        .register_projection(
            ProjectionDefinition::new("audit", "Renamed", "audit"),
            Arc::new(
                FnProjection::new(|current: Option<&ReadModel>, _: &EventEnvelope| {
                    let renames = current
                        .and_then(|m| m.data.get("renames"))
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    let mut data = Document::new();
                    data.insert("renames".into(), json!(renames + 1));
                    Ok(ProjectionOutcome::Upsert(data))
                })
                .with_target(|event| ReadModelId::new(format!("audit-{}", event.aggregate_id))),
            ),
        )
        .await
        .unwrap();

    let x = record(
        &store,
        "X",
        &[
            ("Renamed", json!({"name": "a"})),
            ("Renamed", json!({"name": "b"})),
        ],
    )
    .await;
    let y = record(&store, "Y", &[("Renamed", json!({"name": "c"}))]).await;

    let reports = projector.process(&x[0]).await.unwrap();
    assert_eq!(reports[0].state, UnitState::DeadLettered);
    assert_eq!(reports[1].state, UnitState::Applied);

    let reports = projector.process(&x[1]).await.unwrap();
    assert_eq!(reports[0].state, UnitState::Blocked);
    assert_eq!(reports[1].state, UnitState::Applied);

    let reports = projector.process(&y[0]).await.unwrap();
    assert_eq!(reports[0].state, UnitState::Applied);

    assert!(model(models.as_ref(), "X").await.is_none());
    assert_eq!(model(models.as_ref(), "Y").await.unwrap().data["name"], json!("c"));
    assert_eq!(
        model(models.as_ref(), "audit-X").await.unwrap().data["renames"],
        json!(2)
    );

    let letters = projector.dead_letters(&"profile".into()).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].event.sequence, Sequence::first());
    let status = projector.checkpoint_status(&"profile".into()).await.unwrap();
    assert_eq!(status.dead_letters, 1);

    // Fix the projection and replay: the blocked event follows.
    broken.store(false, Ordering::SeqCst);
    let reports = projector.replay_dead_letters(&"profile".into()).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].state, UnitState::Applied);

    let x_model = model(models.as_ref(), "X").await.unwrap();
    assert_eq!(x_model.data["name"], json!("b"));
    assert_eq!(x_model.version, Version::new(2));
    assert!(projector.dead_letters(&"profile".into()).await.unwrap().is_empty());
}

#[tokio::test]
async fn replaying_unknown_dead_letter_fails() {
    let store = InMemoryEventStore::new();
    let projector = projector(
        &store,
        Arc::new(InMemoryReadModelStore::new()),
        ProjectorConfig::default(),
    );
    let result = projector.replay_dead_letter(uuid::Uuid::new_v4()).await;
    assert!(matches!(result, Err(ProjectionError::UnknownDeadLetter(_))));
}

#[tokio::test]
async fn paused_projection_catches_up_on_resume() {
    let store = InMemoryEventStore::new();
    let models = Arc::new(InMemoryReadModelStore::new());
    let projector = projector(&store, models.clone(), ProjectorConfig::default());
    register_customer_views(&projector).await;

    let renamed = "customer-renamed".into();
    projector.pause(&renamed).unwrap();

    let events = record(
        &store,
        "X",
        &[
            ("Created", json!({"name": "foo"})),
            ("Renamed", json!({"name": "bar"})),
        ],
    )
    .await;
    projector.process(&events[0]).await.unwrap();
    let reports = projector.process(&events[1]).await.unwrap();
    assert_eq!(reports[0].state, UnitState::Paused);
    assert_eq!(model(models.as_ref(), "X").await.unwrap().data["name"], json!("foo"));
    assert!(projector.checkpoint_status(&renamed).await.unwrap().paused);

    projector.resume(&renamed).await.unwrap();

    let x = model(models.as_ref(), "X").await.unwrap();
    assert_eq!(x.data["name"], json!("bar"));
    assert_eq!(x.version, Version::new(2));
    assert!(!projector.checkpoint_status(&renamed).await.unwrap().paused);

    assert!(matches!(
        projector.pause(&"missing".into()),
        Err(ProjectionError::UnknownProjection(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_project_many_aggregates() {
    let store = InMemoryEventStore::new();
    let models = Arc::new(InMemoryReadModelStore::new());
    let projector = projector(
        &store,
        models.clone(),
        ProjectorConfig::default()
            .with_workers(4)
            .with_queue_capacity(8),
    );
    register_customer_views(&projector).await;

    let mut streams = Vec::new();
    for i in 0..20 {
        streams.push(
            record(
                &store,
                &format!("c-{i}"),
                &[
                    ("Created", json!({"name": "new"})),
                    ("Renamed", json!({"name": format!("renamed-{i}")})),
                ],
            )
            .await,
        );
    }

    projector.start();
    projector.start();
    assert!(projector.is_running());

    // Interleave aggregates and deliver one stream backwards.
    streams[0].reverse();
    for position in 0..2 {
        for stream in &streams {
            projector.enqueue(stream[position].clone()).await.unwrap();
        }
    }

    let check_models = models.clone();
    eventually(move || {
        let models = check_models.clone();
        async move {
            for i in 0..20 {
                match models.get(&ReadModelId::new(format!("c-{i}"))).await.unwrap() {
                    Some(m) if m.version == Version::new(2) => {}
                    _ => return false,
                }
            }
            true
        }
    })
    .await;

    projector.stop().await;
    assert!(!projector.is_running());

    for i in 0..20 {
        let m = model(models.as_ref(), &format!("c-{i}")).await.unwrap();
        assert_eq!(m.data["name"], json!(format!("renamed-{i}")));
    }
}

#[tokio::test]
async fn events_missed_while_stopped_are_recovered_by_catch_up() {
    let store = InMemoryEventStore::new();
    let models = Arc::new(InMemoryReadModelStore::new());
    let projector = projector(&store, models.clone(), ProjectorConfig::default());
    register_customer_views(&projector).await;

    projector.start();
    projector.stop().await;

    let events = record(&store, "X", &[("Created", json!({"name": "foo"}))]).await;
    assert!(matches!(
        projector.enqueue(events[0].clone()).await,
        Err(ProjectionError::NotRunning)
    ));

    projector.catch_up().await.unwrap();
    assert_eq!(model(models.as_ref(), "X").await.unwrap().data["name"], json!("foo"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn best_effort_projection_runs_off_its_ring() {
    let store = InMemoryEventStore::new();
    let models = Arc::new(InMemoryReadModelStore::new());
    let projector = projector(&store, models.clone(), ProjectorConfig::default());
    projector.start();

    projector
        .register_projection(
            ProjectionDefinition::new("activity", "Created", "activity")
                .with_config(ProjectionConfig::best_effort(64)),
            Arc::new(
                FnProjection::new(|_: Option<&ReadModel>, event: &EventEnvelope| {
                    let mut data = Document::new();
                    data.insert("last".into(), json!(event.event_type));
                    Ok(ProjectionOutcome::Upsert(data))
                })
                .with_target(|event| ReadModelId::new(format!("activity-{}", event.aggregate_id))),
            ),
        )
        .await
        .unwrap();

    let events = record(&store, "X", &[("Created", json!({"name": "foo"}))]).await;
    let reports = projector.process(&events[0]).await.unwrap();
    assert_eq!(reports[0].state, UnitState::Queued);

    let check_models = models.clone();
    eventually(move || {
        let models = check_models.clone();
        async move {
            models
                .get(&ReadModelId::from("activity-X"))
                .await
                .unwrap()
                .is_some()
        }
    })
    .await;

    projector.stop().await;
    let status = projector.checkpoint_status(&"activity".into()).await.unwrap();
    assert_eq!(status.dropped, 0);
    assert_eq!(status.events_applied, 1);
}

#[tokio::test]
async fn cached_reads_see_projected_writes() {
    let store = InMemoryEventStore::new();
    let backing = Arc::new(InMemoryReadModelStore::new());
    let cached = Arc::new(CachedReadModelStore::new(backing, CacheConfig::default()));
    let engine = QueryEngine::new(cached.clone(), QueryConfig::default());
    let projector = projector(&store, cached.clone(), ProjectorConfig::default());
    register_customer_views(&projector).await;

    let events = record(
        &store,
        "X",
        &[
            ("Created", json!({"name": "foo"})),
            ("Renamed", json!({"name": "bar"})),
        ],
    )
    .await;

    projector.process(&events[0]).await.unwrap();
    let first = engine.get_by_id(&"X".into()).await.unwrap().unwrap();
    assert_eq!(first.data["name"], json!("foo"));
    // Served from cache now.
    engine.get_by_id(&"X".into()).await.unwrap().unwrap();

    projector.process(&events[1]).await.unwrap();
    let second = engine.get_by_id(&"X".into()).await.unwrap().unwrap();
    assert_eq!(second.data["name"], json!("bar"));
    assert_eq!(second.version, Version::new(2));
}

#[tokio::test]
async fn attached_bus_projects_published_events() {
    let store = InMemoryEventStore::new();
    let models = Arc::new(InMemoryReadModelStore::new());
    let projector = projector(&store, models.clone(), ProjectorConfig::default());
    register_customer_views(&projector).await;

    let bus = InMemoryEventBus::new();
    projector.attach(&bus).await;

    let events = record(&store, "X", &[("Created", json!({"name": "foo"}))]).await;
    bus.publish(&events[0]).await;

    assert_eq!(model(models.as_ref(), "X").await.unwrap().data["name"], json!("foo"));
}

#[tokio::test]
async fn reactivated_projection_applies_events_it_missed() {
    let store = InMemoryEventStore::new();
    let models = Arc::new(InMemoryReadModelStore::new());
    let projector = projector(&store, models.clone(), ProjectorConfig::default());
    projector
        .register_projection(
            ProjectionDefinition::new("ticks", "Tick", "counter"),
            Arc::new(FnProjection::new(count_events)),
        )
        .await
        .unwrap();
    let ticks = ProjectionId::from("ticks");

    let events = record(
        &store,
        "X",
        &[("Tick", json!({})), ("Tick", json!({})), ("Tick", json!({}))],
    )
    .await;

    projector.process(&events[0]).await.unwrap();
    projector.registry().deactivate(&ticks).unwrap();
    let reports = projector.process(&events[1]).await.unwrap();
    assert!(reports.is_empty());

    projector.registry().activate(&ticks).unwrap();
    let reports = projector.process(&events[2]).await.unwrap();
    assert_eq!(reports[0].state, UnitState::Applied);

    let counter = model(models.as_ref(), "X").await.unwrap();
    assert_eq!(counter.data["count"], json!(3));
    assert_eq!(counter.version, Version::new(3));
    let status = projector.checkpoint_status(&ticks).await.unwrap();
    assert_eq!(status.positions[&AggregateId::from("X")], Sequence::new(3));
    assert_eq!(status.events_applied, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_to_one_model_retry_without_losing_updates() {
    let store = InMemoryEventStore::new();
    let models = Arc::new(InMemoryReadModelStore::new());
    let projector = Projector::builder(store.clone(), models.clone())
        .config(ProjectorConfig::default().with_retry(RetryPolicy::immediate(100)))
        .build();

    // The first two applications wait for each other, so both read the
    // model before either writes it.
    let arrivals = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(2));
    projector
        .register_projection(
            ProjectionDefinition::new("signups", "Created", "stats"),
            Arc::new(
                FnProjection::new(move |current: Option<&ReadModel>, event: &EventEnvelope| {
                    if arrivals.fetch_add(1, Ordering::SeqCst) < 2 {
                        barrier.wait();
                    }
                    count_events(current, event)
                })
                .with_target(|_| ReadModelId::from("signups")),
            ),
        )
        .await
        .unwrap();

    let mut events = Vec::new();
    for i in 0..32 {
        events.extend(record(&store, &format!("c-{i}"), &[("Created", json!({}))]).await);
    }

    let tasks: Vec<_> = events
        .into_iter()
        .map(|event| {
            let projector = projector.clone();
            tokio::spawn(async move { projector.process(&event).await.unwrap() })
        })
        .collect();
    let mut reports = Vec::new();
    for task in tasks {
        reports.extend(task.await.unwrap());
    }

    assert_eq!(reports.len(), 32);
    assert!(reports.iter().all(|r| r.state == UnitState::Applied));
    assert!(reports.iter().any(|r| r.attempts > 1));

    let signups = model(models.as_ref(), "signups").await.unwrap();
    assert_eq!(signups.data["count"], json!(32));
    assert_eq!(signups.version, Version::new(32));
    assert!(projector.dead_letters(&"signups".into()).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_waits_for_the_unit_in_flight() {
    let store = InMemoryEventStore::new();
    let models = Arc::new(InMemoryReadModelStore::new());
    let projector = projector(&store, models.clone(), ProjectorConfig::default());

    let started = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&started);
    projector
        .register_projection(
            ProjectionDefinition::new("slow", "Created", "customer"),
            Arc::new(FnProjection::new(
                move |current: Option<&ReadModel>, event: &EventEnvelope| {
                    flag.store(true, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(200));
                    MergeFields::new().apply(current, event)
                },
            )),
        )
        .await
        .unwrap();

    projector.start();
    let events = record(&store, "X", &[("Created", json!({"name": "foo"}))]).await;
    projector.enqueue(events[0].clone()).await.unwrap();

    let check = Arc::clone(&started);
    eventually(move || {
        let started = Arc::clone(&check);
        async move { started.load(Ordering::SeqCst) }
    })
    .await;
    projector.stop().await;

    assert_eq!(model(models.as_ref(), "X").await.unwrap().data["name"], json!("foo"));
    let status = projector.checkpoint_status(&"slow".into()).await.unwrap();
    assert_eq!(status.events_applied, 1);
}

/// Dead-letter store whose writes can be switched off.
#[derive(Default)]
struct UnreliableDeadLetters {
    letters: InMemoryDeadLetterStore,
    refuse_records: AtomicBool,
}

#[async_trait]
impl DeadLetterStore for UnreliableDeadLetters {
    async fn record(&self, letter: DeadLetter) -> projections::Result<()> {
        if self.refuse_records.load(Ordering::SeqCst) {
            return Err(ProjectionError::DeadLetter("store offline".into()));
        }
        self.letters.record(letter).await
    }

    async fn list(&self, projection_id: Option<&ProjectionId>) -> projections::Result<Vec<DeadLetter>> {
        self.letters.list(projection_id).await
    }

    async fn get(&self, id: uuid::Uuid) -> projections::Result<Option<DeadLetter>> {
        self.letters.get(id).await
    }

    async fn take(&self, id: uuid::Uuid) -> projections::Result<Option<DeadLetter>> {
        self.letters.take(id).await
    }

    async fn is_blocking(
        &self,
        projection_id: &ProjectionId,
        aggregate_id: &AggregateId,
    ) -> projections::Result<bool> {
        self.letters.is_blocking(projection_id, aggregate_id).await
    }

    async fn count(&self, projection_id: &ProjectionId) -> projections::Result<usize> {
        self.letters.count(projection_id).await
    }
}

#[tokio::test]
async fn failed_replay_keeps_the_dead_letter() {
    let store = InMemoryEventStore::new();
    let models = Arc::new(InMemoryReadModelStore::new());
    let letters = Arc::new(UnreliableDeadLetters::default());
    let projector = Projector::builder(store.clone(), models.clone())
        .dead_letters(letters.clone())
        .config(ProjectorConfig::default().with_retry(RetryPolicy::immediate(3)))
        .build();
    register_customer_views(&projector).await;
    let created = ProjectionId::from("customer-created");

    let events = record(&store, "X", &[("Created", json!({}))]).await;
    let reports = projector.process(&events[0]).await.unwrap();
    assert_eq!(reports[0].state, UnitState::DeadLettered);
    let original = projector.dead_letters(&created).await.unwrap().remove(0);

    // The payload is still invalid, and the new letter cannot be written.
    letters.refuse_records.store(true, Ordering::SeqCst);
    let result = projector.replay_dead_letter(original.id).await;
    assert!(matches!(result, Err(ProjectionError::DeadLetter(_))));

    let remaining = projector.dead_letters(&created).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, original.id);

    letters.refuse_records.store(false, Ordering::SeqCst);
    let report = projector.replay_dead_letter(original.id).await.unwrap();
    assert_eq!(report.state, UnitState::DeadLettered);

    let remaining = projector.dead_letters(&created).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_ne!(remaining[0].id, original.id);
}
