use std::sync::Arc;

use common::AggregateId;
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{CommandPipeline, ConsistencyMode, PipelineConfig};
use event_store::{AppendOptions, EventEnvelope, InMemoryEventStore, Sequence};
use projections::{MergeFields, ProjectionDefinition, Projector};
use read_model::InMemoryReadModelStore;

async fn pipeline(mode: ConsistencyMode) -> CommandPipeline<InMemoryEventStore> {
    let projector = Projector::builder(
        InMemoryEventStore::new(),
        Arc::new(InMemoryReadModelStore::new()),
    )
    .build();
    projector
        .register_projection(
            ProjectionDefinition::new("customer-created", "Created", "customer"),
            Arc::new(MergeFields::required(["name"])),
        )
        .await
        .unwrap();
    CommandPipeline::new(projector, PipelineConfig::default().with_consistency(mode))
}

fn created(id: &AggregateId) -> EventEnvelope {
    EventEnvelope::builder()
        .aggregate_id(id.clone())
        .aggregate_type("Customer")
        .event_type("Created")
        .sequence(Sequence::first())
        .payload_raw(serde_json::json!({ "name": "foo" }))
        .build()
}

fn bench_append(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    for mode in [ConsistencyMode::Inline, ConsistencyMode::Deferred] {
        let pipeline = rt.block_on(pipeline(mode));
        if mode == ConsistencyMode::Deferred {
            rt.block_on(async { pipeline.projector().start() });
        }

        c.bench_function(&format!("pipeline/append_{}", mode.as_str()), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let id = AggregateId::generate();
                    pipeline
                        .append(&id, vec![created(&id)], AppendOptions::expect_new())
                        .await
                        .unwrap();
                });
            });
        });

        rt.block_on(pipeline.projector().stop());
    }
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
