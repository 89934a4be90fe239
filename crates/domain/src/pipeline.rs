//! Write-side entry point: appends events and drives the projector.

use std::sync::Arc;

use common::AggregateId;
use event_store::{
    AppendOptions, EventBus, EventEnvelope, EventStore, EventStoreExt, SequenceRange,
};
use projections::{ProjectionError, Projector, UnitReport};
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::command::{Command, CommandHandler};
use crate::error::{DomainError, PipelineError};

/// When the projector sees appended events relative to the command returning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// Project on the calling task; read models are current on return.
    #[default]
    Inline,
    /// Hand events to the projector's worker queues and return.
    Deferred,
}

impl ConsistencyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Deferred => "deferred",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub consistency: ConsistencyMode,
}

impl PipelineConfig {
    pub fn with_consistency(mut self, consistency: ConsistencyMode) -> Self {
        self.consistency = consistency;
        self
    }
}

/// Outcome of a handled command.
#[derive(Debug)]
pub struct CommandOutput<A> {
    pub aggregate: A,
    /// Stored envelopes, positions included.
    pub events: Vec<EventEnvelope>,
    pub range: Option<SequenceRange>,
    /// One report per (event, projection) in inline mode; empty when
    /// deferred.
    pub reports: Vec<UnitReport>,
}

/// Outcome of appending pre-built events.
#[derive(Debug)]
pub struct AppendOutput {
    pub events: Vec<EventEnvelope>,
    pub range: SequenceRange,
    pub reports: Vec<UnitReport>,
}

/// Runs commands against aggregates and projects what they append.
pub struct CommandPipeline<S> {
    projector: Projector<S>,
    bus: Option<Arc<dyn EventBus>>,
    config: PipelineConfig,
}

impl<S> Clone for CommandPipeline<S> {
    fn clone(&self) -> Self {
        Self {
            projector: self.projector.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: EventStore + Clone + 'static> CommandPipeline<S> {
    pub fn new(projector: Projector<S>, config: PipelineConfig) -> Self {
        Self {
            projector,
            bus: None,
            config,
        }
    }

    /// Also publishes every appended event to `bus`.
    ///
    /// A projector attached to the same bus receives each event twice; the
    /// second delivery is skipped by its checkpoints.
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn projector(&self) -> &Projector<S> {
        &self.projector
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Loads the target aggregate, decides, appends all resulting events in
    /// one guarded call and projects them according to the consistency mode.
    #[tracing::instrument(
        skip(self, command),
        fields(
            aggregate_type = <C::Aggregate as Aggregate>::aggregate_type(),
            aggregate_id = %command.aggregate_id(),
            mode = self.config.consistency.as_str()
        )
    )]
    pub async fn handle<C: Command>(
        &self,
        command: C,
    ) -> Result<CommandOutput<C::Aggregate>, PipelineError> {
        let handler: CommandHandler<S, C::Aggregate> =
            CommandHandler::new(self.projector.store().clone());

        let result = match handler.handle(&command).await {
            Ok(result) => result,
            Err(e) => {
                self.record(domain_outcome(&e));
                return Err(e.into());
            }
        };

        let reports = self.drive(&result.envelopes).await?;
        self.record("ok");

        Ok(CommandOutput {
            aggregate: result.aggregate,
            events: result.envelopes,
            range: result.range,
            reports,
        })
    }

    /// Appends pre-built events for one aggregate and projects them like
    /// [`handle`](Self::handle) does.
    #[tracing::instrument(skip(self, events, options), fields(aggregate_id = %aggregate_id, count = events.len()))]
    pub async fn append(
        &self,
        aggregate_id: &AggregateId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<AppendOutput, PipelineError> {
        let store = self.projector.store();
        let range = match store.append(aggregate_id, events, options).await {
            Ok(range) => range,
            Err(e) => {
                let e = DomainError::from(e);
                self.record(domain_outcome(&e));
                return Err(e.into());
            }
        };
        let events = store
            .load_range(aggregate_id, range.first, range.last.next())
            .await
            .map_err(DomainError::from)?;

        let reports = self.drive(&events).await?;
        self.record("ok");

        Ok(AppendOutput {
            events,
            range,
            reports,
        })
    }

    async fn drive(&self, events: &[EventEnvelope]) -> Result<Vec<UnitReport>, PipelineError> {
        let reports = match self.project(events).await {
            Ok(reports) => reports,
            Err(e) => {
                tracing::error!(error = %e, "Appended events could not be projected");
                self.record("projection_error");
                return Err(e.into());
            }
        };

        if let Some(bus) = &self.bus {
            for event in events {
                bus.publish(event).await;
            }
        }
        Ok(reports)
    }

    async fn project(&self, events: &[EventEnvelope]) -> Result<Vec<UnitReport>, ProjectionError> {
        let mut reports = Vec::new();
        for event in events {
            match self.config.consistency {
                ConsistencyMode::Inline => reports.extend(self.projector.process(event).await?),
                ConsistencyMode::Deferred => match self.projector.enqueue(event.clone()).await {
                    Ok(()) => {}
                    Err(ProjectionError::NotRunning) => {
                        tracing::debug!("Projector stopped; projecting inline");
                        reports.extend(self.projector.process(event).await?);
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(reports)
    }

    fn record(&self, outcome: &'static str) {
        metrics::counter!(
            "pipeline_commands_total",
            "mode" => self.config.consistency.as_str(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

fn domain_outcome(error: &DomainError) -> &'static str {
    match error {
        e if e.is_conflict() => "conflict",
        DomainError::Rejected(_) => "rejected",
        _ => "error",
    }
}
