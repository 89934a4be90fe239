//! Raw event ingestion.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use common::AggregateId;
use domain::DomainError;
use event_store::{AppendOptions, EventEnvelope, EventStore, Sequence, SequenceRange};
use projections::UnitReport;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct AppendEventsRequest {
    pub aggregate_id: String,
    pub aggregate_type: String,
    /// Head the client last saw; defaults to the current head.
    #[serde(default)]
    pub expected_sequence: Option<i64>,
    pub events: Vec<NewEvent>,
}

#[derive(Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Serialize)]
pub struct AppendEventsResponse {
    pub range: SequenceRange,
    pub events: Vec<EventEnvelope>,
    pub reports: Vec<UnitReport>,
}

/// POST /events: appends a batch to one aggregate and projects it
/// according to the pipeline's consistency mode.
#[tracing::instrument(
    skip(state, req),
    fields(aggregate_id = %req.aggregate_id, count = req.events.len())
)]
pub async fn append<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<AppendEventsRequest>,
) -> Result<(StatusCode, Json<AppendEventsResponse>), ApiError> {
    if req.events.is_empty() {
        return Err(ApiError::BadRequest("events must not be empty".to_string()));
    }
    if req.aggregate_id.is_empty() {
        return Err(ApiError::BadRequest("aggregate_id must not be empty".to_string()));
    }

    let aggregate_id = AggregateId::new(req.aggregate_id);
    let expected = match req.expected_sequence {
        Some(sequence) if sequence < 0 => {
            return Err(ApiError::BadRequest(
                "expected_sequence must not be negative".to_string(),
            ));
        }
        Some(sequence) => Sequence::new(sequence),
        None => state
            .projector()
            .store()
            .head(&aggregate_id)
            .await
            .map_err(DomainError::from)?
            .unwrap_or_else(Sequence::initial),
    };

    let mut sequence = expected;
    let envelopes = req
        .events
        .into_iter()
        .map(|event| {
            sequence = sequence.next();
            event
                .metadata
                .into_iter()
                .fold(
                    EventEnvelope::builder()
                        .aggregate_id(aggregate_id.clone())
                        .aggregate_type(req.aggregate_type.as_str())
                        .event_type(event.event_type)
                        .sequence(sequence)
                        .payload_raw(event.payload),
                    |builder, (key, value)| builder.metadata(key, value),
                )
                .build()
        })
        .collect();

    let output = state
        .pipeline
        .append(&aggregate_id, envelopes, AppendOptions::expect_sequence(expected))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(AppendEventsResponse {
            range: output.range,
            events: output.events,
            reports: output.reports,
        }),
    ))
}
