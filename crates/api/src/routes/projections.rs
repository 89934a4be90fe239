//! Projector admin endpoints: status, pause/resume and dead letters.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::ProjectionId;
use event_store::EventStore;
use projections::{CheckpointStatus, DeadLetter, ProjectionDefinition, UnitReport};
use serde::Serialize;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct ProjectionSummary {
    #[serde(flatten)]
    pub definition: ProjectionDefinition,
    pub paused: bool,
}

/// GET /projections
pub async fn list<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<Vec<ProjectionSummary>> {
    let projector = state.projector();
    let summaries = projector
        .registry()
        .list()
        .into_iter()
        .map(|definition| ProjectionSummary {
            paused: projector.is_paused(&definition.id),
            definition,
        })
        .collect();
    Json(summaries)
}

/// GET /projections/{id}/checkpoint
#[tracing::instrument(skip(state))]
pub async fn checkpoint<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<CheckpointStatus>, ApiError> {
    let status = state
        .projector()
        .checkpoint_status(&ProjectionId::new(id))
        .await?;
    Ok(Json(status))
}

/// POST /projections/{id}/pause
#[tracing::instrument(skip(state))]
pub async fn pause<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<CheckpointStatus>, ApiError> {
    let id = ProjectionId::new(id);
    let projector = state.projector();
    projector.pause(&id)?;
    Ok(Json(projector.checkpoint_status(&id).await?))
}

/// POST /projections/{id}/resume: applies what the projection missed
/// before returning.
#[tracing::instrument(skip(state))]
pub async fn resume<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<CheckpointStatus>, ApiError> {
    let id = ProjectionId::new(id);
    let projector = state.projector();
    projector.resume(&id).await?;
    Ok(Json(projector.checkpoint_status(&id).await?))
}

/// GET /projections/{id}/dead-letters
#[tracing::instrument(skip(state))]
pub async fn dead_letters<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    let id = ProjectionId::new(id);
    let projector = state.projector();
    if projector.registry().get(&id).is_none() {
        return Err(ApiError::NotFound(format!("Projection {id} not found")));
    }
    let letters = projector.dead_letters(&id).await?;
    Ok(Json(letters))
}

/// POST /dead-letters/{id}/replay
#[tracing::instrument(skip(state))]
pub async fn replay<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<Uuid>,
) -> Result<Json<UnitReport>, ApiError> {
    Ok(Json(state.projector().replay_dead_letter(id).await?))
}
