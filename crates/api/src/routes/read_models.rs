//! Read-model lookup and search endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use event_store::EventStore;
use read_model::{FindQuery, Page, ReadModel, ReadModelId};

use crate::AppState;
use crate::error::ApiError;

/// GET /read-models/{id}
#[tracing::instrument(skip(state))]
pub async fn get<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<ReadModel>, ApiError> {
    state
        .queries
        .get_by_id(&ReadModelId::new(id.as_str()))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Read model {id} not found")))
}

/// POST /read-models/search. The body is a [`FindQuery`].
#[tracing::instrument(skip(state, query))]
pub async fn search<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(query): Json<FindQuery>,
) -> Result<Json<Page>, ApiError> {
    Ok(Json(state.queries.search(query).await?))
}
