//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use event_store::EventStore;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub projector_running: bool,
    pub projections: usize,
}

/// GET /health: process liveness plus projector state.
pub async fn check<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    let projector = state.projector();
    Json(HealthResponse {
        status: "ok",
        projector_running: projector.is_running(),
        projections: projector.registry().len(),
    })
}
