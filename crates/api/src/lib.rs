//! HTTP adapter for the read side.
//!
//! Exposes read-model queries, projector administration and raw event
//! ingestion, with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use domain::{CommandPipeline, PipelineConfig};
use event_store::EventStore;
use metrics_exporter_prometheus::PrometheusHandle;
use projections::{Projector, ProjectionError, ViewSpec};
use read_model::{CachedReadModelStore, QueryConfig, QueryEngine, ReadModelStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState<S> {
    pub pipeline: CommandPipeline<S>,
    pub queries: QueryEngine,
}

impl<S: EventStore + Clone + 'static> AppState<S> {
    /// Wires the cache, projector, pipeline and query engine over the given
    /// stores and registers `views`.
    ///
    /// Projector writes and queries share one cached store, so a write
    /// invalidates the entry the next query would read.
    pub async fn build(
        events: S,
        read_models: Arc<dyn ReadModelStore>,
        config: &Config,
        views: Vec<ViewSpec>,
    ) -> Result<Self, ProjectionError> {
        let cached: Arc<dyn ReadModelStore> =
            Arc::new(CachedReadModelStore::new(read_models, config.cache.clone()));

        let projector = Projector::builder(events, Arc::clone(&cached))
            .config(config.projector.clone())
            .build();
        for view in views {
            let (definition, projection) = view.into_parts();
            projector.register_projection(definition, projection).await?;
        }

        Ok(Self {
            pipeline: CommandPipeline::new(
                projector,
                PipelineConfig::default().with_consistency(config.consistency),
            ),
            queries: QueryEngine::new(cached, QueryConfig::default()),
        })
    }

    pub fn projector(&self) -> &Projector<S> {
        self.pipeline.projector()
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: EventStore + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/events", post(routes::events::append::<S>))
        .route("/read-models/search", post(routes::read_models::search::<S>))
        .route("/read-models/{id}", get(routes::read_models::get::<S>))
        .route("/projections", get(routes::projections::list::<S>))
        .route(
            "/projections/{id}/checkpoint",
            get(routes::projections::checkpoint::<S>),
        )
        .route("/projections/{id}/pause", post(routes::projections::pause::<S>))
        .route("/projections/{id}/resume", post(routes::projections::resume::<S>))
        .route(
            "/projections/{id}/dead-letters",
            get(routes::projections::dead_letters::<S>),
        )
        .route(
            "/dead-letters/{id}/replay",
            post(routes::projections::replay::<S>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
