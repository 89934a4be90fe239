//! API server entry point.

use std::sync::Arc;

use api::AppState;
use api::config::{Config, LogFormat};
use event_store::{EventStore, InMemoryEventStore, PostgresEventStore};
use metrics_exporter_prometheus::PrometheusHandle;
use projections::ViewSpec;
use read_model::{InMemoryReadModelStore, PostgresReadModelStore, ReadModelStore};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn load_views(config: &Config) -> Result<Vec<ViewSpec>, BoxError> {
    let Some(path) = &config.projections_file else {
        tracing::warn!("PROJECTIONS_FILE not set; no projections registered");
        return Ok(Vec::new());
    };
    let json = std::fs::read_to_string(path)?;
    let views = ViewSpec::parse_list(&json)?;
    tracing::info!(path = %path.display(), count = views.len(), "loaded projections");
    Ok(views)
}

/// Builds the state over the chosen backends, catches the projector up and
/// serves until a shutdown signal arrives.
async fn run<S: EventStore + Clone + 'static>(
    events: S,
    read_models: Arc<dyn ReadModelStore>,
    config: Config,
    metrics_handle: PrometheusHandle,
) -> Result<(), BoxError> {
    let views = load_views(&config)?;
    let state = Arc::new(AppState::build(events, read_models, &config, views).await?);

    let projector = state.projector().clone();
    let replayed = projector.catch_up().await?;
    tracing::info!(events = replayed, "projections caught up");
    projector.start();

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    projector.stop().await;
    served?;
    tracing::info!("server shut down gracefully");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = Config::from_env();
    init_tracing(&config);

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    match config.database_url.clone() {
        Some(url) => {
            tracing::info!("using PostgreSQL stores");
            let pool = PgPoolOptions::new().max_connections(16).connect(&url).await?;
            let events = PostgresEventStore::new(pool.clone());
            events.run_migrations().await?;
            let read_models = Arc::new(PostgresReadModelStore::new(pool));
            run(events, read_models, config, metrics_handle).await
        }
        None => {
            tracing::info!("using in-memory stores");
            run(
                InMemoryEventStore::new(),
                Arc::new(InMemoryReadModelStore::new()),
                config,
                metrics_handle,
            )
            .await
        }
    }
}
