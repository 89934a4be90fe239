//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::{DomainError, PipelineError};
use projections::ProjectionError;
use read_model::ReadModelError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Command or append failure.
    Domain(DomainError),
    /// Projector or projection admin failure.
    Projection(ProjectionError),
    /// Read-side store or query failure.
    ReadModel(ReadModelError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Domain(err) => (domain_status(&err), err.to_string()),
            ApiError::Projection(err) => (projection_status(&err), err.to_string()),
            ApiError::ReadModel(err) => (read_model_status(&err), err.to_string()),
        };

        if status.is_server_error() {
            tracing::error!(error = %message, "internal server error");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn domain_status(err: &DomainError) -> StatusCode {
    match err {
        e if e.is_conflict() => StatusCode::CONFLICT,
        DomainError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DomainError::EventStore(event_store::EventStoreError::Validation(_))
        | DomainError::Serialization(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn projection_status(err: &ProjectionError) -> StatusCode {
    match err {
        ProjectionError::UnknownProjection(_) | ProjectionError::UnknownDeadLetter(_) => {
            StatusCode::NOT_FOUND
        }
        ProjectionError::DuplicateProjection(_) => StatusCode::CONFLICT,
        ProjectionError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        ProjectionError::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn read_model_status(err: &ReadModelError) -> StatusCode {
    match err {
        ReadModelError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        ReadModelError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        ApiError::Domain(err)
    }
}

impl From<ProjectionError> for ApiError {
    fn from(err: ProjectionError) -> Self {
        ApiError::Projection(err)
    }
}

impl From<ReadModelError> for ApiError {
    fn from(err: ReadModelError) -> Self {
        ApiError::ReadModel(err)
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Domain(e) => ApiError::Domain(e),
            PipelineError::Projection(e) => ApiError::Projection(e),
        }
    }
}
