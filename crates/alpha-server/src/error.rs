//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cluster::ClusterError;
use domain::DomainError;
use event_store::EventStoreError;
use saga::SagaError;
use tcc::TccError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Malformed inbound message.
    Domain(DomainError),
    /// Saga coordination error.
    Saga(SagaError),
    /// TCC coordination error.
    Tcc(TccError),
    /// Event store error.
    EventStore(EventStoreError),
    /// Lease store error.
    Cluster(ClusterError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Domain(_) => StatusCode::BAD_REQUEST,
            ApiError::Saga(err) => saga_status(err),
            ApiError::Tcc(TccError::NotActive) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Tcc(TccError::EventStore(err)) => store_status(err),
            ApiError::Tcc(TccError::Serialization(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::EventStore(err) => store_status(err),
            ApiError::Cluster(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::NotFound(msg) => msg.clone(),
            ApiError::Domain(err) => err.to_string(),
            ApiError::Saga(err) => err.to_string(),
            ApiError::Tcc(err) => err.to_string(),
            ApiError::EventStore(err) => err.to_string(),
            ApiError::Cluster(err) => err.to_string(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.message();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %message, "internal server error");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_status(err: &SagaError) -> StatusCode {
    match err {
        SagaError::OrphanEvent { .. } | SagaError::IllegalTransition { .. } => StatusCode::CONFLICT,
        SagaError::NotActive => StatusCode::SERVICE_UNAVAILABLE,
        SagaError::EventStore(err) => store_status(err),
        SagaError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_status(err: &EventStoreError) -> StatusCode {
    match err {
        EventStoreError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        ApiError::Domain(err)
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<TccError> for ApiError {
    fn from(err: TccError) -> Self {
        ApiError::Tcc(err)
    }
}

impl From<EventStoreError> for ApiError {
    fn from(err: EventStoreError) -> Self {
        ApiError::EventStore(err)
    }
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        ApiError::Cluster(err)
    }
}
