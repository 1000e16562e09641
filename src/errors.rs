use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};

/// Standard error body returned by every handler.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

/// Error taxonomy for the stock ledger.
///
/// `Conflict` is the only variant callers (and the service's own retry loop)
/// are expected to retry; everything else is surfaced as-is.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Aggregate-level shortfall, reserved for pre-checks that never reach
    /// the allocation engine. Ledger operations verify at the batch level
    /// and report `InsufficientBatchStock` instead.
    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    /// The allocation walk over the batches could not cover the request.
    /// This is the verdict regardless of what the product aggregate showed;
    /// an aggregate that looked sufficient has drifted and is logged as a
    /// warning at the point of detection.
    #[error("Insufficient batch stock: {0}")]
    InsufficientBatchStock(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Substrings that identify contention-class database failures across the
/// backends we run against (Postgres serialization/deadlock, SQLite busy).
const CONFLICT_MARKERS: &[&str] = &[
    "database is locked",
    "deadlock",
    "could not serialize",
    "serialization failure",
    "sqlite_busy",
];

impl ServiceError {
    /// Wraps a `DbErr`, reclassifying contention failures as `Conflict` so
    /// the retry loop can distinguish them from genuine datastore faults.
    pub fn db_error(error: DbErr) -> Self {
        let msg = error.to_string();
        let lowered = msg.to_lowercase();
        if CONFLICT_MARKERS.iter().any(|m| lowered.contains(m)) {
            ServiceError::Conflict(msg)
        } else {
            ServiceError::DatabaseError(error)
        }
    }

    /// True when the caller may retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Conflict(_))
    }

    /// Single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::InsufficientStock(_) | Self::InsufficientBatchStock(_) | Self::Conflict(_) => {
                StatusCode::CONFLICT
            }
            Self::DatabaseError(_) | Self::EventError(_) | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to expose to API callers. Internal failures are collapsed
    /// to a generic message; details stay in the logs.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) => {
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_db_errors_become_conflict() {
        let err = ServiceError::db_error(DbErr::Custom("database is locked".into()));
        assert!(matches!(err, ServiceError::Conflict(_)));
        assert!(err.is_retryable());

        let err = ServiceError::db_error(DbErr::Custom(
            "ERROR: could not serialize access due to concurrent update".into(),
        ));
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[test]
    fn ordinary_db_errors_stay_database_errors() {
        let err = ServiceError::db_error(DbErr::Custom("relation does not exist".into()));
        assert!(matches!(err, ServiceError::DatabaseError(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            ServiceError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::InsufficientBatchStock("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::InsufficientStock("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::InvalidArgument("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
