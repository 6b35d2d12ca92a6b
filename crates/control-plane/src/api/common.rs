// Common DTOs for public API
//
// These types are shared across multiple API endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use waitlist_positions::{AllocationError, ReconcileError, StoreError};

use crate::services::RegistrationError;

/// Standard error response for API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message describing what went wrong.
    pub error: String,
    /// Stable machine-readable error code.
    #[schema(example = "RetriesExhausted")]
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }

    /// Convert to axum response tuple
    pub fn into_response(self, status: StatusCode) -> (StatusCode, Json<Self>) {
        (status, Json(self))
    }
}

/// Response wrapper for list endpoints.
/// All list endpoints return responses wrapped in a `data` field.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    /// Array of items returned by the list operation.
    pub data: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// Error returned by handlers: a status code plus an [`ErrorResponse`] body
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse::new(error, code),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NotFound", what)
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BadRequest", error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.body.into_response(self.status).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::SignupNotFound(_) => Self::not_found(e.to_string()),
            StoreError::EmailTaken(_) => Self::new(StatusCode::CONFLICT, "EmailTaken", e.to_string()),
            StoreError::Contention(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "Contention", e.to_string())
            }
            _ => {
                tracing::error!(error = %e, "store error");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "StoreError",
                    "internal storage error",
                )
            }
        }
    }
}

impl From<AllocationError> for ApiError {
    fn from(e: AllocationError) -> Self {
        let status = match &e {
            AllocationError::NotFound(_) => StatusCode::NOT_FOUND,
            AllocationError::AlreadyAllocated { .. } => StatusCode::CONFLICT,
            AllocationError::NotMember(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AllocationError::RetriesExhausted { .. } | AllocationError::DeadlineExceeded { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AllocationError::Store(_) => {
                tracing::error!(error = %e, "allocation store error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = if e.is_transient() {
            format!("{}; try again", e)
        } else {
            e.to_string()
        };
        Self::new(status, e.code(), message)
    }
}

impl From<RegistrationError> for ApiError {
    fn from(e: RegistrationError) -> Self {
        match e {
            RegistrationError::Store(e) => e.into(),
            RegistrationError::Allocation(e) => e.into(),
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        tracing::error!(error = %e, "reconciliation failed");
        let status = match &e {
            ReconcileError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            ReconcileError::PartialBatch { .. } | ReconcileError::Counter(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ReconcileError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.code(), e.to_string())
    }
}
