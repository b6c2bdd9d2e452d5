//! API error mapping

use crate::models::ApiResponse;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tenancy_core::TenancyError;
use thiserror::Error;
use tracing::{debug, error};

/// Handler error
#[derive(Error, Debug)]
pub enum ApiError {
    /// Domain or storage failure
    #[error(transparent)]
    Tenancy(#[from] TenancyError),

    /// Request shape the domain never sees
    #[error("bad request: {0}")]
    BadRequest(String),
}

/// Handler result
pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// HTTP status for the error
    pub fn status(&self) -> StatusCode {
        let ApiError::Tenancy(err) = self else {
            return StatusCode::BAD_REQUEST;
        };
        match err {
            TenancyError::UnknownTenant(_)
            | TenancyError::UnknownFeature(_)
            | TenancyError::UnknownPlan(_)
            | TenancyError::UnknownSubscription(_) => StatusCode::NOT_FOUND,
            TenancyError::Validation(_) => StatusCode::BAD_REQUEST,
            TenancyError::FeatureNotEntitled { .. } | TenancyError::TenantInactive { .. } => {
                StatusCode::FORBIDDEN
            }
            TenancyError::NoActiveSubscription(_) => StatusCode::PAYMENT_REQUIRED,
            TenancyError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            TenancyError::InvalidTransition { .. }
            | TenancyError::Conflict(_)
            | TenancyError::ConcurrencyConflict(_) => StatusCode::CONFLICT,
            TenancyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            TenancyError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Machine-readable code for the envelope
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Tenancy(err) => err.code(),
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        if status.is_server_error() {
            error!(code = self.code(), error = %message, "Request failed");
        } else {
            debug!(code = self.code(), error = %message, "Request rejected");
        }

        let body = ApiResponse::<()>::error(self.code(), &message);
        (status, Json(body)).into_response()
    }
}
