use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use plancache_api_types::ApiResponse;

use crate::application::coordinator::CoordinatorError;
use crate::application::error::ErrorReport;
use crate::application::plans::QueryError;
use crate::cache::StoreError;

/// Error answered with the `{code, msg}` envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    report: ErrorReport,
}

impl ApiError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            report: ErrorReport::from_message(source, status, detail),
        }
    }

    fn from_error(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
        error: &dyn std::error::Error,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            report: ErrorReport::from_error(source, status, error),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(
            "infra::http::request",
            StatusCode::BAD_REQUEST,
            message.clone(),
            message,
        )
    }

    pub fn unauthorized() -> Self {
        Self::new(
            "infra::http::admin_auth",
            StatusCode::UNAUTHORIZED,
            "Admin token required",
            "missing bearer token",
        )
    }

    pub fn forbidden(detail: &'static str) -> Self {
        Self::new(
            "infra::http::admin_auth",
            StatusCode::FORBIDDEN,
            "Admin token rejected",
            detail,
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()>::failure(self.status.as_u16(), self.message);
        let mut response = (self.status, Json(body)).into_response();
        self.report.attach(&mut response);
        response
    }
}

fn store_status(err: &StoreError) -> (StatusCode, &'static str) {
    match err {
        StoreError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "Cache unavailable"),
        StoreError::Backend(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        const SOURCE: &str = "infra::http::query_error";
        match &err {
            QueryError::NotFound => {
                Self::from_error(SOURCE, StatusCode::NOT_FOUND, "Plan not found", &err)
            }
            QueryError::Validation(fields) => {
                let message = fields
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n");
                Self::from_error(SOURCE, StatusCode::BAD_REQUEST, message, &err)
            }
            QueryError::Store(store) => {
                let (status, message) = store_status(store);
                Self::from_error(SOURCE, status, message, &err)
            }
        }
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        const SOURCE: &str = "infra::http::refresh_error";
        let (status, message) = match &err {
            CoordinatorError::Busy { .. } | CoordinatorError::LeaseHeld { .. } => {
                (StatusCode::CONFLICT, "Refresh already in progress")
            }
            CoordinatorError::TimedOut { .. } => {
                (StatusCode::GATEWAY_TIMEOUT, "Refresh did not finish in time")
            }
            CoordinatorError::Failed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "Refresh failed"),
            CoordinatorError::Publish(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "Refresh worker unavailable")
            }
        };
        Self::from_error(SOURCE, status, message, &err)
    }
}
