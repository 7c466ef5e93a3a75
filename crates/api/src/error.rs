use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use custos_core::{CustosError, ErrorKind};
use serde_json::json;

/// Error returned by every handler. Serialized as `{"error", "kind"}`.
#[derive(Debug)]
pub enum ApiError {
    /// No subject header on the request.
    Unauthorized(String),
    Domain(CustosError),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<CustosError> for ApiError {
    fn from(e: CustosError) -> Self {
        ApiError::Domain(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Domain(CustosError::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Domain(CustosError::Validation(rejection.body_text()))
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            ApiError::Domain(e) => {
                let kind = e.kind();
                let message = if kind == ErrorKind::Internal {
                    tracing::error!(error = %e, "internal error");
                    "internal server error".to_string()
                } else {
                    e.to_string()
                };
                (status_for(kind), kind.as_str(), message)
            }
        };

        (status, Json(json!({ "error": message, "kind": kind }))).into_response()
    }
}
