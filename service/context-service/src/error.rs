//! RFC 7807 problem documents for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::ServiceError;

#[derive(Debug, Clone, Serialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub type_uri: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl Problem {
    fn new(kind: &str, title: &str, status: StatusCode, detail: String) -> Self {
        Self {
            type_uri: format!("urn:context-cache:error:{kind}"),
            title: title.to_string(),
            status: status.as_u16(),
            detail,
            instance: None,
        }
    }
}

impl From<ServiceError> for Problem {
    fn from(err: ServiceError) -> Self {
        let detail = err.to_string();
        match &err {
            // The violating field stays in the enum; the detail alone is the
            // human-readable message.
            ServiceError::Validation { detail, .. } => {
                Problem::new("validation", "Bad Request", StatusCode::BAD_REQUEST, detail.clone())
            }
            ServiceError::NotFound(_) | ServiceError::Store(context_store::StoreError::NotFound(_)) => {
                Problem::new("not_found", "Not Found", StatusCode::NOT_FOUND, detail)
            }
            ServiceError::DeadlineExceeded => Problem::new(
                "deadline_exceeded",
                "Gateway Timeout",
                StatusCode::GATEWAY_TIMEOUT,
                detail,
            ),
            ServiceError::Cancelled => Problem::new(
                "cancelled",
                "Service Unavailable",
                StatusCode::SERVICE_UNAVAILABLE,
                detail,
            ),
            ServiceError::Config(_) => Problem::new(
                "config",
                "Internal Server Error",
                StatusCode::INTERNAL_SERVER_ERROR,
                detail,
            ),
            ServiceError::Load(_) => Problem::new(
                "load",
                "Unprocessable Content",
                StatusCode::UNPROCESSABLE_ENTITY,
                detail,
            ),
            _ => Problem::new(
                "internal",
                "Internal Server Error",
                StatusCode::INTERNAL_SERVER_ERROR,
                detail,
            ),
        }
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// Handler result alias: every failure renders as a problem document.
pub type ApiResult<T> = Result<T, Problem>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_400_with_the_bare_detail() {
        let p: Problem = ServiceError::validation("query", "query must be non-empty").into();
        assert_eq!(p.status, 400);
        assert_eq!(p.detail, "query must be non-empty");
        assert_eq!(p.type_uri, "urn:context-cache:error:validation");
    }

    #[test]
    fn not_found_maps_to_404() {
        let p: Problem = ServiceError::NotFound("query 9".into()).into();
        assert_eq!(p.status, 404);
        let p: Problem =
            Problem::from(ServiceError::Store(context_store::StoreError::NotFound("x".into())));
        assert_eq!(p.status, 404);
    }

    #[test]
    fn deadline_maps_to_504() {
        let p: Problem = ServiceError::DeadlineExceeded.into();
        assert_eq!(p.status, 504);
        assert_eq!(p.type_uri, "urn:context-cache:error:deadline_exceeded");
    }
}
