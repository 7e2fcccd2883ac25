use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::category::CategoryServiceError;
use crate::inventory::InventoryError;

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }

    /// 404 response carrying the resource type and id, so callers can tell a
    /// missing product from a missing category reference.
    pub fn not_found(resource: &str, id: i64) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("{resource} with ID {id} not found"),
        )
    }

    pub fn validation<S: Into<String>>(detail: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_failure", detail)
    }

    fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "unexpected internal error",
        )
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<InventoryError> for ProblemResponse {
    fn from(err: InventoryError) -> Self {
        match err {
            InventoryError::ProductNotFound(id) => Self::not_found("Product", id),
            InventoryError::CategoryNotFound(id) => Self::not_found("Category", id),
            other => {
                error!(stage = "api", error = %other, "inventory operation failed");
                Self::internal()
            }
        }
    }
}

impl From<CategoryServiceError> for ProblemResponse {
    fn from(err: CategoryServiceError) -> Self {
        match err {
            CategoryServiceError::NotFound(id) => Self::not_found("Category", id),
            CategoryServiceError::InUse(id) => Self::new(
                StatusCode::CONFLICT,
                "category_in_use",
                format!("Category with ID {id} still has associated products"),
            ),
            other => {
                error!(stage = "api", error = %other, "category operation failed");
                Self::internal()
            }
        }
    }
}
