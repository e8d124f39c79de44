use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use catalyst_hiap::HiapError;
use catalyst_storage::StoreError;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Success envelope: `{ "data": ... }`.
#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

/// Handler error rendered as `{ "error": { "message": ... } }`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Hiap(#[from] HiapError),
}

pub type ApiResult<T> = Result<Json<DataResponse<T>>, ApiError>;

pub fn data<T>(data: T) -> Json<DataResponse<T>> {
    Json(DataResponse { data })
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_)
            | ApiError::Store(StoreError::NotFound { .. })
            | ApiError::Hiap(HiapError::Store(StoreError::NotFound { .. })) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = json!({ "error": { "message": self.to_string() } });
        (status, Json(body)).into_response()
    }
}
