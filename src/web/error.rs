//! HTTP error mapping for the upload API.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::core::IngestError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Ingest(e) => match e {
                IngestError::InvalidSubmission(_) => StatusCode::BAD_REQUEST,
                IngestError::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
                IngestError::UnknownUpload(_) => StatusCode::NOT_FOUND,
                IngestError::DuplicateSession(_) => StatusCode::CONFLICT,
                IngestError::IngestionFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::Ingest(e) => match e {
                IngestError::InvalidSubmission(_) => "invalid_submission",
                IngestError::UnsupportedMediaType { .. } => "unsupported_media_type",
                IngestError::UnknownUpload(_) => "unknown_upload",
                IngestError::DuplicateSession(_) => "duplicate_session",
                IngestError::IngestionFailed { .. } => "ingestion_failed",
            },
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            // Storage paths stay in the server log.
            detail: match &self {
                ApiError::Ingest(IngestError::IngestionFailed { id, .. }) => {
                    format!("ingestion of upload {id} failed")
                }
                _ => self.to_string(),
            },
            code: self.code(),
        };

        (status, Json(body)).into_response()
    }
}
