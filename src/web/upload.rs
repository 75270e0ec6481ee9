//! Upload endpoints: register, stream the body, poll progress.

use async_trait::async_trait;
use axum::Json;
use axum::body::{Body, BodyDataStream};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;

use super::WebState;
use super::error::{ApiError, ApiResult};
use crate::core::{ChunkSource, IngestReceipt, Submission, UploadTicket};

/// Request body chunks as they arrive off the socket.
pub struct BodySource(BodyDataStream);

impl BodySource {
    pub fn new(body: Body) -> Self {
        Self(body.into_data_stream())
    }
}

#[async_trait]
impl ChunkSource for BodySource {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        self.0.next().await.transpose().map_err(io::Error::other)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub percentage: f64,
}

/// `POST /uploads`
pub async fn create_upload(
    State(state): State<WebState>,
    Json(submission): Json<Submission>,
) -> ApiResult<(StatusCode, Json<UploadTicket>)> {
    let ticket = state.sink.begin(&submission).await?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

/// `PUT /uploads/{id}` with the raw file as the body.
pub async fn upload_body(
    State(state): State<WebState>,
    Path(id): Path<String>,
    body: Body,
) -> ApiResult<Json<IngestReceipt>> {
    let receipt = state.sink.ingest(&id, BodySource::new(body)).await?;
    Ok(Json(receipt))
}

#[derive(Debug, Serialize)]
pub struct ActiveUpload {
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub percentage: f64,
}

/// `GET /uploads`
pub async fn list_uploads(State(state): State<WebState>) -> Json<BTreeMap<String, ActiveUpload>> {
    let uploads = state
        .sink
        .registry()
        .snapshot_all()
        .await
        .into_iter()
        .map(|(id, snapshot)| {
            let upload = ActiveUpload {
                received_bytes: snapshot.received_bytes,
                total_bytes: snapshot.total_bytes,
                percentage: snapshot.percentage(),
            };
            (id, upload)
        })
        .collect();
    Json(uploads)
}

/// `GET /uploads/{id}/progress`
pub async fn upload_progress(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProgressResponse>> {
    let snapshot = state
        .sink
        .registry()
        .snapshot(&id)
        .await
        .map_err(|_| ApiError::not_found(format!("no active upload {id}")))?;

    Ok(Json(ProgressResponse {
        percentage: snapshot.percentage(),
    }))
}
