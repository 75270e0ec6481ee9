//! HTTP surface of the upload server.
//!
//! - `POST /uploads` registers an upload and returns its id
//! - `GET /uploads` lists uploads that are currently streaming
//! - `PUT /uploads/{id}` streams the file body
//! - `GET /uploads/{id}/progress` returns one progress snapshot
//! - `GET /progress/{id}` websocket progress feed
//! - `GET /health`

mod error;
mod upload;
mod websocket;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::core::IngestionSink;

pub use error::{ApiError, ApiResult};
pub use upload::{BodySource, ProgressResponse};

#[derive(Clone)]
pub struct WebState {
    pub sink: Arc<IngestionSink>,
    pub progress_interval: Duration,
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/uploads",
            post(upload::create_upload).get(upload::list_uploads),
        )
        .route("/uploads/{id}", put(upload::upload_body))
        .route("/uploads/{id}/progress", get(upload::upload_progress))
        .route("/progress/{id}", get(websocket::ws_handler))
        // Uploads are streamed to disk, never buffered.
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

pub struct WebServer {
    listener: TcpListener,
    state: WebState,
}

impl WebServer {
    pub async fn bind(state: WebState, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` is cancelled. In-flight requests are drained.
    pub async fn start(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        tracing::info!(addr = %self.local_addr()?, "Upload server listening");

        axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    active_uploads: usize,
    pending_uploads: usize,
}

async fn health(State(state): State<WebState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        active_uploads: state.sink.registry().active_count().await,
        pending_uploads: state.sink.pending_count(),
    })
}
