//! Coordinator method dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn};

use crate::core::transcode::{Coordinator, CoordinatorError, TranscodeJob};

use super::protocol::{
    ARTIFACT_NOT_FOUND, JOB_NOT_FOUND, PROGRESS_UNAVAILABLE, Request, Response,
};

pub const NOTIFY_UPLOAD_COMPLETE: &str = "transcoder.notify_upload_complete";
pub const TRANSCODE_STATUS: &str = "transcoder.status";
pub const TRANSCODE_JOBS: &str = "transcoder.jobs";
pub const DAEMON_STATUS: &str = "daemon.status";

/// Acknowledgement returned once a job has been accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyAck {
    pub status_code: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub active_jobs: usize,
    pub rpc_bind: String,
}

pub struct MethodHandler {
    coordinator: Coordinator,
    bind_addr: SocketAddr,
    start_time: Instant,
}

impl MethodHandler {
    pub fn new(coordinator: Coordinator, bind_addr: SocketAddr) -> Self {
        Self {
            coordinator,
            bind_addr,
            start_time: Instant::now(),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            NOTIFY_UPLOAD_COMPLETE => self.notify_upload_complete(id, params).await,
            TRANSCODE_STATUS => self.transcode_status(id, params).await,
            TRANSCODE_JOBS => self.transcode_jobs(id).await,
            DAEMON_STATUS => self.daemon_status(id).await,
            _ => Response::method_not_found(id, &request.method),
        }
    }

    async fn notify_upload_complete(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            upload_id: String,
        }

        let params: Params = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e.to_string()),
        };

        match self
            .coordinator
            .notify_upload_complete(&params.upload_id)
            .await
        {
            // The job runs detached and logs its own outcome.
            Ok(_job) => {
                info!(upload_id = %params.upload_id, "Upload completion acknowledged");
                Response::success(id, NotifyAck { status_code: 200 })
            }
            Err(e) => {
                warn!(upload_id = %params.upload_id, error = %e, "Rejected completion notification");
                coordinator_error(id, e)
            }
        }
    }

    async fn transcode_status(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            job_id: String,
        }

        let params: Params = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e.to_string()),
        };

        match self.coordinator.status(&params.job_id).await {
            Ok(status) => Response::success(id, status),
            Err(e) => coordinator_error(id, e),
        }
    }

    async fn transcode_jobs(&self, id: Value) -> Response {
        #[derive(Serialize)]
        struct JobList {
            jobs: Vec<TranscodeJob>,
            count: usize,
        }

        let jobs = self.coordinator.jobs().await;
        let count = jobs.len();
        Response::success(id, JobList { jobs, count })
    }

    async fn daemon_status(&self, id: Value) -> Response {
        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: self.start_time.elapsed().as_secs(),
                active_jobs: self.coordinator.active_count().await,
                rpc_bind: self.bind_addr.to_string(),
            },
        )
    }
}

fn coordinator_error(id: Value, error: CoordinatorError) -> Response {
    let code = match &error {
        CoordinatorError::InvalidUploadId(_) => return Response::invalid_params(id, error.to_string()),
        CoordinatorError::ArtifactNotFound(_) => ARTIFACT_NOT_FOUND,
        CoordinatorError::JobNotFound(_) => JOB_NOT_FOUND,
        CoordinatorError::Progress(_) => PROGRESS_UNAVAILABLE,
    };
    Response::error(id, code, error.to_string())
}
