//! Completion notification: telling the transcoding coordinator an upload landed.
//!
//! Delivery is at-most-once and best-effort. Every call is bounded by a
//! deadline, failures are logged and never retried, and the outcome never
//! changes the result of the ingestion that triggered it.

mod rpc;
mod webhook;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{NotificationChannelType, NotifyConfig};

pub use rpc::RpcNotifier;
pub use webhook::WebhookNotifier;

/// Trait for the ways a coordinator can be reached.
///
/// Implementations issue exactly one remote call carrying only the upload id.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, upload_id: &str) -> Result<()>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("notification for upload {upload_id} failed: {reason}")]
pub struct NotifyFailed {
    pub upload_id: String,
    pub reason: String,
}

/// Build the notifier selected by config, or `None` when notifications are off.
pub fn create_notifier(config: &NotifyConfig) -> Option<Arc<dyn CompletionNotifier>> {
    match config.channel {
        NotificationChannelType::None => None,
        NotificationChannelType::Rpc => Some(Arc::new(RpcNotifier::new(config.coordinator_addr))),
        NotificationChannelType::Webhook => {
            let url = config.webhook_url.as_ref()?;
            if url.is_empty() {
                return None;
            }
            Some(Arc::new(WebhookNotifier::new(url.clone())))
        }
    }
}

/// Run one notification under `deadline`. Expiry abandons the call.
pub async fn notify_with_deadline(
    notifier: &dyn CompletionNotifier,
    upload_id: &str,
    deadline: Duration,
) -> Result<(), NotifyFailed> {
    match tokio::time::timeout(deadline, notifier.notify(upload_id)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(NotifyFailed {
            upload_id: upload_id.to_string(),
            reason: format!("{e:#}"),
        }),
        Err(_) => Err(NotifyFailed {
            upload_id: upload_id.to_string(),
            reason: format!("deadline of {}s exceeded", deadline.as_secs_f64()),
        }),
    }
}

/// Spawn the notification as its own task.
///
/// The task logs its own outcome, so callers may detach the handle; callers
/// that care can still await it for the result.
pub fn dispatch(
    notifier: Arc<dyn CompletionNotifier>,
    upload_id: String,
    deadline: Duration,
) -> JoinHandle<Result<(), NotifyFailed>> {
    tokio::spawn(async move {
        let result = notify_with_deadline(notifier.as_ref(), &upload_id, deadline).await;
        match &result {
            Ok(()) => info!(
                upload_id = %upload_id,
                channel = notifier.name(),
                "Coordinator notified of completed upload"
            ),
            Err(e) => warn!(
                upload_id = %upload_id,
                channel = notifier.name(),
                error = %e,
                "Completion notification failed, not retrying"
            ),
        }
        result
    })
}
