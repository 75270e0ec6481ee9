//! Push-style progress feed for a single upload.
//!
//! Polls the registry on a fixed interval and forwards the percentage to an
//! observer until the session disappears or the observer goes away.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::registry::ProgressRegistry;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressEvent {
    Percentage(f64),
    /// The session is gone: finished, failed, or never existed.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOutcome {
    Finished,
    Disconnected,
}

/// Anything that can receive progress events. An error means the observer
/// is gone and the channel should stop.
#[async_trait]
pub trait ProgressObserver: Send {
    async fn emit(&mut self, event: ProgressEvent) -> Result<()>;
}

#[async_trait]
impl ProgressObserver for mpsc::Sender<ProgressEvent> {
    async fn emit(&mut self, event: ProgressEvent) -> Result<()> {
        self.send(event)
            .await
            .map_err(|_| anyhow!("progress receiver dropped"))
    }
}

#[derive(Clone)]
pub struct ProgressChannel {
    registry: ProgressRegistry,
    interval: Duration,
}

impl ProgressChannel {
    pub fn new(registry: ProgressRegistry, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub async fn run<O: ProgressObserver>(
        &self,
        upload_id: &str,
        observer: &mut O,
    ) -> ChannelOutcome {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let (event, empty_payload) = match self.registry.snapshot(upload_id).await {
                Ok(snapshot) => (
                    ProgressEvent::Percentage(snapshot.percentage()),
                    snapshot.total_bytes == 0,
                ),
                Err(_) => (ProgressEvent::Finished, false),
            };

            if let Err(e) = observer.emit(event).await {
                if event == ProgressEvent::Finished {
                    return ChannelOutcome::Finished;
                }
                debug!(upload_id = %upload_id, error = %e, "Progress observer disconnected");
                return ChannelOutcome::Disconnected;
            }

            // An empty payload reports 100 once and has nothing left to wait for.
            if empty_payload {
                let _ = observer.emit(ProgressEvent::Finished).await;
                return ChannelOutcome::Finished;
            }
            if event == ProgressEvent::Finished {
                return ChannelOutcome::Finished;
            }
        }
    }
}
