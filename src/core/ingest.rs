//! Ingestion sink: validates a submission, streams its bytes to durable storage
//! and keeps the progress registry current while doing so.
//!
//! Ingestion is two-phase so clients can learn the upload id before sending
//! any data: [`IngestionSink::begin`] validates and registers the session,
//! [`IngestionSink::ingest`] consumes the byte stream.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::notifications::{self, CompletionNotifier};
use super::registry::ProgressRegistry;
use crate::config::IngestConfig;
use crate::context::AppContext;
use crate::logging::LogThrottle;

/// 128KB, same as the largest chunks browsers tend to send.
const WRITE_BUFFER_SIZE: usize = 128 * 1024;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("unsupported media type: {filename}")]
    UnsupportedMediaType { filename: String },

    #[error("ingestion of upload {id} failed: {source}")]
    IngestionFailed {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("upload session {0} already exists")]
    DuplicateSession(String),

    #[error("upload {0} is not awaiting data")]
    UnknownUpload(String),
}

/// A sequence of binary chunks, consumed in order until `Ok(None)`.
#[async_trait]
pub trait ChunkSource: Send {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>>;
}

#[async_trait]
impl ChunkSource for mpsc::Receiver<io::Result<Bytes>> {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        self.recv().await.transpose()
    }
}

/// What a client declares before sending any bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub filenames: Vec<String>,
    pub total_bytes: u64,
}

impl Submission {
    pub fn single(filename: impl Into<String>, total_bytes: u64) -> Self {
        Self {
            filenames: vec![filename.into()],
            total_bytes,
        }
    }
}

/// A registered upload that has not started streaming yet.
#[derive(Debug, Clone, Serialize)]
pub struct UploadTicket {
    pub id: String,
    pub total_bytes: u64,
    #[serde(skip)]
    pub destination: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub id: String,
    pub received_bytes: u64,
    /// Hex blake3 digest of everything written.
    pub blake3: String,
}

/// Owns an upload's registry entry while its body streams. Dropping it
/// without `release` (the ingest future was cancelled) still removes the
/// session.
struct SessionGuard {
    registry: ProgressRegistry,
    id: String,
    released: bool,
}

impl SessionGuard {
    fn new(registry: ProgressRegistry, id: &str) -> Self {
        Self {
            registry,
            id: id.to_string(),
            released: false,
        }
    }

    async fn release(mut self) {
        self.registry.remove(&self.id).await;
        self.released = true;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(upload_id = %self.id, "Ingestion abandoned mid-stream");
            self.registry.remove_now(&self.id);
        }
    }
}

struct Pending {
    ticket: UploadTicket,
    registered_at: Instant,
}

pub struct IngestionSink {
    registry: ProgressRegistry,
    notifier: Option<Arc<dyn CompletionNotifier>>,
    notify_deadline: Duration,
    storage_dir: PathBuf,
    allowed_extensions: Vec<String>,
    pending: Mutex<HashMap<String, Pending>>,
}

impl IngestionSink {
    pub fn new(
        registry: ProgressRegistry,
        notifier: Option<Arc<dyn CompletionNotifier>>,
        notify_deadline: Duration,
        config: &IngestConfig,
    ) -> Self {
        Self {
            registry,
            notifier,
            notify_deadline,
            storage_dir: config.storage_dir.clone(),
            allowed_extensions: config.allowed_extensions.clone(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_context(ctx: &AppContext) -> Self {
        Self::new(
            ctx.registry.clone(),
            ctx.notifier.clone(),
            ctx.config.notify.deadline(),
            &ctx.config.ingest,
        )
    }

    pub fn registry(&self) -> &ProgressRegistry {
        &self.registry
    }

    /// Reject anything but exactly one file with an allow-listed extension.
    pub fn validate(&self, submission: &Submission) -> Result<(), IngestError> {
        let filename = match submission.filenames.as_slice() {
            [single] => single,
            [] => {
                return Err(IngestError::InvalidSubmission(
                    "no file in submission".to_string(),
                ));
            }
            many => {
                return Err(IngestError::InvalidSubmission(format!(
                    "expected exactly one file, got {}",
                    many.len()
                )));
            }
        };

        if filename.trim().is_empty() {
            return Err(IngestError::InvalidSubmission(
                "filename must not be empty".to_string(),
            ));
        }

        if !self.is_allowed(filename) {
            return Err(IngestError::UnsupportedMediaType {
                filename: filename.clone(),
            });
        }
        Ok(())
    }

    /// The extension is the suffix of the final path element starting at
    /// its last dot, so a dotfile such as `.mp4` counts as `.mp4`.
    fn is_allowed(&self, filename: &str) -> bool {
        let base = filename.rsplit('/').next().unwrap_or(filename);
        let Some(dot) = base.rfind('.') else {
            return false;
        };
        let ext = &base[dot..];
        self.allowed_extensions.iter().any(|allowed| allowed == ext)
    }

    /// Validate and register a new upload session. No bytes are read here.
    pub async fn begin(&self, submission: &Submission) -> Result<UploadTicket, IngestError> {
        self.validate(submission)?;

        let id = Uuid::now_v7().to_string();
        self.registry
            .register(&id, submission.total_bytes)
            .await
            .map_err(|_| IngestError::DuplicateSession(id.clone()))?;

        let ticket = UploadTicket {
            destination: self.storage_dir.join(&id),
            id: id.clone(),
            total_bytes: submission.total_bytes,
        };

        self.lock_pending().insert(
            id,
            Pending {
                ticket: ticket.clone(),
                registered_at: Instant::now(),
            },
        );

        debug!(upload_id = %ticket.id, total_bytes = ticket.total_bytes, "Upload registered");
        Ok(ticket)
    }

    /// Stream the body of a previously registered upload to disk.
    ///
    /// The session is removed from the registry when this returns, whatever
    /// the outcome, and also when the future is dropped mid-stream.
    pub async fn ingest<S: ChunkSource>(
        &self,
        id: &str,
        source: S,
    ) -> Result<IngestReceipt, IngestError> {
        let ticket = self
            .lock_pending()
            .remove(id)
            .map(|pending| pending.ticket)
            .ok_or_else(|| IngestError::UnknownUpload(id.to_string()))?;
        let session = SessionGuard::new(self.registry.clone(), &ticket.id);

        let span = info_span!("ingest", upload_id = %ticket.id, total_bytes = ticket.total_bytes);
        self.stream(ticket, session, source).instrument(span).await
    }

    /// `begin` and `ingest` in one go.
    pub async fn ingest_submission<S: ChunkSource>(
        &self,
        submission: &Submission,
        source: S,
    ) -> Result<IngestReceipt, IngestError> {
        let ticket = self.begin(submission).await?;
        self.ingest(&ticket.id, source).await
    }

    async fn stream<S: ChunkSource>(
        &self,
        ticket: UploadTicket,
        session: SessionGuard,
        mut source: S,
    ) -> Result<IngestReceipt, IngestError> {
        info!(destination = %ticket.destination.display(), "Ingestion started");
        let start_time = Instant::now();

        match self.write_chunks(&ticket, &mut source).await {
            Ok(receipt) => {
                if receipt.received_bytes != ticket.total_bytes {
                    warn!(
                        received_bytes = receipt.received_bytes,
                        declared_bytes = ticket.total_bytes,
                        "Upload size differs from declared size"
                    );
                }

                if let Some(notifier) = &self.notifier {
                    // The task logs its own outcome.
                    drop(notifications::dispatch(
                        notifier.clone(),
                        ticket.id.clone(),
                        self.notify_deadline,
                    ));
                }
                session.release().await;

                info!(
                    received_bytes = receipt.received_bytes,
                    elapsed_ms = start_time.elapsed().as_millis() as u64,
                    "Ingestion complete"
                );
                Ok(receipt)
            }
            Err(e) => {
                session.release().await;
                // No rollback: whatever reached the disk stays there.
                error!(
                    error = %e,
                    destination = %ticket.destination.display(),
                    "Ingestion failed"
                );
                Err(IngestError::IngestionFailed {
                    id: ticket.id,
                    source: e,
                })
            }
        }
    }

    async fn write_chunks<S: ChunkSource>(
        &self,
        ticket: &UploadTicket,
        source: &mut S,
    ) -> io::Result<IngestReceipt> {
        if let Some(parent) = ticket.destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = File::create(&ticket.destination).await?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        let mut hasher = blake3::Hasher::new();
        let mut received: u64 = 0;
        let throttle = LogThrottle::new(Duration::from_secs(1));

        while let Some(chunk) = source.next_chunk().await? {
            if chunk.is_empty() {
                continue;
            }
            writer.write_all(&chunk).await?;
            hasher.update(&chunk);

            let n = chunk.len() as u64;
            received += n;
            self.registry.advance(&ticket.id, n).await;

            if throttle.should_log() {
                debug!(received_bytes = received, "Upload progress");
            }
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        Ok(IngestReceipt {
            id: ticket.id.clone(),
            received_bytes: received,
            blake3: hasher.finalize().to_hex().to_string(),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Drop registered uploads that have not started streaming within `max_age`.
    pub async fn sweep_stale(&self, max_age: Duration) -> usize {
        let stale: Vec<String> = {
            let mut pending = self.lock_pending();
            let now = Instant::now();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.registered_at) >= max_age)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                pending.remove(id);
            }
            ids
        };

        for id in &stale {
            self.registry.remove(id).await;
            warn!(upload_id = %id, "Dropped upload that never started streaming");
        }
        stale.len()
    }

    pub fn spawn_sweeper(
        self: Arc<Self>,
        max_age: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = (max_age / 4).max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_stale(max_age).await;
                    }
                }
            }
        })
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
