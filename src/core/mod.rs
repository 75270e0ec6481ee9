pub mod ingest;
pub mod notifications;
pub mod progress_channel;
pub mod registry;
pub mod transcode;

pub use ingest::{ChunkSource, IngestError, IngestReceipt, IngestionSink, Submission, UploadTicket};
pub use notifications::CompletionNotifier;
pub use progress_channel::{ChannelOutcome, ProgressChannel, ProgressEvent, ProgressObserver};
pub use registry::{ProgressRegistry, RegistryError, SessionSnapshot};
pub use transcode::{Coordinator, CoordinatorError, JobState, TranscodeJob, TranscodeStatus};
