//! Extraction boundary and producer loop.
//!
//! Page extraction itself lives outside this workspace; producers only see the
//! [`PageExtractor`] capability and hand envelopes to a [`RecordSink`].

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use coursecat_core::{EntityBatch, PlaceholderFilter, RecordEnvelope};
use coursecat_storage::PartitionStore;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

mod fixture;

pub use fixture::FixtureExtractor;

pub const CRATE_NAME: &str = "coursecat-adapters";

const FINISH_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// One page the extractor knows how to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTarget {
    pub id: String,
    pub location: String,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("page not found: {0}")]
    NotFound(String),
    #[error("could not read page {target}: {reason}")]
    Malformed { target: String, reason: String },
    /// The extractor cannot continue at all (lost its browser session, etc.).
    #[error("extractor failed: {0}")]
    Fatal(String),
}

impl ExtractionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExtractionError::Fatal(_))
    }
}

#[async_trait]
pub trait PageExtractor: Send + Sync {
    fn name(&self) -> &str;

    async fn targets(&self) -> Result<Vec<PageTarget>, ExtractionError>;

    /// Missing fields come back empty; only unusable pages are errors.
    async fn extract(&self, target: &PageTarget) -> Result<RecordEnvelope, ExtractionError>;
}

/// Where a producer delivers extracted envelopes.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn submit(
        &self,
        envelope: RecordEnvelope,
        partition: &Path,
        omit_existing: bool,
    ) -> Result<()>;
}

/// Legacy path: the producer merges into its own partition files, guarded only by
/// the directory lock.
#[derive(Debug)]
pub struct DirectSink {
    store: PartitionStore,
    placeholders: PlaceholderFilter,
    pending: Mutex<EntityBatch>,
}

impl DirectSink {
    pub fn new(store: PartitionStore, placeholders: PlaceholderFilter) -> Self {
        Self {
            store,
            placeholders,
            pending: Mutex::new(EntityBatch::default()),
        }
    }

    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Retry rows left behind by earlier failed flushes until they persist or the
    /// store's lock timeout has passed. Returns the rows still unwritten.
    pub async fn finish(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let deadline = Instant::now() + self.store.lock_timeout();

        while !pending.is_empty() {
            let retry = match self.store.flush_batch(&mut pending, false).await {
                Ok(report) => report.failed.iter().all(|(_, err)| err.is_transient()),
                Err(err) => {
                    warn!(partition = %self.store.dir().display(), %err, "final flush failed");
                    err.is_transient()
                }
            };
            if pending.is_empty() || !retry || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(FINISH_RETRY_INTERVAL).await;
        }

        let left = pending.len();
        if left > 0 {
            error!(
                partition = %self.store.dir().display(),
                rows = left,
                "rows could not be persisted before the producer stopped"
            );
        }
        left
    }
}

#[async_trait]
impl RecordSink for DirectSink {
    async fn submit(
        &self,
        envelope: RecordEnvelope,
        _partition: &Path,
        omit_existing: bool,
    ) -> Result<()> {
        let envelope = envelope.normalized();
        if let Some(field) = envelope.placeholder_field(&self.placeholders) {
            info!(code = %envelope.code, field, "skipping placeholder record");
            return Ok(());
        }

        let mut pending = self.pending.lock().await;
        pending.push_split(envelope.split(omit_existing));
        let report = self.store.flush_batch(&mut pending, false).await?;
        for (kind, err) in &report.failed {
            warn!(
                partition = %self.store.dir().display(),
                entity = %kind,
                %err,
                "direct write incomplete"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerSummary {
    pub partition: PathBuf,
    pub targets: usize,
    pub submitted: usize,
    pub extraction_failures: usize,
    pub submit_failures: usize,
    pub aborted: bool,
}

/// Drives one extractor over its targets for one partition.
pub struct Producer<X> {
    extractor: X,
    store: PartitionStore,
}

impl<X: PageExtractor> Producer<X> {
    pub fn new(extractor: X, store: PartitionStore) -> Self {
        Self { extractor, store }
    }

    pub async fn run(&self, sink: &dyn RecordSink) -> ProducerSummary {
        let mut summary = ProducerSummary {
            partition: self.store.dir().to_path_buf(),
            ..ProducerSummary::default()
        };

        let targets = match self.extractor.targets().await {
            Ok(targets) => targets,
            Err(err) => {
                error!(producer = self.extractor.name(), %err, "could not list targets");
                summary.aborted = true;
                return summary;
            }
        };
        summary.targets = targets.len();

        for target in &targets {
            let envelope = match self.extractor.extract(target).await {
                Ok(envelope) => envelope,
                Err(err) if err.is_fatal() => {
                    error!(
                        producer = self.extractor.name(),
                        target = %target.id,
                        %err,
                        "extractor aborted"
                    );
                    summary.extraction_failures += 1;
                    summary.aborted = true;
                    break;
                }
                Err(err) => {
                    warn!(
                        producer = self.extractor.name(),
                        target = %target.id,
                        %err,
                        "skipping target"
                    );
                    summary.extraction_failures += 1;
                    continue;
                }
            };

            let omit_existing = match self.store.contains_course(&envelope.code).await {
                Ok(known) => known,
                Err(err) => {
                    warn!(
                        partition = %self.store.dir().display(),
                        %err,
                        "could not check known courses"
                    );
                    false
                }
            };

            let code = envelope.code.clone();
            match sink.submit(envelope, self.store.dir(), omit_existing).await {
                Ok(()) => {
                    debug!(
                        producer = self.extractor.name(),
                        %code,
                        omit_existing,
                        "record submitted"
                    );
                    summary.submitted += 1;
                }
                Err(err) => {
                    warn!(
                        producer = self.extractor.name(),
                        %code,
                        error = %err,
                        "record not delivered"
                    );
                    summary.submit_failures += 1;
                }
            }
        }

        info!(
            producer = self.extractor.name(),
            partition = %summary.partition.display(),
            targets = summary.targets,
            submitted = summary.submitted,
            failures = summary.extraction_failures,
            "producer finished"
        );
        summary
    }
}
