//! Aggregation service, cross-partition unification and run orchestration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use coursecat_adapters::{DirectSink, FixtureExtractor, Producer, ProducerSummary};
use coursecat_core::PlaceholderFilter;
use coursecat_storage::PartitionStore;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

pub mod accumulator;
pub mod config;
pub mod service;
pub mod unify;

pub use accumulator::{Accumulator, Admission, PendingBatch};
pub use config::{load_faculty_registry, FacultyConfig, FacultyRegistry, SyncConfig};
pub use service::{
    resolve_partition, AggregationService, Message, ServiceConfig, ServiceError, ServiceHandle,
    ServiceReport, ServiceState,
};
pub use unify::{
    dedup_tables, discover_partitions, unify, unify_all, DedupMode, UnifyManifest, UnifyOutcome,
};

pub const CRATE_NAME: &str = "coursecat-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// All producers route through one aggregation service.
    Service,
    /// Each producer merges into its own partition under the directory lock.
    Direct,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub producers: Vec<ProducerRun>,
    pub service: Option<ServiceReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProducerRun {
    pub faculty_id: String,
    pub partition: PathBuf,
    pub targets: usize,
    pub submitted: usize,
    pub extraction_failures: usize,
    pub submit_failures: usize,
    pub aborted: bool,
    /// Rows a direct-write producer still held when it stopped.
    pub unflushed_rows: usize,
}

impl ProducerRun {
    fn from_summary(faculty_id: &str, summary: ProducerSummary, unflushed_rows: usize) -> Self {
        Self {
            faculty_id: faculty_id.to_string(),
            partition: summary.partition,
            targets: summary.targets,
            submitted: summary.submitted,
            extraction_failures: summary.extraction_failures,
            submit_failures: summary.submit_failures,
            aborted: summary.aborted,
            unflushed_rows,
        }
    }
}

/// One producer task per enabled faculty, replaying its extracted envelopes.
pub async fn run_ingest(
    config: &SyncConfig,
    registry: &FacultyRegistry,
    mode: WriteMode,
) -> Result<IngestRunSummary> {
    let lock_timeout = Duration::from_secs(config.lock_timeout_secs);
    let (service_task, handle) = match mode {
        WriteMode::Service => {
            let (task, handle) = AggregationService::spawn(config.service_config());
            (Some(task), Some(handle))
        }
        WriteMode::Direct => (None, None),
    };

    let mut tasks = Vec::new();
    for faculty in registry.enabled() {
        let Some(fixtures) = &faculty.fixtures else {
            warn!(faculty = %faculty.faculty_id, "no fixtures configured; skipping faculty");
            continue;
        };
        let partition = config.data_dir.join(&faculty.partition);
        let store = PartitionStore::new(&partition).with_lock_timeout(lock_timeout);
        let extractor = FixtureExtractor::new(
            faculty.display_name.clone(),
            config.workspace_root.join(fixtures),
        );
        let service = handle.clone();
        let placeholders = PlaceholderFilter::new(&config.placeholders);
        let faculty_id = faculty.faculty_id.clone();
        info!(faculty = %faculty_id, partition = %partition.display(), "starting producer");
        tasks.push(tokio::spawn(async move {
            let producer = Producer::new(extractor, store.clone());
            match service {
                Some(service) => {
                    let summary = producer.run(&service).await;
                    ProducerRun::from_summary(&faculty_id, summary, 0)
                }
                None => {
                    let sink = DirectSink::new(store, placeholders);
                    let summary = producer.run(&sink).await;
                    let unflushed = sink.finish().await;
                    ProducerRun::from_summary(&faculty_id, summary, unflushed)
                }
            }
        }));
    }

    let mut producers = Vec::with_capacity(tasks.len());
    for task in tasks {
        producers.push(task.await.context("producer task panicked")?);
    }

    let service = match (service_task, handle) {
        (Some(task), Some(handle)) => {
            handle.shutdown().await?;
            Some(task.await.context("aggregation service task panicked")?)
        }
        _ => None,
    };

    Ok(IngestRunSummary { producers, service })
}

/// Feed a JSON-lines stream of [`Message`]s through one aggregation service.
///
/// Unparseable lines are skipped. The service is always shut down and drained
/// before returning, so a read error never loses messages already sent.
pub async fn replay_messages<R>(config: ServiceConfig, reader: R) -> Result<ServiceReport>
where
    R: AsyncBufRead + Unpin,
{
    let (task, handle) = AggregationService::spawn(config);

    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let read_result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(&line) {
            Ok(message) => {
                if handle.send(message).await.is_err() {
                    warn!(line = line_no, "service stopped; ignoring remaining input");
                    break Ok(());
                }
            }
            Err(err) => warn!(line = line_no, %err, "skipping unreadable message"),
        }
    };
    info!(lines = line_no, "replay input exhausted");

    // A stream that already ended with a shutdown message leaves nothing to stop.
    if handle.shutdown().await.is_err() {
        info!("service already stopped");
    }
    handle.stopped().await;
    let report = task.await.context("aggregation service task panicked")?;

    read_result.with_context(|| {
        format!(
            "reading replay input after line {line_no}; {} records were persisted",
            report.accepted
        )
    })?;
    Ok(report)
}

