//! The single-writer aggregation service.
//!
//! Producers hold cloneable [`ServiceHandle`]s that all feed one bounded channel.
//! Exactly one consumer owns the buffers and the partition stores, so flushes of a
//! partition never overlap from within the service.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coursecat_adapters::RecordSink;
use coursecat_core::{PlaceholderFilter, RecordEnvelope};
use coursecat_storage::PartitionStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::accumulator::{Accumulator, Admission};

/// Inbound message. The JSON form is `{"kind": "record" | "flush" | "shutdown", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    #[serde(rename = "record")]
    Ingest {
        record: RecordEnvelope,
        #[serde(default)]
        partition: PathBuf,
        #[serde(default)]
        omit_existing: bool,
    },
    Flush {
        #[serde(default)]
        partition: PathBuf,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServiceState::Running => "running",
            ServiceState::Draining => "draining",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("aggregation service is no longer accepting messages")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Partition used when a message names none (empty path or `.`).
    pub data_dir: PathBuf,
    pub idle_flush: Duration,
    pub lock_timeout: Duration,
    pub flush_batch: usize,
    pub channel_capacity: usize,
    pub placeholders: PlaceholderFilter,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        crate::config::SyncConfig::default().service_config()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub accepted: usize,
    pub dropped_placeholders: usize,
    pub invalid_schedules: usize,
    pub flushes: usize,
    pub failed_flushes: usize,
    pub discarded_after_shutdown: usize,
    /// Partitions whose rows could not be persisted before the service stopped.
    pub unflushed_partitions: Vec<PathBuf>,
}

/// Producer-side handle. Messages from one handle are processed in send order.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<Message>,
    state: watch::Receiver<ServiceState>,
}

impl ServiceHandle {
    pub async fn send(&self, message: Message) -> Result<(), ServiceError> {
        self.tx.send(message).await.map_err(|_| ServiceError::Closed)
    }

    pub async fn ingest(
        &self,
        record: RecordEnvelope,
        partition: impl Into<PathBuf>,
        omit_existing: bool,
    ) -> Result<(), ServiceError> {
        self.send(Message::Ingest {
            record,
            partition: partition.into(),
            omit_existing,
        })
        .await
    }

    pub async fn flush(&self, partition: impl Into<PathBuf>) -> Result<(), ServiceError> {
        self.send(Message::Flush {
            partition: partition.into(),
        })
        .await
    }

    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.send(Message::Shutdown).await
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Resolves once the service reaches `Stopped`.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ServiceState::Stopped).await;
    }
}

#[async_trait]
impl RecordSink for ServiceHandle {
    async fn submit(
        &self,
        envelope: RecordEnvelope,
        partition: &Path,
        omit_existing: bool,
    ) -> Result<()> {
        self.ingest(envelope, partition, omit_existing).await?;
        Ok(())
    }
}

pub struct AggregationService {
    config: ServiceConfig,
    rx: mpsc::Receiver<Message>,
    state: watch::Sender<ServiceState>,
    accumulator: Accumulator,
    stores: BTreeMap<PathBuf, PartitionStore>,
    last_flush: Instant,
    report: ServiceReport,
}

impl AggregationService {
    pub fn new(config: ServiceConfig) -> (Self, ServiceHandle) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ServiceState::Running);
        let service = Self {
            config,
            rx,
            state: state_tx,
            accumulator: Accumulator::default(),
            stores: BTreeMap::new(),
            last_flush: Instant::now(),
            report: ServiceReport {
                run_id: Uuid::new_v4(),
                started_at: Utc::now(),
                finished_at: None,
                accepted: 0,
                dropped_placeholders: 0,
                invalid_schedules: 0,
                flushes: 0,
                failed_flushes: 0,
                discarded_after_shutdown: 0,
                unflushed_partitions: Vec::new(),
            },
        };
        let handle = ServiceHandle { tx, state: state_rx };
        (service, handle)
    }

    pub fn spawn(config: ServiceConfig) -> (JoinHandle<ServiceReport>, ServiceHandle) {
        let (service, handle) = Self::new(config);
        (tokio::spawn(service.run()), handle)
    }

    /// Consume messages until `Shutdown` (or every handle is dropped), then drain.
    pub async fn run(mut self) -> ServiceReport {
        let span = info_span!("aggregation_service", run_id = %self.report.run_id);
        async move {
            info!(
                data_dir = %self.config.data_dir.display(),
                flush_batch = self.config.flush_batch,
                "aggregation service started"
            );
            loop {
                match tokio::time::timeout(self.config.idle_flush, self.rx.recv()).await {
                    Ok(Some(Message::Ingest {
                        record,
                        partition,
                        omit_existing,
                    })) => self.handle_ingest(&record, &partition, omit_existing).await,
                    Ok(Some(Message::Flush { partition })) => {
                        let partition = self.resolve(&partition);
                        debug!(partition = %partition.display(), "flush requested");
                        self.flush_partition(&partition, true).await;
                    }
                    Ok(Some(Message::Shutdown)) => {
                        info!("shutdown requested");
                        break;
                    }
                    Ok(None) => {
                        info!("all producer handles dropped");
                        break;
                    }
                    Err(_) => {
                        if self.accumulator.has_pending() {
                            debug!("idle interval elapsed with pending rows");
                        }
                        self.flush_pending().await;
                        continue;
                    }
                }

                if self.last_flush.elapsed() >= self.config.idle_flush {
                    self.flush_pending().await;
                }
            }

            self.drain().await;
            self.report
        }
        .instrument(span)
        .await
    }

    async fn drain(&mut self) {
        self.state.send_replace(ServiceState::Draining);
        self.rx.close();
        while self.rx.try_recv().is_ok() {
            self.report.discarded_after_shutdown += 1;
        }
        if self.report.discarded_after_shutdown > 0 {
            warn!(
                discarded = self.report.discarded_after_shutdown,
                "messages received after shutdown were not processed"
            );
        }

        self.flush_pending().await;

        self.report.unflushed_partitions = self.accumulator.pending_partitions();
        for partition in &self.report.unflushed_partitions {
            error!(
                partition = %partition.display(),
                rows = self.accumulator.pending(partition),
                "rows could not be persisted before stopping"
            );
        }
        self.report.finished_at = Some(Utc::now());
        self.state.send_replace(ServiceState::Stopped);
        info!(
            accepted = self.report.accepted,
            dropped = self.report.dropped_placeholders,
            flushes = self.report.flushes,
            failed_flushes = self.report.failed_flushes,
            "aggregation service stopped"
        );
    }

    async fn handle_ingest(&mut self, record: &RecordEnvelope, hint: &Path, omit_existing: bool) {
        let partition = self.resolve(hint);
        match self
            .accumulator
            .admit(&partition, record, omit_existing, &self.config.placeholders)
        {
            Admission::Placeholder { field } => {
                self.report.dropped_placeholders += 1;
                info!(code = %record.code.trim(), field, "dropping placeholder record");
            }
            Admission::Accepted {
                rows,
                invalid_schedules,
            } => {
                self.report.accepted += 1;
                self.report.invalid_schedules += invalid_schedules;
                if invalid_schedules > 0 {
                    debug!(
                        code = %record.code.trim(),
                        invalid_schedules,
                        "dropped schedule slots without a day"
                    );
                }
                debug!(
                    partition = %partition.display(),
                    code = %record.code.trim(),
                    rows,
                    omit_existing,
                    "record accepted"
                );
                if self.accumulator.pending_records(&partition) >= self.config.flush_batch {
                    self.flush_partition(&partition, false).await;
                }
            }
        }
    }

    async fn flush_pending(&mut self) {
        for partition in self.accumulator.pending_partitions() {
            self.flush_partition(&partition, false).await;
        }
        self.last_flush = Instant::now();
    }

    /// Failures are logged and the rows kept for the next trigger; never fatal.
    async fn flush_partition(&mut self, partition: &Path, include_empty: bool) {
        let store = self.store_for(partition);
        let mut pending = self.accumulator.take(partition);
        if pending.is_empty() && !include_empty {
            return;
        }

        match store.flush_batch(&mut pending.rows, include_empty).await {
            Ok(outcome) => {
                self.report.flushes += 1;
                if !outcome.is_complete() {
                    self.report.failed_flushes += 1;
                }
                debug!(
                    partition = %partition.display(),
                    appended = outcome.appended(),
                    "partition flushed"
                );
            }
            Err(err) if err.is_transient() => {
                self.report.failed_flushes += 1;
                warn!(
                    partition = %partition.display(),
                    %err,
                    retained = pending.rows.len(),
                    "flush aborted; will retry"
                );
            }
            Err(err) => {
                self.report.failed_flushes += 1;
                error!(
                    partition = %partition.display(),
                    %err,
                    retained = pending.rows.len(),
                    "flush aborted; partition file needs attention"
                );
            }
        }
        self.accumulator.restore(partition, pending);
    }

    fn store_for(&mut self, partition: &Path) -> PartitionStore {
        let lock_timeout = self.config.lock_timeout;
        self.stores
            .entry(partition.to_path_buf())
            .or_insert_with(|| PartitionStore::new(partition).with_lock_timeout(lock_timeout))
            .clone()
    }

    fn resolve(&self, hint: &Path) -> PathBuf {
        resolve_partition(hint, &self.config.data_dir)
    }
}

/// An empty hint or `.` falls back to the default data directory.
pub fn resolve_partition(hint: &Path, default: &Path) -> PathBuf {
    if hint.as_os_str().is_empty() || hint == Path::new(".") {
        default.to_path_buf()
    } else {
        hint.to_path_buf()
    }
}
