//! Lock-guarded read-merge-write of the four entity files of one partition.

use std::path::{Path, PathBuf};
use std::time::Duration;

use coursecat_core::{
    merge_entities, Course, CourseProgram, Entity, EntityBatch, EntityKind, Prerequisite, Schedule,
};
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::lock::DirLock;
use crate::table::{encode_rows, parse_table};
use crate::{write_atomic, StoreError};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Durable store for one partition directory.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityFlush {
    pub kind: EntityKind,
    pub incoming: usize,
    pub appended: usize,
    pub total: usize,
    /// False when the merge changed nothing and the file was left untouched.
    pub written: bool,
}

/// Outcome of flushing a whole batch under one lock. Failed kinds keep their buffers.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub flushed: Vec<EntityFlush>,
    pub failed: Vec<(EntityKind, StoreError)>,
}

impl FlushReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn appended(&self) -> usize {
        self.flushed.iter().map(|f| f.appended).sum()
    }
}

impl PartitionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn path_for(&self, kind: EntityKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// Current on-disk rows. A missing file is an empty dataset.
    pub async fn load<E: Entity>(&self) -> Result<Vec<E>, StoreError> {
        let path = self.path_for(E::KIND);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(&path, err)),
        };

        let table = parse_table(&path, &bytes)?;
        if table.header.is_empty() && table.rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut indices = Vec::with_capacity(E::HEADER.len());
        for column in E::HEADER {
            let idx = table.column(column).ok_or_else(|| {
                StoreError::malformed(&path, format!("missing column `{column}`"))
            })?;
            indices.push(idx);
        }
        if table.header.len() > indices.len() {
            warn!(
                path = %path.display(),
                extra = table.header.len() - indices.len(),
                "dropping unknown columns on next rewrite"
            );
        }

        Ok(table
            .rows
            .iter()
            .map(|row| {
                let ordered: Vec<String> = indices
                    .iter()
                    .map(|i| row.get(*i).cloned().unwrap_or_default())
                    .collect();
                E::from_row(&ordered)
            })
            .collect())
    }

    pub async fn contains_course(&self, code: &str) -> Result<bool, StoreError> {
        let code = code.trim();
        Ok(self.load::<Course>().await?.iter().any(|c| c.code == code))
    }

    /// Merge `incoming` into one entity file under the directory lock.
    pub async fn flush<E: Entity>(&self, incoming: &[E]) -> Result<EntityFlush, StoreError> {
        let _lock = DirLock::acquire(&self.dir, self.lock_timeout).await?;
        self.flush_locked(incoming).await
    }

    /// Flush every buffer of `batch` under a single lock acquisition.
    ///
    /// Buffers that reach disk are cleared; failing ones are kept for the next
    /// attempt. Empty buffers are skipped unless `include_empty` is set, in which
    /// case the file is still re-validated and rewritten only if it changes.
    pub async fn flush_batch(
        &self,
        batch: &mut EntityBatch,
        include_empty: bool,
    ) -> Result<FlushReport, StoreError> {
        let span = info_span!("flush", partition = %self.dir.display());
        async move {
            let _lock = DirLock::acquire(&self.dir, self.lock_timeout).await?;
            let mut report = FlushReport::default();
            self.flush_buffer(&mut batch.courses, include_empty, &mut report).await;
            self.flush_buffer(&mut batch.course_programs, include_empty, &mut report).await;
            self.flush_buffer(&mut batch.schedules, include_empty, &mut report).await;
            self.flush_buffer(&mut batch.prerequisites, include_empty, &mut report).await;
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn flush_buffer<E: Entity>(
        &self,
        buffer: &mut Vec<E>,
        include_empty: bool,
        report: &mut FlushReport,
    ) {
        if buffer.is_empty() && !include_empty {
            return;
        }
        match self.flush_locked(buffer).await {
            Ok(flushed) => {
                buffer.clear();
                report.flushed.push(flushed);
            }
            Err(err) => {
                warn!(entity = %E::KIND, %err, retained = buffer.len(), "entity flush failed");
                report.failed.push((E::KIND, err));
            }
        }
    }

    async fn flush_locked<E: Entity>(&self, incoming: &[E]) -> Result<EntityFlush, StoreError> {
        let path = self.path_for(E::KIND);
        let existing = self.load::<E>().await?;
        let outcome = merge_entities(existing.clone(), incoming.to_vec());
        let total = outcome.records.len();

        let unchanged = outcome.records == existing && fs::try_exists(&path).await.unwrap_or(false);
        if unchanged || (outcome.records.is_empty() && existing.is_empty()) {
            debug!(entity = %E::KIND, total, "merge produced no change; skipping write");
            return Ok(EntityFlush {
                kind: E::KIND,
                incoming: incoming.len(),
                appended: 0,
                total,
                written: false,
            });
        }

        let bytes = encode_rows(E::HEADER, outcome.records.iter().map(|r| r.to_row()))
            .map_err(|source| StoreError::Encode {
                entity: E::KIND,
                source,
            })?;
        write_atomic(&path, &bytes).await?;

        info!(
            entity = %E::KIND,
            incoming = incoming.len(),
            appended = outcome.appended,
            total,
            "dataset updated"
        );
        Ok(EntityFlush {
            kind: E::KIND,
            incoming: incoming.len(),
            appended: outcome.appended,
            total,
            written: true,
        })
    }

    pub async fn load_courses(&self) -> Result<Vec<Course>, StoreError> {
        self.load().await
    }

    pub async fn load_course_programs(&self) -> Result<Vec<CourseProgram>, StoreError> {
        self.load().await
    }

    pub async fn load_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        self.load().await
    }

    pub async fn load_prerequisites(&self) -> Result<Vec<Prerequisite>, StoreError> {
        self.load().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursecat_core::{Credits, RecordEnvelope};
    use tempfile::tempdir;

    fn course(code: &str, name: &str, credits: &str) -> Course {
        Course {
            code: code.into(),
            name: name.into(),
            credits: Credits::parse(credits),
        }
    }

    #[tokio::test]
    async fn flush_writes_header_and_rows() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path().join("Facultad_Minas"));

        let flushed = store
            .flush(&[course("100", "X", "3"), course("200", "Y", "2")])
            .await
            .expect("flush");
        assert!(flushed.written);
        assert_eq!(flushed.appended, 2);

        let text = std::fs::read_to_string(store.path_for(EntityKind::Course)).expect("read");
        assert_eq!(text, "code,name,credit_count\n100,X,3\n200,Y,2\n");
        assert!(!store.dir().join(crate::LOCK_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn first_write_wins_across_flushes() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        store.flush(&[course("001", "A", "3")]).await.expect("first");
        let second = store.flush(&[course("001", "A", "4")]).await.expect("second");
        assert_eq!(second.appended, 0);
        assert!(!second.written);

        let courses = store.load_courses().await.expect("load");
        assert_eq!(courses, vec![course("001", "A", "3")]);
    }

    #[tokio::test]
    async fn empty_flush_leaves_file_byte_identical() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let path = store.path_for(EntityKind::CourseProgram);
        let original = "code,name,program,course_kind\n\"100\",\"Cálculo, I\",3501 ARQUITECTURA,DISCIPLINAR\n";
        std::fs::write(&path, original).expect("seed");

        let flushed = store.flush::<CourseProgram>(&[]).await.expect("flush");
        assert!(!flushed.written);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), original);
    }

    #[tokio::test]
    async fn malformed_file_aborts_and_retains_buffer() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let path = store.path_for(EntityKind::Course);
        std::fs::write(&path, "code,name,credit_count\n100,X\n").expect("seed");

        let mut batch = EntityBatch::default();
        batch.push_split(
            RecordEnvelope {
                code: "200".into(),
                name: "Y".into(),
                credits: "2".into(),
                program: "3501 ARQUITECTURA".into(),
                ..Default::default()
            }
            .split(false),
        );

        let report = store.flush_batch(&mut batch, false).await.expect("lock ok");
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, EntityKind::Course);
        assert!(matches!(report.failed[0].1, StoreError::Malformed { .. }));
        assert_eq!(batch.courses.len(), 1, "course buffer retained");
        assert!(batch.course_programs.is_empty(), "healthy entity flushed");
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "code,name,credit_count\n100,X\n"
        );
        assert!(!dir.path().join(crate::LOCK_FILE_NAME).exists(), "lock released");
    }

    #[tokio::test]
    async fn io_failure_releases_the_lock() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        // A directory where the course file belongs makes every access to it fail.
        std::fs::create_dir(store.path_for(EntityKind::Course)).expect("blocker dir");

        let mut batch = EntityBatch::default();
        batch.courses.push(course("100", "X", "3"));
        let report = store.flush_batch(&mut batch, false).await.expect("lock ok");
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, StoreError::Io { .. }));
        assert_eq!(batch.courses.len(), 1);

        assert!(!dir.path().join(crate::LOCK_FILE_NAME).exists());
        let relock = crate::DirLock::acquire(dir.path(), Duration::from_millis(200)).await;
        assert!(relock.is_ok(), "a later writer gets the lock at once");
    }

    #[tokio::test]
    async fn missing_column_is_malformed() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        std::fs::write(store.path_for(EntityKind::Course), "code,name\n100,X\n").expect("seed");
        let err = store.load_courses().await.expect_err("missing column");
        assert!(err.to_string().contains("credit_count"));
    }

    #[tokio::test]
    async fn lock_timeout_keeps_whole_batch() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path()).with_lock_timeout(Duration::from_millis(200));
        let _held = DirLock::acquire(dir.path(), Duration::from_secs(1))
            .await
            .expect("held");

        let mut batch = EntityBatch::default();
        batch.courses.push(course("100", "X", "3"));
        let err = store.flush_batch(&mut batch, false).await.expect_err("timeout");
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn contains_course_reads_persisted_codes() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        assert!(!store.contains_course("100").await.expect("empty"));
        store.flush(&[course("100", "X", "3")]).await.expect("flush");
        assert!(store.contains_course(" 100 ").await.expect("lookup"));
        assert!(!store.contains_course("200").await.expect("lookup"));
    }
}
