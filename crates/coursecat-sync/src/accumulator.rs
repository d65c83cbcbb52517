use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use coursecat_core::{EntityBatch, PlaceholderFilter, RecordEnvelope};

/// What happened to one ingested envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted { rows: usize, invalid_schedules: usize },
    Placeholder { field: &'static str },
}

/// Unflushed rows of one partition and the number of envelopes they came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingBatch {
    pub rows: EntityBatch,
    pub records: usize,
}

impl PendingBatch {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Per-partition row buffers owned by one aggregation service.
#[derive(Debug, Default)]
pub struct Accumulator {
    partitions: BTreeMap<PathBuf, PendingBatch>,
}

impl Accumulator {
    /// Normalize, filter and fan out one envelope into the partition's buffers.
    pub fn admit(
        &mut self,
        partition: &Path,
        envelope: &RecordEnvelope,
        omit_existing: bool,
        placeholders: &PlaceholderFilter,
    ) -> Admission {
        let envelope = envelope.normalized();
        if let Some(field) = envelope.placeholder_field(placeholders) {
            return Admission::Placeholder { field };
        }

        let split = envelope.split(omit_existing);
        let invalid_schedules = split.invalid_schedules;
        let pending = self.partitions.entry(partition.to_path_buf()).or_default();
        let before = pending.rows.len();
        pending.rows.push_split(split);
        pending.records += 1;
        Admission::Accepted {
            rows: pending.rows.len() - before,
            invalid_schedules,
        }
    }

    /// Buffered rows for `partition`, across all entities.
    pub fn pending(&self, partition: &Path) -> usize {
        self.partitions.get(partition).map_or(0, |p| p.rows.len())
    }

    /// Accepted envelopes whose rows are still buffered for `partition`.
    pub fn pending_records(&self, partition: &Path) -> usize {
        self.partitions.get(partition).map_or(0, |p| p.records)
    }

    pub fn has_pending(&self) -> bool {
        self.partitions.values().any(|p| !p.is_empty())
    }

    /// Partitions holding unflushed rows, in path order.
    pub fn pending_partitions(&self) -> Vec<PathBuf> {
        self.partitions
            .iter()
            .filter(|(_, p)| !p.is_empty())
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn take(&mut self, partition: &Path) -> PendingBatch {
        self.partitions.remove(partition).unwrap_or_default()
    }

    /// Put back whatever a flush could not persist.
    pub fn restore(&mut self, partition: &Path, pending: PendingBatch) {
        if pending.is_empty() {
            return;
        }
        let slot = self.partitions.entry(partition.to_path_buf()).or_default();
        let newer = std::mem::replace(slot, pending);
        slot.records += newer.records;
        slot.rows.courses.extend(newer.rows.courses);
        slot.rows.course_programs.extend(newer.rows.course_programs);
        slot.rows.schedules.extend(newer.rows.schedules);
        slot.rows.prerequisites.extend(newer.rows.prerequisites);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursecat_core::{GroupEntry, MeetingSlot};

    fn envelope(code: &str) -> RecordEnvelope {
        RecordEnvelope {
            code: code.into(),
            name: "X".into(),
            credits: "3".into(),
            program: "3507 MATEMÁTICAS".into(),
            course_kind: "DISCIPLINAR".into(),
            groups: vec![GroupEntry {
                group_number: "2".into(),
                instructor: "Ana".into(),
                slots: vec![
                    MeetingSlot {
                        day: "MIÉRCOLES".into(),
                        start_time: "08:00".into(),
                        end_time: "10:00".into(),
                        room: "21-105".into(),
                    },
                    MeetingSlot::default(),
                ],
            }],
            prerequisites: Vec::new(),
        }
    }

    #[test]
    fn placeholder_records_never_reach_buffers() {
        let mut acc = Accumulator::default();
        let mut env = envelope("Selecciona qué quieres consultar");
        env.name = "Selecciona qué quieres consultar".into();
        let admission = acc.admit(Path::new("Data/A"), &env, false, &PlaceholderFilter::default());
        assert_eq!(admission, Admission::Placeholder { field: "code" });
        assert!(!acc.has_pending());
    }

    #[test]
    fn buffers_are_keyed_by_partition() {
        let mut acc = Accumulator::default();
        let filter = PlaceholderFilter::default();
        let admission = acc.admit(Path::new("Data/B"), &envelope("200"), false, &filter);
        assert_eq!(
            admission,
            Admission::Accepted {
                rows: 3,
                invalid_schedules: 1
            }
        );
        acc.admit(Path::new("Data/A"), &envelope("100"), true, &filter);

        assert_eq!(acc.pending(Path::new("Data/B")), 3);
        assert_eq!(acc.pending(Path::new("Data/A")), 1);
        assert_eq!(acc.pending_records(Path::new("Data/B")), 1);
        assert_eq!(acc.pending_records(Path::new("Data/A")), 1);
        assert_eq!(
            acc.pending_partitions(),
            vec![PathBuf::from("Data/A"), PathBuf::from("Data/B")]
        );
    }

    #[test]
    fn restore_keeps_older_rows_first() {
        let mut acc = Accumulator::default();
        let filter = PlaceholderFilter::default();
        let partition = Path::new("Data/A");
        acc.admit(partition, &envelope("100"), false, &filter);
        let failed = acc.take(partition);
        acc.admit(partition, &envelope("200"), false, &filter);
        acc.restore(partition, failed);

        assert_eq!(acc.pending_records(partition), 2);
        let pending = acc.take(partition);
        let codes: Vec<_> = pending.rows.courses.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["100", "200"]);
        assert_eq!(pending.records, 2);
        assert_eq!(acc.pending_records(partition), 0);
    }

    #[test]
    fn record_count_ignores_fan_out_and_placeholders() {
        let mut acc = Accumulator::default();
        let filter = PlaceholderFilter::default();
        let partition = Path::new("Data/A");
        let mut env = envelope("100");
        env.prerequisites = vec![coursecat_core::PrerequisiteEntry {
            code: "050".into(),
            name: "Base".into(),
        }];
        acc.admit(partition, &env, false, &filter);
        env.name = "Selecciona qué quieres consultar".into();
        acc.admit(partition, &env, false, &filter);

        assert_eq!(acc.pending(partition), 4);
        assert_eq!(acc.pending_records(partition), 1);
    }
}
