//! First-write-wins deduplicating merge.

use std::hash::Hash;

use indexmap::IndexMap;

use crate::entity::Entity;

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome<R> {
    pub records: Vec<R>,
    /// Incoming records that introduced a new key.
    pub appended: usize,
    /// Records (existing or incoming) dropped because their key was already present.
    pub discarded: usize,
}

/// Union of `existing` then `incoming`, keeping the first record seen for each key.
///
/// Existing order is preserved and new records are appended in arrival order.
/// A later record never overwrites fields of an earlier one with the same key.
pub fn merge_with_stats<R, K, F>(existing: Vec<R>, incoming: Vec<R>, key_fn: F) -> MergeOutcome<R>
where
    K: Hash + Eq,
    F: Fn(&R) -> K,
{
    let mut seen: IndexMap<K, R> = IndexMap::with_capacity(existing.len() + incoming.len());
    let mut discarded = 0usize;

    for record in existing {
        let key = key_fn(&record);
        if seen.contains_key(&key) {
            discarded += 1;
        } else {
            seen.insert(key, record);
        }
    }

    let before_incoming = seen.len();
    for record in incoming {
        let key = key_fn(&record);
        if seen.contains_key(&key) {
            discarded += 1;
        } else {
            seen.insert(key, record);
        }
    }
    let appended = seen.len() - before_incoming;

    MergeOutcome {
        records: seen.into_values().collect(),
        appended,
        discarded,
    }
}

pub fn merge<R, K, F>(existing: Vec<R>, incoming: Vec<R>, key_fn: F) -> Vec<R>
where
    K: Hash + Eq,
    F: Fn(&R) -> K,
{
    merge_with_stats(existing, incoming, key_fn).records
}

/// Merge under the entity's own identity key.
pub fn merge_entities<E: Entity>(existing: Vec<E>, incoming: Vec<E>) -> MergeOutcome<E> {
    merge_with_stats(existing, incoming, E::key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Course, CourseProgram, Credits};
    use std::collections::HashSet;

    fn course(code: &str, credits: &str) -> Course {
        Course {
            code: code.into(),
            name: format!("Course {code}"),
            credits: Credits::parse(credits),
        }
    }

    #[test]
    fn first_write_wins_on_key_collision() {
        let out = merge_entities(vec![course("001", "3")], vec![course("001", "4")]);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].credits, Credits::Count(3));
        assert_eq!(out.appended, 0);
        assert_eq!(out.discarded, 1);
    }

    #[test]
    fn preserves_existing_order_and_appends_in_arrival_order() {
        let existing = vec![course("300", "1"), course("100", "1")];
        let incoming = vec![course("200", "1"), course("100", "9"), course("050", "1")];
        let out = merge_entities(existing, incoming);
        let codes: Vec<_> = out.records.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["300", "100", "200", "050"]);
        assert_eq!(out.appended, 2);
    }

    #[test]
    fn duplicates_inside_existing_are_collapsed() {
        let out = merge_entities(vec![course("7", "2"), course("7", "5")], Vec::new());
        assert_eq!(out.records, vec![course("7", "2")]);
        assert_eq!(out.discarded, 1);
    }

    #[test]
    fn full_row_identity_keeps_rows_sharing_a_code() {
        let a = CourseProgram {
            code: "100".into(),
            name: "X".into(),
            program: "3501 ARQUITECTURA".into(),
            course_kind: "DISCIPLINAR".into(),
        };
        let mut b = a.clone();
        b.program = "3503 CONSTRUCCIÓN".into();
        let out = merge_entities(vec![a.clone()], vec![a.clone(), b.clone()]);
        assert_eq!(out.records, vec![a, b]);
    }

    #[test]
    fn codes_stay_unique_for_interleaved_batches() {
        let mut stored: Vec<Course> = Vec::new();
        let batches = [
            vec![course("1", "1"), course("2", "1"), course("1", "2")],
            vec![course("3", "1"), course("2", "3")],
            vec![course("1", "4"), course("4", "1"), course("4", "2")],
        ];
        for batch in batches {
            stored = merge_entities(stored, batch).records;
            let codes: HashSet<_> = stored.iter().map(|c| c.code.clone()).collect();
            assert_eq!(codes.len(), stored.len());
        }
        assert_eq!(stored.len(), 4);
        assert_eq!(stored[0].credits, Credits::Count(1));
    }

    #[test]
    fn generic_merge_accepts_custom_keys() {
        let out = merge(vec![1, 2, 3], vec![4, 5, 6], |n| n % 3);
        assert_eq!(out, vec![1, 2, 3]);
    }
}
