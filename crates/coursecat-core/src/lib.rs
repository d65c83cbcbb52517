//! Record model, normalization and deduplicating merge for course catalog datasets.

pub mod entity;
pub mod envelope;
pub mod merge;

pub use entity::{
    Course, CourseProgram, Credits, Entity, EntityKind, Prerequisite, RowKey, Schedule,
};
pub use envelope::{
    EntityBatch, EntitySplit, GroupEntry, MeetingSlot, PlaceholderFilter, PrerequisiteEntry,
    RecordEnvelope,
};
pub use merge::{merge, merge_entities, merge_with_stats, MergeOutcome};

pub const CRATE_NAME: &str = "coursecat-core";

/// UI strings the catalog renders in place of data ("please select" prompts).
pub const DEFAULT_PLACEHOLDERS: &[&str] = &["Selecciona qué quieres consultar"];

/// Trim surrounding whitespace; the only normalization applied to textual fields.
pub fn normalize_text(value: &str) -> String {
    value.trim().to_string()
}
