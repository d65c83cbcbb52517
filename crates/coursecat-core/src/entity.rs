//! The four persisted entity shapes and their identity keys.

use std::fmt;

use crate::normalize_text;

/// Identity tuple used for deduplication. Single-column keys are a one-element tuple.
pub type RowKey = Vec<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Course,
    CourseProgram,
    Schedule,
    Prerequisite,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Course,
        EntityKind::CourseProgram,
        EntityKind::Schedule,
        EntityKind::Prerequisite,
    ];

    /// Dataset name, shared by partition files and unified outputs.
    pub fn stem(self) -> &'static str {
        match self {
            EntityKind::Course => "Courses",
            EntityKind::CourseProgram => "CourseProgram",
            EntityKind::Schedule => "Schedules",
            EntityKind::Prerequisite => "Prerequisites",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.csv", self.stem())
    }

    pub fn unified_file_name(self) -> String {
        format!("unified_{}.csv", self.stem())
    }

    pub fn header(self) -> &'static [&'static str] {
        match self {
            EntityKind::Course => Course::HEADER,
            EntityKind::CourseProgram => CourseProgram::HEADER,
            EntityKind::Schedule => Schedule::HEADER,
            EntityKind::Prerequisite => Prerequisite::HEADER,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stem())
    }
}

/// A persisted row shape: fixed header, identity key, and lossless row conversion.
pub trait Entity: Clone + PartialEq + Send + Sync + 'static {
    const KIND: EntityKind;
    const HEADER: &'static [&'static str];

    fn key(&self) -> RowKey;

    fn to_row(&self) -> Vec<String>;

    /// Build from cells in `HEADER` order. Missing trailing cells read as empty.
    fn from_row(row: &[String]) -> Self;
}

fn cell(row: &[String], index: usize) -> String {
    row.get(index).map(|v| normalize_text(v)).unwrap_or_default()
}

/// Credit count: a small integer when the catalog shows one, the raw text otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Credits {
    Count(u8),
    Text(String),
}

impl Credits {
    /// Only canonical decimal forms become `Count`, so `"03"` survives a rewrite as written.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<u8>() {
            Ok(n) if n.to_string() == trimmed => Credits::Count(n),
            _ => Credits::Text(trimmed.to_string()),
        }
    }

    pub fn count(&self) -> Option<u8> {
        match self {
            Credits::Count(n) => Some(*n),
            Credits::Text(_) => None,
        }
    }
}

impl Default for Credits {
    fn default() -> Self {
        Credits::Text(String::new())
    }
}

impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credits::Count(n) => write!(f, "{n}"),
            Credits::Text(t) => f.write_str(t),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Course {
    pub code: String,
    pub name: String,
    pub credits: Credits,
}

impl Entity for Course {
    const KIND: EntityKind = EntityKind::Course;
    const HEADER: &'static [&'static str] = &["code", "name", "credit_count"];

    fn key(&self) -> RowKey {
        vec![self.code.clone()]
    }

    fn to_row(&self) -> Vec<String> {
        vec![self.code.clone(), self.name.clone(), self.credits.to_string()]
    }

    fn from_row(row: &[String]) -> Self {
        Self {
            code: cell(row, 0),
            name: cell(row, 1),
            credits: Credits::parse(&cell(row, 2)),
        }
    }
}

/// Association of a course with one program; identity is the whole row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CourseProgram {
    pub code: String,
    pub name: String,
    pub program: String,
    pub course_kind: String,
}

impl Entity for CourseProgram {
    const KIND: EntityKind = EntityKind::CourseProgram;
    const HEADER: &'static [&'static str] = &["code", "name", "program", "course_kind"];

    fn key(&self) -> RowKey {
        self.to_row()
    }

    fn to_row(&self) -> Vec<String> {
        vec![
            self.code.clone(),
            self.name.clone(),
            self.program.clone(),
            self.course_kind.clone(),
        ]
    }

    fn from_row(row: &[String]) -> Self {
        Self {
            code: cell(row, 0),
            name: cell(row, 1),
            program: cell(row, 2),
            course_kind: cell(row, 3),
        }
    }
}

/// One meeting slot of one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Schedule {
    pub code: String,
    pub name: String,
    pub group: String,
    pub instructor: String,
    pub day: String,
    pub start_time: String,
    pub end_time: String,
    pub room: String,
}

impl Schedule {
    /// A slot without a meeting day was not extracted and must not be persisted.
    pub fn is_valid(&self) -> bool {
        !self.day.is_empty()
    }
}

impl Entity for Schedule {
    const KIND: EntityKind = EntityKind::Schedule;
    const HEADER: &'static [&'static str] = &[
        "code",
        "name",
        "group",
        "instructor",
        "day",
        "start_time",
        "end_time",
        "room",
    ];

    fn key(&self) -> RowKey {
        vec![
            self.code.clone(),
            self.group.clone(),
            self.day.clone(),
            self.start_time.clone(),
            self.end_time.clone(),
        ]
    }

    fn to_row(&self) -> Vec<String> {
        vec![
            self.code.clone(),
            self.name.clone(),
            self.group.clone(),
            self.instructor.clone(),
            self.day.clone(),
            self.start_time.clone(),
            self.end_time.clone(),
            self.room.clone(),
        ]
    }

    fn from_row(row: &[String]) -> Self {
        Self {
            code: cell(row, 0),
            name: cell(row, 1),
            group: cell(row, 2),
            instructor: cell(row, 3),
            day: cell(row, 4),
            start_time: cell(row, 5),
            end_time: cell(row, 6),
            room: cell(row, 7),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Prerequisite {
    pub course_code: String,
    pub course_name: String,
    pub program: String,
    pub descriptor: String,
}

impl Entity for Prerequisite {
    const KIND: EntityKind = EntityKind::Prerequisite;
    const HEADER: &'static [&'static str] = &[
        "course_code",
        "course_name",
        "program",
        "prerequisite_descriptor",
    ];

    fn key(&self) -> RowKey {
        vec![
            self.course_code.clone(),
            self.program.clone(),
            self.descriptor.clone(),
        ]
    }

    fn to_row(&self) -> Vec<String> {
        vec![
            self.course_code.clone(),
            self.course_name.clone(),
            self.program.clone(),
            self.descriptor.clone(),
        ]
    }

    fn from_row(row: &[String]) -> Self {
        Self {
            course_code: cell(row, 0),
            course_name: cell(row, 1),
            program: cell(row, 2),
            descriptor: cell(row, 3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn credits_keep_non_canonical_text() {
        assert_eq!(Credits::parse(" 3 "), Credits::Count(3));
        assert_eq!(Credits::parse("03"), Credits::Text("03".into()));
        assert_eq!(Credits::parse("N/A"), Credits::Text("N/A".into()));
        assert_eq!(Credits::parse("300"), Credits::Text("300".into()));
        assert_eq!(Credits::parse(""), Credits::default());
        assert_eq!(Credits::parse("4").count(), Some(4));
    }

    #[test]
    fn from_row_trims_and_pads_missing_cells() {
        let course = Course::from_row(&strings(&["  001 ", "Algebra"]));
        assert_eq!(course.code, "001");
        assert_eq!(course.name, "Algebra");
        assert_eq!(course.credits, Credits::default());
        assert_eq!(course.to_row(), strings(&["001", "Algebra", ""]));
    }

    #[test]
    fn schedule_key_ignores_instructor_and_room() {
        let a = Schedule::from_row(&strings(&[
            "100", "X", "1", "Ana", "LUNES", "08:00", "10:00", "A-1",
        ]));
        let mut b = a.clone();
        b.instructor = "Luis".into();
        b.room = "B-2".into();
        assert_eq!(a.key(), b.key());
        b.day = "MARTES".into();
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn headers_match_entity_kinds() {
        for kind in EntityKind::ALL {
            assert!(!kind.header().is_empty());
        }
        assert_eq!(EntityKind::Schedule.file_name(), "Schedules.csv");
        assert_eq!(
            EntityKind::Prerequisite.unified_file_name(),
            "unified_Prerequisites.csv"
        );
        assert_eq!(Prerequisite::HEADER.len(), Prerequisite::default().to_row().len());
    }
}
