//! Raw extraction output for one course and its fan-out into entity rows.

use serde::{Deserialize, Serialize};

use crate::entity::{Course, CourseProgram, Credits, EntityKind, Prerequisite, Schedule};
use crate::{normalize_text, DEFAULT_PLACEHOLDERS};

/// Everything extracted from one course page. Absent fields are empty, never errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordEnvelope {
    pub code: String,
    pub name: String,
    pub credits: String,
    pub program: String,
    pub course_kind: String,
    pub groups: Vec<GroupEntry>,
    pub prerequisites: Vec<PrerequisiteEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupEntry {
    pub group_number: String,
    pub instructor: String,
    pub slots: Vec<MeetingSlot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeetingSlot {
    pub day: String,
    pub start_time: String,
    pub end_time: String,
    pub room: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrerequisiteEntry {
    pub code: String,
    pub name: String,
}

impl PrerequisiteEntry {
    pub fn descriptor(&self) -> String {
        normalize_text(&format!("{} {}", self.code.trim(), self.name.trim()))
    }
}

/// Case-insensitive substring match against known non-data UI strings.
#[derive(Debug, Clone)]
pub struct PlaceholderFilter {
    patterns: Vec<String>,
}

impl PlaceholderFilter {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        let lower = text.to_lowercase();
        self.patterns.iter().any(|p| lower.contains(p.as_str()))
    }
}

impl Default for PlaceholderFilter {
    fn default() -> Self {
        Self::new(DEFAULT_PLACEHOLDERS)
    }
}

/// Rows produced from one accepted envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitySplit {
    pub course: Option<Course>,
    pub course_program: Option<CourseProgram>,
    pub schedules: Vec<Schedule>,
    pub prerequisites: Vec<Prerequisite>,
    /// Slots dropped because no meeting day was extracted.
    pub invalid_schedules: usize,
}

impl RecordEnvelope {
    /// Copy with every textual field trimmed.
    pub fn normalized(&self) -> Self {
        Self {
            code: normalize_text(&self.code),
            name: normalize_text(&self.name),
            credits: normalize_text(&self.credits),
            program: normalize_text(&self.program),
            course_kind: normalize_text(&self.course_kind),
            groups: self
                .groups
                .iter()
                .map(|g| GroupEntry {
                    group_number: normalize_text(&g.group_number),
                    instructor: normalize_text(&g.instructor),
                    slots: g
                        .slots
                        .iter()
                        .map(|s| MeetingSlot {
                            day: normalize_text(&s.day),
                            start_time: normalize_text(&s.start_time),
                            end_time: normalize_text(&s.end_time),
                            room: normalize_text(&s.room),
                        })
                        .collect(),
                })
                .collect(),
            prerequisites: self
                .prerequisites
                .iter()
                .map(|p| PrerequisiteEntry {
                    code: normalize_text(&p.code),
                    name: normalize_text(&p.name),
                })
                .collect(),
        }
    }

    /// Name of the first identity field holding a placeholder, if any.
    pub fn placeholder_field(&self, filter: &PlaceholderFilter) -> Option<&'static str> {
        if filter.matches(&self.code) {
            Some("code")
        } else if filter.matches(&self.name) {
            Some("name")
        } else {
            None
        }
    }

    /// Fan out into entity rows. With `omit_existing` the course row and its
    /// schedules are skipped: the partition already holds them.
    pub fn split(&self, omit_existing: bool) -> EntitySplit {
        let mut split = EntitySplit {
            course_program: Some(CourseProgram {
                code: self.code.clone(),
                name: self.name.clone(),
                program: self.program.clone(),
                course_kind: self.course_kind.clone(),
            }),
            ..EntitySplit::default()
        };

        if !omit_existing {
            split.course = Some(Course {
                code: self.code.clone(),
                name: self.name.clone(),
                credits: Credits::parse(&self.credits),
            });

            for group in &self.groups {
                for slot in &group.slots {
                    let schedule = Schedule {
                        code: self.code.clone(),
                        name: self.name.clone(),
                        group: group.group_number.clone(),
                        instructor: group.instructor.clone(),
                        day: slot.day.clone(),
                        start_time: slot.start_time.clone(),
                        end_time: slot.end_time.clone(),
                        room: slot.room.clone(),
                    };
                    if schedule.is_valid() {
                        split.schedules.push(schedule);
                    } else {
                        split.invalid_schedules += 1;
                    }
                }
            }
        }

        split.prerequisites = self
            .prerequisites
            .iter()
            .map(|p| Prerequisite {
                course_code: self.code.clone(),
                course_name: self.name.clone(),
                program: self.program.clone(),
                descriptor: p.descriptor(),
            })
            .collect();

        split
    }
}

/// Per-entity row buffers awaiting a flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityBatch {
    pub courses: Vec<Course>,
    pub course_programs: Vec<CourseProgram>,
    pub schedules: Vec<Schedule>,
    pub prerequisites: Vec<Prerequisite>,
}

impl EntityBatch {
    pub fn push_split(&mut self, split: EntitySplit) {
        self.courses.extend(split.course);
        self.course_programs.extend(split.course_program);
        self.schedules.extend(split.schedules);
        self.prerequisites.extend(split.prerequisites);
    }

    pub fn len_of(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Course => self.courses.len(),
            EntityKind::CourseProgram => self.course_programs.len(),
            EntityKind::Schedule => self.schedules.len(),
            EntityKind::Prerequisite => self.prerequisites.len(),
        }
    }

    pub fn len(&self) -> usize {
        EntityKind::ALL.iter().map(|k| self.len_of(*k)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear_kind(&mut self, kind: EntityKind) {
        match kind {
            EntityKind::Course => self.courses.clear(),
            EntityKind::CourseProgram => self.course_programs.clear(),
            EntityKind::Schedule => self.schedules.clear(),
            EntityKind::Prerequisite => self.prerequisites.clear(),
        }
    }
}
