use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Structural level of a block in a course tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Module,
    Section,
    Lesson,
    Unit,
    Component,
}

impl NodeKind {
    /// Kind of a node whose breadcrumb has `depth` entries.
    pub fn from_depth(depth: usize) -> Self {
        match depth {
            0 | 1 => NodeKind::Module,
            2 => NodeKind::Section,
            3 => NodeKind::Lesson,
            4 => NodeKind::Unit,
            _ => NodeKind::Component,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Module => "module",
            NodeKind::Section => "section",
            NodeKind::Lesson => "lesson",
            NodeKind::Unit => "unit",
            NodeKind::Component => "component",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const LESSON_DEPTH: usize = 3;
pub const UNIT_DEPTH: usize = 4;

/// Export field prefix for a module: lowercased, spaces as underscores.
pub fn field_name(module: &str) -> String {
    module.to_lowercase().replace(' ', "_")
}

/// Display names from the course root down to a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Breadcrumb(Vec<String>);

impl Breadcrumb {
    pub fn child(&self, name: &str) -> Self {
        let mut names = self.0.clone();
        names.push(name.to_string());
        Self(names)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::from_depth(self.depth())
    }

    pub fn truncate(&self, depth: usize) -> Self {
        Self(self.0.iter().take(depth).cloned().collect())
    }

    /// Name at `level` (0 = module), or an empty string past the end.
    pub fn level(&self, level: usize) -> &str {
        self.0.get(level).map(String::as_str).unwrap_or("")
    }

    pub fn module(&self) -> &str {
        self.level(0)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }
}

impl<S: Into<String>> FromIterator<S> for Breadcrumb {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Breadcrumb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" > "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub block_id: String,
    pub display_name: String,
    pub kind: NodeKind,
    pub breadcrumb: Breadcrumb,
}

#[derive(Debug, Clone, Default)]
pub struct CourseBlock {
    pub display_name: String,
    pub children: Vec<String>,
}

/// A course tree as stored by the LMS: a root id plus every block by id.
#[derive(Debug, Clone, Default)]
pub struct CourseOutline {
    pub course_id: String,
    pub root: String,
    pub blocks: HashMap<String, CourseBlock>,
}

impl CourseOutline {
    pub fn new(course_id: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            course_id: course_id.into(),
            root: root.into(),
            blocks: HashMap::new(),
        }
    }

    /// Builder used by loaders and tests: adds `block_id` under `parent`.
    pub fn add_block(&mut self, parent: Option<&str>, block_id: &str, display_name: &str) {
        self.blocks
            .entry(block_id.to_string())
            .or_default()
            .display_name = display_name.to_string();
        if let Some(parent) = parent {
            self.blocks
                .entry(parent.to_string())
                .or_default()
                .children
                .push(block_id.to_string());
        }
    }
}

#[derive(Debug, Clone)]
pub struct Learner {
    pub id: i64,
    pub email: String,
    pub date_joined: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ActivityEvent {
    pub learner_id: i64,
    pub block_id: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Fractions {
    #[serde(default)]
    pub lesson_fraction: f64,
    #[serde(default)]
    pub module_fraction: f64,
    #[serde(default)]
    pub cumulative_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LessonWeight {
    pub module: String,
    pub lesson: String,
    #[serde(default)]
    pub fractions: Fractions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedLesson {
    pub block_id: String,
    pub completed_at: DateTime<Utc>,
}

/// Windowed totals for one module, before normalisation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleProgress {
    pub lessons: usize,
    pub units: usize,
    pub days_into: Vec<i64>,
    pub fraction_within: f64,
    pub fraction_before: f64,
    /// Module fraction plus any project fraction, used to normalise.
    pub total_fraction: f64,
}

impl ModuleProgress {
    pub fn cumulative(&self) -> f64 {
        self.fraction_within + self.fraction_before
    }

    pub fn normalised(&self, value: f64) -> f64 {
        if self.total_fraction == 0.0 {
            value
        } else {
            value / self.total_fraction
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentProgressRecord {
    pub student_id: i64,
    pub email: String,
    pub date_joined: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub latest_unit_completion: Option<DateTime<Utc>>,
    pub latest_unit: Breadcrumb,
    pub units_in_window: usize,
    pub days_into_data: Vec<i64>,
    pub completed_fractions_recent: f64,
    pub completed_fractions_before: f64,
    pub cumulative_completed_fractions: f64,
    /// Sparse day offset to completed fraction mass.
    pub fractions_per_day: BTreeMap<i64, f64>,
    /// Last day offset of the series (days from first activity to now).
    pub horizon_days: i64,
    pub modules: BTreeMap<String, ModuleProgress>,
    pub unmatched_events: usize,
    pub unweighted_lessons: usize,
    pub window_days: i64,
    pub unit_window_days: i64,
}

impl StudentProgressRecord {
    /// Zero-filled per-day series from day 0 to the horizon.
    pub fn daily_fractions(&self) -> impl Iterator<Item = f64> + '_ {
        (0..=self.horizon_days).map(|day| self.fractions_per_day.get(&day).copied().unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_breadcrumb_depth() {
        let crumb: Breadcrumb = ["M", "S", "L", "U", "C", "X"].into_iter().collect();
        assert_eq!(crumb.truncate(1).kind(), NodeKind::Module);
        assert_eq!(crumb.truncate(2).kind(), NodeKind::Section);
        assert_eq!(crumb.truncate(3).kind(), NodeKind::Lesson);
        assert_eq!(crumb.truncate(4).kind(), NodeKind::Unit);
        assert_eq!(crumb.truncate(5).kind(), NodeKind::Component);
        assert_eq!(crumb.kind(), NodeKind::Component);
    }

    #[test]
    fn level_past_end_is_empty() {
        let crumb: Breadcrumb = ["M", "S"].into_iter().collect();
        assert_eq!(crumb.module(), "M");
        assert_eq!(crumb.level(3), "");
        assert_eq!(Breadcrumb::default().module(), "");
    }

    #[test]
    fn outline_builder_links_children_in_order() {
        let mut outline = CourseOutline::new("course-v1:CI+FS+1", "root");
        outline.add_block(None, "root", "Module");
        outline.add_block(Some("root"), "b", "Second");
        outline.add_block(Some("root"), "a", "First");
        assert_eq!(outline.blocks["root"].children, vec!["b", "a"]);
        assert_eq!(outline.blocks["a"].display_name, "First");
    }

    #[test]
    fn module_field_names_are_snake_case() {
        assert_eq!(field_name("Full Stack Frameworks With Django"), "full_stack_frameworks_with_django");
        assert_eq!(field_name("Careers"), "careers");
    }

    #[test]
    fn zero_module_total_leaves_value_raw() {
        let progress = ModuleProgress {
            fraction_within: 0.2,
            ..Default::default()
        };
        assert_eq!(progress.normalised(0.2), 0.2);
        let weighted = ModuleProgress {
            total_fraction: 0.4,
            ..Default::default()
        };
        assert!((weighted.normalised(0.2) - 0.5).abs() < 1e-9);
    }
}
