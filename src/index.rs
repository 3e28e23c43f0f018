use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::harvest::Harvest;
use crate::models::{ActivityEvent, Breadcrumb, CompletedLesson, LESSON_DEPTH, UNIT_DEPTH};

/// What one learner's activity log says about their position in the course.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearnerProgress {
    /// Earliest `created` across every event, matched or not.
    pub first_activity: Option<DateTime<Utc>>,
    pub completed_lessons: BTreeMap<Breadcrumb, CompletedLesson>,
    pub completed_units: BTreeMap<Breadcrumb, DateTime<Utc>>,
    /// Unit breadcrumb and `created` time of the last unit-level event.
    pub latest_unit: Option<(Breadcrumb, DateTime<Utc>)>,
    pub unmatched_events: usize,
}

/// Replays a learner's events in modification order against the harvest.
///
/// Later events overwrite earlier ones for the same lesson or unit. The
/// latest-unit pointer records `created` rather than `modified` so that
/// revisiting an old unit does not move the learner backwards.
pub fn index_activity(harvest: &Harvest, events: &[ActivityEvent]) -> LearnerProgress {
    let mut ordered: Vec<&ActivityEvent> = events.iter().collect();
    ordered.sort_by_key(|event| event.modified);

    let mut progress = LearnerProgress {
        first_activity: events.iter().map(|event| event.created).min(),
        ..Default::default()
    };

    for event in ordered {
        let Some(node) = harvest.get(&event.block_id) else {
            debug!(learner_id = event.learner_id, block_id = %event.block_id, "activity for unknown block skipped");
            progress.unmatched_events += 1;
            continue;
        };

        let depth = node.breadcrumb.depth();
        if depth == LESSON_DEPTH {
            progress.completed_lessons.insert(
                node.breadcrumb.clone(),
                CompletedLesson {
                    block_id: node.block_id.clone(),
                    completed_at: event.modified,
                },
            );
        }

        if depth >= UNIT_DEPTH {
            let unit = node.breadcrumb.truncate(UNIT_DEPTH);
            progress.completed_units.insert(unit.clone(), event.modified);
            progress.latest_unit = Some((unit, event.created));
        }
    }

    progress
}
