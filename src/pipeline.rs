//! One export run: harvest the program, replay every enrolled learner's
//! activity, aggregate, then hand the whole batch to a sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::aggregate::aggregate;
use crate::config::ExportConfig;
use crate::export::RecordSink;
use crate::harvest::{harvest_program, Harvest};
use crate::index::index_activity;
use crate::models::{ActivityEvent, CourseOutline, Learner, StudentProgressRecord};
use crate::syllabus::WeightTable;

/// Read side of the LMS the pipeline pulls from.
#[async_trait]
pub trait ProgressSource: Send + Sync {
    async fn course_outlines(&self, program_code: &str) -> anyhow::Result<Vec<CourseOutline>>;

    async fn enrolled_learners(&self, program_code: &str) -> anyhow::Result<Vec<Learner>>;

    /// Events for one learner within the given courses, oldest first by
    /// modification time.
    async fn learner_activity(
        &self,
        learner_id: i64,
        course_ids: &[String],
    ) -> anyhow::Result<Vec<ActivityEvent>>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportSummary {
    pub learners: usize,
    pub delivered: usize,
    pub unmatched_events: usize,
    pub unweighted_lessons: usize,
}

pub async fn harvest_source(
    source: &dyn ProgressSource,
    program_code: &str,
) -> anyhow::Result<(Harvest, Vec<String>)> {
    let outlines = source.course_outlines(program_code).await?;
    let course_ids = outlines.iter().map(|outline| outline.course_id.clone()).collect();
    let harvest = harvest_program(&outlines)?;
    if harvest.is_empty() {
        warn!(program_code, "program has no course blocks");
    }
    info!(
        program_code,
        courses = outlines.len(),
        blocks = harvest.len(),
        "harvested program"
    );
    Ok((harvest, course_ids))
}

/// Builds a record for every enrolled learner, sequentially.
pub async fn build_records(
    source: &dyn ProgressSource,
    program_code: &str,
    weights: &WeightTable,
    config: &ExportConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<StudentProgressRecord>> {
    let (harvest, course_ids) = harvest_source(source, program_code).await?;

    let mut learners = source.enrolled_learners(program_code).await?;
    if let Some(limit) = config.limit {
        learners.truncate(limit);
    }

    let mut records = Vec::with_capacity(learners.len());
    for learner in &learners {
        let events = source.learner_activity(learner.id, &course_ids).await?;
        let progress = index_activity(&harvest, &events);
        let record = aggregate(learner, &progress, weights, config, now);
        debug!(
            learner_id = learner.id,
            events = events.len(),
            lessons = progress.completed_lessons.len(),
            units = progress.completed_units.len(),
            "aggregated learner"
        );
        records.push(record);
    }

    Ok(records)
}

pub async fn run_export(
    source: &dyn ProgressSource,
    sink: &dyn RecordSink,
    program_code: &str,
    weights: &WeightTable,
    config: &ExportConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<ExportSummary> {
    let records = build_records(source, program_code, weights, config, now).await?;

    let summary = ExportSummary {
        learners: records.len(),
        delivered: 0,
        unmatched_events: records.iter().map(|record| record.unmatched_events).sum(),
        unweighted_lessons: records.iter().map(|record| record.unweighted_lessons).sum(),
    };
    if summary.unmatched_events > 0 {
        warn!(
            count = summary.unmatched_events,
            "activity events referenced blocks missing from the harvest"
        );
    }
    if summary.unweighted_lessons > 0 {
        warn!(
            count = summary.unweighted_lessons,
            "completed lessons had no syllabus weight"
        );
    }

    let delivered = sink.deliver(&records).await?;
    info!(sink = %sink.describe(), delivered, "export delivered");

    Ok(ExportSummary { delivered, ..summary })
}
