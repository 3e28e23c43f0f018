use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::config::ExportConfig;
use crate::index::LearnerProgress;
use crate::models::{Learner, ModuleProgress, StudentProgressRecord};
use crate::syllabus::WeightTable;

/// Start of a `days` window ending at `now`. Windows reaching past the
/// representable range start at the earliest instant instead.
pub fn cutoff(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    Duration::try_days(days.max(1))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn days_into(first_active: DateTime<Utc>, at: DateTime<Utc>) -> i64 {
    (at - first_active).num_days()
}

// Modules the syllabus does not weight are exported unnormalised.
fn module_mut<'a>(
    modules: &'a mut BTreeMap<String, ModuleProgress>,
    module: &str,
) -> &'a mut ModuleProgress {
    modules.entry(module.to_string()).or_default()
}

/// Folds one learner's indexed progress and the syllabus weights into the
/// exported record. Pure for a fixed `now`.
pub fn aggregate(
    learner: &Learner,
    progress: &LearnerProgress,
    weights: &WeightTable,
    config: &ExportConfig,
    now: DateTime<Utc>,
) -> StudentProgressRecord {
    let first_active = progress.first_activity.unwrap_or(learner.date_joined);
    let recent_cutoff = cutoff(now, config.window_days);
    let unit_cutoff = cutoff(now, config.unit_window_days);

    let mut modules: BTreeMap<String, ModuleProgress> = weights
        .module_fractions()
        .iter()
        .map(|(module, fraction)| {
            let total_fraction = if *fraction == 0.0 {
                0.0
            } else {
                fraction + config.project_fraction(module)
            };
            let progress = ModuleProgress {
                total_fraction,
                ..Default::default()
            };
            (module.clone(), progress)
        })
        .collect();
    let mut fractions_per_day: BTreeMap<i64, f64> = BTreeMap::new();
    let mut unweighted_lessons = 0;

    for (breadcrumb, lesson) in &progress.completed_lessons {
        let lesson_fraction = match weights.lookup(&lesson.block_id, breadcrumb) {
            Some(weight) => weight.fractions.lesson_fraction,
            None => {
                unweighted_lessons += 1;
                0.0
            }
        };

        let entry = module_mut(&mut modules, breadcrumb.module());
        entry.lessons += 1;
        let day = days_into(first_active, lesson.completed_at);
        entry.days_into.push(day);
        if lesson.completed_at > recent_cutoff {
            entry.fraction_within += lesson_fraction;
        } else {
            entry.fraction_before += lesson_fraction;
        }

        if lesson_fraction != 0.0 {
            *fractions_per_day.entry(day.max(0)).or_insert(0.0) += lesson_fraction;
        }
    }

    let mut units_in_window = 0;
    let mut days_into_data = Vec::with_capacity(progress.completed_units.len());
    for (unit, completed_at) in &progress.completed_units {
        module_mut(&mut modules, unit.module()).units += 1;

        if *completed_at > unit_cutoff {
            units_in_window += 1;
        }
        days_into_data.push(days_into(first_active, *completed_at));
    }
    days_into_data.sort_unstable();
    for module in modules.values_mut() {
        module.days_into.sort_unstable();
    }

    let completed_fractions_recent = modules.values().fold(0.0, |sum, m| sum + m.fraction_within);
    let completed_fractions_before = modules.values().fold(0.0, |sum, m| sum + m.fraction_before);
    let last_completion_day = fractions_per_day.keys().next_back().copied().unwrap_or(0);
    let horizon_days = days_into(first_active, now).max(last_completion_day).max(0);

    let (latest_unit, latest_unit_completion) = match &progress.latest_unit {
        Some((unit, started)) => (unit.clone(), Some(*started)),
        None => Default::default(),
    };

    StudentProgressRecord {
        student_id: learner.id,
        email: learner.email.clone(),
        date_joined: first_active,
        last_login: learner.last_login,
        latest_unit_completion,
        latest_unit,
        units_in_window,
        days_into_data,
        completed_fractions_recent,
        completed_fractions_before,
        cumulative_completed_fractions: completed_fractions_recent + completed_fractions_before,
        fractions_per_day,
        horizon_days,
        modules,
        unmatched_events: progress.unmatched_events,
        unweighted_lessons,
        window_days: config.window_days,
        unit_window_days: config.unit_window_days,
    }
}
