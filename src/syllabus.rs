use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::models::{Breadcrumb, LessonWeight};

#[derive(Debug, thiserror::Error)]
pub enum SyllabusError {
    #[error("syllabus request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("syllabus endpoint answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not read syllabus file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed syllabus document: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct SyllabusDocument {
    #[serde(rename = "LESSONS", alias = "lessons")]
    lessons: BTreeMap<String, LessonWeight>,
}

/// Lesson weights from the syllabus feed, read-only for the whole run.
#[derive(Debug, Clone, Default)]
pub struct WeightTable {
    by_key: HashMap<String, LessonWeight>,
    by_lesson: HashMap<(String, String), String>,
    order: HashMap<String, usize>,
    module_fractions: BTreeMap<String, f64>,
}

impl WeightTable {
    pub fn from_json(body: &str) -> Result<Self, SyllabusError> {
        let document: SyllabusDocument = serde_json::from_str(body)?;
        Ok(Self::from_lessons(document.lessons))
    }

    pub fn from_lessons(lessons: impl IntoIterator<Item = (String, LessonWeight)>) -> Self {
        let mut table = WeightTable::default();
        for (key, weight) in lessons {
            let module_fraction = table
                .module_fractions
                .entry(weight.module.clone())
                .or_insert(0.0);
            *module_fraction = module_fraction.max(weight.fractions.module_fraction);
            table
                .by_lesson
                .insert((weight.module.clone(), weight.lesson.clone()), key.clone());
            table.by_key.insert(key, weight);
        }

        // course order follows the running total of lesson fractions
        let mut keys: Vec<(&String, &LessonWeight)> = table.by_key.iter().collect();
        keys.sort_by(|a, b| {
            a.1.fractions
                .cumulative_fraction
                .total_cmp(&b.1.fractions.cumulative_fraction)
                .then_with(|| a.0.cmp(b.0))
        });
        table.order = keys
            .into_iter()
            .enumerate()
            .map(|(index, (key, _))| (key.clone(), index))
            .collect();
        table
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Weight of a lesson, by its block id first and then by module and
    /// lesson name.
    pub fn lookup(&self, block_id: &str, lesson: &Breadcrumb) -> Option<&LessonWeight> {
        self.by_key
            .get(block_id)
            .or_else(|| self.key_for(lesson).and_then(|key| self.by_key.get(key)))
    }

    /// Position of the lesson in course order, if the syllabus lists it.
    pub fn order_index(&self, block_id: &str, breadcrumb: &Breadcrumb) -> Option<usize> {
        self.order
            .get(block_id)
            .or_else(|| self.key_for(breadcrumb).and_then(|key| self.order.get(key)))
            .copied()
    }

    pub fn module_fractions(&self) -> &BTreeMap<String, f64> {
        &self.module_fractions
    }

    fn key_for(&self, breadcrumb: &Breadcrumb) -> Option<&String> {
        let pair = (breadcrumb.level(0).to_string(), breadcrumb.level(2).to_string());
        self.by_lesson.get(&pair)
    }
}

/// Loads the weight table from an http(s) URL or a local JSON file.
pub async fn load_weights(client: &reqwest::Client, source: &str) -> Result<WeightTable, SyllabusError> {
    let body = if source.starts_with("http://") || source.starts_with("https://") {
        fetch_syllabus(client, source).await?
    } else {
        tokio::fs::read_to_string(Path::new(source)).await?
    };
    let table = WeightTable::from_json(&body)?;
    info!(lessons = table.len(), source, "loaded syllabus weights");
    Ok(table)
}

async fn fetch_syllabus(client: &reqwest::Client, url: &str) -> Result<String, SyllabusError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(SyllabusError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

#[cfg(test)]
pub(crate) const SAMPLE_SYLLABUS: &str = r#"{
    "LESSONS": {
        "l1": {
            "module": "Python Fundamentals",
            "lesson": "Variables",
            "fractions": {"lesson_fraction": 0.1, "module_fraction": 0.3, "cumulative_fraction": 0.1}
        },
        "l2-syllabus": {
            "module": "Python Fundamentals",
            "lesson": "Loops",
            "fractions": {"lesson_fraction": 0.2, "module_fraction": 0.3, "cumulative_fraction": 0.3}
        },
        "careers-1": {
            "module": "Careers",
            "lesson": "CV Writing",
            "fractions": {"lesson_fraction": 0.05, "module_fraction": 0.05, "cumulative_fraction": 0.35}
        }
    }
}"#;
