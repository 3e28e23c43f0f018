use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db;
use crate::models::{field_name, StudentProgressRecord};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("export request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("export endpoint rejected the batch with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("could not write export table: {0}")]
    Database(#[from] sqlx::Error),

    #[error("could not write export file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode export: {0}")]
    Json(#[from] serde_json::Error),
}

fn timestamp(value: DateTime<Utc>) -> Value {
    Value::String(value.to_rfc3339_opts(SecondsFormat::Micros, true))
}

fn optional_timestamp(value: Option<DateTime<Utc>>) -> Value {
    value.map(timestamp).unwrap_or(Value::Null)
}

fn join<T: ToString>(values: impl IntoIterator<Item = T>) -> String {
    values
        .into_iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Flattens a record into the JSON object the sinks deliver. Per-module
/// fields are prefixed with the module's field name.
pub fn flatten_record(record: &StudentProgressRecord) -> Map<String, Value> {
    let window = format!("{}d", record.window_days);
    let mut fields = Map::new();

    fields.insert("student_id".into(), record.student_id.into());
    fields.insert("email".into(), record.email.clone().into());
    fields.insert("date_joined".into(), timestamp(record.date_joined));
    fields.insert("last_login".into(), optional_timestamp(record.last_login));
    fields.insert(
        "latest_unit_completion".into(),
        optional_timestamp(record.latest_unit_completion),
    );
    for (level, key) in ["latest_module", "latest_section", "latest_lesson", "latest_unit"]
        .into_iter()
        .enumerate()
    {
        fields.insert(key.into(), record.latest_unit.level(level).into());
    }
    fields.insert(
        format!("units_in_{}d", record.unit_window_days),
        record.units_in_window.into(),
    );
    fields.insert("days_into_data".into(), join(&record.days_into_data).into());
    fields.insert(
        format!("completed_fractions_{window}"),
        record.completed_fractions_recent.into(),
    );
    fields.insert(
        format!("completed_fractions_before_{window}"),
        record.completed_fractions_before.into(),
    );
    fields.insert(
        "cumulative_completed_fractions".into(),
        record.cumulative_completed_fractions.into(),
    );
    fields.insert("fractions_per_day".into(), join(record.daily_fractions()).into());
    fields.insert("unmatched_events".into(), record.unmatched_events.into());
    fields.insert("unweighted_lessons".into(), record.unweighted_lessons.into());

    for (module, progress) in &record.modules {
        let prefix = field_name(module);
        fields.insert(format!("{prefix}_lessons"), progress.lessons.into());
        fields.insert(format!("{prefix}_units"), progress.units.into());
        fields.insert(format!("{prefix}_days_into"), join(&progress.days_into).into());
        fields.insert(
            format!("{prefix}_fraction_within_{window}"),
            progress.normalised(progress.fraction_within).into(),
        );
        fields.insert(
            format!("{prefix}_fraction_before_{window}"),
            progress.normalised(progress.fraction_before).into(),
        );
        fields.insert(
            format!("{prefix}_cumulative_fraction"),
            progress.normalised(progress.cumulative()).into(),
        );
    }

    fields
}

pub fn flatten_all(records: &[StudentProgressRecord]) -> Vec<Value> {
    records
        .iter()
        .map(|record| Value::Object(flatten_record(record)))
        .collect()
}

/// Destination for one run's records. Delivery is all-or-nothing.
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn describe(&self) -> String;

    async fn deliver(&self, records: &[StudentProgressRecord]) -> Result<usize, ExportError>;
}

pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl RecordSink for HttpSink {
    fn describe(&self) -> String {
        format!("POST {}", self.endpoint)
    }

    async fn deliver(&self, records: &[StudentProgressRecord]) -> Result<usize, ExportError> {
        let payload = flatten_all(records);
        debug!(records = payload.len(), endpoint = %self.endpoint, "posting export batch");

        let response = self.client.post(&self.endpoint).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(payload.len())
    }
}

pub struct TableSink {
    pool: PgPool,
    run_id: Uuid,
}

impl TableSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            run_id: Uuid::new_v4(),
        }
    }
}

#[async_trait]
impl RecordSink for TableSink {
    fn describe(&self) -> String {
        format!("progress_export.student_progress (run {})", self.run_id)
    }

    async fn deliver(&self, records: &[StudentProgressRecord]) -> Result<usize, ExportError> {
        let rows: Vec<(i64, &str, Value)> = records
            .iter()
            .map(|record| {
                (
                    record.student_id,
                    record.email.as_str(),
                    Value::Object(flatten_record(record)),
                )
            })
            .collect();
        let inserted = db::insert_progress_records(&self.pool, self.run_id, &rows).await?;
        info!(run_id = %self.run_id, inserted, "stored export batch");
        Ok(inserted)
    }
}

pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordSink for FileSink {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn deliver(&self, records: &[StudentProgressRecord]) -> Result<usize, ExportError> {
        let payload = flatten_all(records);
        let body = serde_json::to_vec_pretty(&payload)?;
        tokio::fs::write(&self.path, body).await?;
        Ok(payload.len())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration, TimeZone};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::models::{Breadcrumb, ModuleProgress};

    fn sample_record() -> StudentProgressRecord {
        let joined = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let mut modules = BTreeMap::new();
        modules.insert(
            "Python Fundamentals".to_string(),
            ModuleProgress {
                lessons: 2,
                units: 3,
                days_into: vec![0, 4],
                fraction_within: 0.1,
                fraction_before: 0.05,
                total_fraction: 0.5,
            },
        );
        StudentProgressRecord {
            student_id: 7,
            email: "jules.moreno@example.com".to_string(),
            date_joined: joined,
            last_login: None,
            latest_unit_completion: Some(joined + Duration::days(4)),
            latest_unit: ["Python Fundamentals", "Getting Started", "Loops", "For loops"]
                .into_iter()
                .collect::<Breadcrumb>(),
            units_in_window: 3,
            days_into_data: vec![0, 1, 4],
            completed_fractions_recent: 0.1,
            completed_fractions_before: 0.05,
            cumulative_completed_fractions: 0.15000000000000002,
            fractions_per_day: BTreeMap::from([(0, 0.05), (4, 0.1)]),
            horizon_days: 5,
            modules,
            unmatched_events: 1,
            unweighted_lessons: 0,
            window_days: 14,
            unit_window_days: 30,
        }
    }

    #[test]
    fn flattens_to_named_fields() {
        let fields = flatten_record(&sample_record());

        assert_eq!(fields["email"], "jules.moreno@example.com");
        assert_eq!(fields["date_joined"], "2026-03-01T09:30:00.000000Z");
        assert_eq!(fields["last_login"], Value::Null);
        assert_eq!(fields["latest_module"], "Python Fundamentals");
        assert_eq!(fields["latest_unit"], "For loops");
        assert_eq!(fields["units_in_30d"], 3);
        assert_eq!(fields["days_into_data"], "0,1,4");
        assert_eq!(fields["completed_fractions_14d"], 0.1);
        assert_eq!(fields["completed_fractions_before_14d"], 0.05);
        assert_eq!(fields["fractions_per_day"], "0.05,0,0,0,0.1,0");
        assert_eq!(fields["python_fundamentals_lessons"], 2);
        assert_eq!(fields["python_fundamentals_units"], 3);
        assert_eq!(fields["python_fundamentals_days_into"], "0,4");
        assert_eq!(fields["python_fundamentals_fraction_within_14d"], 0.2);
        assert_eq!(fields["python_fundamentals_fraction_before_14d"], 0.1);
    }

    #[test]
    fn module_cumulative_is_within_plus_before() {
        let fields = flatten_record(&sample_record());
        let within = fields["python_fundamentals_fraction_within_14d"].as_f64().unwrap();
        let before = fields["python_fundamentals_fraction_before_14d"].as_f64().unwrap();
        let cumulative = fields["python_fundamentals_cumulative_fraction"].as_f64().unwrap();
        assert!((cumulative - 0.3).abs() < 1e-9);
        assert!((within + before - cumulative).abs() < 1e-9);
    }

    #[test]
    fn empty_latest_unit_exports_blank_strings() {
        let mut record = sample_record();
        record.latest_unit = Breadcrumb::default();
        record.latest_unit_completion = None;
        let fields = flatten_record(&record);
        for key in ["latest_module", "latest_section", "latest_lesson", "latest_unit"] {
            assert_eq!(fields[key], "");
        }
        assert_eq!(fields["latest_unit_completion"], Value::Null);
    }

    #[tokio::test]
    async fn http_sink_posts_json_array() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/progress"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpSink::new(reqwest::Client::new(), format!("{}/progress", server.uri()));
        let delivered = sink.deliver(&[sample_record(), sample_record()]).await.unwrap();
        assert_eq!(delivered, 2);

        let requests = server.received_requests().await.unwrap();
        let body: Vec<Value> = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body.len(), 2);
        assert_eq!(body[0]["student_id"], 7);
    }

    #[tokio::test]
    async fn http_sink_fails_on_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("quota exceeded"))
            .mount(&server)
            .await;

        let sink = HttpSink::new(reqwest::Client::new(), server.uri());
        let err = sink.deliver(&[sample_record()]).await.unwrap_err();
        match err {
            ExportError::Rejected { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "quota exceeded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn file_sink_writes_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        let sink = FileSink::new(&path);
        assert_eq!(sink.deliver(&[sample_record()]).await.unwrap(), 1);

        let written: Vec<Value> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written[0]["email"], "jules.moreno@example.com");
    }
}
