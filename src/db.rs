use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::breadcrumbs::BreadcrumbRow;
use crate::models::{ActivityEvent, CourseOutline, Learner};
use crate::pipeline::ProgressSource;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const SEED_COURSE: &str = "course-v1:CI+FS+2026";

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let program_id: Uuid = sqlx::query(
        r#"
        INSERT INTO progress_export.programs (id, program_code, name)
        VALUES ($1, $2, $3)
        ON CONFLICT (program_code) DO UPDATE SET name = EXCLUDED.name
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind("FS")
    .bind("Full Stack Software Development")
    .fetch_one(pool)
    .await?
    .get("id");

    sqlx::query(
        r#"
        INSERT INTO progress_export.program_courses (program_id, course_id, position)
        VALUES ($1, $2, 0)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(program_id)
    .bind(SEED_COURSE)
    .execute(pool)
    .await?;

    let blocks = vec![
        ("fs-module", None, 0, "Python Fundamentals"),
        ("fs-section", Some("fs-module"), 0, "Getting Started"),
        ("fs-lesson-vars", Some("fs-section"), 0, "Variables"),
        ("fs-lesson-loops", Some("fs-section"), 1, "Loops"),
        ("fs-unit-naming", Some("fs-lesson-vars"), 0, "Naming things"),
        ("fs-unit-for", Some("fs-lesson-loops"), 0, "For loops"),
        ("fs-video-naming", Some("fs-unit-naming"), 0, "Video"),
        ("fs-quiz-for", Some("fs-unit-for"), 0, "Quiz"),
    ];

    for (block_id, parent_id, position, display_name) in blocks {
        sqlx::query(
            r#"
            INSERT INTO progress_export.course_blocks
            (course_id, block_id, parent_id, position, display_name)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (course_id, block_id) DO UPDATE
            SET parent_id = EXCLUDED.parent_id,
                position = EXCLUDED.position,
                display_name = EXCLUDED.display_name
            "#,
        )
        .bind(SEED_COURSE)
        .bind(block_id)
        .bind(parent_id)
        .bind(position)
        .bind(display_name)
        .execute(pool)
        .await?;
    }

    let now = Utc::now();
    let learners = vec![
        ("avery.lee@example.com", now - Duration::days(40)),
        ("jules.moreno@example.com", now - Duration::days(12)),
        ("kiara.patel@example.com", now - Duration::days(3)),
    ];

    for (email, joined) in learners {
        let learner_id = upsert_learner(pool, email, Some(joined)).await?;
        sqlx::query(
            r#"
            INSERT INTO progress_export.program_enrollments (program_id, learner_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(program_id)
        .bind(learner_id)
        .execute(pool)
        .await?;
    }

    let events = vec![
        ("seed-001", "avery.lee@example.com", "fs-lesson-vars", 35),
        ("seed-002", "avery.lee@example.com", "fs-video-naming", 34),
        ("seed-003", "avery.lee@example.com", "fs-lesson-loops", 6),
        ("seed-004", "avery.lee@example.com", "fs-quiz-for", 5),
        ("seed-005", "jules.moreno@example.com", "fs-lesson-vars", 10),
        ("seed-006", "jules.moreno@example.com", "fs-unit-naming", 9),
    ];

    for (source_key, email, block_id, days_ago) in events {
        let learner_id = upsert_learner(pool, email, None).await?;
        let at = now - Duration::days(days_ago);
        insert_activity(pool, learner_id, SEED_COURSE, block_id, at, at, source_key).await?;
    }

    Ok(())
}

async fn upsert_learner(
    pool: &PgPool,
    email: &str,
    date_joined: Option<DateTime<Utc>>,
) -> anyhow::Result<i64> {
    let id: i64 = sqlx::query(
        r#"
        INSERT INTO progress_export.learners (email, date_joined)
        VALUES ($1, COALESCE($2, now()))
        ON CONFLICT (email) DO UPDATE
        SET date_joined = COALESCE($2, progress_export.learners.date_joined)
        RETURNING id
        "#,
    )
    .bind(email)
    .bind(date_joined)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

async fn insert_activity(
    pool: &PgPool,
    learner_id: i64,
    course_id: &str,
    block_id: &str,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
    source_key: &str,
) -> anyhow::Result<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO progress_export.activity_events
        (id, learner_id, course_id, block_id, created, modified, source_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(learner_id)
    .bind(course_id)
    .bind(block_id)
    .bind(created)
    .bind(modified)
    .bind(source_key)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        email: String,
        course_id: String,
        block_id: String,
        created: DateTime<Utc>,
        modified: DateTime<Utc>,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let learner_id = upsert_learner(pool, &row.email, None).await?;

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let affected = insert_activity(
            pool,
            learner_id,
            &row.course_id,
            &row.block_id,
            row.created,
            row.modified,
            &source_key,
        )
        .await?;

        if affected > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

pub async fn fetch_program_courses(pool: &PgPool, program_code: &str) -> anyhow::Result<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT pc.course_id
        FROM progress_export.program_courses pc
        JOIN progress_export.programs p ON p.id = pc.program_id
        WHERE p.program_code = $1
        ORDER BY pc.position, pc.course_id
        "#,
    )
    .bind(program_code)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        bail!("program {program_code} has no courses");
    }

    Ok(rows.into_iter().map(|row| row.get("course_id")).collect())
}

pub async fn fetch_course_outline(pool: &PgPool, course_id: &str) -> anyhow::Result<CourseOutline> {
    let rows = sqlx::query(
        r#"
        SELECT block_id, parent_id, display_name
        FROM progress_export.course_blocks
        WHERE course_id = $1
        ORDER BY parent_id NULLS FIRST, position, block_id
        "#,
    )
    .bind(course_id)
    .fetch_all(pool)
    .await?;

    let mut roots = Vec::new();
    let mut outline = CourseOutline::new(course_id, "");
    for row in rows {
        let block_id: String = row.get("block_id");
        let parent_id: Option<String> = row.get("parent_id");
        let display_name: String = row.get("display_name");
        if parent_id.is_none() {
            roots.push(block_id.clone());
        }
        outline.add_block(parent_id.as_deref(), &block_id, &display_name);
    }

    match roots.as_slice() {
        [root] => outline.root = root.clone(),
        [] => bail!("course {course_id} has no root block"),
        _ => bail!("course {course_id} has {} root blocks", roots.len()),
    }

    Ok(outline)
}

pub async fn fetch_enrolled_learners(pool: &PgPool, program_code: &str) -> anyhow::Result<Vec<Learner>> {
    let rows = sqlx::query(
        r#"
        SELECT l.id, l.email, l.date_joined, l.last_login
        FROM progress_export.program_enrollments e
        JOIN progress_export.programs p ON p.id = e.program_id
        JOIN progress_export.learners l ON l.id = e.learner_id
        WHERE p.program_code = $1 AND l.is_active
        ORDER BY l.id DESC
        "#,
    )
    .bind(program_code)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| Learner {
            id: row.get("id"),
            email: row.get("email"),
            date_joined: row.get("date_joined"),
            last_login: row.get("last_login"),
        })
        .collect())
}

pub async fn fetch_learner_activity(
    pool: &PgPool,
    learner_id: i64,
    course_ids: &[String],
) -> anyhow::Result<Vec<ActivityEvent>> {
    let rows = sqlx::query(
        r#"
        SELECT learner_id, block_id, created, modified
        FROM progress_export.activity_events
        WHERE learner_id = $1 AND course_id = ANY($2)
        ORDER BY modified, created
        "#,
    )
    .bind(learner_id)
    .bind(course_ids)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ActivityEvent {
            learner_id: row.get("learner_id"),
            block_id: row.get("block_id"),
            created: row.get("created"),
            modified: row.get("modified"),
        })
        .collect())
}

/// Replaces the breadcrumbs table with the given rows.
pub async fn store_breadcrumbs(pool: &PgPool, rows: &[BreadcrumbRow]) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM progress_export.breadcrumbs")
        .execute(&mut *tx)
        .await?;

    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO progress_export.breadcrumbs
            (block_id, kind, module, section, lesson, unit, component, order_index)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&row.block_id)
        .bind(&row.kind)
        .bind(&row.module)
        .bind(&row.section)
        .bind(&row.lesson)
        .bind(&row.unit)
        .bind(&row.component)
        .bind(row.order_index)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(rows.len())
}

/// Inserts one run's records in a single transaction.
pub async fn insert_progress_records(
    pool: &PgPool,
    run_id: Uuid,
    rows: &[(i64, &str, Value)],
) -> Result<usize, sqlx::Error> {
    let exported_at = Utc::now();
    let mut tx = pool.begin().await?;

    for (learner_id, email, payload) in rows {
        sqlx::query(
            r#"
            INSERT INTO progress_export.student_progress
            (id, run_id, learner_id, email, payload, exported_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(learner_id)
        .bind(email)
        .bind(payload)
        .bind(exported_at)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(rows.len())
}

/// [`ProgressSource`] backed by the LMS tables.
pub struct PgSource {
    pool: PgPool,
}

impl PgSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProgressSource for PgSource {
    async fn course_outlines(&self, program_code: &str) -> anyhow::Result<Vec<CourseOutline>> {
        let mut outlines = Vec::new();
        for course_id in fetch_program_courses(&self.pool, program_code).await? {
            let outline = fetch_course_outline(&self.pool, &course_id)
                .await
                .with_context(|| format!("failed to load outline for {course_id}"))?;
            outlines.push(outline);
        }
        Ok(outlines)
    }

    async fn enrolled_learners(&self, program_code: &str) -> anyhow::Result<Vec<Learner>> {
        fetch_enrolled_learners(&self.pool, program_code).await
    }

    async fn learner_activity(
        &self,
        learner_id: i64,
        course_ids: &[String],
    ) -> anyhow::Result<Vec<ActivityEvent>> {
        fetch_learner_activity(&self.pool, learner_id, course_ids).await
    }
}

