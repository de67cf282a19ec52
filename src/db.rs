use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{ActorKey, AlertStatus, InstructorAlert, PatternKind, StrugglePattern};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Durable side of the engine: alert rows and audit entries. Behind a trait
/// so the actor pipeline can run against an in-memory stand-in in tests and
/// the retry behavior stays observable.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn insert_alert(&self, alert: &InstructorAlert) -> anyhow::Result<()>;
    async fn record_audit(
        &self,
        key: &ActorKey,
        pattern: &StrugglePattern,
        decision: &str,
    ) -> anyhow::Result<()>;
}

/// Hand-off point for medium-severity patterns; the intervention generator
/// consumes this queue out of process.
#[async_trait]
pub trait InterventionQueue: Send + Sync {
    async fn enqueue(&self, key: &ActorKey, pattern: &StrugglePattern) -> anyhow::Result<()>;
}

pub struct PgAlertStore {
    pool: PgPool,
}

impl PgAlertStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertStore for PgAlertStore {
    async fn insert_alert(&self, alert: &InstructorAlert) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO struggle.instructor_alerts
            (id, student_id, course_id, pattern_type, severity, evidence_count, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(alert.id)
        .bind(alert.student_id)
        .bind(&alert.course_id)
        .bind(alert.pattern_type.as_str())
        .bind(alert.severity)
        .bind(alert.evidence_count)
        .bind(alert.status.as_str())
        .bind(alert.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert instructor alert")?;
        Ok(())
    }

    async fn record_audit(
        &self,
        key: &ActorKey,
        pattern: &StrugglePattern,
        decision: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO struggle.engine_audit
            (id, student_id, course_id, pattern_type, severity, decision, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.student_id)
        .bind(&key.course_id)
        .bind(pattern.kind.as_str())
        .bind(pattern.severity)
        .bind(decision)
        .bind(pattern.detected_at)
        .execute(&self.pool)
        .await
        .context("failed to record audit row")?;
        Ok(())
    }
}

pub struct PgInterventionQueue {
    pool: PgPool,
}

impl PgInterventionQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InterventionQueue for PgInterventionQueue {
    async fn enqueue(&self, key: &ActorKey, pattern: &StrugglePattern) -> anyhow::Result<()> {
        let payload = serde_json::json!({
            "student_id": key.student_id,
            "pattern": pattern,
        });
        sqlx::query(
            r#"
            INSERT INTO struggle.intervention_queue
            (id, student_id, course_id, payload, enqueued_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.student_id)
        .bind(&key.course_id)
        .bind(payload)
        .bind(pattern.detected_at)
        .execute(&self.pool)
        .await
        .context("failed to enqueue intervention request")?;
        Ok(())
    }
}

pub async fn fetch_recent_alerts(
    pool: &PgPool,
    course: Option<&str>,
    limit: i64,
) -> anyhow::Result<Vec<InstructorAlert>> {
    let mut query = String::from(
        "SELECT id, student_id, course_id, pattern_type, severity, evidence_count, \
         status, created_at, acknowledged_at, resolved_at \
         FROM struggle.instructor_alerts",
    );
    if course.is_some() {
        query.push_str(" WHERE course_id = $2");
    }
    query.push_str(" ORDER BY created_at DESC LIMIT $1");

    let mut rows = sqlx::query(&query).bind(limit.max(1));
    if let Some(value) = course {
        rows = rows.bind(value);
    }

    let records = rows.fetch_all(pool).await?;
    let mut alerts = Vec::new();

    for row in records {
        let pattern_raw: String = row.get("pattern_type");
        let status_raw: String = row.get("status");
        alerts.push(InstructorAlert {
            id: row.get("id"),
            student_id: row.get("student_id"),
            course_id: row.get("course_id"),
            pattern_type: PatternKind::parse(&pattern_raw)
                .ok_or_else(|| anyhow!("unknown pattern type {pattern_raw}"))?,
            severity: row.get("severity"),
            evidence_count: row.get("evidence_count"),
            status: AlertStatus::parse(&status_raw)
                .ok_or_else(|| anyhow!("unknown alert status {status_raw}"))?,
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            acknowledged_at: row.get("acknowledged_at"),
            resolved_at: row.get("resolved_at"),
        });
    }

    Ok(alerts)
}
