use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::assembly::types::{ItemId, SubjectId};
use crate::db::models::{DeviceMeta, ExamSession, SessionCounters, SessionReport};
use crate::db::store::{SaveOutcome, StoreError};

const SESSION_COLUMNS: &str = r#""id", "learnerFingerprint", "subjectId", "startTime", "endTime",
    "contentItemIds", "answers", "isSubmitted", "score", "report", "deviceMeta",
    "pdfDownloadCount", "shareCount", "degraded""#;

pub async fn find_active_session(
    pool: &PgPool,
    fingerprint: &str,
    subject_id: SubjectId,
) -> Result<Option<ExamSession>, StoreError> {
    let sql = format!(
        r#"
        SELECT {SESSION_COLUMNS}
        FROM "exam_sessions"
        WHERE "learnerFingerprint" = $1 AND "subjectId" = $2 AND "isSubmitted" = FALSE
        ORDER BY "startTime" DESC
        LIMIT 1
        "#
    );
    let row = sqlx::query(&sql)
        .bind(fingerprint)
        .bind(subject_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(map_session).transpose()
}

pub async fn get_session(pool: &PgPool, session_id: &str) -> Result<Option<ExamSession>, StoreError> {
    let sql = format!(r#"SELECT {SESSION_COLUMNS} FROM "exam_sessions" WHERE "id" = $1"#);
    let row = sqlx::query(&sql).bind(session_id).fetch_optional(pool).await?;

    row.as_ref().map(map_session).transpose()
}

pub async fn insert_session(pool: &PgPool, session: &ExamSession) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO "exam_sessions" (
            "id", "learnerFingerprint", "subjectId", "startTime", "endTime",
            "contentItemIds", "answers", "isSubmitted", "score", "report", "deviceMeta",
            "pdfDownloadCount", "shareCount", "degraded", "createdAt"
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW())
        "#,
    )
    .bind(&session.id)
    .bind(&session.learner_fingerprint)
    .bind(session.subject_id)
    .bind(session.start_time)
    .bind(session.end_time)
    .bind(&session.content_item_ids)
    .bind(Json(&session.answers))
    .bind(session.is_submitted)
    .bind(session.score)
    .bind(session.report.as_ref().map(Json))
    .bind(Json(&session.device_meta))
    .bind(session.counters.pdf_download_count)
    .bind(session.counters.share_count)
    .bind(session.degraded)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Conflict {
            fingerprint: session.learner_fingerprint.clone(),
            subject_id: session.subject_id,
        }),
        Err(err) => Err(err.into()),
    }
}

pub async fn update_device_meta(
    pool: &PgPool,
    session_id: &str,
    meta: &DeviceMeta,
) -> Result<(), StoreError> {
    sqlx::query(r#"UPDATE "exam_sessions" SET "deviceMeta" = $2 WHERE "id" = $1"#)
        .bind(session_id)
        .bind(Json(meta))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn close_session(
    pool: &PgPool,
    session_id: &str,
    end_time: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE "exam_sessions"
        SET "isSubmitted" = TRUE, "endTime" = $2
        WHERE "id" = $1 AND "isSubmitted" = FALSE
        "#,
    )
    .bind(session_id)
    .bind(end_time)
    .execute(pool)
    .await?;
    Ok(())
}

/// Overwrites the answer map unless the session was already submitted.
pub async fn save_answers(
    pool: &PgPool,
    session_id: &str,
    answers: &BTreeMap<ItemId, String>,
) -> Result<SaveOutcome, StoreError> {
    let sql = format!(
        r#"
        UPDATE "exam_sessions"
        SET "answers" = $2
        WHERE "id" = $1 AND "isSubmitted" = FALSE
        RETURNING {SESSION_COLUMNS}
        "#
    );
    let row = sqlx::query(&sql)
        .bind(session_id)
        .bind(Json(answers))
        .fetch_optional(pool)
        .await?;

    if let Some(row) = row {
        return Ok(SaveOutcome::Saved(map_session(&row)?));
    }

    Ok(match get_session(pool, session_id).await? {
        Some(session) => SaveOutcome::Submitted(session),
        None => SaveOutcome::Missing,
    })
}

pub async fn complete_session(
    pool: &PgPool,
    session_id: &str,
    end_time: DateTime<Utc>,
    report: &SessionReport,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE "exam_sessions"
        SET "isSubmitted" = TRUE, "endTime" = $2, "score" = $3, "report" = $4
        WHERE "id" = $1 AND "isSubmitted" = FALSE
        "#,
    )
    .bind(session_id)
    .bind(end_time)
    .bind(report.score)
    .bind(Json(report))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn recent_submitted_sessions(
    pool: &PgPool,
    fingerprint: &str,
    subject_id: SubjectId,
    limit: usize,
) -> Result<Vec<ExamSession>, StoreError> {
    let sql = format!(
        r#"
        SELECT {SESSION_COLUMNS}
        FROM "exam_sessions"
        WHERE "learnerFingerprint" = $1 AND "subjectId" = $2 AND "isSubmitted" = TRUE
        ORDER BY "startTime" DESC
        LIMIT $3
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(fingerprint)
        .bind(subject_id)
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;

    rows.iter().map(map_session).collect()
}

fn map_session(row: &PgRow) -> Result<ExamSession, StoreError> {
    let answers: Json<BTreeMap<ItemId, String>> = row.try_get("answers")?;
    let report: Option<Json<SessionReport>> = row.try_get("report")?;
    let device_meta: Json<DeviceMeta> = row.try_get("deviceMeta")?;

    Ok(ExamSession {
        id: row.try_get("id")?,
        learner_fingerprint: row.try_get("learnerFingerprint")?,
        subject_id: row.try_get("subjectId")?,
        start_time: row.try_get("startTime")?,
        end_time: row.try_get("endTime")?,
        content_item_ids: row.try_get("contentItemIds")?,
        answers: answers.0,
        is_submitted: row.try_get("isSubmitted")?,
        score: row.try_get("score")?,
        report: report.map(|r| r.0),
        device_meta: device_meta.0,
        counters: SessionCounters {
            pdf_download_count: row.try_get("pdfDownloadCount")?,
            share_count: row.try_get("shareCount")?,
        },
        degraded: row.try_get("degraded")?,
    })
}
