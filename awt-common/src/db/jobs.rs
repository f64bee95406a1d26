//! Job queue persistence
//!
//! Jobs move Queued -> Running -> deleted; completion is recorded in
//! `test_results`, never on the job row itself.

use crate::db::models::{Job, JobCause, JobStatus};
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Queue a test invocation, due immediately.
pub async fn enqueue(db: &SqlitePool, test_name: &str, cause: JobCause) -> Result<Job> {
    enqueue_at(db, test_name, cause, Utc::now()).await
}

/// Queue a test invocation that becomes due at `queued_at`.
pub async fn enqueue_at(
    db: &SqlitePool,
    test_name: &str,
    cause: JobCause,
    queued_at: DateTime<Utc>,
) -> Result<Job> {
    let job = Job {
        guid: Uuid::new_v4().to_string(),
        test_name: test_name.to_string(),
        status: JobStatus::Queued,
        cause,
        queued_at,
    };
    sqlx::query(
        "INSERT INTO jobs (guid, test_name, status, cause, queued_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&job.guid)
    .bind(&job.test_name)
    .bind(job.status.as_str())
    .bind(job.cause.as_str())
    .bind(job.queued_at.to_rfc3339())
    .execute(db)
    .await?;
    Ok(job)
}

type JobRow = (String, String, String, String, String);

fn from_row(r: JobRow) -> Job {
    Job {
        guid: r.0,
        test_name: r.1,
        status: if r.2 == "Running" {
            JobStatus::Running
        } else {
            JobStatus::Queued
        },
        cause: JobCause::parse(&r.3).unwrap_or(JobCause::Manual),
        queued_at: DateTime::parse_from_rfc3339(&r.4)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    }
}

/// Oldest queued job whose timestamp has come due. Future-dated jobs are
/// never returned.
pub async fn next_due(db: &SqlitePool, now: DateTime<Utc>) -> Result<Option<Job>> {
    let row: Option<JobRow> = sqlx::query_as(
        "SELECT guid, test_name, status, cause, queued_at FROM jobs \
         WHERE status = 'Queued' AND queued_at <= ? \
         ORDER BY queued_at ASC LIMIT 1",
    )
    .bind(now.to_rfc3339())
    .fetch_optional(db)
    .await?;
    Ok(row.map(from_row))
}

/// Whether any queued job is currently due.
pub async fn any_due(db: &SqlitePool, now: DateTime<Utc>) -> Result<bool> {
    Ok(next_due(db, now).await?.is_some())
}

pub async fn mark_running(db: &SqlitePool, guid: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = 'Running' WHERE guid = ?")
        .bind(guid)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn delete(db: &SqlitePool, guid: &str) -> Result<()> {
    sqlx::query("DELETE FROM jobs WHERE guid = ?")
        .bind(guid)
        .execute(db)
        .await?;
    Ok(())
}

/// Drop every Running job. Called after each run and at startup so a
/// crash mid-test never wedges the queue.
pub async fn clear_running(db: &SqlitePool) -> Result<()> {
    sqlx::query("DELETE FROM jobs WHERE status = 'Running'")
        .execute(db)
        .await?;
    Ok(())
}

/// All jobs, oldest first. For the status API.
pub async fn all_jobs(db: &SqlitePool) -> Result<Vec<Job>> {
    let rows: Vec<JobRow> = sqlx::query_as(
        "SELECT guid, test_name, status, cause, queued_at FROM jobs ORDER BY queued_at ASC",
    )
    .fetch_all(db)
    .await?;
    Ok(rows.into_iter().map(from_row).collect())
}
