//! Test result persistence
//!
//! Every run attempt produces exactly one row here; rows are never
//! updated afterwards. Old rows are pruned by the maintenance tick.

use crate::db::models::{ResultStatus, TestResult};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Persist one outcome record.
pub async fn save_result(
    db: &SqlitePool,
    test_name: &str,
    value: Option<f64>,
    status: ResultStatus,
    readings_json: Option<String>,
) -> Result<TestResult> {
    let result = TestResult {
        guid: Uuid::new_v4().to_string(),
        test_name: test_name.to_string(),
        value,
        status,
        performed_at: Utc::now(),
        readings_json,
    };
    sqlx::query(
        r#"
        INSERT INTO test_results (guid, test_name, value, status, performed_at, readings_json)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&result.guid)
    .bind(&result.test_name)
    .bind(result.value)
    .bind(result.status.as_str())
    .bind(result.performed_at.to_rfc3339())
    .bind(&result.readings_json)
    .execute(db)
    .await?;
    Ok(result)
}

type ResultRow = (String, String, Option<f64>, String, String, Option<String>);

fn from_row(r: ResultRow) -> TestResult {
    TestResult {
        guid: r.0,
        test_name: r.1,
        value: r.2,
        status: ResultStatus::parse(&r.3).unwrap_or(ResultStatus::Failed),
        performed_at: DateTime::parse_from_rfc3339(&r.4)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        readings_json: r.5,
    }
}

/// Most recent results, newest first.
pub async fn recent_results(db: &SqlitePool, limit: i64) -> Result<Vec<TestResult>> {
    let rows: Vec<ResultRow> = sqlx::query_as(
        "SELECT guid, test_name, value, status, performed_at, readings_json \
         FROM test_results ORDER BY performed_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(db)
    .await?;
    Ok(rows.into_iter().map(from_row).collect())
}

/// The most recent result row, if any. Used to decide whether the mixer
/// needs an extra clean after sitting idle.
pub async fn last_result(db: &SqlitePool) -> Result<Option<TestResult>> {
    let row: Option<ResultRow> = sqlx::query_as(
        "SELECT guid, test_name, value, status, performed_at, readings_json \
         FROM test_results ORDER BY performed_at DESC LIMIT 1",
    )
    .fetch_optional(db)
    .await?;
    Ok(row.map(from_row))
}

/// Delete results older than the retention window. Returns rows removed.
pub async fn prune_older_than(db: &SqlitePool, days: i64) -> Result<u64> {
    let cutoff = Utc::now() - Duration::days(days);
    let done = sqlx::query("DELETE FROM test_results WHERE performed_at < ?")
        .bind(cutoff.to_rfc3339())
        .execute(db)
        .await?;
    Ok(done.rows_affected())
}
