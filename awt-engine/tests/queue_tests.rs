//! Queue consumer dequeue discipline.

mod support;

use awt_common::db::models::{JobCause, JobStatus, ResultStatus};
use awt_common::db::{self, jobs, results};
use awt_engine::queue::next_runnable;
use chrono::{Duration, Utc};
use support::*;

#[tokio::test(start_paused = true)]
async fn future_jobs_are_never_dequeued() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    db::tests::upsert_test(&db, &direct_read_test("PH", "chart"))
        .await
        .unwrap();
    jobs::enqueue_at(&db, "PH", JobCause::Scheduled, Utc::now() + Duration::hours(1))
        .await
        .unwrap();

    let job = next_runnable(&db, &bench.engine).await.unwrap();
    assert!(job.is_none());
    // The job stays queued for later
    assert_eq!(jobs::all_jobs(&db).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn disabled_test_job_is_skipped_without_hardware() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    let mut ts = direct_read_test("PH", "chart");
    ts.enabled = false;
    db::tests::upsert_test(&db, &ts).await.unwrap();
    jobs::enqueue(&db, "PH", JobCause::Manual).await.unwrap();

    let job = next_runnable(&db, &bench.engine).await.unwrap();
    assert!(job.is_none());

    // Job deleted, Skipped recorded, nothing moved
    assert!(jobs::all_jobs(&db).await.unwrap().is_empty());
    let rows = results::recent_results(&db, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ResultStatus::Skipped);
    assert_eq!(rows[0].test_name, "PH");
    assert!(bench.device.journal().is_empty());
}

#[tokio::test(start_paused = true)]
async fn runnable_job_is_marked_running() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    db::tests::upsert_test(&db, &direct_read_test("PH", "chart"))
        .await
        .unwrap();
    jobs::enqueue(&db, "PH", JobCause::Manual).await.unwrap();

    let job = next_runnable(&db, &bench.engine).await.unwrap().unwrap();
    assert_eq!(job.test_name, "PH");

    let all = jobs::all_jobs(&db).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, JobStatus::Running);

    // And completion clears it
    jobs::clear_running(&db).await.unwrap();
    assert!(jobs::all_jobs(&db).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn oldest_due_job_runs_first() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    db::tests::upsert_test(&db, &direct_read_test("PH", "chart"))
        .await
        .unwrap();
    db::tests::upsert_test(&db, &direct_read_test("KH", "chart"))
        .await
        .unwrap();
    jobs::enqueue_at(&db, "KH", JobCause::Manual, Utc::now() - Duration::minutes(5))
        .await
        .unwrap();
    jobs::enqueue_at(&db, "PH", JobCause::Manual, Utc::now() - Duration::minutes(9))
        .await
        .unwrap();

    let job = next_runnable(&db, &bench.engine).await.unwrap().unwrap();
    assert_eq!(job.test_name, "PH");
}
