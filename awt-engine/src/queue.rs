//! Job queue consumer
//!
//! Single-consumer loop over the persisted job queue: dequeue the
//! oldest due job when the instrument is Idle, run it synchronously,
//! delete it. Disabled tests are recorded as Skipped without touching
//! hardware. Errors never kill the loop.

use std::sync::Arc;
use std::time::Duration;

use awt_common::db::models::Job;
use awt_common::db::{jobs, tests};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{error, info};

use crate::exec::TestEngine;
use crate::hardware::{Device, Sensor};
use crate::state::{SharedState, SystemStatus};

const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Dequeue the oldest due runnable job, skipping (and recording) jobs
/// whose test is disabled. The returned job is already marked Running.
pub async fn next_runnable<D: Device, S: Sensor>(
    db: &SqlitePool,
    engine: &TestEngine<D, S>,
) -> awt_common::Result<Option<Job>> {
    loop {
        let Some(job) = jobs::next_due(db, Utc::now()).await? else {
            return Ok(None);
        };
        let enabled = tests::get_test(db, &job.test_name)
            .await
            .map(|t| t.enabled)
            .unwrap_or(false);
        if !enabled {
            info!(
                "Job {} skipped since test disabled or missing",
                job.test_name
            );
            engine.record_skipped(&job.test_name).await?;
            jobs::delete(db, &job.guid).await?;
            continue;
        }
        jobs::mark_running(db, &job.guid).await?;
        return Ok(Some(job));
    }
}

/// Long-running consumer task. Gates on `systemStatus == Idle` so at
/// most one test or diagnostic executes at a time system-wide.
pub async fn run_consumer<D: Device, S: Sensor>(engine: Arc<TestEngine<D, S>>) {
    let state: Arc<SharedState> = engine.shared_state();
    let db = engine.db_pool();
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        if state.status().await != SystemStatus::Idle {
            continue;
        }
        let job = match next_runnable(&db, &engine).await {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(e) => {
                error!("Error in test runner: {e}");
                continue;
            }
        };
        match engine.run_sequence(&job.test_name).await {
            Ok(outcome) => info!(
                "Job {} finished: {:?} ({:?})",
                job.test_name, outcome.status, outcome.value
            ),
            Err(e) => error!("Job {} errored: {e}", job.test_name),
        }
        state.clear_abort();
        if let Err(e) = jobs::clear_running(&db).await {
            error!("Could not clear running jobs: {e}");
        }
    }
}
