//! Database initialization
//!
//! Creates the SQLite database on first run and brings the schema up to
//! date. All statements are idempotent, so startup can call this
//! unconditionally.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize the database connection pool and create tables if needed.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL keeps the queue consumer and the HTTP handlers from blocking
    // each other on writes.
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_settings_table(&pool).await?;
    create_reagent_slots_table(&pool).await?;
    create_test_definitions_table(&pool).await?;
    create_swatches_table(&pool).await?;
    create_test_results_table(&pool).await?;
    create_jobs_table(&pool).await?;
    create_test_schedules_table(&pool).await?;

    Ok(pool)
}

async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_reagent_slots_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reagent_slots (
            slot TEXT PRIMARY KEY,
            reagent_name TEXT,
            has_agitator INTEGER NOT NULL DEFAULT 0,
            remaining_ml REAL NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_test_definitions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS test_definitions (
            name TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 1,
            kh_probe_test INTEGER NOT NULL DEFAULT 0,
            water_volume_ml REAL NOT NULL DEFAULT 5.0,
            reagent1_slot TEXT,
            reagent1_amount_ml REAL,
            reagent1_agitate_secs INTEGER,
            reagent1_agitate_mixer_secs INTEGER,
            reagent1_agitate_between_drips_secs INTEGER,
            reagent1_thick_liquid INTEGER,
            reagent2_slot TEXT,
            reagent2_amount_ml REAL,
            reagent2_agitate_secs INTEGER,
            reagent2_agitate_mixer_secs INTEGER,
            reagent2_agitate_between_drips_secs INTEGER,
            reagent2_thick_liquid INTEGER,
            reagent3_slot TEXT,
            reagent3_amount_ml REAL,
            reagent3_agitate_secs INTEGER,
            reagent3_agitate_mixer_secs INTEGER,
            reagent3_agitate_between_drips_secs INTEGER,
            reagent3_thick_liquid INTEGER,
            agitate_mixture_secs INTEGER NOT NULL DEFAULT 0,
            delay_before_reading_secs INTEGER NOT NULL DEFAULT 0,
            titration_slot TEXT,
            titration_agitate_secs INTEGER,
            titration_agitate_mixer_secs REAL,
            titration_transition REAL,
            titration_max_amount_ml REAL,
            titration_first_skip_ml REAL,
            calc_to_value REAL,
            color_chart TEXT,
            too_low_alarm REAL,
            too_low_warning REAL,
            too_high_warning REAL,
            too_high_alarm REAL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_swatches_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS swatches (
            sheet TEXT NOT NULL,
            row INTEGER NOT NULL,
            lighting TEXT NOT NULL DEFAULT 'LED',
            enabled INTEGER NOT NULL DEFAULT 1,
            channel1 REAL NOT NULL DEFAULT 0,
            channel2 REAL NOT NULL DEFAULT 0,
            channel3 REAL NOT NULL DEFAULT 0,
            value REAL NOT NULL DEFAULT 0,
            PRIMARY KEY (sheet, lighting, row)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_test_results_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS test_results (
            guid TEXT PRIMARY KEY,
            test_name TEXT NOT NULL,
            value REAL,
            status TEXT NOT NULL,
            performed_at TEXT NOT NULL,
            readings_json TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_test_results_performed_at \
         ON test_results (performed_at)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            guid TEXT PRIMARY KEY,
            test_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'Queued',
            cause TEXT NOT NULL DEFAULT 'Manual',
            queued_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_test_schedules_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS test_schedules (
            test_name TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 1,
            days_to_run TEXT NOT NULL DEFAULT 'Never',
            hours_json TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
