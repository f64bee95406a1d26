//! Swatch calibration table access
//!
//! Calibration workflows write rows; a run loads them once into an
//! immutable snapshot, so edits made mid-run are only seen by the next
//! run.

use crate::db::models::SwatchEntry;
use crate::Result;
use sqlx::SqlitePool;

type SwatchRow = (String, i64, String, i64, f64, f64, f64, f64);

fn from_row(r: SwatchRow) -> SwatchEntry {
    SwatchEntry {
        sheet: r.0,
        row: r.1,
        lighting: r.2,
        enabled: r.3 != 0,
        channel1: r.4,
        channel2: r.5,
        channel3: r.6,
        value: r.7,
    }
}

/// All entries of one color sheet, ordered by lighting then row.
pub async fn load_sheet(db: &SqlitePool, sheet: &str) -> Result<Vec<SwatchEntry>> {
    let rows: Vec<SwatchRow> = sqlx::query_as(
        "SELECT sheet, row, lighting, enabled, channel1, channel2, channel3, value \
         FROM swatches WHERE sheet = ? ORDER BY lighting, row",
    )
    .bind(sheet)
    .fetch_all(db)
    .await?;
    Ok(rows.into_iter().map(from_row).collect())
}

/// Insert or replace one calibration point.
pub async fn upsert_entry(db: &SqlitePool, entry: &SwatchEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO swatches (sheet, row, lighting, enabled, channel1, channel2, channel3, value)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (sheet, lighting, row) DO UPDATE SET
            enabled = excluded.enabled,
            channel1 = excluded.channel1,
            channel2 = excluded.channel2,
            channel3 = excluded.channel3,
            value = excluded.value
        "#,
    )
    .bind(&entry.sheet)
    .bind(entry.row)
    .bind(&entry.lighting)
    .bind(entry.enabled as i64)
    .bind(entry.channel1)
    .bind(entry.channel2)
    .bind(entry.channel3)
    .bind(entry.value)
    .execute(db)
    .await?;
    Ok(())
}
