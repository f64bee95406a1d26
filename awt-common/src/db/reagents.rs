//! Reagent inventory access

use crate::db::models::ReagentSlot;
use crate::{Error, Result};
use sqlx::SqlitePool;

type SlotRow = (String, Option<String>, i64, f64);

fn from_row(r: SlotRow) -> ReagentSlot {
    ReagentSlot {
        slot: r.0,
        reagent_name: r.1,
        has_agitator: r.2 != 0,
        remaining_ml: r.3,
    }
}

/// Fetch one slot by letter.
pub async fn get_slot(db: &SqlitePool, slot: &str) -> Result<ReagentSlot> {
    let row: Option<SlotRow> = sqlx::query_as(
        "SELECT slot, reagent_name, has_agitator, remaining_ml FROM reagent_slots WHERE slot = ?",
    )
    .bind(slot)
    .fetch_optional(db)
    .await?;
    row.map(from_row)
        .ok_or_else(|| Error::NotFound(format!("reagent slot {slot}")))
}

/// All slots in carousel order.
pub async fn all_slots(db: &SqlitePool) -> Result<Vec<ReagentSlot>> {
    let rows: Vec<SlotRow> = sqlx::query_as(
        "SELECT slot, reagent_name, has_agitator, remaining_ml FROM reagent_slots ORDER BY slot",
    )
    .fetch_all(db)
    .await?;
    Ok(rows.into_iter().map(from_row).collect())
}

/// Insert or replace a slot record.
pub async fn upsert_slot(db: &SqlitePool, slot: &ReagentSlot) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO reagent_slots (slot, reagent_name, has_agitator, remaining_ml)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (slot) DO UPDATE SET
            reagent_name = excluded.reagent_name,
            has_agitator = excluded.has_agitator,
            remaining_ml = excluded.remaining_ml
        "#,
    )
    .bind(&slot.slot)
    .bind(&slot.reagent_name)
    .bind(slot.has_agitator as i64)
    .bind(slot.remaining_ml)
    .execute(db)
    .await?;
    Ok(())
}

/// Record a dose against a slot: `remaining -= dispensed`, exactly.
///
/// Returns the new remaining amount so the caller can raise a
/// low-reagent alarm without re-reading.
pub async fn record_dose(db: &SqlitePool, slot: &str, dispensed_ml: f64) -> Result<f64> {
    let current = get_slot(db, slot).await?;
    let remaining = current.remaining_ml - dispensed_ml;
    sqlx::query("UPDATE reagent_slots SET remaining_ml = ? WHERE slot = ?")
        .bind(remaining)
        .bind(slot)
        .execute(db)
        .await?;
    Ok(remaining)
}
