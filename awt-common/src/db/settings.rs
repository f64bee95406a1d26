//! Instrument settings
//!
//! Key-value settings with typed accessors. Configuration is
//! database-first: a missing key is written back with its default on
//! first read, so a fresh database self-populates.

use crate::Result;
use sqlx::SqlitePool;
use std::str::FromStr;

/// Read a setting, parsed from its stored TEXT value.
pub async fn get_setting<T: FromStr>(db: &SqlitePool, key: &str) -> Result<Option<T>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?;
    Ok(row.and_then(|(v,)| v.parse().ok()))
}

/// Write a setting, replacing any previous value.
pub async fn set_setting<T: ToString>(db: &SqlitePool, key: &str, value: T) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await?;
    Ok(())
}

async fn get_or_init<T: FromStr + ToString + Clone>(
    db: &SqlitePool,
    key: &str,
    default: T,
) -> Result<T> {
    match get_setting::<T>(db, key).await? {
        Some(v) => Ok(v),
        None => {
            set_setting(db, key, default.clone()).await?;
            Ok(default)
        }
    }
}

/// Process-wide instrument configuration, loaded fresh at the start of
/// every run so operator edits take effect between tests.
#[derive(Debug, Clone)]
pub struct InstrumentSettings {
    pub instrument_name: String,
    /// Low-reagent alarm threshold for carousel tests (mL)
    pub reagent_alarm_threshold_ml: f64,
    /// Low-reagent alarm threshold for the KH tester (mL)
    pub reagent_alarm_threshold_kh_ml: f64,
    pub reagent_alarm_enabled: bool,
    /// Water pushed through the mixer per clean cycle (mL)
    pub mixer_clean_ml: f64,
    pub mixer_clean_cycles: u32,
    /// Idle hours after which the mixer gets a double clean
    pub extra_clean_after_hours: i64,
    /// Pause between evaluation and draining the chamber (seconds)
    pub pause_before_drain_secs: u64,
    pub days_of_results_to_keep: i64,
    pub send_measurement_reports: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: i64,
}

impl InstrumentSettings {
    pub async fn load(db: &SqlitePool) -> Result<Self> {
        let token = get_or_init(db, "telegram_bot_token", "None".to_string()).await?;
        Ok(Self {
            instrument_name: get_or_init(db, "instrument_name", "AutoTester".to_string()).await?,
            reagent_alarm_threshold_ml: get_or_init(db, "reagent_alarm_threshold_ml", 5.0).await?,
            reagent_alarm_threshold_kh_ml: get_or_init(db, "reagent_alarm_threshold_kh_ml", 50.0)
                .await?,
            reagent_alarm_enabled: get_or_init(db, "reagent_alarm_enabled", true).await?,
            mixer_clean_ml: get_or_init(db, "mixer_clean_ml", 8.0).await?,
            mixer_clean_cycles: get_or_init(db, "mixer_clean_cycles", 2u32).await?,
            extra_clean_after_hours: get_or_init(db, "extra_clean_after_hours", 2i64).await?,
            pause_before_drain_secs: get_or_init(db, "pause_before_drain_secs", 10u64).await?,
            days_of_results_to_keep: get_or_init(db, "days_of_results_to_keep", 100i64).await?,
            send_measurement_reports: get_or_init(db, "send_measurement_reports", false).await?,
            telegram_bot_token: if token == "None" || token.is_empty() {
                None
            } else {
                Some(token)
            },
            telegram_chat_id: get_or_init(db, "telegram_chat_id", 0i64).await?,
        })
    }

    /// Threshold applicable to the given test variant.
    pub fn reagent_threshold_for(&self, kh_probe_test: bool) -> f64 {
        if kh_probe_test {
            self.reagent_alarm_threshold_kh_ml
        } else {
            self.reagent_alarm_threshold_ml
        }
    }
}
