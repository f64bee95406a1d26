//! Shared fixtures for engine integration tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use awt_common::alarms::Notifier;
use awt_common::db::models::{ReagentSlot, ReagentStep, SwatchEntry, TestDefinition, TitrationSpec};
use awt_common::db::{self, init_database};
use sqlx::SqlitePool;
use tempfile::TempDir;

use awt_engine::exec::TestEngine;
use awt_engine::hardware::sim::{SimDevice, SimSensor};
use awt_engine::state::{SharedState, SystemStatus};

pub async fn test_db() -> (TempDir, SqlitePool) {
    let dir = TempDir::new().expect("temp dir");
    // These tests run under `#[tokio::test(start_paused = true)]`. With the
    // clock paused, tokio auto-advances past the sqlx pool's acquire timeout
    // while the initial SQLite connection is opened on a blocking thread,
    // yielding `PoolTimedOut`. Open the pool with the clock running, then
    // re-pause so the rest of the test keeps its simulated-time fast-forward.
    tokio::time::resume();
    let pool = init_database(&dir.path().join("tester.db"))
        .await
        .expect("init database");
    tokio::time::pause();
    (dir, pool)
}

pub struct Bench {
    pub engine: TestEngine<SimDevice, SimSensor>,
    pub device: SimDevice,
    pub sensor: SimSensor,
    pub state: Arc<SharedState>,
    pub alarms: Arc<Mutex<Vec<String>>>,
}

pub async fn bench(db: &SqlitePool) -> Bench {
    let device = SimDevice::new();
    let sensor = SimSensor::new();
    let state = Arc::new(SharedState::new());
    state.set_status(SystemStatus::Idle).await;
    let (notifier, alarms) = Notifier::capture("AutoTester");
    let engine = TestEngine::new(
        db.clone(),
        device.clone(),
        sensor.clone(),
        Arc::clone(&state),
        notifier,
    );
    Bench {
        engine,
        device,
        sensor,
        state,
        alarms,
    }
}

impl Bench {
    pub fn alarm_count(&self, needle: &str) -> usize {
        self.alarms
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.contains(needle))
            .count()
    }
}

pub fn step(slot: &str, amount_ml: f64) -> ReagentStep {
    ReagentStep {
        slot: slot.into(),
        amount_ml,
        agitate_secs: 0,
        agitate_mixer_secs: 0,
        agitate_between_drips_secs: 0,
        thick_liquid: false,
    }
}

/// Minimal direct-read definition: one reagent step, a color chart, no
/// titration.
pub fn direct_read_test(name: &str, chart: &str) -> TestDefinition {
    TestDefinition {
        name: name.into(),
        enabled: true,
        kh_probe_test: false,
        water_volume_ml: 5.0,
        reagent_steps: vec![step("A", 0.5)],
        agitate_mixture_secs: 0,
        delay_before_reading_secs: 0,
        titration: None,
        color_chart: Some(chart.into()),
        too_low_alarm: None,
        too_low_warning: None,
        too_high_warning: None,
        too_high_alarm: None,
    }
}

pub fn titration_spec(slot: &str, max_amount_ml: f64, calc_to_value: f64) -> TitrationSpec {
    TitrationSpec {
        slot: slot.into(),
        agitate_secs: 0,
        agitate_mixer_secs: 0.0,
        transition: 0.5,
        max_amount_ml,
        first_skip_ml: 0.0,
        calc_to_value,
    }
}

pub async fn seed_slot(db: &SqlitePool, slot: &str, remaining_ml: f64) {
    db::reagents::upsert_slot(
        db,
        &ReagentSlot {
            slot: slot.into(),
            reagent_name: Some(format!("reagent {slot}")),
            has_agitator: false,
            remaining_ml,
        },
    )
    .await
    .expect("seed slot");
}

/// Two-point sheet: (0,0,0) -> 0 and (10,0,0) -> 1. The binary matcher
/// over it reads 0 at black and 1 at the endpoint color.
pub async fn seed_binary_sheet(db: &SqlitePool, sheet: &str) {
    for (row, l, value) in [(1, 0.0, 0.0), (2, 10.0, 1.0)] {
        db::swatches::upsert_entry(
            db,
            &SwatchEntry {
                sheet: sheet.into(),
                row,
                lighting: "LED".into(),
                enabled: true,
                channel1: l,
                channel2: 0.0,
                channel3: 0.0,
                value,
            },
        )
        .await
        .expect("seed swatch");
    }
}

/// Sheet used by direct reads: (0,0,0) -> 0 and (100,0,0) -> 5.
pub async fn seed_direct_sheet(db: &SqlitePool, sheet: &str) {
    for (row, l, value) in [(1, 0.0, 0.0), (2, 100.0, 5.0)] {
        db::swatches::upsert_entry(
            db,
            &SwatchEntry {
                sheet: sheet.into(),
                row,
                lighting: "LED".into(),
                enabled: true,
                channel1: l,
                channel2: 0.0,
                channel3: 0.0,
                value,
            },
        )
        .await
        .expect("seed swatch");
    }
}

/// A fresh result row so the engine does not decide the mixer sat idle
/// long enough for the extra clean cycles.
pub async fn seed_recent_result(db: &SqlitePool) {
    db::results::save_result(
        db,
        "warmup",
        Some(1.0),
        awt_common::db::models::ResultStatus::Completed,
        None,
    )
    .await
    .expect("seed result");
}
