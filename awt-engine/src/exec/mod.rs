//! Test execution
//!
//! The [`TestEngine`] owns one full run: sequencing reagent steps,
//! titration or direct-read or KH-probe measurement, cleanup and result
//! persistence. Step failures are explicit [`RunError`] values carried
//! up to the run level; alarms fire at the failure site.

mod engine;
mod kh;
mod steps;
mod titration;

pub use engine::validate_runnable;

use std::sync::Arc;

use awt_common::alarms::Notifier;
use awt_common::db::models::{ResultStatus, TestDefinition};
use awt_common::db::InstrumentSettings;
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::hardware::{Device, DeviceError, DeviceResult, Sensor};
use crate::matcher::MatchError;
use crate::state::SharedState;

/// Overdraw applied when filling the syringe, settled back before dosing.
pub(crate) const SYRINGE_TOLERANCE_ML: f64 = 0.03;

/// One evaluated reading kept for the diagnostics strip.
#[derive(Debug, Clone, Serialize)]
pub struct SwatchReading {
    /// Total dispensed when the reading was taken; None for direct reads
    pub dispensed_ml: Option<f64>,
    pub value: f64,
    pub channel1: f64,
    pub channel2: f64,
    pub channel3: f64,
}

/// What the measurement phase produced. `value: None` with readings
/// means the titration exhausted its budget without a transition.
#[derive(Debug, Clone, Default)]
pub struct MeasureOutcome {
    pub value: Option<f64>,
    pub readings: Vec<SwatchReading>,
}

/// Final disposition of one run attempt.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: ResultStatus,
    pub value: Option<f64>,
}

#[derive(Debug, Error)]
pub enum RunError {
    /// A movement, fill or dose never confirmed. The targeted alarm has
    /// already fired by the time this propagates.
    #[error("hardware: {0}")]
    Hardware(#[from] DeviceError),

    #[error(transparent)]
    Db(#[from] awt_common::Error),

    /// Sensor or matcher failure during evaluation.
    #[error("evaluation: {0}")]
    Evaluation(String),
}

impl From<MatchError> for RunError {
    fn from(e: MatchError) -> Self {
        RunError::Evaluation(e.to_string())
    }
}

/// Per-run context: the definition under execution plus the settings
/// snapshot loaded when the run started.
pub(crate) struct RunCtx<'a> {
    pub ts: &'a TestDefinition,
    pub settings: &'a InstrumentSettings,
}

impl RunCtx<'_> {
    pub fn test_name(&self) -> &str {
        &self.ts.name
    }
}

/// Round to 2 decimals, the reporting precision of every result.
pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Sequence-driven state machine that runs a test end-to-end against
/// one device and one sensor backend.
pub struct TestEngine<D: Device, S: Sensor> {
    pub(crate) db: SqlitePool,
    pub(crate) device: D,
    pub(crate) sensor: S,
    pub(crate) state: Arc<SharedState>,
    pub(crate) notifier: Notifier,
}

impl<D: Device, S: Sensor> TestEngine<D, S> {
    pub fn new(
        db: SqlitePool,
        device: D,
        sensor: S,
        state: Arc<SharedState>,
        notifier: Notifier,
    ) -> Self {
        Self {
            db,
            device,
            sensor,
            state,
            notifier,
        }
    }

    pub fn shared_state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    pub fn db_pool(&self) -> SqlitePool {
        self.db.clone()
    }

    /// Check a motion confirmation; a failure raises the rotate alarm
    /// naming the slot and test before propagating.
    pub(crate) async fn motion(
        &self,
        result: DeviceResult<()>,
        slot: &str,
        test_name: &str,
    ) -> Result<(), RunError> {
        if let Err(e) = result {
            tracing::warn!("Motion failure at slot {slot} during {test_name}: {e}");
            self.notifier.rotate_failure(slot, test_name).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Check a syringe fill/dose confirmation; failure raises the fill
    /// alarm before propagating.
    pub(crate) async fn syringe(
        &self,
        result: DeviceResult<()>,
        slot: &str,
        test_name: &str,
    ) -> Result<(), RunError> {
        if let Err(e) = result {
            tracing::warn!("Syringe failure at slot {slot} during {test_name}: {e}");
            self.notifier.syringe_fill_failure(slot, test_name).await;
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) async fn sleep_secs(&self, secs: f64) {
        if secs > 0.0 {
            tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
        }
    }
}
