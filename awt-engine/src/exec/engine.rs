//! Test execution engine
//!
//! Orchestrates a full run: preflight inventory check, gated reagent
//! steps, the measurement phase (titration, direct read or KH probe),
//! cleanup, and exactly one persisted result per attempt.

use awt_common::db::models::{ResultStatus, TestDefinition};
use awt_common::db::{jobs, reagents, results, tests, InstrumentSettings};
use tracing::{error, info, warn};

use super::{MeasureOutcome, RunCtx, RunError, RunOutcome, TestEngine};
use crate::hardware::{Device, Pump, Sensor, Station, WaterSource};
use crate::matcher;
use crate::state::SystemStatus;

impl<D: Device, S: Sensor> TestEngine<D, S> {
    /// Run one test end-to-end. Always leaves the system Idle with the
    /// agitator off, and always persists exactly one result row.
    pub async fn run_sequence(&self, name: &str) -> awt_common::Result<RunOutcome> {
        self.state.set_status(SystemStatus::RunningTest).await;
        self.state.clear_abort();
        self.state.set_current_test(Some(name.to_string())).await;
        info!("Running Test {name}");

        let outcome = self.run_inner(name).await;

        self.device.agitator_off().await;
        self.state.set_current_test(None).await;
        self.state.set_status(SystemStatus::Idle).await;
        outcome
    }

    async fn run_inner(&self, name: &str) -> awt_common::Result<RunOutcome> {
        let settings = InstrumentSettings::load(&self.db).await?;

        let ts = match tests::get_test(&self.db, name).await {
            Ok(ts) => ts,
            Err(e) => {
                error!("Cannot load test {name}: {e}");
                results::save_result(&self.db, name, None, ResultStatus::Failed, None).await?;
                return Ok(RunOutcome {
                    status: ResultStatus::Failed,
                    value: None,
                });
            }
        };
        let ctx = RunCtx {
            ts: &ts,
            settings: &settings,
        };

        if ts.kh_probe_test {
            self.run_kh_sequence(&ctx).await
        } else {
            self.run_carousel_sequence(&ctx).await
        }
    }

    async fn run_kh_sequence(&self, ctx: &RunCtx<'_>) -> awt_common::Result<RunOutcome> {
        let name = ctx.test_name();
        let Some(trit) = ctx.ts.titration.as_ref() else {
            error!("KH test {name} has no reagent block");
            return self.finish(ctx, ResultStatus::Failed, None, None).await;
        };

        if let Some(pre_fail) = self
            .preflight_slot(ctx, &trit.slot, "KH Reagent too low to start test")
            .await?
        {
            return self.finish(ctx, pre_fail, None, None).await;
        }
        if self.state.abort_requested() {
            return self.finish(ctx, ResultStatus::Aborted, None, None).await;
        }

        match self.run_kh_test(ctx).await {
            Ok((outcome, total_dosed)) => {
                if total_dosed > 0.0 {
                    self.record_dose(ctx, &trit.slot, total_dosed).await.ok();
                }
                match outcome.value {
                    Some(value) => {
                        if ctx.settings.send_measurement_reports {
                            self.notifier.measurement_report(name, value).await;
                        }
                        self.finish(ctx, ResultStatus::Completed, Some(value), None)
                            .await
                    }
                    None => {
                        self.notifier.evaluate_failure(name).await;
                        self.finish(ctx, ResultStatus::Failed, None, None).await
                    }
                }
            }
            Err(e) => {
                warn!("Failure when running KH test {name}: {e}");
                self.notifier.evaluate_failure(name).await;
                self.finish(ctx, ResultStatus::Failed, None, None).await
            }
        }
    }

    async fn run_carousel_sequence(&self, ctx: &RunCtx<'_>) -> awt_common::Result<RunOutcome> {
        let ts = ctx.ts;
        let name = ctx.test_name();

        if let Err(e) = self.device.home().await {
            warn!("Homing failed before test {name}: {e}");
        }

        // Preflight: every configured slot must clear the low-reagent
        // threshold before any hardware is touched.
        let mut pre_failed = false;
        for step in ts.active_steps() {
            if self
                .preflight_slot(ctx, &step.slot, "Reagent too low to start test")
                .await?
                .is_some()
            {
                pre_failed = true;
            }
        }
        if let Some(trit) = ts.titration.as_ref() {
            if self
                .preflight_slot(ctx, &trit.slot, "Titration reagent too low to start test")
                .await?
                .is_some()
            {
                pre_failed = true;
            }
        }
        if pre_failed {
            return self.finish(ctx, ResultStatus::Failed, None, None).await;
        }

        let mut steps_ok = true;
        let mut aborted = false;
        let mut water_vol = ts.water_volume_ml;
        for (index, step) in ts.reagent_steps.iter().enumerate() {
            // A configured step with nothing to dose halts the chain,
            // like an unconfigured one.
            if step.amount_ml <= 0.0 {
                break;
            }
            if index > 0 && self.state.abort_requested() {
                aborted = true;
                break;
            }
            match self.run_step(ctx, index + 1, water_vol, step).await {
                Ok(()) => water_vol = 0.0,
                Err(e) => {
                    warn!("Failure when running Test Step {}: {e}", index + 1);
                    steps_ok = false;
                    break;
                }
            }
        }
        aborted = aborted || self.state.abort_requested();

        let mut measure: Option<MeasureOutcome> = None;
        if steps_ok && !aborted {
            let phase = if ts.titration.is_some() {
                self.run_titration(ctx).await
            } else {
                self.direct_read(ctx).await
            };
            match phase {
                Ok(outcome) => {
                    match outcome.value {
                        Some(value) => {
                            if ctx.settings.send_measurement_reports {
                                self.notifier.measurement_report(name, value).await;
                            }
                            self.check_test_range(ctx, value).await;
                        }
                        None => self.notifier.evaluate_failure(name).await,
                    }
                    measure = Some(outcome);
                }
                Err(e) => {
                    warn!("Failure evaluating {name}: {e}");
                    self.notifier.evaluate_failure(name).await;
                }
            }
        }
        aborted = aborted || self.state.abort_requested();

        let (status, value, readings) = match &measure {
            Some(m) => {
                let readings = serde_json::to_string(&m.readings).ok();
                match m.value {
                    Some(v) => (ResultStatus::Completed, Some(v), readings),
                    None => (ResultStatus::Failed, None, readings),
                }
            }
            None if aborted && steps_ok => (ResultStatus::Aborted, None, None),
            None => (ResultStatus::Failed, None, None),
        };
        let outcome = self.finish(ctx, status, value, readings).await?;

        // Cleanup runs on every path that touched hardware: abort and
        // step failure included.
        if !jobs::any_due(&self.db, chrono::Utc::now()).await.unwrap_or(false) {
            match value {
                Some(v) => {
                    self.state
                        .set_test_status(format!("Result was: {v:.2} - Cleaning the Mixer"))
                        .await
                }
                None => self.state.set_test_status("Test Failed").await,
            }
        }
        self.clean_mixer(ctx, WaterSource::Osmosis).await;
        self.sleep_secs(1.0).await;
        if let Err(e) = self.device.home().await {
            warn!("Parking failed after test {name}: {e}");
        }
        info!("System Parked");

        Ok(outcome)
    }

    /// Inventory gate for one slot. Returns the pre-failure status when
    /// the slot is under the variant's threshold.
    async fn preflight_slot(
        &self,
        ctx: &RunCtx<'_>,
        slot: &str,
        message: &str,
    ) -> awt_common::Result<Option<ResultStatus>> {
        let threshold = ctx.settings.reagent_threshold_for(ctx.ts.kh_probe_test);
        let record = reagents::get_slot(&self.db, slot).await?;
        if record.remaining_ml < threshold {
            info!("{message} (slot {slot}, {:.2} mL left)", record.remaining_ml);
            self.notifier.reagent_low(slot, record.remaining_ml).await;
            return Ok(Some(ResultStatus::Failed));
        }
        Ok(None)
    }

    /// Persist the single result row for this attempt and set the final
    /// status line.
    async fn finish(
        &self,
        ctx: &RunCtx<'_>,
        status: ResultStatus,
        value: Option<f64>,
        readings_json: Option<String>,
    ) -> awt_common::Result<RunOutcome> {
        results::save_result(&self.db, ctx.test_name(), value, status, readings_json).await?;
        match value {
            Some(v) => {
                self.state
                    .set_test_status(format!("Done: Last Results: {v:.2}"))
                    .await
            }
            None => self.state.set_test_status("Test Failed").await,
        }
        Ok(RunOutcome { status, value })
    }

    /// Direct-read measurement: one general matcher evaluation after the
    /// configured settle time. The chamber is drained afterwards on both
    /// the success and the failure path.
    async fn direct_read(&self, ctx: &RunCtx<'_>) -> Result<MeasureOutcome, RunError> {
        let ts = ctx.ts;

        if ts.agitate_mixture_secs > 0 {
            if let Err(e) = self.device.raise_syringe().await {
                warn!("Could not raise syringe before agitation: {e}");
            }
            if let Err(e) = self.device.move_to(Station::MixerReactor).await {
                warn!("Could not move to mixer before agitation: {e}");
            }
            self.state
                .set_test_status(format!(
                    "Agitating the Mixture for {} secs.",
                    ts.agitate_mixture_secs
                ))
                .await;
            self.device.run_agitator(ts.agitate_mixture_secs as f64).await;
        }

        let wait = ts.delay_before_reading_secs as f64 - ts.agitate_mixture_secs as f64;
        if wait > 0.0 {
            self.state
                .set_test_status(format!("Waiting {wait} secs before reading mixture."))
                .await;
            self.sleep_secs(wait).await;
        }

        let evaluation: Result<MeasureOutcome, RunError> = async {
            let snapshot = self.load_snapshot(ctx).await?;
            let color = self
                .sensor
                .read_color()
                .await
                .map_err(|e| RunError::Evaluation(e.to_string()))?;
            let value = matcher::match_value(&snapshot, &color)?.max(0.0);
            info!("Result was: {value:.2}");
            self.state
                .set_test_status(format!("Test results are: {value:.2}"))
                .await;
            Ok(MeasureOutcome {
                value: Some(value),
                readings: vec![super::SwatchReading {
                    dispensed_ml: None,
                    value,
                    channel1: color.l,
                    channel2: color.a,
                    channel3: color.b,
                }],
            })
        }
        .await;

        self.sleep_secs(ctx.settings.pause_before_drain_secs as f64)
            .await;
        match &evaluation {
            Ok(outcome) => {
                self.state
                    .set_test_status(format!(
                        "Result was: {:.2} - Emptying chamber",
                        outcome.value.unwrap_or(0.0)
                    ))
                    .await
            }
            Err(_) => self.state.set_test_status("Test Failed").await,
        }
        if let Err(e) = self.device.run_pump(Pump::MainDrain, 6.0).await {
            warn!("Could not drain chamber: {e}");
        }
        evaluation
    }

    /// Out-of-limits checks: the alarm tier takes precedence, and an
    /// alarm suppresses the warning check for the same run. Low bounds
    /// are evaluated before high bounds.
    pub(crate) async fn check_test_range(&self, ctx: &RunCtx<'_>, value: f64) {
        let ts = ctx.ts;
        let name = ctx.test_name();
        let mut alarm_sent = false;

        if let Some(limit) = ts.too_low_alarm {
            if value <= limit {
                self.notifier.out_of_limits_alarm(name, value).await;
                alarm_sent = true;
            }
        }
        if !alarm_sent {
            if let Some(limit) = ts.too_low_warning {
                if value <= limit {
                    self.notifier.out_of_limits_warning(name, value).await;
                    alarm_sent = true;
                }
            }
        }
        if !alarm_sent {
            if let Some(limit) = ts.too_high_alarm {
                if value >= limit {
                    self.notifier.out_of_limits_alarm(name, value).await;
                    alarm_sent = true;
                }
            }
        }
        if !alarm_sent {
            if let Some(limit) = ts.too_high_warning {
                if value >= limit {
                    self.notifier.out_of_limits_warning(name, value).await;
                }
            }
        }
    }

    /// Convenience used by the queue consumer for disabled tests.
    pub async fn record_skipped(&self, name: &str) -> awt_common::Result<()> {
        results::save_result(&self.db, name, None, ResultStatus::Skipped, None).await?;
        Ok(())
    }
}

/// Validation shared by API and scheduler callers: a runnable test must
/// exist; the engine handles everything else.
pub fn validate_runnable(ts: &TestDefinition) -> Result<(), String> {
    if ts.kh_probe_test && ts.titration.is_none() {
        return Err(format!("KH test {} has no reagent block", ts.name));
    }
    Ok(())
}
