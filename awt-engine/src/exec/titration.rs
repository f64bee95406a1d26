//! Titration controller
//!
//! Adaptive incremental dosing until the binary color matcher reports a
//! transition. Dose accounting runs in integer centi-milliliters (the
//! 0.01 mL unit dose) so a long loop never drifts off the budget.

use awt_common::db::models::TitrationSpec;
use awt_common::db::swatches;
use tracing::{info, warn};

use super::{round2, MeasureOutcome, RunCtx, RunError, SwatchReading, TestEngine, SYRINGE_TOLERANCE_ML};
use crate::hardware::{Device, LowerTarget, Pump, Sensor, Station};
use crate::matcher::{self, SwatchSnapshot};

/// Unused syringe content above this goes back to the source reagent.
const RETURN_THRESHOLD_CML: i64 = 2;

struct DoseState {
    /// Total expelled into the mixture so far (centi-mL)
    dispensed_cml: i64,
    /// Withdrawn but not yet dispensed (centi-mL)
    in_syringe_cml: i64,
    readings: Vec<SwatchReading>,
    /// Dispensed amount at the first transition crossing
    transition_cml: Option<i64>,
}

impl<D: Device, S: Sensor> TestEngine<D, S> {
    /// Run the titration measurement phase. Dosing errors propagate
    /// (with their alarm already fired); cleanup after evaluation is
    /// best-effort so the computed outcome survives.
    pub(crate) async fn run_titration(
        &self,
        ctx: &RunCtx<'_>,
    ) -> Result<MeasureOutcome, RunError> {
        let ts = ctx
            .ts
            .titration
            .as_ref()
            .ok_or_else(|| RunError::Evaluation("no titration step configured".into()))?;
        let test_name = ctx.test_name();
        let slot = &ts.slot;
        let snapshot = self.load_snapshot(ctx).await?;

        if ctx.ts.agitate_mixture_secs > 0 {
            self.motion(self.device.raise_syringe().await, slot, test_name)
                .await?;
            self.motion(
                self.device.move_to(Station::MixerReactor).await,
                slot,
                test_name,
            )
            .await?;
            self.state
                .set_test_status(format!(
                    "Agitating the Mixerreactor for {} secs.",
                    ctx.ts.agitate_mixture_secs
                ))
                .await;
            self.device
                .run_agitator(ctx.ts.agitate_mixture_secs as f64)
                .await;
        }

        self.state
            .set_test_status(format!("Move to Titration Reagent {slot}"))
            .await;
        self.motion(
            self.device.move_to(Station::from_slot(slot)).await,
            slot,
            test_name,
        )
        .await?;

        if ts.agitate_secs > 0 {
            self.state
                .set_test_status(format!(
                    "Agitating the Titration Reagent for {} secs.",
                    ts.agitate_secs
                ))
                .await;
            self.device.run_agitator(ts.agitate_secs as f64).await;
        }

        // Two-phase split: a withdrawal never exceeds 1 mL, so a large
        // budget is spent as a 1 mL allotment plus the remainder.
        let max_cml = (ts.max_amount_ml * 100.0).round() as i64;
        let first_cml = max_cml.min(100);
        let second_cml = max_cml - first_cml;

        self.state
            .set_test_status(format!("Get Reagent Liquid {slot}"))
            .await;
        self.fill_allotment(ctx, slot, first_cml).await?;

        self.motion(self.device.raise_syringe().await, slot, test_name)
            .await?;
        self.state.set_test_status("Move to Mixerreactor").await;
        self.motion(
            self.device.move_to(Station::MixerReactor).await,
            slot,
            test_name,
        )
        .await?;

        let settle = ctx.ts.delay_before_reading_secs as f64 - ts.agitate_secs as f64;
        if settle > 0.0 {
            self.state
                .set_test_status(format!(
                    "Waiting for {settle} secs before beginning titration."
                ))
                .await;
            self.sleep_secs(settle).await;
        }

        self.state
            .set_test_status("Lower the Syringe in the Mixerreactor")
            .await;
        self.motion(
            self.device.lower_into(LowerTarget::MixerReactor).await,
            slot,
            test_name,
        )
        .await?;

        let mut dose = DoseState {
            dispensed_cml: 0,
            in_syringe_cml: first_cml,
            readings: Vec::new(),
            transition_cml: None,
        };

        // Skip a known-insensitive region without evaluating it.
        let skip_cml = (ts.first_skip_ml * 100.0).round() as i64;
        if skip_cml > 1 {
            self.syringe(
                self.device
                    .withdraw((first_cml - skip_cml).max(0) as f64 / 100.0)
                    .await,
                slot,
                test_name,
            )
            .await?;
            dose.in_syringe_cml -= skip_cml;
            dose.dispensed_cml += skip_cml;
        }

        self.dose_loop(ctx, ts, &snapshot, first_cml, &mut dose).await?;

        if second_cml > 1 && dose.transition_cml.is_none() {
            self.refill_for_second_phase(ctx, ts, second_cml).await?;
            dose.in_syringe_cml = second_cml;
            self.dose_loop(ctx, ts, &snapshot, max_cml, &mut dose).await?;
        }

        self.state.set_test_status("Upper the Syringe").await;
        self.motion(self.device.raise_syringe().await, slot, test_name)
            .await?;

        let outcome = match dose.transition_cml {
            Some(trigger_cml) => {
                let used_ml = trigger_cml as f64 / 100.0;
                let value = round2(used_ml * ts.calc_to_value);
                self.state
                    .set_test_status(format!(
                        "Test results are: {value:.2}, Used ML: {used_ml:.2}"
                    ))
                    .await;
                info!(
                    "Completed Test {test_name}, Results were: {value:.2}, Used ML: {used_ml:.2}"
                );
                MeasureOutcome {
                    value: Some(value),
                    readings: dose.readings.clone(),
                }
            }
            None => {
                warn!("Max ML dispensed before hitting transition");
                MeasureOutcome {
                    value: None,
                    readings: dose.readings.clone(),
                }
            }
        };

        self.sleep_secs(ctx.settings.pause_before_drain_secs as f64)
            .await;

        // Best effort from here on: the outcome and its readings must
        // survive a cleanup fault.
        let total_dispensed_cml = dose.dispensed_cml.min(max_cml);
        if let Err(e) = self
            .return_unused_and_clean(ctx, slot, dose.in_syringe_cml)
            .await
        {
            warn!("Titration cleanup failed: {e}");
        }
        if let Err(e) = self
            .record_dose(ctx, slot, total_dispensed_cml as f64 / 100.0)
            .await
        {
            warn!("Could not update reagent inventory for slot {slot}: {e}");
        }

        Ok(outcome)
    }

    /// Withdraw one allotment from the titration reagent: pre-position,
    /// lower, overdraw by the tolerance, settle back to the exact amount.
    async fn fill_allotment(
        &self,
        ctx: &RunCtx<'_>,
        slot: &str,
        allotment_cml: i64,
    ) -> Result<(), RunError> {
        let test_name = ctx.test_name();
        let amount = allotment_cml as f64 / 100.0;

        self.syringe(self.device.withdraw(amount).await, slot, test_name)
            .await?;
        self.state
            .set_test_status(format!("Lower the Syringe in the Reagent {slot}"))
            .await;
        self.motion(
            self.device.lower_into(LowerTarget::Reagent).await,
            slot,
            test_name,
        )
        .await?;
        self.syringe(
            self.device.withdraw(amount + SYRINGE_TOLERANCE_ML).await,
            slot,
            test_name,
        )
        .await?;
        self.syringe(self.device.withdraw(amount).await, slot, test_name)
            .await?;
        Ok(())
    }

    /// The dose loop invariant: while the budget lasts, expel one unit
    /// dose, let the color stabilize, evaluate, and stop at the first
    /// crossing of the transition threshold.
    async fn dose_loop(
        &self,
        ctx: &RunCtx<'_>,
        ts: &TitrationSpec,
        snapshot: &SwatchSnapshot,
        cap_cml: i64,
        dose: &mut DoseState,
    ) -> Result<(), RunError> {
        let test_name = ctx.test_name();
        let slot = &ts.slot;

        while dose.dispensed_cml <= cap_cml {
            self.syringe(
                self.device
                    .withdraw(dose.in_syringe_cml.max(0) as f64 / 100.0)
                    .await,
                slot,
                test_name,
            )
            .await?;
            self.state
                .set_test_status(format!(
                    "Processing with dispense = {:.2}",
                    dose.dispensed_cml as f64 / 100.0
                ))
                .await;
            if ts.agitate_mixer_secs > 0.0 {
                self.device.run_agitator(ts.agitate_mixer_secs).await;
            }
            self.sleep_secs(0.5).await;

            let color = self
                .sensor
                .read_color()
                .await
                .map_err(|e| RunError::Evaluation(e.to_string()))?;
            let value = matcher::match_value_binary(snapshot, &color)?.max(0.0);
            dose.readings.push(SwatchReading {
                dispensed_ml: Some(round2(dose.dispensed_cml as f64 / 100.0)),
                value,
                channel1: color.l,
                channel2: color.a,
                channel3: color.b,
            });

            if value >= ts.transition {
                dose.transition_cml = Some(dose.dispensed_cml);
                return Ok(());
            }
            dose.in_syringe_cml -= 1;
            dose.dispensed_cml += 1;
        }
        Ok(())
    }

    /// Flush the syringe, withdraw the remainder of the budget and get
    /// back into dosing position over the mixer.
    async fn refill_for_second_phase(
        &self,
        ctx: &RunCtx<'_>,
        ts: &TitrationSpec,
        second_cml: i64,
    ) -> Result<(), RunError> {
        let slot = &ts.slot;
        let test_name = ctx.test_name();

        self.state.set_test_status("Upper the Syringe").await;
        self.motion(self.device.raise_syringe().await, slot, test_name)
            .await?;

        self.state.set_test_status("Move to CleaningReactor").await;
        self.motion(
            self.device.move_to(Station::CleanReactor).await,
            slot,
            test_name,
        )
        .await?;
        self.motion(
            self.device.lower_into(LowerTarget::CleanReactor).await,
            slot,
            test_name,
        )
        .await?;
        self.device.run_pump(Pump::OsmoseClean, 6.0).await?;
        self.device.run_agitator(2.0).await;

        self.state
            .set_test_status("Get Osmose Water to flush the Syringe")
            .await;
        self.syringe(self.device.withdraw(0.1).await, slot, test_name)
            .await?;
        self.state.set_test_status("Dose water").await;
        self.syringe(self.device.dispense().await, slot, test_name)
            .await?;

        self.device.run_pump(Pump::CleanDrain, 2.0).await?;
        self.state
            .set_test_status("Upper the Syringe out of the CleaningReactor")
            .await;
        self.motion(self.device.raise_syringe().await, slot, test_name)
            .await?;
        self.device.agitator_off().await;

        self.state
            .set_test_status(format!("Move to Titration Reagent {slot}"))
            .await;
        self.motion(
            self.device.move_to(Station::from_slot(slot)).await,
            slot,
            test_name,
        )
        .await?;
        if ts.agitate_secs > 0 {
            // Half the first-phase agitation; the reagent is already mixed.
            self.device.run_agitator(ts.agitate_secs as f64 / 2.0).await;
        }

        self.fill_allotment(ctx, slot, second_cml).await?;

        self.motion(self.device.raise_syringe().await, slot, test_name)
            .await?;
        self.state.set_test_status("Move to Mixerreactor").await;
        self.motion(
            self.device.move_to(Station::MixerReactor).await,
            slot,
            test_name,
        )
        .await?;
        self.state
            .set_test_status("Lower the Syringe in the Mixerreactor")
            .await;
        self.motion(
            self.device.lower_into(LowerTarget::MixerReactor).await,
            slot,
            test_name,
        )
        .await?;
        Ok(())
    }

    /// Give undispensed reagent back to its slot (above the 0.02 mL
    /// threshold), then run the standard syringe clean cycle.
    async fn return_unused_and_clean(
        &self,
        ctx: &RunCtx<'_>,
        slot: &str,
        in_syringe_cml: i64,
    ) -> Result<(), RunError> {
        let test_name = ctx.test_name();

        self.state.set_test_status("Move to CleaningReactor").await;
        self.motion(
            self.device.move_to(Station::CleanReactor).await,
            slot,
            test_name,
        )
        .await?;

        if in_syringe_cml > RETURN_THRESHOLD_CML {
            self.motion(
                self.device.lower_into(LowerTarget::CleanReactor).await,
                slot,
                test_name,
            )
            .await?;
            self.device.run_pump(Pump::OsmoseClean, 6.0).await?;

            // One unit dose stays behind in the clean reactor so the
            // needle tip goes back rinsed.
            self.syringe(
                self.device
                    .withdraw((in_syringe_cml - 1).max(0) as f64 / 100.0)
                    .await,
                slot,
                test_name,
            )
            .await?;
            self.sleep_secs(1.0).await;
            self.device.run_pump(Pump::CleanDrain, 2.0).await?;

            self.motion(self.device.raise_syringe().await, slot, test_name)
                .await?;
            self.sleep_secs(2.0).await;
            self.device.agitator_off().await;

            self.state
                .set_test_status(format!("Move to Titration Reagent {slot}"))
                .await;
            self.motion(
                self.device.move_to(Station::from_slot(slot)).await,
                slot,
                test_name,
            )
            .await?;
            self.motion(
                self.device.lower_into(LowerTarget::ReagentReturn).await,
                slot,
                test_name,
            )
            .await?;
            self.state
                .set_test_status(format!("Dose Reagent Liquid {slot}"))
                .await;
            self.syringe(self.device.dispense().await, slot, test_name)
                .await?;
            self.motion(self.device.raise_syringe().await, slot, test_name)
                .await?;

            self.state.set_test_status("Move to CleaningReactor").await;
            self.motion(
                self.device.move_to(Station::CleanReactor).await,
                slot,
                test_name,
            )
            .await?;
        }

        self.clean_syringe(ctx, slot).await
    }

    /// Load the swatch snapshot for this run. A missing or unusable
    /// table is a configuration error, reported without touching the
    /// chart hardware side.
    pub(crate) async fn load_snapshot(
        &self,
        ctx: &RunCtx<'_>,
    ) -> Result<SwatchSnapshot, RunError> {
        let sheet = ctx.ts.color_chart.as_deref().ok_or_else(|| {
            RunError::Evaluation(format!("test {} has no color chart", ctx.test_name()))
        })?;
        let entries = swatches::load_sheet(&self.db, sheet).await?;
        Ok(SwatchSnapshot::from_entries(
            &entries,
            matcher::DEFAULT_LIGHTING,
        ))
    }
}
