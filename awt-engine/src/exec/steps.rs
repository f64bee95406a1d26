//! Reagent step execution and cleaning routines

use awt_common::db::models::ReagentStep;
use awt_common::db::reagents;
use chrono::{Duration, Utc};
use tracing::{info, warn};

use super::{RunCtx, RunError, TestEngine, SYRINGE_TOLERANCE_ML};
use crate::hardware::{Device, LowerTarget, Pump, Sensor, Station, WaterSource};

impl<D: Device, S: Sensor> TestEngine<D, S> {
    /// Execute one non-titration reagent step. The first step (positive
    /// water volume) also prepares the mixing chamber and re-baselines
    /// the sensor.
    pub(crate) async fn run_step(
        &self,
        ctx: &RunCtx<'_>,
        step_number: usize,
        water_vol_ml: f64,
        step: &ReagentStep,
    ) -> Result<(), RunError> {
        let test_name = ctx.test_name();
        let slot = &step.slot;
        let station = Station::from_slot(slot);

        self.state.set_test_status("Check Syringe is up").await;
        self.motion(self.device.raise_syringe().await, slot, test_name)
            .await?;

        if water_vol_ml > 0.0 {
            self.state.set_test_status("Move to Mixerreactor").await;
            self.motion(
                self.device.move_to(Station::MixerReactor).await,
                slot,
                test_name,
            )
            .await?;

            self.state.set_test_status("Cleaning the Mixer").await;
            self.clean_mixer(ctx, WaterSource::Tank).await;

            self.state
                .set_test_status("Filling the Mixing Cylinder")
                .await;
            if let Err(e) = self
                .device
                .run_pump(Pump::MixerFill(WaterSource::Tank), water_vol_ml)
                .await
            {
                warn!("Failure filling cylinder: {e}");
                self.notifier.fill_failure(test_name).await;
                return Err(e.into());
            }

            if let Err(e) = self.sensor.calibrate().await {
                warn!("Sensor baseline calibration failed: {e}");
            }
        }

        if self.needs_extra_clean(ctx).await {
            self.clean_syringe(ctx, slot).await?;
        }

        self.state
            .set_test_status(format!("Move to Reagent {step_number}"))
            .await;
        self.motion(self.device.move_to(station).await, slot, test_name)
            .await?;

        if step.agitate_secs > 0 {
            self.state
                .set_test_status(format!(
                    "Agitating the Reagent for {} secs.",
                    step.agitate_secs
                ))
                .await;
            self.device.run_agitator(step.agitate_secs as f64).await;
        }

        // Pre-position the plunger before entering the liquid; the
        // actual draw happens lowered, with a small overdraw settled
        // back so the metered volume is exact.
        self.syringe(self.device.withdraw(step.amount_ml).await, slot, test_name)
            .await?;

        self.state
            .set_test_status(format!("Lower the Syringe in the Reagent {step_number}"))
            .await;
        self.motion(
            self.device.lower_into(LowerTarget::Reagent).await,
            slot,
            test_name,
        )
        .await?;

        self.state
            .set_test_status(format!("Get Reagent Liquid {step_number}"))
            .await;
        self.syringe(
            self.device
                .withdraw(step.amount_ml + SYRINGE_TOLERANCE_ML)
                .await,
            slot,
            test_name,
        )
        .await?;

        if step.thick_liquid {
            self.state
                .set_test_status(format!("Wait for Thick Reagent {step_number}"))
                .await;
            self.sleep_secs(60.0).await;
        }

        self.syringe(self.device.withdraw(step.amount_ml).await, slot, test_name)
            .await?;

        if step.thick_liquid {
            self.state
                .set_test_status(format!("Wait for Thick Reagent {step_number}"))
                .await;
            self.sleep_secs(10.0).await;
        }

        self.state
            .set_test_status(format!(
                "Upper the Syringe out of the Reagent {step_number}"
            ))
            .await;
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

        if step.agitate_between_drips_secs > 0 {
            // Drip-sensitive reagents: 0.01 mL micro-doses, each
            // followed by a short agitation.
            self.state
                .set_test_status(format!("Dose Reagent Liquid {step_number} in steps"))
                .await;
            let mut remaining_cml = (step.amount_ml * 100.0).round() as i64;
            while remaining_cml > 0 {
                self.syringe(
                    self.device.withdraw(remaining_cml as f64 / 100.0).await,
                    slot,
                    test_name,
                )
                .await?;
                self.device
                    .run_agitator(step.agitate_between_drips_secs as f64)
                    .await;
                remaining_cml -= 1;
            }
            self.syringe(self.device.dispense().await, slot, test_name)
                .await?;
        } else {
            self.state
                .set_test_status(format!("Dose Reagent Liquid {step_number}"))
                .await;
            self.syringe(self.device.dispense().await, slot, test_name)
                .await?;
        }

        self.state
            .set_test_status("Upper the Syringe out of the Mixerreactor")
            .await;
        self.motion(self.device.raise_syringe().await, slot, test_name)
            .await?;

        if step.agitate_mixer_secs > 0 {
            self.state
                .set_test_status(format!(
                    "Agitating the Mixerreactor for {} secs.",
                    step.agitate_mixer_secs
                ))
                .await;
            self.device.run_agitator(step.agitate_mixer_secs as f64).await;
        }

        self.record_dose(ctx, slot, step.amount_ml).await?;

        self.clean_syringe(ctx, slot).await?;

        Ok(())
    }

    /// Decrement the slot inventory by exactly the dispensed amount and
    /// raise the low-reagent alarm when the remainder drops under the
    /// variant's threshold.
    pub(crate) async fn record_dose(
        &self,
        ctx: &RunCtx<'_>,
        slot: &str,
        dispensed_ml: f64,
    ) -> Result<(), RunError> {
        let remaining = reagents::record_dose(&self.db, slot, dispensed_ml).await?;
        let threshold = ctx.settings.reagent_threshold_for(ctx.ts.kh_probe_test);
        if remaining < threshold && ctx.settings.reagent_alarm_enabled {
            self.notifier.reagent_low(slot, remaining).await;
        }
        Ok(())
    }

    /// Whether the mixer has sat long enough since the last run to
    /// deserve a double clean (and the syringe a pre-clean).
    pub(crate) async fn needs_extra_clean(&self, ctx: &RunCtx<'_>) -> bool {
        match awt_common::db::results::last_result(&self.db).await {
            Ok(Some(last)) => {
                let idle_for = Utc::now() - last.performed_at;
                idle_for >= Duration::hours(ctx.settings.extra_clean_after_hours)
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Could not read last result: {e}");
                false
            }
        }
    }

    /// Flush the syringe through the clean reactor: osmosis rinse twice,
    /// then an air purge for anything still stuck.
    pub(crate) async fn clean_syringe(
        &self,
        ctx: &RunCtx<'_>,
        slot: &str,
    ) -> Result<(), RunError> {
        let test_name = ctx.test_name();

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

        for _ in 0..2 {
            self.state
                .set_test_status("Get Osmose Water to flush the Syringe")
                .await;
            self.syringe(self.device.withdraw(0.8).await, slot, test_name)
                .await?;
            self.state.set_test_status("Dose water").await;
            self.syringe(self.device.dispense().await, slot, test_name)
                .await?;
        }

        self.device.run_pump(Pump::CleanDrain, 2.0).await?;

        self.state
            .set_test_status("Upper the Syringe out of the CleaningReactor")
            .await;
        self.motion(self.device.raise_syringe().await, slot, test_name)
            .await?;
        self.device.agitator_off().await;

        self.state
            .set_test_status("Get stuck liquid out of Syringe")
            .await;
        self.syringe(self.device.withdraw(0.8).await, slot, test_name)
            .await?;
        self.state.set_test_status("Dose air").await;
        self.syringe(self.device.dispense().await, slot, test_name)
            .await?;

        Ok(())
    }

    /// Clean the mixing chamber with the given water source. Best
    /// effort: a failure here is logged, not fatal to the run.
    pub(crate) async fn clean_mixer(&self, ctx: &RunCtx<'_>, source: WaterSource) {
        if let Err(e) = self.clean_mixer_inner(ctx, source).await {
            warn!("Failure cleaning Mixer: {e}");
        }
    }

    async fn clean_mixer_inner(
        &self,
        ctx: &RunCtx<'_>,
        source: WaterSource,
    ) -> Result<(), RunError> {
        self.device.raise_syringe().await?;
        self.device.move_to(Station::MixerReactor).await?;
        self.device.run_pump(Pump::MainDrain, 8.0).await?;
        self.device.run_agitator(0.0).await;

        let mut cycles = ctx.settings.mixer_clean_cycles;
        if source == WaterSource::Tank && self.needs_extra_clean(ctx).await {
            info!("Extra Cleaning the Mixer");
            self.state.set_test_status("Extra Cleaning the Mixer").await;
            cycles *= 2;
        }

        for _ in 0..cycles {
            self.sleep_secs(0.5).await;
            self.device
                .run_pump(Pump::MixerFill(source), ctx.settings.mixer_clean_ml)
                .await?;
            self.device.run_pump(Pump::MainDrain, 12.0).await?;
        }
        self.device.agitator_off().await;
        Ok(())
    }
}
