//! KH/pH-probe titration variant
//!
//! Drives the pump-based KH tester: coarse reagent doses while the
//! probe reads well above the endpoint, fine doses below the slow-dose
//! threshold, success once pH reaches the carbonate endpoint.

use tracing::{info, warn};

use super::{round2, MeasureOutcome, RunCtx, RunError, TestEngine};
use crate::hardware::{Device, Pump, Sensor};

/// Valid starting window; a sample outside it fails before any dosing.
const PH_START_MIN: f64 = 6.5;
const PH_START_MAX: f64 = 9.0;
/// Below this the controller switches from fast to fine doses.
const PH_SLOW_DOSE: f64 = 5.8;
/// Endpoint: the titration succeeds once pH is at or below this.
const PH_REACH_POINT: f64 = 4.5;
const FAST_DOSE_ML: f64 = 0.50;
const FINE_DOSE_ML: f64 = 0.05;

impl<D: Device, S: Sensor> TestEngine<D, S> {
    /// Run the probe-driven KH measurement. Returns the outcome and the
    /// total reagent spent (for inventory bookkeeping by the caller).
    pub(crate) async fn run_kh_test(
        &self,
        ctx: &RunCtx<'_>,
    ) -> Result<(MeasureOutcome, f64), RunError> {
        let ts = ctx
            .ts
            .titration
            .as_ref()
            .ok_or_else(|| RunError::Evaluation("KH test without a reagent block".into()))?;
        let test_name = ctx.test_name();
        let water_vol = ctx.ts.water_volume_ml;

        self.state.set_test_status("Mix Reagent Bottle").await;
        self.device
            .run_pump(Pump::KhBottleMix, ts.agitate_secs as f64)
            .await?;
        self.state.set_test_status("Mix Jar").await;
        self.device.run_pump(Pump::KhJarMix, 2.0).await?;

        self.state.set_test_status("Empty jar back to tank").await;
        self.device.run_pump(Pump::SampleWater, -water_vol).await?;
        self.state.set_test_status("Empty jar to drain").await;
        self.device.run_pump(Pump::KhDrain, 25.0).await?;

        self.state.set_test_status("Fill jar with tank water").await;
        self.device.run_pump(Pump::SampleWater, water_vol).await?;
        self.device.run_pump(Pump::KhJarMix, 5.0).await?;

        let mut ph = self.probe_ph().await?;
        info!("pH in jar before dosing: {ph:.2}");

        // Window check happens once, before any reagent is spent.
        if !(PH_START_MIN..=PH_START_MAX).contains(&ph) {
            warn!("Test failed because pH {ph:.2} is outside the start range");
            return Ok((MeasureOutcome::default(), 0.0));
        }

        // Slow continuous stir while dosing.
        self.device.run_pump(Pump::KhJarMix, 0.55).await?;

        let mut total_dosed = 0.0_f64;
        if ts.first_skip_ml > 0.0 {
            self.state.set_test_status("Dose first reagent amount").await;
            self.device
                .run_pump(Pump::KhReagent, ts.first_skip_ml)
                .await?;
            total_dosed += ts.first_skip_ml;
        }

        let mut succeeded: Option<bool> = None;
        while total_dosed <= ts.max_amount_ml && succeeded.is_none() {
            self.state
                .set_test_status(format!("Dosed {total_dosed:.2} ML"))
                .await;
            if ph > PH_SLOW_DOSE {
                self.device.run_pump(Pump::KhReagent, FAST_DOSE_ML).await?;
                total_dosed += FAST_DOSE_ML;
                ph = self.probe_ph().await?;
            }
            if ph <= PH_SLOW_DOSE {
                self.device.run_pump(Pump::KhReagent, FINE_DOSE_ML).await?;
                total_dosed += FINE_DOSE_ML;
                ph = self.probe_ph().await?;
                if ph <= PH_REACH_POINT {
                    info!("Endpoint reached with total reagent used {total_dosed:.2}");
                    succeeded = Some(true);
                    break;
                }
            }
            if total_dosed >= ts.max_amount_ml {
                succeeded = Some(false);
            }
        }

        // Stop the stir.
        self.device.run_pump(Pump::KhJarMix, 0.0).await?;

        let outcome = if succeeded == Some(true) {
            let value = round2(total_dosed * ts.calc_to_value);
            self.state
                .set_test_status(format!("Result was: {value:.2} KH"))
                .await;
            MeasureOutcome {
                value: Some(value),
                readings: Vec::new(),
            }
        } else {
            MeasureOutcome::default()
        };

        self.state.set_test_status("Empty jar to drain").await;
        self.device.run_pump(Pump::KhDrain, 60.0).await?;

        // Refill so the probe stays wet between runs.
        self.state.set_test_status("Fill jar with tank water").await;
        self.device.run_pump(Pump::SampleWater, water_vol).await?;
        self.device.run_pump(Pump::KhJarMix, 5.0).await?;

        let after = self.probe_ph().await?;
        info!("pH in jar after test: {after:.2}");

        Ok((outcome, total_dosed))
    }

    async fn probe_ph(&self) -> Result<f64, RunError> {
        self.sensor
            .read_ph()
            .await
            .map_err(|e| RunError::Evaluation(format!("pH probe: {e}")))
    }
}
