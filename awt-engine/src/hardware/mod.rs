//! Hardware interface traits
//!
//! The engine drives the instrument exclusively through [`Device`] and
//! [`Sensor`]. Two hardware generations exist (the stepper/carousel
//! tester and the pump-driven KH tester); both plug in behind the same
//! traits, selected at startup, so business logic never branches on the
//! platform.
//!
//! Real drivers confirm every commanded move by polling the controller
//! until the reported position matches the setpoint. Each poll loop
//! takes an explicit [`PollBudget`], so a wedged axis surfaces as a
//! [`DeviceError::ConfirmationTimeout`] instead of hanging the run
//! forever.

pub mod sim;

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Carousel positions the head can travel to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Station {
    /// Reagent slot, by carousel letter `A..=M`
    Reagent(char),
    CleanReactor,
    MixerReactor,
}

impl Station {
    /// Linear travel from home, in centimeters. Fixed by the carousel
    /// geometry.
    pub fn offset_cm(&self) -> f64 {
        match self {
            Station::Reagent('A') => 0.0,
            Station::Reagent('B') => 3.7,
            Station::Reagent('C') => 7.3,
            Station::Reagent('D') => 11.0,
            Station::Reagent('E') => 14.9,
            Station::Reagent('F') => 18.6,
            Station::Reagent('G') => 22.1,
            Station::Reagent('H') => 25.7,
            Station::Reagent('I') => 29.7,
            Station::Reagent('J') => 33.3,
            Station::Reagent('K') => 36.9,
            Station::Reagent('L') => 40.5,
            Station::Reagent(_) => 44.5,
            Station::CleanReactor => 47.9,
            Station::MixerReactor => 51.1,
        }
    }

    pub fn from_slot(slot: &str) -> Station {
        match slot.chars().next() {
            Some(c @ 'A'..='M') => Station::Reagent(c),
            _ => Station::Reagent('A'),
        }
    }
}

impl std::fmt::Display for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Station::Reagent(c) => write!(f, "{c}"),
            Station::CleanReactor => write!(f, "Clean"),
            Station::MixerReactor => write!(f, "Mixer"),
        }
    }
}

/// Where the syringe gets lowered into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTarget {
    /// Into the reagent reservoir, deep enough to draw liquid
    Reagent,
    /// Into the reservoir at return depth, for giving unused reagent back
    ReagentReturn,
    MixerReactor,
    CleanReactor,
}

impl std::fmt::Display for LowerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LowerTarget::Reagent => write!(f, "Reagent"),
            LowerTarget::ReagentReturn => write!(f, "ReagentReturn"),
            LowerTarget::MixerReactor => write!(f, "Mixer"),
            LowerTarget::CleanReactor => write!(f, "Clean"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaterSource {
    Tank,
    Osmosis,
}

/// Pumps, valves and auxiliary motors. The `amount` passed to
/// [`Device::run_pump`] is milliliters for metering pumps and seconds
/// for timed drain/flush pumps, matching the firmware command sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// Fill the mixing chamber from the given source (mL)
    MixerFill(WaterSource),
    /// Drain the mixing chamber (seconds)
    MainDrain,
    /// Flush the clean reactor with osmosis water (seconds)
    OsmoseClean,
    /// Drain the clean reactor (seconds)
    CleanDrain,
    /// KH tester: move sample water into (+mL) or out of (-mL) the jar
    SampleWater,
    /// KH tester: meter titration reagent into the jar (mL)
    KhReagent,
    /// KH tester: drain the jar (seconds)
    KhDrain,
    /// KH tester: stir the reagent bottle (seconds)
    KhBottleMix,
    /// KH tester: stir the jar (seconds, or a fractional hold level)
    KhJarMix,
}

impl std::fmt::Display for Pump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pump::MixerFill(WaterSource::Tank) => write!(f, "MixerFill(Tank)"),
            Pump::MixerFill(WaterSource::Osmosis) => write!(f, "MixerFill(Osmosis)"),
            Pump::MainDrain => write!(f, "MainDrain"),
            Pump::OsmoseClean => write!(f, "OsmoseClean"),
            Pump::CleanDrain => write!(f, "CleanDrain"),
            Pump::SampleWater => write!(f, "SampleWater"),
            Pump::KhReagent => write!(f, "KhReagent"),
            Pump::KhDrain => write!(f, "KhDrain"),
            Pump::KhBottleMix => write!(f, "KhBottleMix"),
            Pump::KhJarMix => write!(f, "KhJarMix"),
        }
    }
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

#[derive(Debug, Error)]
pub enum DeviceError {
    /// The controller never reported the commanded setpoint within the
    /// poll budget.
    #[error("{op}: no confirmation after {attempts} polls")]
    ConfirmationTimeout { op: &'static str, attempts: u32 },

    #[error("device io: {0}")]
    Io(String),
}

/// Bounded polling parameters for one confirmation loop.
#[derive(Debug, Clone, Copy)]
pub struct PollBudget {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollBudget {
    /// Carousel and syringe lift moves settle within a few seconds.
    pub const MOTION: PollBudget = PollBudget {
        interval: Duration::from_millis(200),
        max_attempts: 150,
    };

    /// Plunger volume moves are slower, especially full withdrawals.
    pub const PLUNGER: PollBudget = PollBudget {
        interval: Duration::from_millis(200),
        max_attempts: 300,
    };
}

/// Poll `read` until it reports within `tolerance` of `target` or the
/// budget runs out. Drivers build every confirmation on this.
pub async fn confirm_setpoint<F>(
    op: &'static str,
    target: f64,
    tolerance: f64,
    budget: PollBudget,
    mut read: F,
) -> DeviceResult<()>
where
    F: FnMut() -> DeviceResult<f64>,
{
    for _ in 0..budget.max_attempts {
        let position = read()?;
        if (position - target).abs() <= tolerance {
            return Ok(());
        }
        tokio::time::sleep(budget.interval).await;
    }
    Err(DeviceError::ConfirmationTimeout {
        op,
        attempts: budget.max_attempts,
    })
}

/// Actuation contract for one hardware generation.
///
/// Every motion resolves only after the driver has confirmed the
/// commanded setpoint; an `Err` means the hardware never got there.
pub trait Device: Send + Sync + 'static {
    /// Travel the head to a station.
    fn move_to(&self, station: Station) -> impl Future<Output = DeviceResult<()>> + Send;

    /// Raise the syringe fully out of whatever it is in.
    fn raise_syringe(&self) -> impl Future<Output = DeviceResult<()>> + Send;

    /// Lower the syringe into the target at the current station.
    fn lower_into(&self, target: LowerTarget) -> impl Future<Output = DeviceResult<()>> + Send;

    /// Move the plunger to an absolute withdrawn volume. Raising the
    /// volume draws liquid (when lowered); lowering it expels the
    /// difference, which is how partial doses are metered.
    fn withdraw(&self, ml: f64) -> impl Future<Output = DeviceResult<()>> + Send;

    /// Drive the plunger to zero, expelling the full syringe content.
    fn dispense(&self) -> impl Future<Output = DeviceResult<()>> + Send;

    /// Run the magnetic agitator for `secs`; `0` switches it on until
    /// [`Device::agitator_off`].
    fn run_agitator(&self, secs: f64) -> impl Future<Output = ()> + Send;

    fn agitator_off(&self) -> impl Future<Output = ()> + Send;

    /// Run a pump, valve or auxiliary motor. See [`Pump`] for the unit
    /// of `amount`.
    fn run_pump(&self, pump: Pump, amount: f64) -> impl Future<Output = DeviceResult<()>> + Send;

    /// Home the carousel stepper.
    fn home(&self) -> impl Future<Output = DeviceResult<()>> + Send;
}

/// Calibrated tri-channel color reading in Lab space, with an sRGB
/// preview for display surfaces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorReading {
    pub l: f64,
    pub a: f64,
    pub b: f64,
    pub rgb: (u8, u8, u8),
}

/// Measurement contract: color sensor plus pH probe.
pub trait Sensor: Send + Sync + 'static {
    /// One calibrated color sample of the mixing chamber.
    fn read_color(&self) -> impl Future<Output = DeviceResult<ColorReading>> + Send;

    /// Re-baseline the sensor against the freshly filled chamber.
    fn calibrate(&self) -> impl Future<Output = DeviceResult<()>> + Send;

    /// Probe pH, averaged over a fixed sample count by the driver.
    fn read_ph(&self) -> impl Future<Output = DeviceResult<f64>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn confirm_setpoint_succeeds_once_in_tolerance() {
        let mut position = 0.0_f64;
        let result = confirm_setpoint(
            "move",
            10.0,
            0.05,
            PollBudget {
                interval: Duration::from_millis(10),
                max_attempts: 50,
            },
            move || {
                position += 2.5;
                Ok(position)
            },
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_setpoint_times_out_on_stuck_axis() {
        let result = confirm_setpoint(
            "move",
            10.0,
            0.05,
            PollBudget {
                interval: Duration::from_millis(10),
                max_attempts: 8,
            },
            || Ok(3.0),
        )
        .await;
        match result {
            Err(DeviceError::ConfirmationTimeout { attempts, .. }) => assert_eq!(attempts, 8),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn station_offsets_are_monotonic_along_the_rail() {
        let mut last = -1.0;
        for c in 'A'..='M' {
            let offset = Station::Reagent(c).offset_cm();
            assert!(offset > last);
            last = offset;
        }
        assert!(Station::CleanReactor.offset_cm() > last);
        assert!(Station::MixerReactor.offset_cm() > Station::CleanReactor.offset_cm());
    }
}
