//! Database models
//!
//! Row types for the tester entities. Parsing between the stored TEXT
//! discriminants and the enums lives here so the query modules and the
//! engine share one vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One reagent-dosing step of a test (up to three per definition).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReagentStep {
    /// Carousel slot letter holding the reagent
    pub slot: String,
    /// Amount to dose into the mixer, in mL
    pub amount_ml: f64,
    /// Agitate the reagent before withdrawing (seconds, 0 = skip)
    pub agitate_secs: u32,
    /// Agitate the mixture after dosing (seconds, 0 = skip)
    pub agitate_mixer_secs: u32,
    /// Agitate between 0.01 mL micro-doses (seconds, 0 = dose in one go)
    pub agitate_between_drips_secs: u32,
    /// Viscous reagent: wait for the syringe level to settle after filling
    pub thick_liquid: bool,
}

/// Titration configuration of a test definition.
///
/// Also drives the KH/pH-probe variant, which reuses the slot, agitate,
/// max-amount, first-skip and scale fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitrationSpec {
    /// Carousel slot holding the titration reagent
    pub slot: String,
    /// Agitate the reagent before the first withdrawal (seconds)
    pub agitate_secs: u32,
    /// Agitate the mixture between unit doses (seconds)
    pub agitate_mixer_secs: f64,
    /// Matched value at which the color transition is declared
    pub transition: f64,
    /// Maximum reagent to spend before declaring failure (mL)
    pub max_amount_ml: f64,
    /// Known-insensitive region dispensed without evaluation (mL)
    pub first_skip_ml: f64,
    /// Scale factor from mL-at-transition to the reported value
    pub calc_to_value: f64,
}

/// Immutable per-run test configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestDefinition {
    pub name: String,
    pub enabled: bool,
    /// KH variant: titrate against the pH probe instead of color
    pub kh_probe_test: bool,
    /// Sample water drawn into the mixing chamber (mL)
    pub water_volume_ml: f64,
    /// Reagent steps, executed in order; each gated on the previous
    pub reagent_steps: Vec<ReagentStep>,
    /// Agitate the finished mixture before reading (seconds)
    pub agitate_mixture_secs: u32,
    /// Total delay between last dose and reading (seconds)
    pub delay_before_reading_secs: u32,
    pub titration: Option<TitrationSpec>,
    /// Color sheet evaluated by the matcher (None for probe-only tests)
    pub color_chart: Option<String>,
    pub too_low_alarm: Option<f64>,
    pub too_low_warning: Option<f64>,
    pub too_high_warning: Option<f64>,
    pub too_high_alarm: Option<f64>,
}

impl TestDefinition {
    /// Reagent steps that actually dose something, in slot order.
    pub fn active_steps(&self) -> impl Iterator<Item = &ReagentStep> {
        self.reagent_steps.iter().filter(|s| s.amount_ml > 0.0)
    }
}

/// Mutable inventory record for one carousel slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReagentSlot {
    /// Carousel slot letter
    pub slot: String,
    pub reagent_name: Option<String>,
    /// Whether the reservoir carries an agitator magnet
    pub has_agitator: bool,
    /// Usable reagent remaining, maintained by the machine (mL)
    pub remaining_ml: f64,
}

/// One calibration point of a color sheet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwatchEntry {
    /// Color sheet this entry belongs to
    pub sheet: String,
    /// Row index; rows must run contiguously from 1 per lighting condition
    pub row: i64,
    /// Lighting condition the reading was calibrated under
    pub lighting: String,
    /// Soft-deletion flag
    pub enabled: bool,
    pub channel1: f64,
    pub channel2: f64,
    pub channel3: f64,
    /// Calibrated numeric value at this color
    pub value: f64,
}

/// Completion status of one run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Completed,
    Failed,
    Aborted,
    Skipped,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Completed => "Completed",
            ResultStatus::Failed => "Failed",
            ResultStatus::Aborted => "Aborted",
            ResultStatus::Skipped => "Skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Completed" => Some(ResultStatus::Completed),
            "Failed" => Some(ResultStatus::Failed),
            "Aborted" => Some(ResultStatus::Aborted),
            "Skipped" => Some(ResultStatus::Skipped),
            _ => None,
        }
    }
}

/// One outcome record; never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub guid: String,
    pub test_name: String,
    /// Numeric result; None on failure or abort
    pub value: Option<f64>,
    pub status: ResultStatus,
    pub performed_at: DateTime<Utc>,
    /// Ordered titration readings serialized as JSON, kept for diagnostics
    pub readings_json: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Running => "Running",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobCause {
    Scheduled,
    Manual,
}

impl JobCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobCause::Scheduled => "Scheduled",
            JobCause::Manual => "Manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Scheduled" => Some(JobCause::Scheduled),
            "Manual" => Some(JobCause::Manual),
            _ => None,
        }
    }
}

/// A queued test invocation. Deleted on completion rather than marked done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub guid: String,
    pub test_name: String,
    pub status: JobStatus,
    pub cause: JobCause,
    /// Not dequeued before this instant
    pub queued_at: DateTime<Utc>,
}

/// Recurrence cadence of a test schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Everyday,
    EveryNDays(u32),
    Weekday(chrono::Weekday),
    Never,
}

impl Cadence {
    /// Parse the stored cadence discriminant (`Everyday`, `2day`, `Sunday`, ...).
    pub fn parse(s: &str) -> Cadence {
        use chrono::Weekday::*;
        match s {
            "Everyday" => Cadence::Everyday,
            "Sunday" => Cadence::Weekday(Sun),
            "Monday" => Cadence::Weekday(Mon),
            "Tuesday" => Cadence::Weekday(Tue),
            "Wednesday" => Cadence::Weekday(Wed),
            "Thursday" => Cadence::Weekday(Thu),
            "Friday" => Cadence::Weekday(Fri),
            "Saturday" => Cadence::Weekday(Sat),
            other => match other.strip_suffix("day").and_then(|n| n.parse::<u32>().ok()) {
                Some(n) if n > 0 => Cadence::EveryNDays(n),
                _ => Cadence::Never,
            },
        }
    }
}

/// Recurring schedule for one test: cadence plus hour-of-day boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSchedule {
    pub test_name: String,
    pub enabled: bool,
    /// Raw cadence discriminant; parse with [`Cadence::parse`]
    pub days_to_run: String,
    /// `HH:MM` local-time boundaries
    pub hours: Vec<String>,
}

impl TestSchedule {
    pub fn cadence(&self) -> Cadence {
        Cadence::parse(&self.days_to_run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadence_parses_known_forms() {
        assert_eq!(Cadence::parse("Everyday"), Cadence::Everyday);
        assert_eq!(Cadence::parse("3day"), Cadence::EveryNDays(3));
        assert_eq!(Cadence::parse("28day"), Cadence::EveryNDays(28));
        assert_eq!(
            Cadence::parse("Wednesday"),
            Cadence::Weekday(chrono::Weekday::Wed)
        );
        assert_eq!(Cadence::parse("Never"), Cadence::Never);
        assert_eq!(Cadence::parse("gibberish"), Cadence::Never);
    }

    #[test]
    fn active_steps_skips_zero_amounts() {
        let t = TestDefinition {
            name: "NO3".into(),
            enabled: true,
            kh_probe_test: false,
            water_volume_ml: 5.0,
            reagent_steps: vec![
                ReagentStep {
                    slot: "A".into(),
                    amount_ml: 1.0,
                    agitate_secs: 0,
                    agitate_mixer_secs: 0,
                    agitate_between_drips_secs: 0,
                    thick_liquid: false,
                },
                ReagentStep {
                    slot: "B".into(),
                    amount_ml: 0.0,
                    agitate_secs: 0,
                    agitate_mixer_secs: 0,
                    agitate_between_drips_secs: 0,
                    thick_liquid: false,
                },
            ],
            agitate_mixture_secs: 0,
            delay_before_reading_secs: 0,
            titration: None,
            color_chart: None,
            too_low_alarm: None,
            too_low_warning: None,
            too_high_warning: None,
            too_high_alarm: None,
        };
        assert_eq!(t.active_steps().count(), 1);
    }
}
