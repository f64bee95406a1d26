//! Swatch color matching
//!
//! Converts a raw Lab reading into a calibrated numeric value by
//! nearest-distance search over candidates interpolated between sparse
//! calibration points. Two variants share the same primitive: the
//! general matcher walks the whole swatch sequence (absolute reads) and
//! the binary matcher interpolates only between the two endpoint
//! swatches (titration transition detection).

use awt_common::db::SwatchEntry;
use thiserror::Error;

use crate::hardware::ColorReading;

/// Lighting condition the instrument calibrates and reads under.
pub const DEFAULT_LIGHTING: &str = "LED";

/// Candidate spacing for the general matcher.
const GENERAL_INCREMENTS: usize = 10;
/// Candidate spacing for the binary/endpoint matcher.
const BINARY_INCREMENTS: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatchError {
    /// Fewer than two usable swatches for the lighting condition.
    #[error("color sheet has {0} usable swatches, at least 2 are required")]
    TooFewSwatches(usize),

    /// Row numbers do not form a contiguous 1..N sequence.
    #[error("swatch rows are not numbered contiguously from 1")]
    NonContiguousRows,
}

/// One interpolation candidate in (channel, channel, channel, value) space.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    channel1: f64,
    channel2: f64,
    channel3: f64,
    value: f64,
}

/// Immutable per-run view of one color sheet under one lighting
/// condition. Built once when the run starts; calibration edits only
/// affect the next run's snapshot.
#[derive(Debug, Clone)]
pub struct SwatchSnapshot {
    points: Vec<Candidate>,
    rows: Vec<i64>,
}

impl SwatchSnapshot {
    /// Filter `entries` down to the enabled swatches of one lighting
    /// condition, ordered by row.
    pub fn from_entries(entries: &[SwatchEntry], lighting: &str) -> Self {
        let mut selected: Vec<&SwatchEntry> = entries
            .iter()
            .filter(|e| e.enabled && e.lighting == lighting)
            .collect();
        selected.sort_by_key(|e| e.row);
        Self {
            points: selected
                .iter()
                .map(|e| Candidate {
                    channel1: e.channel1,
                    channel2: e.channel2,
                    channel3: e.channel3,
                    value: e.value,
                })
                .collect(),
            rows: selected.iter().map(|e| e.row).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The precondition every match runs under: at least two swatches,
    /// rows contiguous from 1.
    fn ensure_usable(&self) -> Result<(), MatchError> {
        if self.points.len() < 2 {
            return Err(MatchError::TooFewSwatches(self.points.len()));
        }
        for (i, row) in self.rows.iter().enumerate() {
            if *row != i as i64 + 1 {
                return Err(MatchError::NonContiguousRows);
            }
        }
        Ok(())
    }
}

/// Append `increments` evenly spaced candidates from `a` (inclusive)
/// toward `b` (exclusive).
fn push_intermediates(a: Candidate, b: Candidate, increments: usize, out: &mut Vec<Candidate>) {
    let n = increments as f64;
    for index in 0..increments {
        let t = index as f64;
        out.push(Candidate {
            channel1: ((n - t) * a.channel1 + t * b.channel1) / n,
            channel2: ((n - t) * a.channel2 + t * b.channel2) / n,
            channel3: ((n - t) * a.channel3 + t * b.channel3) / n,
            value: ((n - t) * a.value + t * b.value) / n,
        });
    }
}

fn offset(p: Candidate, d: Candidate) -> Candidate {
    Candidate {
        channel1: p.channel1 + d.channel1,
        channel2: p.channel2 + d.channel2,
        channel3: p.channel3 + d.channel3,
        value: p.value + d.value,
    }
}

fn difference(a: Candidate, b: Candidate) -> Candidate {
    Candidate {
        channel1: a.channel1 - b.channel1,
        channel2: a.channel2 - b.channel2,
        channel3: a.channel3 - b.channel3,
        value: a.value - b.value,
    }
}

/// Full candidate list: one extrapolated interval before the first
/// swatch, every consecutive pair, one extrapolated interval after the
/// last. Readings slightly outside the calibrated range still resolve.
fn general_candidates(snapshot: &SwatchSnapshot) -> Vec<Candidate> {
    let points = &snapshot.points;
    let mut candidates = Vec::with_capacity((points.len() + 1) * GENERAL_INCREMENTS);

    let lead_delta = difference(points[0], points[1]);
    push_intermediates(
        offset(points[0], lead_delta),
        points[0],
        GENERAL_INCREMENTS,
        &mut candidates,
    );

    for pair in points.windows(2) {
        push_intermediates(pair[0], pair[1], GENERAL_INCREMENTS, &mut candidates);
    }

    let last = points[points.len() - 1];
    let tail_delta = difference(last, points[points.len() - 2]);
    push_intermediates(
        last,
        offset(last, tail_delta),
        GENERAL_INCREMENTS,
        &mut candidates,
    );
    candidates
}

/// Endpoint-only candidate list for transition detection, with the far
/// endpoint itself appended so a perfect end reading matches exactly.
fn binary_candidates(snapshot: &SwatchSnapshot) -> Vec<Candidate> {
    let first = snapshot.points[0];
    let last = snapshot.points[snapshot.points.len() - 1];
    let mut candidates = Vec::with_capacity(BINARY_INCREMENTS + 1);
    push_intermediates(first, last, BINARY_INCREMENTS, &mut candidates);
    candidates.push(last);
    candidates
}

/// Nearest candidate by Euclidean distance in 3-channel color space.
/// Strict `<` keeps the first minimum encountered, so ties resolve to
/// the lower interpolation index; fixtures depend on that.
fn closest_value(candidates: &[Candidate], reading: &ColorReading) -> f64 {
    let mut min_distance = f64::INFINITY;
    let mut closest = 0.0;
    for c in candidates {
        let distance = ((reading.l - c.channel1).powi(2)
            + (reading.a - c.channel2).powi(2)
            + (reading.b - c.channel3).powi(2))
        .sqrt();
        if distance < min_distance {
            min_distance = distance;
            closest = c.value;
        }
    }
    closest
}

/// Best-estimate value for an absolute color read.
pub fn match_value(snapshot: &SwatchSnapshot, reading: &ColorReading) -> Result<f64, MatchError> {
    snapshot.ensure_usable()?;
    Ok(closest_value(&general_candidates(snapshot), reading))
}

/// Transition estimate between the two endpoint swatches.
pub fn match_value_binary(
    snapshot: &SwatchSnapshot,
    reading: &ColorReading,
) -> Result<f64, MatchError> {
    snapshot.ensure_usable()?;
    Ok(closest_value(&binary_candidates(snapshot), reading))
}
