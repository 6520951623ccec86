//! The potential along a [`TunnelPath`] as a one-dimensional spline.

use serde::{Deserialize, Serialize};

use super::path::TunnelPath;
use crate::error::{Result, VacuumError};
use crate::potential::PotentialFunction;

/// Samples within this fraction of the largest magnitude involved are
/// rounding noise, not a barrier.
const ROUNDING_FRACTION: f64 = 1e3 * f64::EPSILON;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PathPotentialSettings {
    /// Number of spline segments between the vacua.
    pub path_potential_resolution: usize,
}

impl Default for PathPotentialSettings {
    fn default() -> Self {
        Self {
            path_potential_resolution: 64,
        }
    }
}

/// Piecewise cubic Hermite approximation of `V(path(p)) - V(false vacuum)`
/// on equally spaced samples. The slope vanishes at both vacua; the last
/// segment is evaluated in the offset `d = 1 - p`.
#[derive(Debug, Clone)]
pub struct PathPotential {
    values: Vec<f64>,
    slopes: Vec<f64>,
    segment_width: f64,
    barrier_resolved: bool,
    definite_undershoot_offset: f64,
    temperature: f64,
}

impl PathPotential {
    pub fn new(
        potential: &impl PotentialFunction,
        path: &TunnelPath,
        settings: PathPotentialSettings,
    ) -> Result<Self> {
        let segments = settings.path_potential_resolution;
        if segments < 2 {
            return Err(VacuumError::configuration(format!(
                "path_potential_resolution must be at least 2, got {segments}"
            )));
        }
        let temperature = path.temperature();
        let reference = potential.evaluate(path.false_vacuum(), temperature);
        let potential_difference = potential.evaluate(path.true_vacuum(), temperature) - reference;

        let segment_width = 1.0 / segments as f64;
        let mut values: Vec<f64> = (0..=segments)
            .map(|j| {
                if j == 0 {
                    0.0
                } else if j == segments {
                    potential_difference
                } else {
                    let p = j as f64 * segment_width;
                    potential.evaluate(&path.field_configuration(p), temperature) - reference
                }
            })
            .collect();
        values[segments] = potential_difference;

        let slopes = (0..=segments)
            .map(|j| {
                if j == 0 || j == segments {
                    0.0
                } else {
                    (values[j + 1] - values[j - 1]) / (2.0 * segment_width)
                }
            })
            .collect();

        let magnitude = values
            .iter()
            .fold(reference.abs(), |acc, &value| acc.max(value.abs()));
        let noise_floor = ROUNDING_FRACTION * magnitude;
        let barrier_resolved = values.iter().any(|&value| value > noise_floor);
        let mut spline = Self {
            values,
            slopes,
            segment_width,
            barrier_resolved,
            definite_undershoot_offset: 0.0,
            temperature,
        };
        spline.definite_undershoot_offset = spline.find_definite_undershoot_offset();
        Ok(spline)
    }

    pub fn energy_barrier_was_resolved(&self) -> bool {
        self.barrier_resolved
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn number_of_segments(&self) -> usize {
        self.values.len() - 1
    }

    /// `V(true) - V(false)`.
    pub fn potential_difference(&self) -> f64 {
        self.values[self.values.len() - 1]
    }

    /// Largest sample, `0` if there is no barrier.
    pub fn barrier_height(&self) -> f64 {
        self.values.iter().fold(0.0f64, |acc, &value| acc.max(value))
    }

    /// Starting closer to the false vacuum than this crossing of `V = 0`
    /// cannot reach it.
    pub fn definite_undershoot_auxiliary(&self) -> f64 {
        1.0 - self.definite_undershoot_offset
    }

    pub fn definite_undershoot_offset(&self) -> f64 {
        self.definite_undershoot_offset
    }

    /// Starting at the true vacuum itself never leaves it.
    pub fn definite_overshoot_auxiliary(&self) -> f64 {
        1.0
    }

    pub fn value_at(&self, p: f64) -> f64 {
        let offset = 1.0 - p;
        if offset < self.segment_width {
            return self.final_segment(offset).0;
        }
        self.interior(p).0
    }

    pub fn first_derivative_at(&self, p: f64) -> f64 {
        let offset = 1.0 - p;
        if offset < self.segment_width {
            return -self.final_segment(offset).1;
        }
        self.interior(p).1
    }

    /// `V` at `p = 1 - offset`.
    pub fn value_at_offset(&self, offset: f64) -> f64 {
        if offset < self.segment_width {
            return self.final_segment(offset).0;
        }
        self.interior(1.0 - offset).0
    }

    /// `dV/dd` at `p = 1 - offset`.
    pub fn first_derivative_at_offset(&self, offset: f64) -> f64 {
        if offset < self.segment_width {
            return self.final_segment(offset).1;
        }
        -self.interior(1.0 - offset).1
    }

    /// Value and `dV/dp` away from the final segment. Points before `p = 0`
    /// extrapolate the first segment.
    fn interior(&self, p: f64) -> (f64, f64) {
        let last_interior = self.number_of_segments() - 2;
        let position = p / self.segment_width;
        let j = if position <= 0.0 {
            0
        } else {
            (position.floor() as usize).min(last_interior)
        };
        let t = position - j as f64;
        let (value, slope) = hermite(
            self.values[j],
            self.values[j + 1],
            self.slopes[j] * self.segment_width,
            self.slopes[j + 1] * self.segment_width,
            t,
        );
        (value, slope / self.segment_width)
    }

    /// Value and `dV/dd` on the final segment, parametrized from the true
    /// vacuum end.
    fn final_segment(&self, offset: f64) -> (f64, f64) {
        let end = self.values.len() - 1;
        let t = offset / self.segment_width;
        let (value, slope) = hermite(
            self.values[end],
            self.values[end - 1],
            -self.slopes[end] * self.segment_width,
            -self.slopes[end - 1] * self.segment_width,
            t,
        );
        (value, slope / self.segment_width)
    }

    /// Offset of the zero crossing closest to the true vacuum, on the true
    /// side of the barrier. `0` if the true vacuum is not deeper.
    fn find_definite_undershoot_offset(&self) -> f64 {
        let end = self.values.len() - 1;
        if self.values[end] >= 0.0 {
            return 0.0;
        }
        let Some(j) = (0..end).rev().find(|&j| self.values[j] >= 0.0) else {
            return 1.0;
        };
        // Bisect the sign change on segment [j, j + 1] in offset coordinates.
        let mut near_true = 1.0 - (j + 1) as f64 * self.segment_width;
        let mut near_false = 1.0 - j as f64 * self.segment_width;
        if j + 1 == end {
            near_true = 0.0;
        }
        for _ in 0..100 {
            let middle = 0.5 * (near_true + near_false);
            if middle <= near_true || middle >= near_false {
                break;
            }
            if self.value_at_offset(middle) >= 0.0 {
                near_false = middle;
            } else {
                near_true = middle;
            }
        }
        near_false
    }
}

/// Cubic Hermite interpolant from `(0, y0, m0)` to `(1, y1, m1)`, slopes per
/// unit `t`; returns value and `d/dt`.
fn hermite(y0: f64, y1: f64, m0: f64, m1: f64, t: f64) -> (f64, f64) {
    let t2 = t * t;
    let t3 = t2 * t;
    let rise = 3.0 * t2 - 2.0 * t3;
    let value = y0 + (y1 - y0) * rise + m0 * (t3 - 2.0 * t2 + t) + m1 * (t3 - t2);
    let slope =
        (y1 - y0) * (6.0 * t - 6.0 * t2) + m0 * (3.0 * t2 - 4.0 * t + 1.0) + m1 * (3.0 * t2 - 2.0 * t);
    (value, slope)
}
