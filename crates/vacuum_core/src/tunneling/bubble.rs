//! Undershoot/overshoot shooting for the O(4) (or O(3) at finite
//! temperature) bounce along a fixed [`TunnelPath`].
//!
//! The radial equation is integrated in the offset `d = 1 - p` from the
//! true vacuum, so that starting points exponentially close to it keep full
//! precision:
//!
//! ```text
//! d'' = (dV/dd - (f_d . f_dd) d'^2) / |f_d|^2 - (D / r) d'
//! ```
//!
//! with `D = 3` at zero temperature and `D = 2` otherwise.

use std::f64::consts::PI;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::path::TunnelPath;
use super::path_potential::PathPotential;
use crate::error::{Diagnostics, Result, VacuumError, Warning};
use crate::solvers::Tsit5;
use crate::traits::{AdaptiveSteppable, DynamicalSystem, StepOutcome};
use crate::util::l2_distance;

/// Closest approach to the true vacuum tried before any shot has overshot.
pub const MINIMUM_OFFSET: f64 = 1e-150;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShootingSettings {
    /// Accept an undershoot whose turning point is within this fraction of
    /// the starting distance from the false vacuum.
    pub shooting_threshold: f64,
    pub maximum_shoot_attempts: usize,
    pub relative_tolerance: f64,
    /// Absolute tolerance on `d`, as a fraction of the starting offset.
    pub absolute_tolerance_fraction: f64,
    /// First radius, as a fraction of the characteristic radius.
    pub initial_radius_fraction: f64,
    pub maximum_window_doublings: usize,
    pub maximum_steps_per_shot: usize,
}

impl Default for ShootingSettings {
    fn default() -> Self {
        Self {
            shooting_threshold: 0.01,
            maximum_shoot_attempts: 64,
            relative_tolerance: 1e-8,
            absolute_tolerance_fraction: 1e-6,
            initial_radius_fraction: 1e-3,
            maximum_window_doublings: 48,
            maximum_steps_per_shot: 200_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BubbleRadialValue {
    pub radius: f64,
    /// Path parameter `p`.
    pub auxiliary: f64,
    /// `dp/dr`.
    pub auxiliary_slope: f64,
    /// `1 - p`, kept separately for precision near the true vacuum.
    pub offset: f64,
}

impl BubbleRadialValue {
    fn new(radius: f64, offset: f64, offset_slope: f64) -> Self {
        Self {
            radius,
            auxiliary: 1.0 - offset,
            auxiliary_slope: -offset_slope,
            offset,
        }
    }
}

/// The radial profile of the best shot and its Euclidean action.
#[derive(Debug, Clone)]
pub struct BubbleProfile {
    samples: Vec<BubbleRadialValue>,
    action: f64,
    converged: bool,
    attempts: usize,
    bracket_widths: Vec<f64>,
    miss_fraction: f64,
    temperature: f64,
}

impl BubbleProfile {
    /// Samples in increasing radius, starting at `r = 0`.
    pub fn samples(&self) -> &[BubbleRadialValue] {
        &self.samples
    }

    /// `S_4` at zero temperature, `S_3` otherwise.
    pub fn action(&self) -> f64 {
        self.action
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Width of the offset bracket before each attempt.
    pub fn bracket_widths(&self) -> &[f64] {
        &self.bracket_widths
    }

    pub fn miss_fraction(&self) -> f64 {
        self.miss_fraction
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// `dp/dr` where the profile passes through `p`, interpolated linearly
    /// between samples. Zero outside the range the profile covers.
    pub fn auxiliary_slope_at(&self, auxiliary: f64) -> f64 {
        for pair in self.samples.windows(2) {
            let (inner, outer) = (&pair[0], &pair[1]);
            let (high, low) = if inner.auxiliary >= outer.auxiliary {
                (inner, outer)
            } else {
                (outer, inner)
            };
            if auxiliary <= high.auxiliary && auxiliary >= low.auxiliary {
                let span = high.auxiliary - low.auxiliary;
                if span <= 0.0 {
                    return high.auxiliary_slope;
                }
                let weight = (auxiliary - low.auxiliary) / span;
                return low.auxiliary_slope + weight * (high.auxiliary_slope - low.auxiliary_slope);
            }
        }
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShotOutcome {
    Undershoot,
    Overshoot,
}

struct Shot {
    outcome: ShotOutcome,
    samples: Vec<BubbleRadialValue>,
    miss_fraction: f64,
}

/// `y = (d, d')` as a first-order system in `r`.
struct RadialEquation<'a> {
    potential: &'a PathPotential,
    path: &'a TunnelPath,
    damping: f64,
}

impl DynamicalSystem<f64> for RadialEquation<'_> {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, r: f64, y: &[f64], out: &mut [f64]) {
        let (slope_squared, slope_dot_curvature) = self.path.offset_slope_terms(y[0]);
        let force = self.potential.first_derivative_at_offset(y[0]);
        out[0] = y[1];
        out[1] = (force - slope_dot_curvature * y[1] * y[1]) / slope_squared
            - self.damping * y[1] / r;
    }
}

pub struct BubbleShooter {
    settings: ShootingSettings,
    diagnostics: Diagnostics,
}

impl BubbleShooter {
    pub fn new(settings: ShootingSettings, diagnostics: Diagnostics) -> Result<Self> {
        if !(settings.shooting_threshold > 0.0 && settings.shooting_threshold < 1.0) {
            return Err(VacuumError::configuration(format!(
                "shooting_threshold must lie in (0, 1), got {}",
                settings.shooting_threshold
            )));
        }
        if settings.maximum_shoot_attempts == 0 || settings.maximum_steps_per_shot == 0 {
            return Err(VacuumError::configuration(
                "maximum_shoot_attempts and maximum_steps_per_shot must be positive",
            ));
        }
        if !(settings.relative_tolerance > 0.0)
            || !(settings.absolute_tolerance_fraction > 0.0)
            || !(settings.initial_radius_fraction > 0.0)
        {
            return Err(VacuumError::configuration(
                "shooting tolerances and initial_radius_fraction must be positive",
            ));
        }
        Ok(Self {
            settings,
            diagnostics,
        })
    }

    pub fn settings(&self) -> ShootingSettings {
        self.settings
    }

    /// Bisects the starting offset between the definite undershoot and the
    /// true vacuum until a shot comes to rest close enough to the false
    /// vacuum, then integrates the action of the best undershoot.
    pub fn shoot(&self, potential: &PathPotential, path: &TunnelPath) -> Result<BubbleProfile> {
        let undershoot_limit = potential.definite_undershoot_offset();
        if !(potential.potential_difference() < 0.0) || !(undershoot_limit > 0.0) {
            return Err(anyhow!(
                "true vacuum is not below the false vacuum along the path (difference {})",
                potential.potential_difference()
            )
            .into());
        }
        let temperature = path.temperature();
        let damping = if temperature == 0.0 { 3.0 } else { 2.0 };
        let energy_scale = potential
            .barrier_height()
            .max(potential.potential_difference().abs());
        let characteristic_radius = path.vacuum_separation() / energy_scale.sqrt();

        let mut undershoot = undershoot_limit;
        let mut overshoot = 0.0;
        let mut best_undershoot: Option<Shot> = None;
        let mut last_overshoot: Option<Shot> = None;
        let mut bracket_widths = Vec::new();
        let mut converged = false;
        let mut attempts = 0;

        while attempts < self.settings.maximum_shoot_attempts {
            let lower = if overshoot > 0.0 { overshoot } else { MINIMUM_OFFSET };
            let initial = if undershoot > 2.0 * lower {
                (undershoot * lower).sqrt()
            } else {
                0.5 * (undershoot + lower)
            };
            let collapsed = undershoot - overshoot <= 4.0 * f64::EPSILON * undershoot
                || !(initial > overshoot && initial < undershoot);
            if collapsed {
                converged = best_undershoot.is_some();
                debug!(undershoot, overshoot, "shooting bracket collapsed");
                break;
            }

            bracket_widths.push(undershoot - overshoot);
            attempts += 1;
            let shot = self.shoot_once(initial, potential, path, damping, characteristic_radius);
            trace!(
                attempt = attempts,
                initial_offset = initial,
                outcome = ?shot.outcome,
                miss_fraction = shot.miss_fraction,
                "shot"
            );
            match shot.outcome {
                ShotOutcome::Undershoot => {
                    undershoot = initial;
                    let close_enough = shot.miss_fraction <= self.settings.shooting_threshold;
                    let improves = best_undershoot
                        .as_ref()
                        .map_or(true, |best| shot.miss_fraction <= best.miss_fraction);
                    if improves {
                        best_undershoot = Some(shot);
                    }
                    if close_enough {
                        converged = true;
                        break;
                    }
                }
                ShotOutcome::Overshoot => {
                    overshoot = initial;
                    last_overshoot = Some(shot);
                }
            }
        }

        let Some(best) = best_undershoot.or(last_overshoot) else {
            return Err(anyhow!("no shot was taken").into());
        };
        if !converged {
            self.diagnostics
                .record(Warning::ShootingAttemptsExhaustedWarning {
                    attempts,
                    best_miss_fraction: best.miss_fraction,
                });
        }

        let action = bounce_action(&best.samples, potential, path, damping);
        debug!(
            temperature,
            attempts,
            converged,
            miss_fraction = best.miss_fraction,
            action,
            "bubble profile"
        );
        Ok(BubbleProfile {
            samples: best.samples,
            action,
            converged,
            attempts,
            bracket_widths,
            miss_fraction: best.miss_fraction,
            temperature,
        })
    }

    fn shoot_once(
        &self,
        initial: f64,
        potential: &PathPotential,
        path: &TunnelPath,
        damping: f64,
        characteristic_radius: f64,
    ) -> Shot {
        let (slope_squared, _) = path.offset_slope_terms(initial);
        let curvature =
            potential.first_derivative_at_offset(initial) / ((1.0 + damping) * slope_squared);
        let mut samples = vec![BubbleRadialValue::new(0.0, initial, 0.0)];
        let start_distance =
            l2_distance(&path.field_configuration_at_offset(initial), path.false_vacuum());
        let miss_at = |offset: f64| {
            l2_distance(&path.field_configuration_at_offset(offset), path.false_vacuum())
                / start_distance
        };

        if !(curvature > 0.0) {
            // Rolls straight back toward the true vacuum.
            return Shot {
                outcome: ShotOutcome::Undershoot,
                samples,
                miss_fraction: 1.0,
            };
        }

        let first_radius = self.settings.initial_radius_fraction * characteristic_radius;
        let mut r = first_radius;
        let mut state = vec![
            initial + 0.5 * curvature * first_radius * first_radius,
            curvature * first_radius,
        ];
        samples.push(BubbleRadialValue::new(r, state[0], state[1]));

        let offset_tolerance = self.settings.absolute_tolerance_fraction * initial;
        let mut stepper = Tsit5::new(
            2,
            self.settings.relative_tolerance,
            vec![offset_tolerance, offset_tolerance / characteristic_radius],
            1e-12 * characteristic_radius,
        );
        let equation = RadialEquation {
            potential,
            path,
            damping,
        };

        let overshoot = |samples: Vec<BubbleRadialValue>| Shot {
            outcome: ShotOutcome::Overshoot,
            samples,
            miss_fraction: 0.0,
        };

        let mut step = first_radius;
        let mut window = characteristic_radius.max(2.0 * first_radius);
        let mut steps = 0;
        for _ in 0..=self.settings.maximum_window_doublings {
            while r < window {
                if steps >= self.settings.maximum_steps_per_shot {
                    return overshoot(samples);
                }
                steps += 1;
                let previous_offset = state[0];
                let trial = step.min(window - r);
                match stepper.try_step(&equation, &mut r, &mut state, trial) {
                    StepOutcome::Accepted { next_step, .. } => {
                        step = next_step;
                        if !state.iter().all(|value| value.is_finite()) || state[0] > 1.0 {
                            samples.push(BubbleRadialValue::new(r, state[0], state[1]));
                            return overshoot(samples);
                        }
                        samples.push(BubbleRadialValue::new(r, state[0], state[1]));
                        if state[1] < 0.0 {
                            let turning_offset = previous_offset.max(state[0]);
                            return Shot {
                                outcome: ShotOutcome::Undershoot,
                                samples,
                                miss_fraction: miss_at(turning_offset),
                            };
                        }
                    }
                    StepOutcome::Rejected { retry_step } => step = retry_step,
                }
            }
            window *= 2.0;
        }
        // Never resolved: it is still creeping toward the false vacuum.
        overshoot(samples)
    }
}

/// `Omega_D * integral r^D (|f_d|^2 d'^2 / 2 + V) dr` by the trapezoid rule,
/// with `Omega_3 = 2 pi^2` and `Omega_2 = 4 pi`.
fn bounce_action(
    samples: &[BubbleRadialValue],
    potential: &PathPotential,
    path: &TunnelPath,
    damping: f64,
) -> f64 {
    let solid_angle = if damping == 3.0 { 2.0 * PI * PI } else { 4.0 * PI };
    let density = |sample: &BubbleRadialValue| {
        let (slope_squared, _) = path.offset_slope_terms(sample.offset);
        sample.radius.powf(damping)
            * (0.5 * slope_squared * sample.auxiliary_slope * sample.auxiliary_slope
                + potential.value_at_offset(sample.offset))
    };
    let integral: f64 = samples
        .windows(2)
        .map(|pair| 0.5 * (pair[1].radius - pair[0].radius) * (density(&pair[0]) + density(&pair[1])))
        .sum();
    solid_angle * integral
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polynomial::test_models::tilted_double_well;
    use crate::tunneling::path_potential::PathPotentialSettings;

    fn setup(temperature: f64) -> (TunnelPath, PathPotential) {
        let potential = tilted_double_well();
        let path = TunnelPath::straight(&[0.0], &[1.0], temperature).expect("path");
        let spline = PathPotential::new(&potential, &path, PathPotentialSettings::default())
            .expect("spline");
        (path, spline)
    }

    #[test]
    fn tilted_well_bounce_converges() {
        let (path, spline) = setup(0.0);
        let diagnostics = Diagnostics::new();
        let shooter = BubbleShooter::new(ShootingSettings::default(), diagnostics.clone())
            .expect("shooter");
        let profile = shooter.shoot(&spline, &path).expect("profile");

        assert!(profile.converged());
        assert!(profile.attempts() < ShootingSettings::default().maximum_shoot_attempts);
        assert!(profile.action().is_finite());
        assert!(profile.action() > 0.0, "action {}", profile.action());
        assert!(diagnostics.is_empty());

        let samples = profile.samples();
        let first = samples[0];
        let last = samples[samples.len() - 1];
        assert_eq!(first.radius, 0.0);
        assert!(first.auxiliary > spline.definite_undershoot_auxiliary());
        assert!(last.auxiliary < 0.02, "ended at p = {}", last.auxiliary);
        assert!(samples.windows(2).all(|pair| pair[1].radius > pair[0].radius));
    }

    #[test]
    fn bracket_widths_never_grow() {
        let (path, spline) = setup(0.0);
        let shooter =
            BubbleShooter::new(ShootingSettings::default(), Diagnostics::new()).expect("shooter");
        let profile = shooter.shoot(&spline, &path).expect("profile");
        let widths = profile.bracket_widths();
        assert_eq!(widths.len(), profile.attempts());
        assert!((widths[0] - spline.definite_undershoot_offset()).abs() < 1e-15);
        assert!(widths.windows(2).all(|pair| pair[1] <= pair[0]));
    }

    #[test]
    fn finite_temperature_uses_three_dimensional_action() {
        let (path, spline) = setup(0.5);
        let shooter =
            BubbleShooter::new(ShootingSettings::default(), Diagnostics::new()).expect("shooter");
        let profile = shooter.shoot(&spline, &path).expect("profile");
        assert!(profile.converged());
        assert_eq!(profile.temperature(), 0.5);
        assert!(profile.action() > 0.0 && profile.action().is_finite());
    }

    #[test]
    fn exhausted_attempts_warn_and_return_best_shot() {
        let (path, spline) = setup(0.0);
        let diagnostics = Diagnostics::new();
        let shooter = BubbleShooter::new(
            ShootingSettings {
                maximum_shoot_attempts: 2,
                ..ShootingSettings::default()
            },
            diagnostics.clone(),
        )
        .expect("shooter");
        let profile = shooter.shoot(&spline, &path).expect("profile");
        assert!(!profile.converged());
        assert_eq!(profile.attempts(), 2);
        let warnings = diagnostics.warnings();
        assert!(matches!(
            warnings.as_slice(),
            [Warning::ShootingAttemptsExhaustedWarning { attempts: 2, .. }]
        ));
    }

    #[test]
    fn slope_lookup_interpolates_between_samples() {
        let profile = BubbleProfile {
            samples: vec![
                BubbleRadialValue::new(0.0, 0.1, 0.0),
                BubbleRadialValue::new(1.0, 0.5, 0.4),
                BubbleRadialValue::new(2.0, 0.9, 0.2),
            ],
            action: 1.0,
            converged: true,
            attempts: 1,
            bracket_widths: vec![1.0],
            miss_fraction: 0.0,
            temperature: 0.0,
        };
        // p = 0.9 -> 0.5 -> 0.1 with dp/dr = 0, -0.4, -0.2.
        assert!((profile.auxiliary_slope_at(0.7) + 0.2).abs() < 1e-12);
        assert!((profile.auxiliary_slope_at(0.3) + 0.3).abs() < 1e-12);
        assert_eq!(profile.auxiliary_slope_at(0.95), 0.0);
        assert_eq!(profile.auxiliary_slope_at(0.05), 0.0);
    }

    #[test]
    fn true_vacuum_above_false_is_an_error() {
        let potential = tilted_double_well();
        let path = TunnelPath::straight(&[1.0], &[0.0], 0.0).expect("path");
        let spline = PathPotential::new(&potential, &path, PathPotentialSettings::default())
            .expect("spline");
        let shooter =
            BubbleShooter::new(ShootingSettings::default(), Diagnostics::new()).expect("shooter");
        assert!(matches!(
            shooter.shoot(&spline, &path),
            Err(VacuumError::Numerical(_))
        ));
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        let result = BubbleShooter::new(
            ShootingSettings {
                shooting_threshold: 1.5,
                ..ShootingSettings::default()
            },
            Diagnostics::new(),
        );
        assert!(matches!(result, Err(VacuumError::Configuration(_))));
    }
}
