//! Local minimization of the full potential from a starting point.
//!
//! The minimizer is a variable-metric (BFGS) method driven by central
//! finite-difference gradients, so callers only supply function values.
//! Convergence is judged by the estimated distance to the minimum,
//! `EDM = g^T H^-1 g / 2`.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Diagnostics, Result, VacuumError, Warning};
use crate::potential::{PotentialFunction, PotentialMinimum};

/// Relative finite-difference step for gradients, about `eps^(1/3)`.
const GRADIENT_STEP: f64 = 6.0e-6;
const LINE_SEARCH_STEPS: usize = 40;
const ARMIJO: f64 = 1e-4;
/// The default tolerance is this multiple of `error_fraction * |V(start)|`.
const EDM_SCALE: f64 = 1e-3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RefinerSettings {
    pub error_fraction: f64,
    pub error_minimum: f64,
    /// EDM tolerance; derived from the starting value when absent.
    #[serde(default)]
    pub tolerance: Option<f64>,
    pub minimum_tolerance: f64,
    pub max_iterations: usize,
}

impl Default for RefinerSettings {
    fn default() -> Self {
        Self {
            error_fraction: 0.1,
            error_minimum: 1.0,
            tolerance: None,
            minimum_tolerance: 1e-12,
            max_iterations: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuasiNewtonOutcome {
    pub location: Vec<f64>,
    pub value: f64,
    pub inverse_hessian: DMatrix<f64>,
    pub edm: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Minimizes `objective` from `start`. `initial_steps` sets the scale of the
/// initial curvature estimate in each coordinate and must be positive.
pub fn quasi_newton(
    objective: impl Fn(&[f64]) -> f64,
    start: &[f64],
    initial_steps: &[f64],
    tolerance: f64,
    max_iterations: usize,
) -> QuasiNewtonOutcome {
    let n = start.len();
    let mut x = start.to_vec();
    let mut fx = objective(&x);
    let mut gradient = finite_difference_gradient(&objective, &x, initial_steps);
    let mut inverse_hessian = initial_inverse_hessian(&objective, &x, fx, initial_steps);
    let mut escapes = 0usize;
    let mut edm = f64::INFINITY;
    let mut iterations = 0usize;

    while iterations < max_iterations {
        edm = 0.5 * gradient.dot(&(&inverse_hessian * &gradient));
        if !edm.is_finite() {
            break;
        }
        if edm <= tolerance {
            if escapes < n {
                if let Some((lower, value)) =
                    step_off_saddle(&objective, &x, fx, initial_steps)
                {
                    escapes += 1;
                    x = lower;
                    fx = value;
                    gradient = finite_difference_gradient(&objective, &x, initial_steps);
                    inverse_hessian = initial_inverse_hessian(&objective, &x, fx, initial_steps);
                    continue;
                }
            }
            return QuasiNewtonOutcome {
                location: x,
                value: fx,
                inverse_hessian,
                edm,
                iterations,
                converged: true,
            };
        }

        let mut direction = -(&inverse_hessian * &gradient);
        if direction.dot(&gradient) >= 0.0 {
            inverse_hessian = initial_inverse_hessian(&objective, &x, fx, initial_steps);
            direction = -(&inverse_hessian * &gradient);
        }
        let slope = direction.dot(&gradient);

        let mut accepted = None;
        let mut alpha = 1.0;
        for _ in 0..LINE_SEARCH_STEPS {
            let trial: Vec<f64> = x
                .iter()
                .zip(direction.iter())
                .map(|(xi, di)| xi + alpha * di)
                .collect();
            let value = objective(&trial);
            if value.is_finite() && value <= fx + ARMIJO * alpha * slope {
                accepted = Some((trial, value));
                break;
            }
            alpha *= 0.5;
        }
        let Some((trial, value)) = accepted else {
            break;
        };

        let next_gradient = finite_difference_gradient(&objective, &trial, initial_steps);
        let s = DVector::from_iterator(n, trial.iter().zip(x.iter()).map(|(a, b)| a - b));
        let y = &next_gradient - &gradient;
        let sy = s.dot(&y);
        if sy > 1e-16 * s.norm() * y.norm() {
            let rho = 1.0 / sy;
            let identity = DMatrix::<f64>::identity(n, n);
            let left = &identity - (&s * y.transpose()) * rho;
            let right = &identity - (&y * s.transpose()) * rho;
            inverse_hessian = &left * &inverse_hessian * &right + (&s * s.transpose()) * rho;
        }
        x = trial;
        fx = value;
        gradient = next_gradient;
        iterations += 1;
    }

    QuasiNewtonOutcome {
        location: x,
        value: fx,
        inverse_hessian,
        edm,
        iterations,
        converged: false,
    }
}

fn gradient_step(x: f64, scale: f64) -> f64 {
    GRADIENT_STEP * x.abs().max(scale)
}

fn finite_difference_gradient(
    objective: &impl Fn(&[f64]) -> f64,
    x: &[f64],
    scales: &[f64],
) -> DVector<f64> {
    let mut probe = x.to_vec();
    DVector::from_iterator(
        x.len(),
        (0..x.len()).map(|i| {
            let h = gradient_step(x[i], scales[i]);
            probe[i] = x[i] + h;
            let above = objective(&probe);
            probe[i] = x[i] - h;
            let below = objective(&probe);
            probe[i] = x[i];
            (above - below) / (2.0 * h)
        }),
    )
}

/// Diagonal inverse Hessian from second differences over the initial steps.
fn initial_inverse_hessian(
    objective: &impl Fn(&[f64]) -> f64,
    x: &[f64],
    fx: f64,
    steps: &[f64],
) -> DMatrix<f64> {
    let mut probe = x.to_vec();
    let diagonal = (0..x.len()).map(|i| {
        let s = steps[i];
        probe[i] = x[i] + s;
        let above = objective(&probe);
        probe[i] = x[i] - s;
        let below = objective(&probe);
        probe[i] = x[i];
        let curvature = (above - 2.0 * fx + below) / (s * s);
        if curvature > 0.0 && curvature.is_finite() {
            1.0 / curvature
        } else {
            let change = (above - fx).abs() + (below - fx).abs();
            if change > 0.0 && change.is_finite() {
                s * s / change
            } else {
                s * s
            }
        }
    });
    DMatrix::from_diagonal(&DVector::from_iterator(x.len(), diagonal))
}

/// At a stationary point with negative curvature along some axis, returns
/// the lower of the two points one initial step away along that axis.
fn step_off_saddle(
    objective: &impl Fn(&[f64]) -> f64,
    x: &[f64],
    fx: f64,
    steps: &[f64],
) -> Option<(Vec<f64>, f64)> {
    let mut probe = x.to_vec();
    for i in 0..x.len() {
        let h = steps[i] * 1e-3;
        probe[i] = x[i] + h;
        let above = objective(&probe);
        probe[i] = x[i] - h;
        let below = objective(&probe);
        probe[i] = x[i];
        if above - 2.0 * fx + below >= 0.0 {
            continue;
        }
        let sign = if above <= below { 1.0 } else { -1.0 };
        probe[i] = x[i] + sign * steps[i];
        let value = objective(&probe);
        if value < fx {
            return Some((probe, value));
        }
        probe[i] = x[i];
    }
    None
}

/// Refines starting points into minima of `V(phi, T) - V(origin, T)`.
pub struct GradientRefiner<P: PotentialFunction> {
    potential: P,
    settings: RefinerSettings,
    temperature: f64,
    diagnostics: Diagnostics,
}

impl<P: PotentialFunction> GradientRefiner<P> {
    pub fn new(potential: P, settings: RefinerSettings, diagnostics: Diagnostics) -> Result<Self> {
        if !(settings.error_fraction > 0.0) || !(settings.error_minimum > 0.0) {
            return Err(VacuumError::configuration(format!(
                "error_fraction and error_minimum must be positive, got {} and {}",
                settings.error_fraction, settings.error_minimum
            )));
        }
        if settings.max_iterations == 0 {
            return Err(VacuumError::configuration(
                "max_iterations must be greater than zero",
            ));
        }
        Ok(Self {
            potential,
            settings,
            temperature: 0.0,
            diagnostics,
        })
    }

    pub fn potential(&self) -> &P {
        &self.potential
    }

    pub fn potential_mut(&mut self) -> &mut P {
        &mut self.potential
    }

    pub fn settings(&self) -> RefinerSettings {
        self.settings
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn set_temperature(&mut self, temperature: f64) {
        self.temperature = temperature;
    }

    /// `max(error_minimum, error_fraction * |x_i|)` per coordinate.
    pub fn initial_steps(&self, starting_point: &[f64]) -> Vec<f64> {
        starting_point
            .iter()
            .map(|x| (self.settings.error_fraction * x.abs()).max(self.settings.error_minimum))
            .collect()
    }

    pub fn refine(&self, starting_point: &[f64]) -> Result<PotentialMinimum> {
        self.refine_at(starting_point, self.temperature)
    }

    pub fn refine_at(&self, starting_point: &[f64], temperature: f64) -> Result<PotentialMinimum> {
        let fields = self.potential.number_of_field_variables();
        if starting_point.len() != fields {
            return Err(VacuumError::configuration(format!(
                "starting point has {} fields, potential has {}",
                starting_point.len(),
                fields
            )));
        }

        let origin_value = self
            .potential
            .evaluate(&self.potential.field_values_origin(), temperature);
        let objective = |x: &[f64]| self.potential.evaluate(x, temperature) - origin_value;
        let steps = self.initial_steps(starting_point);
        let tolerance = self
            .settings
            .tolerance
            .unwrap_or_else(|| {
                EDM_SCALE * self.settings.error_fraction * objective(starting_point).abs()
            })
            .max(self.settings.minimum_tolerance);

        let outcome = quasi_newton(
            objective,
            starting_point,
            &steps,
            tolerance,
            self.settings.max_iterations,
        );
        if !outcome.converged {
            self.diagnostics.record(Warning::OptimizationWarning {
                iterations: outcome.iterations,
                edm: outcome.edm,
            });
        }
        debug!(
            temperature,
            iterations = outcome.iterations,
            edm = outcome.edm,
            value = outcome.value,
            "refined starting point"
        );

        let uncertainties = (0..fields)
            .map(|i| {
                let variance = 2.0 * outcome.inverse_hessian[(i, i)];
                if variance > 0.0 && variance.is_finite() {
                    variance.sqrt().min(steps[i])
                } else {
                    steps[i]
                }
            })
            .collect();
        Ok(PotentialMinimum::new(outcome.location, outcome.value).with_uncertainties(uncertainties))
    }
}
