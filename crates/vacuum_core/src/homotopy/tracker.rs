//! In-process total-degree homotopy continuation.
//!
//! Tracks `H(x, t) = (1 - t) gamma G(x) + t F(x)` from the roots of the start
//! system `G_i(x) = x_i^{d_i} - 1` at `t = 0` to the target system `F` at
//! `t = 1`, with an RK4 predictor on `dx/dt = -H_x^{-1} H_t` and a Newton
//! corrector. The complex constant `gamma` keeps the paths away from
//! singularities for all but a measure-zero set of angles.

use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ComplexRootFinder;
use crate::error::{Result, VacuumError};
use crate::polynomial::{ConstraintSystem, PolynomialConstraint};

type C64 = Complex<f64>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HomotopySettings {
    pub initial_step: f64,
    pub min_step: f64,
    pub max_step: f64,
    pub corrector_steps: usize,
    pub corrector_tolerance: f64,
    pub endgame_newton_steps: usize,
    pub residual_tolerance: f64,
    /// Paths whose norm exceeds this are treated as going to infinity.
    pub divergence_norm: f64,
    pub gamma_angle: f64,
    pub max_paths: usize,
}

impl Default for HomotopySettings {
    fn default() -> Self {
        Self {
            initial_step: 0.01,
            min_step: 1e-10,
            max_step: 0.1,
            corrector_steps: 4,
            corrector_tolerance: 1e-10,
            endgame_newton_steps: 16,
            residual_tolerance: 1e-8,
            divergence_norm: 1e10,
            gamma_angle: 2.384_372_315_991_1,
            max_paths: 1 << 16,
        }
    }
}

pub struct HomotopyTracker {
    settings: HomotopySettings,
}

/// The homotopy for one system, with the Jacobian of `F` precomputed.
struct Homotopy<'a> {
    target: &'a ConstraintSystem,
    jacobian: Vec<Vec<PolynomialConstraint>>,
    degrees: Vec<u32>,
    gamma: C64,
}

impl<'a> Homotopy<'a> {
    fn start_value(&self, x: &[C64]) -> Vec<C64> {
        x.iter()
            .zip(self.degrees.iter())
            .map(|(value, &degree)| value.powu(degree) - C64::new(1.0, 0.0))
            .collect()
    }

    fn residual(&self, x: &[C64], t: f64) -> DVector<C64> {
        let f = self.target.evaluate(x);
        let g = self.start_value(x);
        DVector::from_iterator(
            x.len(),
            f.iter()
                .zip(g.iter())
                .map(|(&fi, &gi)| self.gamma * gi * (1.0 - t) + fi * t),
        )
    }

    fn jacobian_x(&self, x: &[C64], t: f64) -> DMatrix<C64> {
        let n = x.len();
        let mut matrix = DMatrix::from_element(n, n, C64::new(0.0, 0.0));
        for i in 0..n {
            for j in 0..n {
                let target: C64 = self.jacobian[i][j].evaluate(x);
                matrix[(i, j)] = target * t;
            }
            let degree = self.degrees[i];
            let start = x[i].powu(degree - 1) * degree as f64;
            matrix[(i, i)] += self.gamma * start * (1.0 - t);
        }
        matrix
    }

    fn jacobian_t(&self, x: &[C64]) -> DVector<C64> {
        let f = self.target.evaluate(x);
        let g = self.start_value(x);
        DVector::from_iterator(
            x.len(),
            f.iter().zip(g.iter()).map(|(&fi, &gi)| fi - self.gamma * gi),
        )
    }

    fn velocity(&self, x: &[C64], t: f64) -> Option<Vec<C64>> {
        let rhs = -self.jacobian_t(x);
        let solution = self.jacobian_x(x, t).lu().solve(&rhs)?;
        let velocity: Vec<C64> = solution.iter().cloned().collect();
        velocity
            .iter()
            .all(|v| v.re.is_finite() && v.im.is_finite())
            .then_some(velocity)
    }
}

impl HomotopyTracker {
    pub fn new(settings: HomotopySettings) -> Result<Self> {
        if !(settings.min_step > 0.0 && settings.min_step <= settings.max_step) {
            return Err(VacuumError::configuration(
                "homotopy step bounds must satisfy 0 < min_step <= max_step",
            ));
        }
        if settings.corrector_steps == 0 {
            return Err(VacuumError::configuration(
                "homotopy corrector_steps must be greater than zero",
            ));
        }
        Ok(Self { settings })
    }

    pub fn settings(&self) -> HomotopySettings {
        self.settings
    }

    fn track(&self, homotopy: &Homotopy, start: Vec<C64>) -> Option<Vec<C64>> {
        let settings = &self.settings;
        let mut x = start;
        let mut t = 0.0;
        let mut step = settings.initial_step.clamp(settings.min_step, settings.max_step);
        let mut streak = 0usize;

        while t < 1.0 {
            let dt = step.min(1.0 - t);
            let next_t = if dt >= 1.0 - t { 1.0 } else { t + dt };
            let corrected = rk4_predict(homotopy, &x, t, dt)
                .and_then(|predicted| self.correct(homotopy, predicted, next_t));
            match corrected {
                Some(next) => {
                    if complex_norm(&next) > settings.divergence_norm {
                        return None;
                    }
                    x = next;
                    t = next_t;
                    streak += 1;
                    if streak >= 3 {
                        step = (step * 2.0).min(settings.max_step);
                        streak = 0;
                    }
                }
                None => {
                    step *= 0.5;
                    streak = 0;
                    if step < settings.min_step {
                        return None;
                    }
                }
            }
        }
        self.polish(homotopy, x)
    }

    fn correct(&self, homotopy: &Homotopy, mut x: Vec<C64>, t: f64) -> Option<Vec<C64>> {
        for _ in 0..self.settings.corrector_steps {
            let residual = homotopy.residual(&x, t);
            let delta = homotopy.jacobian_x(&x, t).lu().solve(&(-residual))?;
            for (value, change) in x.iter_mut().zip(delta.iter()) {
                *value += *change;
            }
            let delta_norm = delta.iter().map(|d| d.norm_sqr()).sum::<f64>().sqrt();
            if !delta_norm.is_finite() {
                return None;
            }
            if delta_norm <= self.settings.corrector_tolerance * (1.0 + complex_norm(&x)) {
                return Some(x);
            }
        }
        None
    }

    fn polish(&self, homotopy: &Homotopy, mut x: Vec<C64>) -> Option<Vec<C64>> {
        for _ in 0..self.settings.endgame_newton_steps {
            let residual = homotopy.residual(&x, 1.0);
            let Some(delta) = homotopy.jacobian_x(&x, 1.0).lu().solve(&(-residual)) else {
                break;
            };
            for (value, change) in x.iter_mut().zip(delta.iter()) {
                *value += *change;
            }
            let delta_norm = delta.iter().map(|d| d.norm_sqr()).sum::<f64>().sqrt();
            if !delta_norm.is_finite() {
                return None;
            }
            if delta_norm <= f64::EPSILON * (1.0 + complex_norm(&x)) {
                break;
            }
        }
        let residual = homotopy.residual(&x, 1.0);
        let residual_norm = residual.iter().map(|r| r.norm_sqr()).sum::<f64>().sqrt();
        (residual_norm <= self.settings.residual_tolerance * (1.0 + complex_norm(&x)))
            .then_some(x)
    }
}

impl ComplexRootFinder for HomotopyTracker {
    fn complex_roots(&mut self, system: &ConstraintSystem) -> Result<Vec<Vec<C64>>> {
        let degrees = system.degrees();
        if let Some(index) = degrees.iter().position(|&degree| degree == 0) {
            return Err(VacuumError::solver_failure(format!(
                "constraint {index} is a non-zero constant; the system has no solutions"
            )));
        }
        let total_degree = degrees
            .iter()
            .try_fold(1usize, |product, &degree| product.checked_mul(degree as usize))
            .filter(|&paths| paths <= self.settings.max_paths)
            .ok_or_else(|| {
                VacuumError::configuration(format!(
                    "total degree {:?} exceeds the limit of {} homotopy paths",
                    degrees, self.settings.max_paths
                ))
            })?;

        let homotopy = Homotopy {
            target: system,
            jacobian: system.jacobian(),
            degrees: degrees.clone(),
            gamma: C64::from_polar(1.0, self.settings.gamma_angle),
        };

        let mut roots = Vec::with_capacity(total_degree);
        let mut lost = 0usize;
        for start in start_solutions(&degrees) {
            match self.track(&homotopy, start) {
                Some(root) => roots.push(root),
                None => lost += 1,
            }
        }
        debug!(
            paths = total_degree,
            finite = roots.len(),
            lost,
            "tracked total-degree homotopy"
        );
        Ok(roots)
    }
}

fn rk4_predict(homotopy: &Homotopy, x: &[C64], t: f64, dt: f64) -> Option<Vec<C64>> {
    let shifted = |base: &[C64], k: &[C64], scale: f64| -> Vec<C64> {
        base.iter().zip(k.iter()).map(|(&b, &v)| b + v * scale).collect()
    };
    let k1 = homotopy.velocity(x, t)?;
    let k2 = homotopy.velocity(&shifted(x, &k1, 0.5 * dt), t + 0.5 * dt)?;
    let k3 = homotopy.velocity(&shifted(x, &k2, 0.5 * dt), t + 0.5 * dt)?;
    let k4 = homotopy.velocity(&shifted(x, &k3, dt), t + dt)?;
    Some(
        (0..x.len())
            .map(|i| x[i] + (k1[i] + k2[i] * 2.0 + k3[i] * 2.0 + k4[i]) * (dt / 6.0))
            .collect(),
    )
}

/// Every combination of `d_i`-th roots of unity.
fn start_solutions(degrees: &[u32]) -> impl Iterator<Item = Vec<C64>> + '_ {
    let total: usize = degrees.iter().map(|&d| d as usize).product();
    (0..total).map(move |mut index| {
        degrees
            .iter()
            .map(|&degree| {
                let k = index % degree as usize;
                index /= degree as usize;
                C64::from_polar(1.0, 2.0 * std::f64::consts::PI * k as f64 / degree as f64)
            })
            .collect()
    })
}

fn complex_norm(x: &[C64]) -> f64 {
    x.iter().map(|v| v.norm_sqr()).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::homotopy::{PolynomialSystemSolver, RootFilterSettings};
    use crate::polynomial::test_models::{degenerate_quartic, two_field_double_well};
    use crate::polynomial::{PolynomialTerm, StationaritySource};

    fn tracker() -> HomotopyTracker {
        HomotopyTracker::new(HomotopySettings::default()).expect("tracker")
    }

    #[test]
    fn start_solutions_cover_the_total_degree() {
        let starts: Vec<Vec<C64>> = start_solutions(&[2, 3]).collect();
        assert_eq!(starts.len(), 6);
        for start in &starts {
            assert!((start[0].powu(2) - C64::new(1.0, 0.0)).norm() < 1e-12);
            assert!((start[1].powu(3) - C64::new(1.0, 0.0)).norm() < 1e-12);
        }
    }

    #[test]
    fn finds_complex_roots_of_a_circle() {
        // x^2 + 1 = 0 has only complex roots
        let system = ConstraintSystem::new(
            1,
            vec![PolynomialConstraint::new(vec![
                PolynomialTerm::new(1.0, &[(0, 2)]),
                PolynomialTerm::constant(1.0),
            ])],
        )
        .expect("system");
        let mut roots = tracker().complex_roots(&system).expect("roots");
        roots.sort_by(|a, b| a[0].im.partial_cmp(&b[0].im).unwrap());
        assert_eq!(roots.len(), 2);
        assert!((roots[0][0] - C64::new(0.0, -1.0)).norm() < 1e-8);
        assert!((roots[1][0] - C64::new(0.0, 1.0)).norm() < 1e-8);
    }

    #[test]
    fn quartic_extrema_are_zero_half_and_one() {
        let system = degenerate_quartic().stationarity_system(&[]).expect("system");
        let mut solver =
            PolynomialSystemSolver::new(tracker(), RootFilterSettings::default()).expect("solver");
        let mut solutions = solver.solve(&system).expect("solutions");
        solutions.sort_by(|a, b| a[0].partial_cmp(&b[0]).unwrap());
        assert_eq!(solutions.len(), 3);
        for (found, expected) in solutions.iter().zip([0.0, 0.5, 1.0]) {
            assert!((found[0] - expected).abs() < 1e-8, "{found:?} vs {expected}");
        }
    }

    #[test]
    fn decoupled_wells_give_nine_real_extrema() {
        let system = two_field_double_well()
            .stationarity_system(&[])
            .expect("system");
        let mut solver =
            PolynomialSystemSolver::new(tracker(), RootFilterSettings::default()).expect("solver");
        let solutions = solver.solve(&system).expect("solutions");
        assert_eq!(solutions.len(), 9);
        for solution in &solutions {
            for value in solution {
                assert!(
                    [0.0, 0.4625, 1.0].iter().any(|root| (value - root).abs() < 1e-7),
                    "unexpected coordinate {value}"
                );
            }
        }
    }

    #[test]
    fn constant_constraint_is_a_solver_failure() {
        let system = ConstraintSystem::new(
            1,
            vec![PolynomialConstraint::new(vec![PolynomialTerm::constant(2.0)])],
        )
        .expect("system");
        let err = tracker().complex_roots(&system).expect_err("no solutions");
        assert!(matches!(err, VacuumError::SolverFailure(_)));
    }
}
