//! Enumerating every real stationary point of a polynomial system.
//!
//! Root finding is delegated to a [`ComplexRootFinder`] backend: either an
//! external homotopy-continuation executable ([`PhcProcess`]) or the
//! in-process tracker ([`HomotopyTracker`]). [`PolynomialSystemSolver`] owns
//! the backend-independent part: dropping complex roots and recovering
//! sign-flipped real roots that a backend may have missed.

pub mod phc;
pub mod tracker;

pub use phc::{PhcProcess, PhcSettings};
pub use tracker::{HomotopySettings, HomotopyTracker};

use num_complex::Complex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, VacuumError};
use crate::polynomial::ConstraintSystem;
use crate::potential::FieldConfiguration;
use crate::util::within_hypercube;

/// Produces candidate complex solutions of a square polynomial system.
pub trait ComplexRootFinder {
    fn complex_roots(&mut self, system: &ConstraintSystem) -> Result<Vec<Vec<Complex<f64>>>>;
}

impl<F: ComplexRootFinder + ?Sized> ComplexRootFinder for Box<F> {
    fn complex_roots(&mut self, system: &ConstraintSystem) -> Result<Vec<Vec<Complex<f64>>>> {
        (**self).complex_roots(system)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RootFilterSettings {
    /// Half-width of the hypercube within which two solutions are the same,
    /// the largest imaginary part still counted as real, and the sampling
    /// offset of the sign-flip check.
    pub resolution_size: f64,
}

impl Default for RootFilterSettings {
    fn default() -> Self {
        Self {
            resolution_size: 1e-6,
        }
    }
}

/// Real solutions of a [`ConstraintSystem`], deduplicated and closed under
/// valid sign flips.
pub struct PolynomialSystemSolver<F: ComplexRootFinder> {
    backend: F,
    settings: RootFilterSettings,
}

impl<F: ComplexRootFinder> PolynomialSystemSolver<F> {
    pub fn new(backend: F, settings: RootFilterSettings) -> Result<Self> {
        if !(settings.resolution_size > 0.0) {
            return Err(VacuumError::configuration(format!(
                "resolution_size must be positive, got {}",
                settings.resolution_size
            )));
        }
        Ok(Self { backend, settings })
    }

    pub fn settings(&self) -> RootFilterSettings {
        self.settings
    }

    pub fn backend(&self) -> &F {
        &self.backend
    }

    pub fn solve(&mut self, system: &ConstraintSystem) -> Result<Vec<FieldConfiguration>> {
        let dim = system.number_of_fields();
        let roots = self.backend.complex_roots(system)?;
        let candidate_count = roots.len();

        let mut solutions: Vec<FieldConfiguration> = Vec::new();
        for root in roots {
            if root.len() != dim {
                return Err(VacuumError::solver_failure(format!(
                    "backend returned a solution with {} entries for {} fields",
                    root.len(),
                    dim
                )));
            }
            if root
                .iter()
                .any(|value| !value.re.is_finite() || value.im.abs() > self.settings.resolution_size)
            {
                continue;
            }
            let real: Vec<f64> = root.iter().map(|value| value.re).collect();
            self.append_pure_real_solution_and_valid_sign_flips(real, system, &mut solutions);
        }

        debug!(
            candidates = candidate_count,
            real_solutions = solutions.len(),
            "filtered polynomial system roots"
        );
        if solutions.is_empty() {
            return Err(VacuumError::solver_failure(format!(
                "none of the {candidate_count} candidate roots were real"
            )));
        }
        Ok(solutions)
    }

    fn append_pure_real_solution_and_valid_sign_flips(
        &self,
        solution: FieldConfiguration,
        system: &ConstraintSystem,
        solutions: &mut Vec<FieldConfiguration>,
    ) {
        let resolution = self.settings.resolution_size;
        if !is_known(&solution, solutions, resolution) {
            solutions.push(solution.clone());
        }

        let dim = solution.len();
        if dim >= u64::BITS as usize {
            return;
        }
        for mask in 1u64..(1u64 << dim) {
            let flipped: Vec<f64> = solution
                .iter()
                .enumerate()
                .map(|(i, value)| if mask & (1 << i) != 0 { -value } else { *value })
                .collect();
            if is_known(&flipped, solutions, resolution) {
                continue;
            }
            if satisfies_every_constraint(&flipped, system, resolution) {
                solutions.push(flipped);
            }
        }
    }
}

fn is_known(candidate: &[f64], solutions: &[FieldConfiguration], resolution: f64) -> bool {
    solutions
        .iter()
        .any(|known| within_hypercube(candidate, known, resolution))
}

/// Axis-sampling check: each constraint must not have the same strict sign
/// at `x - delta e_i` and `x + delta e_i` for at least one axis `i`.
pub fn satisfies_every_constraint(candidate: &[f64], system: &ConstraintSystem, delta: f64) -> bool {
    let mut probe = candidate.to_vec();
    system.constraints().iter().all(|constraint| {
        (0..candidate.len()).any(|axis| {
            probe[axis] = candidate[axis] - delta;
            let below: f64 = constraint.evaluate(&probe);
            probe[axis] = candidate[axis] + delta;
            let above: f64 = constraint.evaluate(&probe);
            probe[axis] = candidate[axis];
            !((below > 0.0 && above > 0.0) || (below < 0.0 && above < 0.0))
        })
    })
}
