//! Starting points for the gradient refiner.
//!
//! [`FixedScaleSolver`] solves the tree-level stationarity conditions at one
//! renormalization scale, or at several log-spaced scales keeping only the
//! solutions whose length is compatible with the scale they were found at.

use nalgebra::SymmetricEigen;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Diagnostics, Result, VacuumError, Warning};
use crate::homotopy::{ComplexRootFinder, PolynomialSystemSolver};
use crate::polynomial::{ConstraintSystem, StationaritySource};
use crate::potential::{FieldConfiguration, LagrangianParameterManager};
use crate::util::{l2_norm, log_spaced};

/// Produces candidate field configurations.
pub trait StartingPointGenerator {
    /// Appends the generated configurations to `out`.
    fn generate(&mut self, out: &mut Vec<FieldConfiguration>) -> Result<()>;
}

impl<G: StartingPointGenerator + ?Sized> StartingPointGenerator for Box<G> {
    fn generate(&mut self, out: &mut Vec<FieldConfiguration>) -> Result<()> {
        (**self).generate(out)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StartingPointSettings {
    pub number_of_scales: usize,
    /// Keep only solutions whose tree-level Hessian is positive semi-definite.
    pub minima_only: bool,
    /// Eigenvalues down to `-hessian_tolerance * max(1, max |eigenvalue|)`
    /// count as non-negative.
    pub hessian_tolerance: f64,
    /// Overrides the manager's single fixed scale when `number_of_scales == 1`.
    #[serde(default)]
    pub fixed_scale: Option<f64>,
}

impl Default for StartingPointSettings {
    fn default() -> Self {
        Self {
            number_of_scales: 1,
            minima_only: false,
            hessian_tolerance: 1e-9,
            fixed_scale: None,
        }
    }
}

pub struct FixedScaleSolver<S, M, F>
where
    S: StationaritySource,
    M: LagrangianParameterManager,
    F: ComplexRootFinder,
{
    source: S,
    manager: M,
    solver: PolynomialSystemSolver<F>,
    settings: StartingPointSettings,
    diagnostics: Diagnostics,
}

impl<S, M, F> FixedScaleSolver<S, M, F>
where
    S: StationaritySource,
    M: LagrangianParameterManager,
    F: ComplexRootFinder,
{
    pub fn new(
        source: S,
        manager: M,
        solver: PolynomialSystemSolver<F>,
        settings: StartingPointSettings,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            source,
            manager,
            solver,
            settings,
            diagnostics,
        }
    }

    pub fn settings(&self) -> StartingPointSettings {
        self.settings
    }

    pub fn solver(&self) -> &PolynomialSystemSolver<F> {
        &self.solver
    }

    /// The renormalization scales (GeV) the system will be solved at.
    pub fn scales(&self) -> Result<Vec<f64>> {
        match self.settings.number_of_scales {
            0 => Err(VacuumError::configuration(
                "number_of_scales must be at least 1",
            )),
            1 => {
                let scale = self
                    .settings
                    .fixed_scale
                    .unwrap_or_else(|| self.manager.appropriate_single_fixed_scale());
                if !(scale > 0.0) {
                    return Err(VacuumError::configuration(format!(
                        "fixed scale must be positive, got {scale}"
                    )));
                }
                Ok(vec![scale])
            }
            count => {
                let low = self.manager.minimum_evaluation_scale();
                let high = self.manager.maximum_evaluation_scale();
                if !(low > 0.0) || high < low {
                    return Err(VacuumError::configuration(format!(
                        "invalid evaluation range [{low}, {high}]"
                    )));
                }
                Ok(log_spaced(low, high, count))
            }
        }
    }

    fn passes_hessian_filter(&self, system: &ConstraintSystem, solution: &[f64]) -> bool {
        let jacobian = system.jacobian_at(solution);
        let hessian = (&jacobian + jacobian.transpose()) * 0.5;
        let eigenvalues = SymmetricEigen::new(hessian).eigenvalues;
        let largest = eigenvalues.iter().fold(1.0f64, |acc, value| acc.max(value.abs()));
        eigenvalues
            .iter()
            .all(|&value| value >= -self.settings.hessian_tolerance * largest)
    }
}

impl<S, M, F> StartingPointGenerator for FixedScaleSolver<S, M, F>
where
    S: StationaritySource,
    M: LagrangianParameterManager,
    F: ComplexRootFinder,
{
    fn generate(&mut self, out: &mut Vec<FieldConfiguration>) -> Result<()> {
        let scales = self.scales()?;
        let mut failures = 0usize;
        let mut last_failure = String::new();

        for (index, &scale) in scales.iter().enumerate() {
            let parameters = self.manager.parameter_values(scale.ln());
            let system = self.source.stationarity_system(&parameters)?;
            let solutions = match self.solver.solve(&system) {
                Ok(solutions) => solutions,
                Err(VacuumError::SolverFailure(message)) if scales.len() > 1 => {
                    self.diagnostics.record(Warning::ScaleSkipped {
                        scale,
                        message: message.clone(),
                    });
                    failures += 1;
                    last_failure = message;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let lower = index.checked_sub(1).map(|below| scales[below]);
            let upper = scales.get(index + 1).copied();
            let before = out.len();
            for solution in solutions {
                let length = l2_norm(&solution);
                if lower.is_some_and(|bound| length < bound)
                    || upper.is_some_and(|bound| length > bound)
                {
                    continue;
                }
                if self.settings.minima_only && !self.passes_hessian_filter(&system, &solution) {
                    continue;
                }
                out.push(solution);
            }
            debug!(scale, kept = out.len() - before, "solved tree-level extrema");
        }

        if failures == scales.len() {
            return Err(VacuumError::solver_failure(format!(
                "polynomial solve failed at all {} scales; last error: {last_failure}",
                scales.len()
            )));
        }
        info!(
            scales = scales.len(),
            starting_points = out.len(),
            "generated starting points"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::homotopy::{HomotopySettings, HomotopyTracker, RootFilterSettings};
    use crate::polynomial::test_models::degenerate_quartic;
    use crate::polynomial::{PolynomialPotential, PolynomialTerm};
    use crate::potential::FixedParameterManager;
    use num_complex::Complex;

    /// Returns canned real roots; fails on the calls listed in `failing_calls`.
    struct CountingRoots {
        roots: Vec<f64>,
        failing_calls: Vec<usize>,
        calls: usize,
    }

    impl CountingRoots {
        fn new(roots: Vec<f64>) -> Self {
            Self {
                roots,
                failing_calls: Vec::new(),
                calls: 0,
            }
        }
    }

    impl ComplexRootFinder for CountingRoots {
        fn complex_roots(&mut self, _system: &ConstraintSystem) -> Result<Vec<Vec<Complex<f64>>>> {
            let call = self.calls;
            self.calls += 1;
            if self.failing_calls.contains(&call) {
                return Err(VacuumError::solver_failure("backend crashed"));
            }
            Ok(self
                .roots
                .iter()
                .map(|&root| vec![Complex::new(root, 0.0)])
                .collect())
        }
    }

    /// V = x^2 / 2, so the stationarity condition is x = 0.
    fn parabola() -> PolynomialPotential {
        PolynomialPotential::from_terms(1, &[PolynomialTerm::new(0.5, &[(0, 2)])], vec![0.0])
            .expect("parabola")
    }

    fn solver<F: ComplexRootFinder>(backend: F) -> PolynomialSystemSolver<F> {
        PolynomialSystemSolver::new(backend, RootFilterSettings::default()).expect("solver")
    }

    #[test]
    fn zero_scales_is_a_configuration_error_before_solving() {
        let manager = FixedParameterManager::new(Vec::new(), 100.0).expect("manager");
        let settings = StartingPointSettings {
            number_of_scales: 0,
            ..StartingPointSettings::default()
        };
        let mut generator = FixedScaleSolver::new(
            parabola(),
            manager,
            solver(CountingRoots::new(vec![0.0])),
            settings,
            Diagnostics::new(),
        );
        let mut out = Vec::new();
        let err = generator.generate(&mut out).expect_err("zero scales");
        assert!(matches!(err, VacuumError::Configuration(_)));
        assert_eq!(generator.solver().backend().calls, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn hessian_filter_discards_the_quartic_maximum() {
        let manager = FixedParameterManager::new(Vec::new(), 100.0).expect("manager");
        let tracker = HomotopyTracker::new(HomotopySettings::default()).expect("tracker");
        let settings = StartingPointSettings {
            minima_only: true,
            ..StartingPointSettings::default()
        };
        let mut generator = FixedScaleSolver::new(
            degenerate_quartic(),
            manager,
            solver(tracker),
            settings,
            Diagnostics::new(),
        );
        let mut out = Vec::new();
        generator.generate(&mut out).expect("generate");
        out.sort_by(|a, b| a[0].partial_cmp(&b[0]).unwrap());
        assert_eq!(out.len(), 2);
        assert!(out[0][0].abs() < 1e-8);
        assert!((out[1][0] - 1.0).abs() < 1e-8);
    }

    #[test]
    fn multi_scale_windows_use_neighbouring_scales() {
        let manager = FixedParameterManager::new(Vec::new(), 100.0)
            .expect("manager")
            .with_evaluation_range(1.0, 10_000.0)
            .expect("range");
        let settings = StartingPointSettings {
            number_of_scales: 3,
            ..StartingPointSettings::default()
        };
        let mut generator = FixedScaleSolver::new(
            parabola(),
            manager,
            solver(CountingRoots::new(vec![0.5, 50.0, 5000.0])),
            settings,
            Diagnostics::new(),
        );
        let mut out = Vec::new();
        generator.generate(&mut out).expect("generate");
        let lengths: Vec<f64> = out.iter().map(|point| point[0]).collect();
        // scales 1, 100, 10000: [.., 100], [1, 10000], [100, ..]
        assert_eq!(lengths, vec![0.5, 50.0, 50.0, 5000.0, 5000.0]);
        assert_eq!(generator.solver().backend().calls, 3);
    }

    #[test]
    fn failed_scale_is_skipped_with_a_warning() {
        let manager = FixedParameterManager::new(Vec::new(), 100.0)
            .expect("manager")
            .with_evaluation_range(1.0, 100.0)
            .expect("range");
        let diagnostics = Diagnostics::new();
        let mut backend = CountingRoots::new(vec![5.0]);
        backend.failing_calls = vec![0];
        let mut generator = FixedScaleSolver::new(
            parabola(),
            manager,
            solver(backend),
            StartingPointSettings {
                number_of_scales: 2,
                ..StartingPointSettings::default()
            },
            diagnostics.clone(),
        );
        let mut out = Vec::new();
        generator.generate(&mut out).expect("second scale succeeds");
        assert_eq!(out, vec![vec![5.0]]);
        assert!(matches!(
            diagnostics.warnings().as_slice(),
            [Warning::ScaleSkipped { scale, .. }] if *scale == 1.0
        ));
    }

    #[test]
    fn every_scale_failing_is_a_solver_failure() {
        let manager = FixedParameterManager::new(Vec::new(), 100.0)
            .expect("manager")
            .with_evaluation_range(1.0, 100.0)
            .expect("range");
        let mut backend = CountingRoots::new(vec![5.0]);
        backend.failing_calls = vec![0, 1];
        let mut generator = FixedScaleSolver::new(
            parabola(),
            manager,
            solver(backend),
            StartingPointSettings {
                number_of_scales: 2,
                ..StartingPointSettings::default()
            },
            Diagnostics::new(),
        );
        let err = generator.generate(&mut Vec::new()).expect_err("all failed");
        assert!(matches!(err, VacuumError::SolverFailure(_)));
    }

    #[test]
    fn single_scale_failure_propagates() {
        let manager = FixedParameterManager::new(Vec::new(), 100.0).expect("manager");
        let mut backend = CountingRoots::new(vec![5.0]);
        backend.failing_calls = vec![0];
        let mut generator = FixedScaleSolver::new(
            parabola(),
            manager,
            solver(backend),
            StartingPointSettings::default(),
            Diagnostics::new(),
        );
        let err = generator.generate(&mut Vec::new()).expect_err("failure");
        assert!(err.to_string().contains("backend crashed"));
    }
}
