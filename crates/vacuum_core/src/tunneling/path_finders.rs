//! Strategies that deform a tunneling path to lower its bounce action.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::bubble::BubbleProfile;
use super::path::{PathFromNodes, TunnelPath};
use crate::error::{Result, VacuumError};
use crate::potential::{FieldConfiguration, PotentialFunction};
use crate::refiner::quasi_newton;
use crate::util::{dot, l2_norm};

/// One path-improvement strategy. The bounce calculator resets it, then
/// alternates [`PathFinder::path_can_be_improved`] with
/// [`PathFinder::try_improve_path`] until the former says stop.
pub trait PathFinder {
    fn reset(&mut self);

    /// A new path proposed from the current best path and its bounce.
    fn try_improve_path(&mut self, path: &TunnelPath, profile: &BubbleProfile) -> Result<TunnelPath>;

    /// `proposal_action` is the action of the last proposal, `None` before
    /// the first one and infinite when the proposal had no barrier.
    fn path_can_be_improved(&mut self, proposal_action: Option<f64>) -> bool;
}

impl<F: PathFinder + ?Sized> PathFinder for Box<F> {
    fn reset(&mut self) {
        (**self).reset()
    }

    fn try_improve_path(&mut self, path: &TunnelPath, profile: &BubbleProfile) -> Result<TunnelPath> {
        (**self).try_improve_path(path, profile)
    }

    fn path_can_be_improved(&mut self, proposal_action: Option<f64>) -> bool {
        (**self).path_can_be_improved(proposal_action)
    }
}

/// Stops after `maximum_rounds` proposals or once consecutive proposals
/// improve by less than `relative_improvement` of the previous action.
#[derive(Debug, Clone)]
struct RoundBudget {
    maximum_rounds: usize,
    relative_improvement: f64,
    rounds: usize,
    previous_action: Option<f64>,
}

impl RoundBudget {
    fn new(maximum_rounds: usize, relative_improvement: f64) -> Self {
        Self {
            maximum_rounds,
            relative_improvement,
            rounds: 0,
            previous_action: None,
        }
    }

    fn reset(&mut self) {
        self.rounds = 0;
        self.previous_action = None;
    }

    fn allows_another(&mut self, proposal_action: Option<f64>) -> bool {
        if self.rounds >= self.maximum_rounds {
            return false;
        }
        let Some(action) = proposal_action else {
            return true;
        };
        let keep_going = match self.previous_action {
            Some(previous) if previous.is_finite() => {
                action < previous
                    && (previous - action) > self.relative_improvement * previous.abs()
            }
            _ => action.is_finite(),
        };
        self.previous_action = Some(action);
        keep_going
    }

    fn count_round(&mut self) {
        self.rounds += 1;
    }
}

fn check_round_settings(maximum_rounds: usize, relative_improvement: f64) -> Result<()> {
    if maximum_rounds == 0 || !(relative_improvement >= 0.0) {
        return Err(VacuumError::configuration(format!(
            "path finder needs maximum_rounds > 0 and a non-negative improvement threshold, got {maximum_rounds} and {relative_improvement}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ParallelPlanesSettings {
    /// Nodes in the first round; one more each round up to `maximum_nodes`.
    pub initial_nodes: usize,
    pub maximum_nodes: usize,
    pub maximum_rounds: usize,
    pub relative_improvement: f64,
    pub minimizer_iterations: usize,
    /// Initial minimizer step as a fraction of the vacuum separation.
    pub step_fraction: f64,
}

impl Default for ParallelPlanesSettings {
    fn default() -> Self {
        Self {
            initial_nodes: 1,
            maximum_nodes: 5,
            maximum_rounds: 5,
            relative_improvement: 0.01,
            minimizer_iterations: 200,
            step_fraction: 0.05,
        }
    }
}

/// Places nodes on hyperplanes perpendicular to the straight line between
/// the vacua and moves each to the lowest potential within its plane.
pub struct ParallelPlanesPathFinder<P: PotentialFunction> {
    potential: P,
    settings: ParallelPlanesSettings,
    budget: RoundBudget,
}

impl<P: PotentialFunction> ParallelPlanesPathFinder<P> {
    pub fn new(potential: P, settings: ParallelPlanesSettings) -> Result<Self> {
        check_round_settings(settings.maximum_rounds, settings.relative_improvement)?;
        if settings.initial_nodes == 0 || settings.maximum_nodes < settings.initial_nodes {
            return Err(VacuumError::configuration(format!(
                "need 0 < initial_nodes <= maximum_nodes, got {} and {}",
                settings.initial_nodes, settings.maximum_nodes
            )));
        }
        Ok(Self {
            potential,
            settings,
            budget: RoundBudget::new(settings.maximum_rounds, settings.relative_improvement),
        })
    }

    fn node_count(&self) -> usize {
        (self.settings.initial_nodes + self.budget.rounds).min(self.settings.maximum_nodes)
    }
}

impl<P: PotentialFunction> PathFinder for ParallelPlanesPathFinder<P> {
    fn reset(&mut self) {
        self.budget.reset();
    }

    fn try_improve_path(&mut self, path: &TunnelPath, _profile: &BubbleProfile) -> Result<TunnelPath> {
        let temperature = path.temperature();
        let builder = PathFromNodes::new(
            path.false_vacuum(),
            path.true_vacuum(),
            self.node_count(),
            temperature,
        )?;
        self.budget.count_round();
        if builder.number_of_free_parameters() == 0 {
            return Ok(path.clone());
        }

        let scale = self.settings.step_fraction * path.vacuum_separation();
        let reference = self.potential.evaluate(path.false_vacuum(), temperature);
        let depth = (self.potential.evaluate(path.true_vacuum(), temperature) - reference).abs();
        let tolerance = (1e-8 * depth).max(f64::MIN_POSITIVE);

        let nodes: Vec<FieldConfiguration> = (0..builder.number_of_varying_nodes())
            .map(|node| {
                let start = builder.free_fields_of(&path.field_configuration(builder.node_fraction(node)));
                let steps = vec![scale; start.len()];
                let outcome = quasi_newton(
                    |free: &[f64]| {
                        self.potential
                            .evaluate(&builder.node_in_plane(node, free), temperature)
                    },
                    &start,
                    &steps,
                    tolerance,
                    self.settings.minimizer_iterations,
                );
                builder.node_in_plane(node, &outcome.location)
            })
            .collect();
        debug!(nodes = nodes.len(), temperature, "parallel-plane path");
        TunnelPath::through_nodes(path.false_vacuum(), path.true_vacuum(), &nodes, temperature)
    }

    fn path_can_be_improved(&mut self, proposal_action: Option<f64>) -> bool {
        self.potential.number_of_field_variables() > 1
            && self.budget.allows_another(proposal_action)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerpendicularForceSettings {
    pub number_of_nodes: usize,
    /// Largest node displacement per round, as a fraction of the vacuum
    /// separation.
    pub movement_fraction: f64,
    pub maximum_rounds: usize,
    pub relative_improvement: f64,
    /// Finite-difference step for the potential gradient, as a fraction of
    /// the vacuum separation.
    pub gradient_step_fraction: f64,
}

impl Default for PerpendicularForceSettings {
    fn default() -> Self {
        Self {
            number_of_nodes: 5,
            movement_fraction: 0.05,
            maximum_rounds: 10,
            relative_improvement: 0.001,
            gradient_step_fraction: 1e-5,
        }
    }
}

/// Moves nodes against the force perpendicular to the path that the bounce
/// equation leaves unbalanced: `grad_perp V - |df/dp|^2 (dp/dr)^2 kappa`.
pub struct PerpendicularForcePathFinder<P: PotentialFunction> {
    potential: P,
    settings: PerpendicularForceSettings,
    budget: RoundBudget,
}

impl<P: PotentialFunction> PerpendicularForcePathFinder<P> {
    pub fn new(potential: P, settings: PerpendicularForceSettings) -> Result<Self> {
        check_round_settings(settings.maximum_rounds, settings.relative_improvement)?;
        if settings.number_of_nodes == 0
            || !(settings.movement_fraction > 0.0)
            || !(settings.gradient_step_fraction > 0.0)
        {
            return Err(VacuumError::configuration(
                "perpendicular force finder needs nodes, a positive movement fraction and a positive gradient step",
            ));
        }
        Ok(Self {
            potential,
            settings,
            budget: RoundBudget::new(settings.maximum_rounds, settings.relative_improvement),
        })
    }

    fn gradient(&self, point: &[f64], temperature: f64, step: f64) -> Vec<f64> {
        let mut probe = point.to_vec();
        (0..point.len())
            .map(|i| {
                probe[i] = point[i] + step;
                let up = self.potential.evaluate(&probe, temperature);
                probe[i] = point[i] - step;
                let down = self.potential.evaluate(&probe, temperature);
                probe[i] = point[i];
                (up - down) / (2.0 * step)
            })
            .collect()
    }

    /// Unbalanced perpendicular force at `p`.
    fn perpendicular_force(&self, path: &TunnelPath, profile: &BubbleProfile, p: f64, step: f64) -> Vec<f64> {
        let point = path.field_configuration(p);
        let tangent = path.field_derivative(p);
        let second = path.field_second_derivative(p);
        let speed_squared = dot(&tangent, &tangent);
        let speed = speed_squared.sqrt();
        if speed == 0.0 {
            return vec![0.0; point.len()];
        }
        let unit: Vec<f64> = tangent.iter().map(|t| t / speed).collect();
        let gradient = self.gradient(&point, path.temperature(), step);
        let along = dot(&gradient, &unit);
        let bend = dot(&second, &unit);
        let slope = profile.auxiliary_slope_at(p);
        let kinetic = speed_squared * slope * slope;
        gradient
            .iter()
            .zip(second.iter())
            .zip(unit.iter())
            .map(|((g, s), u)| {
                let normal_gradient = g - along * u;
                let curvature = (s - bend * u) / speed_squared;
                normal_gradient - kinetic * curvature
            })
            .collect()
    }
}

impl<P: PotentialFunction> PathFinder for PerpendicularForcePathFinder<P> {
    fn reset(&mut self) {
        self.budget.reset();
    }

    fn try_improve_path(&mut self, path: &TunnelPath, profile: &BubbleProfile) -> Result<TunnelPath> {
        self.budget.count_round();
        let separation = path.vacuum_separation();
        let step = self.settings.gradient_step_fraction * separation;
        let count = self.settings.number_of_nodes;
        let fractions: Vec<f64> = (1..=count).map(|k| k as f64 / (count + 1) as f64).collect();
        let forces: Vec<Vec<f64>> = fractions
            .iter()
            .map(|&p| self.perpendicular_force(path, profile, p, step))
            .collect();
        let largest = forces.iter().map(|force| l2_norm(force)).fold(0.0, f64::max);
        if !(largest > 0.0) || !largest.is_finite() {
            return Ok(path.clone());
        }
        let rate = self.settings.movement_fraction * separation / largest;
        let nodes: Vec<FieldConfiguration> = fractions
            .iter()
            .zip(forces.iter())
            .map(|(&p, force)| {
                path.field_configuration(p)
                    .iter()
                    .zip(force.iter())
                    .map(|(x, f)| x - rate * f)
                    .collect()
            })
            .collect();
        debug!(largest_force = largest, rate, "perpendicular-force path");
        TunnelPath::through_nodes(path.false_vacuum(), path.true_vacuum(), &nodes, path.temperature())
    }

    fn path_can_be_improved(&mut self, proposal_action: Option<f64>) -> bool {
        self.potential.number_of_field_variables() > 1
            && self.budget.allows_another(proposal_action)
    }
}

#[cfg(test)]
pub(crate) mod test_models {
    use crate::polynomial::{PolynomialPotential, PolynomialTerm};

    /// `20 x^2 (1 - x)^2 - 0.5 (3 x^2 - 2 x^3) + 100 (y - 0.3 x (1 - x))^2`:
    /// the tilted double well along a valley that bows out to `y = 0.075`
    /// halfway between the vacua `(0, 0)` and `(1, 0)`.
    pub fn curved_valley() -> PolynomialPotential {
        PolynomialPotential::from_terms(
            2,
            &[
                PolynomialTerm::new(27.5, &[(0, 2)]),
                PolynomialTerm::new(-57.0, &[(0, 3)]),
                PolynomialTerm::new(29.0, &[(0, 4)]),
                PolynomialTerm::new(100.0, &[(1, 2)]),
                PolynomialTerm::new(-60.0, &[(0, 1), (1, 1)]),
                PolynomialTerm::new(60.0, &[(0, 2), (1, 1)]),
            ],
            vec![0.0, 0.0],
        )
        .expect("curved valley")
    }
}

#[cfg(test)]
mod tests {
    use super::test_models::curved_valley;
    use super::*;
    use crate::error::Diagnostics;
    use crate::polynomial::test_models::tilted_double_well;
    use crate::tunneling::bubble::{BubbleShooter, ShootingSettings};
    use crate::tunneling::path_potential::{PathPotential, PathPotentialSettings};

    fn bounce(potential: &impl PotentialFunction, path: &TunnelPath) -> BubbleProfile {
        let spline = PathPotential::new(potential, path, PathPotentialSettings::default())
            .expect("spline");
        BubbleShooter::new(ShootingSettings::default(), Diagnostics::new())
            .expect("shooter")
            .shoot(&spline, path)
            .expect("profile")
    }

    #[test]
    fn valley_potential_matches_its_closed_form() {
        let potential = curved_valley();
        for (x, y) in [(0.2, 0.1), (0.5, -0.3), (0.9, 0.05)] {
            let valley = 0.3 * x * (1.0 - x);
            let expected = 20.0 * x * x * (1.0 - x) * (1.0 - x)
                - 0.5 * (3.0 * x * x - 2.0 * x * x * x)
                + 100.0 * (y - valley) * (y - valley);
            assert!((potential.evaluate(&[x, y], 0.0) - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn plane_minimum_finds_the_valley_floor() {
        let potential = curved_valley();
        let straight = TunnelPath::straight(&[0.0, 0.0], &[1.0, 0.0], 0.0).expect("path");
        let profile = bounce(&potential, &straight);
        let mut finder =
            ParallelPlanesPathFinder::new(&potential, ParallelPlanesSettings::default()).expect("finder");
        finder.reset();
        assert!(finder.path_can_be_improved(None));
        let improved = finder.try_improve_path(&straight, &profile).expect("path");
        let middle = improved.field_configuration(0.5);
        assert!((middle[0] - 0.5).abs() < 1e-9);
        assert!((middle[1] - 0.075).abs() < 1e-3, "node at {middle:?}");

        let better = bounce(&potential, &improved);
        assert!(
            better.action() < profile.action(),
            "{} vs {}",
            better.action(),
            profile.action()
        );
    }

    #[test]
    fn single_field_paths_cannot_be_improved() {
        let potential = tilted_double_well();
        let mut planes =
            ParallelPlanesPathFinder::new(&potential, ParallelPlanesSettings::default()).expect("finder");
        let mut force = PerpendicularForcePathFinder::new(
            &potential,
            PerpendicularForceSettings::default(),
        )
        .expect("finder");
        planes.reset();
        force.reset();
        assert!(!planes.path_can_be_improved(None));
        assert!(!force.path_can_be_improved(None));
    }

    #[test]
    fn force_pushes_nodes_toward_the_valley() {
        let potential = curved_valley();
        let straight = TunnelPath::straight(&[0.0, 0.0], &[1.0, 0.0], 0.0).expect("path");
        let profile = bounce(&potential, &straight);
        let mut finder = PerpendicularForcePathFinder::new(
            &potential,
            PerpendicularForceSettings::default(),
        )
        .expect("finder");
        finder.reset();
        let moved = finder.try_improve_path(&straight, &profile).expect("path");
        let middle = moved.field_configuration(0.5);
        assert!(middle[1] > 0.0 && middle[1] <= 0.05 + 1e-9, "node at {middle:?}");
        assert_eq!(moved.field_configuration(0.0), vec![0.0, 0.0]);
        assert_eq!(moved.field_configuration(1.0), vec![1.0, 0.0]);
    }

    #[test]
    fn rounds_stop_on_stalled_improvement() {
        let mut budget = RoundBudget::new(10, 0.01);
        assert!(budget.allows_another(None));
        budget.count_round();
        assert!(budget.allows_another(Some(100.0)));
        budget.count_round();
        assert!(budget.allows_another(Some(90.0)));
        budget.count_round();
        assert!(!budget.allows_another(Some(89.99)));
        budget.reset();
        assert!(!budget.allows_another(Some(f64::INFINITY)));
    }

    #[test]
    fn round_cap_is_respected() {
        let mut budget = RoundBudget::new(2, 0.0);
        assert!(budget.allows_another(None));
        budget.count_round();
        assert!(budget.allows_another(Some(10.0)));
        budget.count_round();
        assert!(!budget.allows_another(Some(5.0)));
    }

    #[test]
    fn empty_node_range_is_rejected() {
        let potential = curved_valley();
        let result = ParallelPlanesPathFinder::new(
            &potential,
            ParallelPlanesSettings {
                initial_nodes: 3,
                maximum_nodes: 2,
                ..ParallelPlanesSettings::default()
            },
        );
        assert!(matches!(result, Err(VacuumError::Configuration(_))));
    }
}
