//! Bounce action along the best path the path finders can produce.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::bubble::{BubbleProfile, BubbleShooter, ShootingSettings};
use super::path::TunnelPath;
use super::path_finders::PathFinder;
use super::path_potential::{PathPotential, PathPotentialSettings};
use super::CancellationToken;
use crate::error::{Diagnostics, Result, VacuumError, Warning};
use crate::potential::PotentialFunction;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BounceSettings {
    pub path_potential: PathPotentialSettings,
    pub shooting: ShootingSettings,
    /// Path improvement stops once the best action drops below this.
    pub action_threshold: f64,
}

impl Default for BounceSettings {
    fn default() -> Self {
        Self {
            path_potential: PathPotentialSettings::default(),
            shooting: ShootingSettings::default(),
            action_threshold: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BounceActionResult {
    /// `S_4` at zero temperature, `S_3` otherwise. Zero when the straight
    /// path shows no barrier, infinite when the true vacuum is not deeper.
    pub action: f64,
    pub temperature: f64,
    pub path: TunnelPath,
    pub profile: Option<BubbleProfile>,
    pub barrier_resolved: bool,
}

/// Outcome of shooting along one path.
enum PathAction {
    Unresolved,
    NoDecay,
    Bounce(BubbleProfile),
}

fn action_along(
    potential: &impl PotentialFunction,
    shooter: &BubbleShooter,
    settings: &BounceSettings,
    path: &TunnelPath,
) -> Result<PathAction> {
    let spline = PathPotential::new(potential, path, settings.path_potential)?;
    if !spline.energy_barrier_was_resolved() {
        return Ok(PathAction::Unresolved);
    }
    if !(spline.potential_difference() < 0.0) {
        return Ok(PathAction::NoDecay);
    }
    Ok(PathAction::Bounce(shooter.shoot(&spline, path)?))
}

pub struct BounceActionCalculator<'a, P: PotentialFunction> {
    potential: P,
    path_finders: Vec<Box<dyn PathFinder + 'a>>,
    shooter: BubbleShooter,
    settings: BounceSettings,
    diagnostics: Diagnostics,
    cancellation: CancellationToken,
}

impl<'a, P: PotentialFunction> BounceActionCalculator<'a, P> {
    pub fn new(
        potential: P,
        path_finders: Vec<Box<dyn PathFinder + 'a>>,
        settings: BounceSettings,
        diagnostics: Diagnostics,
        cancellation: CancellationToken,
    ) -> Result<Self> {
        let shooter = BubbleShooter::new(settings.shooting, diagnostics.clone())?;
        Ok(Self {
            potential,
            path_finders,
            shooter,
            settings,
            diagnostics,
            cancellation,
        })
    }

    pub fn potential(&self) -> &P {
        &self.potential
    }

    pub fn settings(&self) -> BounceSettings {
        self.settings
    }

    pub fn action_threshold(&self) -> f64 {
        self.settings.action_threshold
    }

    pub fn set_action_threshold(&mut self, action_threshold: f64) {
        self.settings.action_threshold = action_threshold;
    }

    /// Shoots along the straight path, then lets each path finder in turn
    /// propose deformations, keeping whichever path gives the lowest action.
    pub fn bounce_action(
        &mut self,
        false_vacuum: &[f64],
        true_vacuum: &[f64],
        temperature: f64,
    ) -> Result<BounceActionResult> {
        self.cancellation.check()?;
        let straight = TunnelPath::straight(false_vacuum, true_vacuum, temperature)?;
        let mut best_profile =
            match action_along(&self.potential, &self.shooter, &self.settings, &straight)? {
                PathAction::Unresolved => {
                    self.diagnostics
                        .record(Warning::UnresolvedBarrierWarning { temperature });
                    return Ok(BounceActionResult {
                        action: 0.0,
                        temperature,
                        path: straight,
                        profile: None,
                        barrier_resolved: false,
                    });
                }
                PathAction::NoDecay => {
                    return Ok(BounceActionResult {
                        action: f64::INFINITY,
                        temperature,
                        path: straight,
                        profile: None,
                        barrier_resolved: true,
                    });
                }
                PathAction::Bounce(profile) => profile,
            };
        let mut best_path = straight;
        debug!(temperature, action = best_profile.action(), "straight path");

        'finders: for (index, finder) in self.path_finders.iter_mut().enumerate() {
            finder.reset();
            let mut proposal_action = None;
            loop {
                if best_profile.action() < self.settings.action_threshold {
                    break 'finders;
                }
                self.cancellation.check()?;
                if !finder.path_can_be_improved(proposal_action) {
                    break;
                }
                let outcome = finder
                    .try_improve_path(&best_path, &best_profile)
                    .and_then(|proposal| {
                        action_along(&self.potential, &self.shooter, &self.settings, &proposal)
                            .map(|action| (proposal, action))
                    });
                let action = match outcome {
                    Ok((proposal, PathAction::Bounce(profile))) => {
                        let action = profile.action();
                        if action < best_profile.action() {
                            best_profile = profile;
                            best_path = proposal;
                        }
                        action
                    }
                    Ok((_, PathAction::Unresolved | PathAction::NoDecay)) => f64::INFINITY,
                    Err(VacuumError::Cancelled) => return Err(VacuumError::Cancelled),
                    Err(err) => {
                        debug!(finder = index, %err, "path proposal rejected");
                        f64::INFINITY
                    }
                };
                debug!(finder = index, proposal = action, best = best_profile.action(), "path proposal");
                proposal_action = Some(action);
            }
        }

        info!(
            temperature,
            action = best_profile.action(),
            converged = best_profile.converged(),
            "bounce action"
        );
        Ok(BounceActionResult {
            action: best_profile.action(),
            temperature,
            path: best_path,
            profile: Some(best_profile),
            barrier_resolved: true,
        })
    }
}
