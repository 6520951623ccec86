//! Quantum and thermal tunneling out of the DSB vacuum.
//!
//! [`TunnelingCalculator`] drives the pipeline for one parameter point:
//! bounce actions along improved paths ([`bounce`]), turned into a lifetime
//! and survival probability at zero temperature, and a decay width integrated
//! over the temperature history of the universe ([`thermal`]).

pub mod bounce;
pub mod bubble;
pub mod path;
pub mod path_finders;
pub mod path_potential;
pub mod thermal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

pub use bounce::{BounceActionCalculator, BounceActionResult, BounceSettings};
pub use bubble::{BubbleProfile, BubbleRadialValue, BubbleShooter, ShootingSettings};
pub use path::{PathFromNodes, TunnelPath};
pub use path_finders::{
    ParallelPlanesPathFinder, ParallelPlanesSettings, PathFinder, PerpendicularForcePathFinder,
    PerpendicularForceSettings,
};
pub use path_potential::{PathPotential, PathPotentialSettings};
pub use thermal::{ThermalIntegrator, ThermalOutcome, ThermalSettings};

use crate::error::{Diagnostics, Result, VacuumError, Warning};
use crate::potential::{PotentialFunction, PotentialMinimum};
use crate::refiner::{GradientRefiner, RefinerSettings};

/// Which decay channels to evaluate, and in which order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TunnelingStrategy {
    NoTunneling,
    JustQuantum,
    JustThermal,
    /// Thermal is skipped when the quantum survival is already below threshold.
    #[default]
    QuantumThenThermal,
    /// Quantum is skipped when the thermal survival is already below threshold.
    ThermalThenQuantum,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TunnelingSettings {
    pub strategy: TunnelingStrategy,
    /// A point whose survival probability drops below this is excluded.
    pub survival_probability_threshold: f64,
    pub age_of_universe_seconds: f64,
    pub hbar_gev_seconds: f64,
    pub bounce: BounceSettings,
    pub thermal: ThermalSettings,
}

impl Default for TunnelingSettings {
    fn default() -> Self {
        Self {
            strategy: TunnelingStrategy::default(),
            survival_probability_threshold: 0.01,
            age_of_universe_seconds: 4.354e17,
            hbar_gev_seconds: 6.582119569e-25,
            bounce: BounceSettings::default(),
            thermal: ThermalSettings::default(),
        }
    }
}

/// Cooperative cancellation flag, shared across threads.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(VacuumError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelingResult {
    pub quantum_survival_probability: Option<f64>,
    pub quantum_lifetime_in_seconds: Option<f64>,
    pub quantum_action: Option<f64>,
    pub thermal_survival_probability: Option<f64>,
    pub dominant_temperature_in_gev: Option<f64>,
    pub thermal_decay_width: Option<f64>,
}

/// Lifetime `hbar exp(S / 4) / sqrt(scale^2)` and survival probability
/// `exp(-age / lifetime)`, both computed in log space. Probabilities that
/// cannot be represented are clamped to 0 or 1 with a
/// [`Warning::NumericOverflow`].
pub fn quantum_survival(
    action: f64,
    scale_squared: f64,
    settings: &TunnelingSettings,
    diagnostics: &Diagnostics,
) -> (f64, f64) {
    let log_lifetime = settings.hbar_gev_seconds.ln() + 0.25 * action - 0.5 * scale_squared.ln();
    let lifetime = log_lifetime.exp();
    let log_decays = settings.age_of_universe_seconds.ln() - log_lifetime;

    if log_decays.is_nan() {
        diagnostics.record(Warning::NumericOverflow {
            exponent: log_decays,
            clamped_to: 0.0,
        });
        return (lifetime, 0.0);
    }
    let decays = log_decays.exp();
    if decays.is_infinite() {
        diagnostics.record(Warning::NumericOverflow {
            exponent: log_decays,
            clamped_to: 0.0,
        });
        return (lifetime, 0.0);
    }
    if lifetime.is_infinite() {
        diagnostics.record(Warning::NumericOverflow {
            exponent: log_lifetime,
            clamped_to: 1.0,
        });
        return (lifetime, 1.0);
    }
    (lifetime, survival_from_decay_width(decays, diagnostics))
}

/// `exp(-width)`, recording a [`Warning::NumericOverflow`] when a positive
/// width underflows the probability to 0.
pub(crate) fn survival_from_decay_width(width: f64, diagnostics: &Diagnostics) -> f64 {
    let survival = (-width).exp();
    if survival == 0.0 && width > 0.0 {
        diagnostics.record(Warning::NumericOverflow {
            exponent: -width,
            clamped_to: 0.0,
        });
    }
    survival.clamp(0.0, 1.0)
}

/// Largest action whose survival probability is still below `threshold`:
/// `4 ln(age sqrt(scale^2) / (hbar (-ln threshold)))`.
pub fn quantum_action_threshold(scale_squared: f64, settings: &TunnelingSettings) -> f64 {
    let threshold = settings.survival_probability_threshold;
    4.0 * (settings.age_of_universe_seconds.ln() + 0.5 * scale_squared.ln()
        - settings.hbar_gev_seconds.ln()
        - (-threshold.ln()).ln())
}

pub struct TunnelingCalculator<'a, P: PotentialFunction + Clone> {
    potential: P,
    refiner: GradientRefiner<P>,
    bounce: BounceActionCalculator<'a, P>,
    thermal: ThermalIntegrator,
    settings: TunnelingSettings,
    diagnostics: Diagnostics,
    cancellation: CancellationToken,
}

impl<'a, P: PotentialFunction + Clone> TunnelingCalculator<'a, P> {
    pub fn new(
        potential: P,
        path_finders: Vec<Box<dyn PathFinder + 'a>>,
        refiner_settings: RefinerSettings,
        settings: TunnelingSettings,
        diagnostics: Diagnostics,
        cancellation: CancellationToken,
    ) -> Result<Self> {
        let threshold = settings.survival_probability_threshold;
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(VacuumError::configuration(format!(
                "survival_probability_threshold must lie in (0, 1), got {threshold}"
            )));
        }
        if !(settings.age_of_universe_seconds > 0.0) || !(settings.hbar_gev_seconds > 0.0) {
            return Err(VacuumError::configuration(
                "age_of_universe_seconds and hbar_gev_seconds must be positive",
            ));
        }
        let refiner = GradientRefiner::new(potential.clone(), refiner_settings, diagnostics.clone())?;
        let bounce = BounceActionCalculator::new(
            potential.clone(),
            path_finders,
            settings.bounce,
            diagnostics.clone(),
            cancellation.clone(),
        )?;
        let thermal = ThermalIntegrator::new(settings.thermal, diagnostics.clone(), cancellation.clone())?;
        Ok(Self {
            potential,
            refiner,
            bounce,
            thermal,
            settings,
            diagnostics,
            cancellation,
        })
    }

    /// Uses the parallel-plane finder followed by the perpendicular-force
    /// finder, both with default settings.
    pub fn with_default_path_finders(
        potential: P,
        refiner_settings: RefinerSettings,
        settings: TunnelingSettings,
        diagnostics: Diagnostics,
        cancellation: CancellationToken,
    ) -> Result<Self>
    where
        P: 'a,
    {
        let path_finders: Vec<Box<dyn PathFinder + 'a>> = vec![
            Box::new(ParallelPlanesPathFinder::new(
                potential.clone(),
                ParallelPlanesSettings::default(),
            )?),
            Box::new(PerpendicularForcePathFinder::new(
                potential.clone(),
                PerpendicularForceSettings::default(),
            )?),
        ];
        Self::new(
            potential,
            path_finders,
            refiner_settings,
            settings,
            diagnostics,
            cancellation,
        )
    }

    pub fn settings(&self) -> TunnelingSettings {
        self.settings
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Survival of `false_vacuum` against decay into `true_vacuum`, through
    /// the channels the strategy selects.
    pub fn calculate_tunneling(
        &mut self,
        false_vacuum: &PotentialMinimum,
        true_vacuum: &PotentialMinimum,
    ) -> Result<TunnelingResult> {
        self.cancellation.check()?;
        let threshold = self.settings.survival_probability_threshold;
        let mut result = TunnelingResult::default();
        match self.settings.strategy {
            TunnelingStrategy::NoTunneling => {}
            TunnelingStrategy::JustQuantum => {
                self.quantum(false_vacuum, true_vacuum, &mut result)?;
            }
            TunnelingStrategy::JustThermal => {
                self.thermal(false_vacuum, true_vacuum, &mut result)?;
            }
            TunnelingStrategy::QuantumThenThermal => {
                if self.quantum(false_vacuum, true_vacuum, &mut result)? >= threshold {
                    self.thermal(false_vacuum, true_vacuum, &mut result)?;
                }
            }
            TunnelingStrategy::ThermalThenQuantum => {
                if self.thermal(false_vacuum, true_vacuum, &mut result)? >= threshold {
                    self.quantum(false_vacuum, true_vacuum, &mut result)?;
                }
            }
        }
        info!(
            strategy = ?self.settings.strategy,
            quantum = ?result.quantum_survival_probability,
            thermal = ?result.thermal_survival_probability,
            "tunneling"
        );
        Ok(result)
    }

    fn quantum(
        &mut self,
        false_vacuum: &PotentialMinimum,
        true_vacuum: &PotentialMinimum,
        result: &mut TunnelingResult,
    ) -> Result<f64> {
        let scale_squared = self
            .potential
            .scale_squared_relevant_to_tunneling(false_vacuum, true_vacuum);
        self.bounce
            .set_action_threshold(quantum_action_threshold(scale_squared, &self.settings));
        let action = self
            .bounce
            .bounce_action(
                false_vacuum.field_configuration(),
                true_vacuum.field_configuration(),
                0.0,
            )?
            .action;
        let (lifetime, probability) =
            quantum_survival(action, scale_squared, &self.settings, &self.diagnostics);
        result.quantum_action = Some(action);
        result.quantum_lifetime_in_seconds = Some(lifetime);
        result.quantum_survival_probability = Some(probability);
        Ok(probability)
    }

    fn thermal(
        &mut self,
        false_vacuum: &PotentialMinimum,
        true_vacuum: &PotentialMinimum,
        result: &mut TunnelingResult,
    ) -> Result<f64> {
        self.bounce.set_action_threshold(0.0);
        let outcome = self.thermal.integrate(
            &self.refiner,
            &mut self.bounce,
            false_vacuum,
            true_vacuum,
            self.settings.survival_probability_threshold,
        )?;
        result.thermal_survival_probability = Some(outcome.survival_probability);
        result.dominant_temperature_in_gev = outcome.dominant_temperature;
        result.thermal_decay_width = Some(outcome.decay_width);
        Ok(outcome.survival_probability)
    }
}
