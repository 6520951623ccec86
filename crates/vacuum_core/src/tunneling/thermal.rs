//! Thermal decay: the temperature window in which the panic vacuum is
//! deeper than the symmetric phase, and the decay width integrated over it.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::bounce::BounceActionCalculator;
use super::CancellationToken;
use crate::error::{Diagnostics, Result, VacuumError, Warning};
use crate::potential::{PotentialFunction, PotentialMinimum};
use crate::refiner::GradientRefiner;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThermalSettings {
    pub thermal_integration_steps: usize,
    /// Relativistic degrees of freedom `g*` in the Hubble rate.
    pub effective_degrees_of_freedom: f64,
    /// GeV; also the highest temperature searched.
    pub planck_mass: f64,
    pub bisection_steps: usize,
}

impl Default for ThermalSettings {
    fn default() -> Self {
        Self {
            thermal_integration_steps: 50,
            effective_degrees_of_freedom: 106.75,
            planck_mass: 1.22e19,
            bisection_steps: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermalOutcome {
    pub survival_probability: f64,
    /// Integrated decay width (dimensionless exponent of the survival).
    pub decay_width: f64,
    /// Temperature with the largest `dGamma/dT`, if any step contributed.
    pub dominant_temperature: Option<f64>,
    /// Upper end of the integration range.
    pub critical_temperature: f64,
}

pub struct ThermalIntegrator {
    settings: ThermalSettings,
    diagnostics: Diagnostics,
    cancellation: CancellationToken,
}

impl ThermalIntegrator {
    pub fn new(
        settings: ThermalSettings,
        diagnostics: Diagnostics,
        cancellation: CancellationToken,
    ) -> Result<Self> {
        if settings.thermal_integration_steps == 0 {
            return Err(VacuumError::configuration(
                "thermal_integration_steps must be greater than zero",
            ));
        }
        if !(settings.effective_degrees_of_freedom > 0.0) || !(settings.planck_mass > 0.0) {
            return Err(VacuumError::configuration(format!(
                "effective_degrees_of_freedom and planck_mass must be positive, got {} and {}",
                settings.effective_degrees_of_freedom, settings.planck_mass
            )));
        }
        Ok(Self {
            settings,
            diagnostics,
            cancellation,
        })
    }

    pub fn settings(&self) -> ThermalSettings {
        self.settings
    }

    /// `(4 pi / 3) (M_Pl / (1.66 sqrt(g*)))^4`, as its logarithm.
    fn log_prefactor(&self) -> f64 {
        let hubble_mass =
            self.settings.planck_mass / (1.66 * self.settings.effective_degrees_of_freedom.sqrt());
        (4.0 * PI / 3.0).ln() + 4.0 * hubble_mass.ln()
    }

    /// Highest temperature at which `vacuum`, followed from its location as
    /// the temperature rises, is still deeper than the field origin. The
    /// search doubles from `max(|vacuum|, 1)` and then bisects; reaching the
    /// Planck mass is recorded as [`Warning::ThermalRangeCapped`] and the cap
    /// is returned.
    pub fn critical_temperature<P: PotentialFunction>(
        &self,
        refiner: &GradientRefiner<P>,
        vacuum: &PotentialMinimum,
    ) -> Result<f64> {
        let deeper_at = |location: &[f64], temperature: f64| -> Result<Option<PotentialMinimum>> {
            let minimum = refiner.refine_at(location, temperature)?;
            Ok((minimum.potential_value() < 0.0).then_some(minimum))
        };

        let mut tracked = vacuum.field_configuration().to_vec();
        let mut lower = 0.0;
        let mut upper = vacuum.length_squared().sqrt().max(1.0);
        loop {
            self.cancellation.check()?;
            if upper >= self.settings.planck_mass {
                if deeper_at(&tracked, self.settings.planck_mass)?.is_some() {
                    self.diagnostics.record(Warning::ThermalRangeCapped {
                        temperature: self.settings.planck_mass,
                    });
                    return Ok(self.settings.planck_mass);
                }
                upper = self.settings.planck_mass;
                break;
            }
            match deeper_at(&tracked, upper)? {
                Some(minimum) => {
                    tracked = minimum.field_configuration().to_vec();
                    lower = upper;
                    upper *= 2.0;
                }
                None => break,
            }
        }

        for _ in 0..self.settings.bisection_steps {
            let middle = 0.5 * (lower + upper);
            match deeper_at(&tracked, middle)? {
                Some(minimum) => {
                    tracked = minimum.field_configuration().to_vec();
                    lower = middle;
                }
                None => upper = middle,
            }
        }
        debug!(critical_temperature = lower, "vacuum window");
        Ok(lower)
    }

    /// Integrates `dGamma/dT = C exp(-S_3 / T) / T^5` downwards from the
    /// critical temperature of `true_vacuum`, tunneling at each step from the
    /// symmetric phase (or the thermally shifted `false_vacuum` below its own
    /// critical temperature). Stops as soon as the survival probability falls
    /// below `survival_threshold`.
    pub fn integrate<P, Q>(
        &self,
        refiner: &GradientRefiner<P>,
        bounce: &mut BounceActionCalculator<'_, Q>,
        false_vacuum: &PotentialMinimum,
        true_vacuum: &PotentialMinimum,
        survival_threshold: f64,
    ) -> Result<ThermalOutcome>
    where
        P: PotentialFunction,
        Q: PotentialFunction,
    {
        let potential = refiner.potential();
        let origin = potential.field_values_origin();
        let above_origin =
            potential.evaluate(false_vacuum.field_configuration(), 0.0) - potential.evaluate(&origin, 0.0);
        if above_origin > 0.0 {
            info!(above_origin, "false vacuum above the field origin at T = 0; thermal survival set to 0");
            return Ok(ThermalOutcome {
                survival_probability: 0.0,
                decay_width: f64::INFINITY,
                dominant_temperature: None,
                critical_temperature: 0.0,
            });
        }

        let critical_temperature = self.critical_temperature(refiner, true_vacuum)?;
        let false_vacuum_critical = if false_vacuum.potential_value() < 0.0 {
            self.critical_temperature(refiner, false_vacuum)?
        } else {
            0.0
        };

        let steps = self.settings.thermal_integration_steps;
        let step = critical_temperature / steps as f64;
        let log_prefactor = self.log_prefactor();
        let mut decay_width = 0.0;
        let mut dominant: Option<(f64, f64)> = None;
        let mut true_location = true_vacuum.field_configuration().to_vec();

        for k in 0..steps {
            self.cancellation.check()?;
            let temperature = critical_temperature * (steps as f64 - k as f64 - 0.5) / steps as f64;
            let false_location = if temperature >= false_vacuum_critical {
                origin.clone()
            } else {
                refiner
                    .refine_at(false_vacuum.field_configuration(), temperature)?
                    .field_configuration()
                    .to_vec()
            };
            let true_minimum = refiner.refine_at(&true_location, temperature)?;
            let false_value = potential.evaluate(&false_location, temperature);
            let true_value = potential.evaluate(true_minimum.field_configuration(), temperature);
            true_location = true_minimum.field_configuration().to_vec();
            if !(true_value < false_value) {
                continue;
            }

            let action = bounce
                .bounce_action(&false_location, &true_location, temperature)?
                .action;
            let log_rate = log_prefactor - action / temperature - 5.0 * temperature.ln();
            if log_rate.is_nan() {
                continue;
            }
            let rate = log_rate.exp();
            decay_width += rate * step;
            if dominant.map_or(true, |(_, largest)| rate > largest) {
                dominant = Some((temperature, rate));
            }
            debug!(temperature, action, rate, decay_width, "thermal step");
            if (-decay_width).exp() < survival_threshold {
                break;
            }
        }

        let survival_probability = super::survival_from_decay_width(decay_width, &self.diagnostics);
        info!(
            critical_temperature,
            decay_width,
            survival_probability,
            "thermal survival"
        );
        Ok(ThermalOutcome {
            survival_probability,
            decay_width,
            dominant_temperature: dominant.map(|(temperature, _)| temperature),
            critical_temperature,
        })
    }
}
