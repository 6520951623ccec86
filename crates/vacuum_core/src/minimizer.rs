//! Classification of the refined minima relative to the DSB vacuum.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, VacuumError};
use crate::potential::{
    FieldConfiguration, LagrangianParameterManager, PotentialFunction, PotentialMinimum,
    ScaleDependent,
};
use crate::refiner::GradientRefiner;
use crate::starting_points::StartingPointGenerator;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MinimizerSettings {
    /// Two minima closer than this fraction of `max(|dsb|, 1)` in every
    /// field are the same minimum.
    pub extremum_separation_threshold_fraction: f64,
}

impl Default for MinimizerSettings {
    fn default() -> Self {
        Self {
            extremum_separation_threshold_fraction: 0.05,
        }
    }
}

pub struct PotentialMinimizer<P: PotentialFunction, G: StartingPointGenerator> {
    refiner: GradientRefiner<P>,
    generator: G,
    settings: MinimizerSettings,
    dsb_vacuum: Option<PotentialMinimum>,
    found_minima: Vec<PotentialMinimum>,
    panic_vacua: Vec<PotentialMinimum>,
    panic_vacuum: Option<PotentialMinimum>,
}

impl<P: PotentialFunction, G: StartingPointGenerator> PotentialMinimizer<P, G> {
    pub fn new(refiner: GradientRefiner<P>, generator: G, settings: MinimizerSettings) -> Result<Self> {
        if !(settings.extremum_separation_threshold_fraction > 0.0) {
            return Err(VacuumError::configuration(format!(
                "extremum_separation_threshold_fraction must be positive, got {}",
                settings.extremum_separation_threshold_fraction
            )));
        }
        Ok(Self {
            refiner,
            generator,
            settings,
            dsb_vacuum: None,
            found_minima: Vec::new(),
            panic_vacua: Vec::new(),
            panic_vacuum: None,
        })
    }

    pub fn potential(&self) -> &P {
        self.refiner.potential()
    }

    pub fn refiner(&self) -> &GradientRefiner<P> {
        &self.refiner
    }

    pub fn generator_mut(&mut self) -> &mut G {
        &mut self.generator
    }

    /// Refines the DSB input and every starting point at `temperature`, then
    /// classifies the distinct minima.
    pub fn find_minima(&mut self, temperature: f64) -> Result<()> {
        self.refiner.set_temperature(temperature);
        let fields = self.refiner.potential().number_of_field_variables();
        let dsb_input = self.refiner.potential().dsb_field_values();
        let dsb_vacuum = self.refiner.refine(&dsb_input)?;

        let mut starting_points: Vec<FieldConfiguration> = Vec::new();
        self.generator.generate(&mut starting_points)?;

        let half_width = self.separation_half_width(&dsb_vacuum);
        self.found_minima.clear();
        for start in &starting_points {
            if start.len() != fields {
                return Err(VacuumError::configuration(format!(
                    "starting point has {} fields, potential has {fields}",
                    start.len()
                )));
            }
            let minimum = self.refiner.refine(start)?;
            if self
                .found_minima
                .iter()
                .any(|known| known.within_hypercube(&minimum, half_width))
            {
                continue;
            }
            self.found_minima.push(minimum);
        }

        self.panic_vacua = self
            .found_minima
            .iter()
            .filter(|minimum| {
                !minimum.is_phase_rotation_of(&dsb_vacuum, half_width)
                    && minimum.potential_value() < dsb_vacuum.potential_value()
            })
            .cloned()
            .collect();
        self.panic_vacuum = self
            .panic_vacua
            .iter()
            .min_by(|a, b| {
                a.squared_distance_to(&dsb_vacuum)
                    .total_cmp(&b.squared_distance_to(&dsb_vacuum))
            })
            .cloned();

        info!(
            temperature,
            starting_points = starting_points.len(),
            minima = self.found_minima.len(),
            panic_vacua = self.panic_vacua.len(),
            dsb_value = dsb_vacuum.potential_value(),
            "classified vacua"
        );
        self.dsb_vacuum = Some(dsb_vacuum);
        Ok(())
    }

    fn separation_half_width(&self, dsb_vacuum: &PotentialMinimum) -> f64 {
        self.settings.extremum_separation_threshold_fraction * dsb_vacuum.length_squared().sqrt().max(1.0)
    }

    /// Re-minimizes `minimum` at `temperature`, starting from its location.
    pub fn refine_at_temperature(
        &self,
        minimum: &PotentialMinimum,
        temperature: f64,
    ) -> Result<PotentialMinimum> {
        self.refiner
            .refine_at(minimum.field_configuration(), temperature)
    }

    pub fn dsb_vacuum(&self) -> Option<&PotentialMinimum> {
        self.dsb_vacuum.as_ref()
    }

    pub fn found_minima(&self) -> &[PotentialMinimum] {
        &self.found_minima
    }

    pub fn panic_vacua(&self) -> &[PotentialMinimum] {
        &self.panic_vacua
    }

    pub fn panic_vacuum(&self) -> Option<&PotentialMinimum> {
        self.panic_vacuum.as_ref()
    }

    pub fn dsb_vacuum_is_stable(&self) -> bool {
        self.panic_vacua.is_empty()
    }
}

impl<P, G> PotentialMinimizer<P, G>
where
    P: PotentialFunction + ScaleDependent,
    G: StartingPointGenerator,
{
    /// Moves the potential to a new renormalization scale and forgets the
    /// minima found at the old one.
    pub fn update_for_scale(
        &mut self,
        manager: &dyn LagrangianParameterManager,
        log_scale: f64,
    ) -> Result<()> {
        self.refiner.potential_mut().update_for_scale(manager, log_scale)?;
        self.dsb_vacuum = None;
        self.found_minima.clear();
        self.panic_vacua.clear();
        self.panic_vacuum = None;
        Ok(())
    }
}
