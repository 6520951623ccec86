//! Field-space data types and the interfaces to the model layer.
//!
//! The potential itself (tree level plus loop and thermal corrections) and the
//! running of the Lagrangian parameters are built elsewhere; this crate only
//! consumes them through [`PotentialFunction`] and
//! [`LagrangianParameterManager`].

use serde::{Deserialize, Serialize};

use crate::error::{Result, VacuumError};
use crate::util::{squared_distance, within_hypercube};

/// One real value per scalar field, in the model's field order.
pub type FieldConfiguration = Vec<f64>;

/// A refined minimum of the potential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PotentialMinimum {
    field_configuration: FieldConfiguration,
    potential_value: f64,
    #[serde(default)]
    field_uncertainties: Option<Vec<f64>>,
}

impl PotentialMinimum {
    pub fn new(field_configuration: FieldConfiguration, potential_value: f64) -> Self {
        Self {
            field_configuration,
            potential_value,
            field_uncertainties: None,
        }
    }

    pub fn with_uncertainties(mut self, uncertainties: Vec<f64>) -> Self {
        self.field_uncertainties = Some(uncertainties);
        self
    }

    pub fn field_configuration(&self) -> &[f64] {
        &self.field_configuration
    }

    pub fn potential_value(&self) -> f64 {
        self.potential_value
    }

    pub fn field_uncertainties(&self) -> Option<&[f64]> {
        self.field_uncertainties.as_deref()
    }

    pub fn number_of_fields(&self) -> usize {
        self.field_configuration.len()
    }

    pub fn length_squared(&self) -> f64 {
        self.field_configuration.iter().map(|v| v * v).sum()
    }

    pub fn squared_distance_to(&self, other: &PotentialMinimum) -> f64 {
        squared_distance(&self.field_configuration, &other.field_configuration)
    }

    /// True if every field of `other` is within `half_width` of this one.
    pub fn within_hypercube(&self, other: &PotentialMinimum, half_width: f64) -> bool {
        within_hypercube(&self.field_configuration, &other.field_configuration, half_width)
    }

    /// True if `|field_i|` matches `|other_i|` within `half_width` for every field,
    /// i.e. the two differ at most by sign flips of individual fields.
    pub fn is_phase_rotation_of(&self, other: &PotentialMinimum, half_width: f64) -> bool {
        self.number_of_fields() == other.number_of_fields()
            && self
                .field_configuration
                .iter()
                .zip(other.field_configuration.iter())
                .all(|(a, b)| (a.abs() - b.abs()).abs() <= half_width)
    }
}

/// The effective potential of the model.
pub trait PotentialFunction {
    /// Energy density at `fields` and `temperature` (GeV).
    fn evaluate(&self, fields: &[f64], temperature: f64) -> f64;

    fn number_of_field_variables(&self) -> usize;

    /// The symmetric point, usually all zeros.
    fn field_values_origin(&self) -> FieldConfiguration {
        vec![0.0; self.number_of_field_variables()]
    }

    /// Squared energy scale that sets the prefactor of the tunneling rate.
    fn scale_squared_relevant_to_tunneling(
        &self,
        false_vacuum: &PotentialMinimum,
        true_vacuum: &PotentialMinimum,
    ) -> f64 {
        false_vacuum
            .length_squared()
            .max(true_vacuum.length_squared())
    }

    /// The model's nominal DSB field values.
    fn dsb_field_values(&self) -> FieldConfiguration;
}

impl<P: PotentialFunction + ?Sized> PotentialFunction for &P {
    fn evaluate(&self, fields: &[f64], temperature: f64) -> f64 {
        (**self).evaluate(fields, temperature)
    }

    fn number_of_field_variables(&self) -> usize {
        (**self).number_of_field_variables()
    }

    fn field_values_origin(&self) -> FieldConfiguration {
        (**self).field_values_origin()
    }

    fn scale_squared_relevant_to_tunneling(
        &self,
        false_vacuum: &PotentialMinimum,
        true_vacuum: &PotentialMinimum,
    ) -> f64 {
        (**self).scale_squared_relevant_to_tunneling(false_vacuum, true_vacuum)
    }

    fn dsb_field_values(&self) -> FieldConfiguration {
        (**self).dsb_field_values()
    }
}

/// Source of Lagrangian parameter values as functions of the renormalization scale.
pub trait LagrangianParameterManager {
    /// Parameter values at `ln(scale / GeV)`.
    fn parameter_values(&self, log_scale: f64) -> Vec<f64>;

    fn minimum_evaluation_scale(&self) -> f64;

    fn maximum_evaluation_scale(&self) -> f64;

    fn appropriate_single_fixed_scale(&self) -> f64;
}

/// Components whose state depends on the renormalization scale. The
/// orchestration layer calls [`ScaleDependent::update_for_scale`] on each of
/// them in dependency order after choosing a new scale.
pub trait ScaleDependent {
    fn update_for_scale(
        &mut self,
        manager: &dyn LagrangianParameterManager,
        log_scale: f64,
    ) -> Result<()>;
}

/// Parameters that do not run: the same values at every scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedParameterManager {
    values: Vec<f64>,
    minimum_scale: f64,
    maximum_scale: f64,
    fixed_scale: f64,
}

impl FixedParameterManager {
    pub fn new(values: Vec<f64>, fixed_scale: f64) -> Result<Self> {
        if !(fixed_scale > 0.0) {
            return Err(VacuumError::configuration(format!(
                "renormalization scale must be positive, got {fixed_scale}"
            )));
        }
        Ok(Self {
            values,
            minimum_scale: fixed_scale,
            maximum_scale: fixed_scale,
            fixed_scale,
        })
    }

    /// Widens the evaluation range reported to multi-scale generators.
    pub fn with_evaluation_range(mut self, minimum_scale: f64, maximum_scale: f64) -> Result<Self> {
        if !(minimum_scale > 0.0) || maximum_scale < minimum_scale {
            return Err(VacuumError::configuration(format!(
                "invalid evaluation range [{minimum_scale}, {maximum_scale}]"
            )));
        }
        self.minimum_scale = minimum_scale;
        self.maximum_scale = maximum_scale;
        Ok(self)
    }
}

impl LagrangianParameterManager for FixedParameterManager {
    fn parameter_values(&self, _log_scale: f64) -> Vec<f64> {
        self.values.clone()
    }

    fn minimum_evaluation_scale(&self) -> f64 {
        self.minimum_scale
    }

    fn maximum_evaluation_scale(&self) -> f64 {
        self.maximum_scale
    }

    fn appropriate_single_fixed_scale(&self) -> f64 {
        self.fixed_scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_rotation_ignores_signs_only() {
        let dsb = PotentialMinimum::new(vec![246.0, -10.0], -1.0);
        let flipped = PotentialMinimum::new(vec![-246.0, 10.0], -1.0);
        let other = PotentialMinimum::new(vec![246.0, 50.0], -2.0);
        assert!(flipped.is_phase_rotation_of(&dsb, 1e-3));
        assert!(!other.is_phase_rotation_of(&dsb, 1e-3));
    }

    #[test]
    fn squared_distance_is_euclidean() {
        let a = PotentialMinimum::new(vec![0.0, 0.0], 0.0);
        let b = PotentialMinimum::new(vec![3.0, 4.0], 0.0);
        assert_eq!(a.squared_distance_to(&b), 25.0);
        assert_eq!(b.length_squared(), 25.0);
    }

    #[test]
    fn fixed_manager_rejects_bad_range() {
        let manager = FixedParameterManager::new(vec![1.0], 100.0).expect("manager");
        assert!(manager.clone().with_evaluation_range(10.0, 1.0).is_err());
        let widened = manager
            .with_evaluation_range(10.0, 1000.0)
            .expect("valid range");
        assert_eq!(widened.minimum_evaluation_scale(), 10.0);
        assert_eq!(widened.appropriate_single_fixed_scale(), 100.0);
    }

    #[test]
    fn minimum_round_trips_through_json() {
        let minimum = PotentialMinimum::new(vec![1.0, 2.0], -3.0).with_uncertainties(vec![0.1, 0.2]);
        let text = serde_json::to_string(&minimum).expect("serialize");
        let back: PotentialMinimum = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, minimum);
    }
}
