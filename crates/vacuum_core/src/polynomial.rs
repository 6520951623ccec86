//! Polynomial constraints and a parameter-dependent polynomial potential.
//!
//! A [`ConstraintSystem`] is the set of stationarity conditions
//! `dV/dphi_i = 0` of the tree-level potential after the Lagrangian parameters
//! have been replaced by their values at one renormalization scale.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VacuumError};
use crate::potential::{
    FieldConfiguration, LagrangianParameterManager, PotentialFunction, PotentialMinimum,
    ScaleDependent,
};
use crate::traits::PolynomialScalar;

/// `coefficient * prod(phi_i ^ power_i)`, powers sorted by field index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolynomialTerm {
    pub coefficient: f64,
    pub powers: Vec<(usize, u32)>,
}

impl PolynomialTerm {
    pub fn new(coefficient: f64, powers: &[(usize, u32)]) -> Self {
        let mut merged: Vec<(usize, u32)> = Vec::with_capacity(powers.len());
        let mut sorted = powers.to_vec();
        sorted.sort_by_key(|(field, _)| *field);
        for (field, power) in sorted {
            if power == 0 {
                continue;
            }
            match merged.last_mut() {
                Some((last_field, last_power)) if *last_field == field => *last_power += power,
                _ => merged.push((field, power)),
            }
        }
        Self {
            coefficient,
            powers: merged,
        }
    }

    pub fn constant(coefficient: f64) -> Self {
        Self {
            coefficient,
            powers: Vec::new(),
        }
    }

    pub fn total_degree(&self) -> u32 {
        self.powers.iter().map(|(_, power)| power).sum()
    }

    pub fn power_of(&self, field: usize) -> u32 {
        self.powers
            .iter()
            .find(|(index, _)| *index == field)
            .map(|(_, power)| *power)
            .unwrap_or(0)
    }

    pub fn evaluate<T: PolynomialScalar>(&self, fields: &[T]) -> T {
        let mut value = T::from_real(self.coefficient);
        for &(field, power) in &self.powers {
            value = value * fields[field].powu(power);
        }
        value
    }

    /// d/dphi_field of this term, or `None` if it does not depend on the field.
    pub fn partial_derivative(&self, field: usize) -> Option<PolynomialTerm> {
        let power = self.power_of(field);
        if power == 0 || self.coefficient == 0.0 {
            return None;
        }
        let powers: Vec<(usize, u32)> = self
            .powers
            .iter()
            .filter_map(|&(index, p)| {
                if index != field {
                    Some((index, p))
                } else if p > 1 {
                    Some((index, p - 1))
                } else {
                    None
                }
            })
            .collect();
        Some(PolynomialTerm {
            coefficient: self.coefficient * power as f64,
            powers,
        })
    }
}

/// A sum of terms, one stationarity equation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolynomialConstraint {
    pub terms: Vec<PolynomialTerm>,
}

impl PolynomialConstraint {
    pub fn new(terms: Vec<PolynomialTerm>) -> Self {
        Self { terms }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.iter().all(|term| term.coefficient == 0.0)
    }

    pub fn degree(&self) -> u32 {
        self.terms
            .iter()
            .filter(|term| term.coefficient != 0.0)
            .map(PolynomialTerm::total_degree)
            .max()
            .unwrap_or(0)
    }

    pub fn evaluate<T: PolynomialScalar>(&self, fields: &[T]) -> T {
        self.terms
            .iter()
            .fold(T::zero(), |sum, term| sum + term.evaluate(fields))
    }

    pub fn partial_derivative(&self, field: usize) -> PolynomialConstraint {
        PolynomialConstraint {
            terms: self
                .terms
                .iter()
                .filter_map(|term| term.partial_derivative(field))
                .collect(),
        }
    }

    fn max_field_index(&self) -> Option<usize> {
        self.terms
            .iter()
            .flat_map(|term| term.powers.iter().map(|(field, _)| *field))
            .max()
    }
}

/// One constraint per field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSystem {
    number_of_fields: usize,
    constraints: Vec<PolynomialConstraint>,
}

impl ConstraintSystem {
    /// Builds and validates a square system.
    pub fn new(number_of_fields: usize, constraints: Vec<PolynomialConstraint>) -> Result<Self> {
        if number_of_fields == 0 {
            return Err(VacuumError::configuration(
                "constraint system needs at least one field",
            ));
        }
        if constraints.len() != number_of_fields {
            return Err(VacuumError::configuration(format!(
                "expected {} constraints (one per field), got {}",
                number_of_fields,
                constraints.len()
            )));
        }
        for (index, constraint) in constraints.iter().enumerate() {
            if constraint.is_empty() {
                return Err(VacuumError::configuration(format!(
                    "constraint {index} has no non-zero terms"
                )));
            }
            if let Some(max_field) = constraint.max_field_index() {
                if max_field >= number_of_fields {
                    return Err(VacuumError::configuration(format!(
                        "constraint {index} refers to field {max_field} but the system has {number_of_fields} fields"
                    )));
                }
            }
        }
        Ok(Self {
            number_of_fields,
            constraints,
        })
    }

    /// The stationarity conditions of `potential`: one partial derivative per field.
    pub fn stationarity_of(number_of_fields: usize, potential: &PolynomialConstraint) -> Result<Self> {
        let constraints = (0..number_of_fields)
            .map(|field| potential.partial_derivative(field))
            .collect();
        Self::new(number_of_fields, constraints)
    }

    pub fn number_of_fields(&self) -> usize {
        self.number_of_fields
    }

    pub fn constraints(&self) -> &[PolynomialConstraint] {
        &self.constraints
    }

    pub fn degrees(&self) -> Vec<u32> {
        self.constraints.iter().map(PolynomialConstraint::degree).collect()
    }

    pub fn evaluate<T: PolynomialScalar>(&self, fields: &[T]) -> Vec<T> {
        self.constraints
            .iter()
            .map(|constraint| constraint.evaluate(fields))
            .collect()
    }

    /// Jacobian of the constraints, `[i][j] = d constraint_i / d phi_j`.
    pub fn jacobian(&self) -> Vec<Vec<PolynomialConstraint>> {
        self.constraints
            .iter()
            .map(|constraint| {
                (0..self.number_of_fields)
                    .map(|field| constraint.partial_derivative(field))
                    .collect()
            })
            .collect()
    }

    /// Jacobian evaluated at a real point. For a stationarity system this is
    /// the Hessian of the underlying potential.
    pub fn jacobian_at(&self, fields: &[f64]) -> DMatrix<f64> {
        let dim = self.number_of_fields;
        let mut matrix = DMatrix::zeros(dim, dim);
        for (i, row) in self.jacobian().iter().enumerate() {
            for (j, entry) in row.iter().enumerate() {
                matrix[(i, j)] = entry.evaluate(fields);
            }
        }
        matrix
    }
}

/// Produces the tree-level stationarity system for given parameter values.
pub trait StationaritySource {
    fn number_of_fields(&self) -> usize;

    fn stationarity_system(&self, parameter_values: &[f64]) -> Result<ConstraintSystem>;
}

/// A monomial whose coefficient is `constant * prod(parameters[k])`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParametrizedTerm {
    pub constant: f64,
    #[serde(default)]
    pub parameter_factors: Vec<usize>,
    pub powers: Vec<(usize, u32)>,
}

impl ParametrizedTerm {
    pub fn new(constant: f64, parameter_factors: &[usize], powers: &[(usize, u32)]) -> Self {
        Self {
            constant,
            parameter_factors: parameter_factors.to_vec(),
            powers: PolynomialTerm::new(1.0, powers).powers,
        }
    }

    fn substitute(&self, parameter_values: &[f64]) -> Result<PolynomialTerm> {
        let mut coefficient = self.constant;
        for &index in &self.parameter_factors {
            let value = parameter_values.get(index).ok_or_else(|| {
                VacuumError::configuration(format!(
                    "term refers to parameter {index} but only {} values were supplied",
                    parameter_values.len()
                ))
            })?;
            coefficient *= value;
        }
        Ok(PolynomialTerm {
            coefficient,
            powers: self.powers.clone(),
        })
    }
}

/// Tree-level polynomial potential with optional leading thermal masses.
///
/// `V(phi, T) = sum_k c_k(params) phi^k + T^2 sum_i m_i phi_i^2`.
/// Parameter values are held for the current scale and replaced with
/// [`ScaleDependent::update_for_scale`]; until the first update only
/// parameter-free terms contribute.
#[derive(Debug, Clone, PartialEq)]
pub struct PolynomialPotential {
    number_of_fields: usize,
    terms: Vec<ParametrizedTerm>,
    thermal_mass_coefficients: Vec<f64>,
    dsb_field_values: FieldConfiguration,
    parameter_values: Vec<f64>,
    renormalization_scale: f64,
    substituted: PolynomialConstraint,
}

impl PolynomialPotential {
    pub fn new(
        number_of_fields: usize,
        terms: Vec<ParametrizedTerm>,
        dsb_field_values: FieldConfiguration,
    ) -> Result<Self> {
        if number_of_fields == 0 {
            return Err(VacuumError::configuration("potential needs at least one field"));
        }
        if dsb_field_values.len() != number_of_fields {
            return Err(VacuumError::configuration(format!(
                "DSB input has {} fields, potential has {}",
                dsb_field_values.len(),
                number_of_fields
            )));
        }
        if let Some(bad) = terms
            .iter()
            .flat_map(|term| term.powers.iter())
            .find(|(field, _)| *field >= number_of_fields)
        {
            return Err(VacuumError::configuration(format!(
                "term refers to field {} but the potential has {} fields",
                bad.0, number_of_fields
            )));
        }
        let mut potential = Self {
            number_of_fields,
            terms,
            thermal_mass_coefficients: Vec::new(),
            dsb_field_values,
            parameter_values: Vec::new(),
            renormalization_scale: 1.0,
            substituted: PolynomialConstraint::default(),
        };
        potential.substituted = PolynomialConstraint::new(
            potential
                .terms
                .iter()
                .filter(|term| term.parameter_factors.is_empty())
                .map(|term| PolynomialTerm {
                    coefficient: term.constant,
                    powers: term.powers.clone(),
                })
                .collect(),
        );
        Ok(potential)
    }

    /// A potential with plain numeric coefficients and no parameters.
    pub fn from_terms(
        number_of_fields: usize,
        terms: &[PolynomialTerm],
        dsb_field_values: FieldConfiguration,
    ) -> Result<Self> {
        let parametrized = terms
            .iter()
            .map(|term| ParametrizedTerm {
                constant: term.coefficient,
                parameter_factors: Vec::new(),
                powers: term.powers.clone(),
            })
            .collect();
        Self::new(number_of_fields, parametrized, dsb_field_values)
    }

    pub fn with_thermal_masses(mut self, coefficients: Vec<f64>) -> Result<Self> {
        if coefficients.len() != self.number_of_fields {
            return Err(VacuumError::configuration(format!(
                "expected {} thermal mass coefficients, got {}",
                self.number_of_fields,
                coefficients.len()
            )));
        }
        self.thermal_mass_coefficients = coefficients;
        Ok(self)
    }

    pub fn renormalization_scale(&self) -> f64 {
        self.renormalization_scale
    }

    pub fn tree_level_polynomial(&self) -> &PolynomialConstraint {
        &self.substituted
    }

    fn substitute(&self, parameter_values: &[f64]) -> Result<PolynomialConstraint> {
        let terms = self
            .terms
            .iter()
            .map(|term| term.substitute(parameter_values))
            .collect::<Result<Vec<_>>>()?;
        Ok(PolynomialConstraint::new(terms))
    }

    fn resubstitute(&mut self) -> Result<()> {
        self.substituted = self.substitute(&self.parameter_values)?;
        Ok(())
    }
}

impl ScaleDependent for PolynomialPotential {
    /// Replaces the parameter values with those at `ln(scale)`.
    fn update_for_scale(
        &mut self,
        manager: &dyn LagrangianParameterManager,
        log_scale: f64,
    ) -> Result<()> {
        self.parameter_values = manager.parameter_values(log_scale);
        self.renormalization_scale = log_scale.exp();
        self.resubstitute()
    }
}

impl PotentialFunction for PolynomialPotential {
    fn evaluate(&self, fields: &[f64], temperature: f64) -> f64 {
        let tree = self.substituted.evaluate(fields);
        if self.thermal_mass_coefficients.is_empty() || temperature == 0.0 {
            return tree;
        }
        let thermal: f64 = self
            .thermal_mass_coefficients
            .iter()
            .zip(fields.iter())
            .map(|(coefficient, field)| coefficient * field * field)
            .sum();
        tree + temperature * temperature * thermal
    }

    fn number_of_field_variables(&self) -> usize {
        self.number_of_fields
    }

    fn scale_squared_relevant_to_tunneling(
        &self,
        false_vacuum: &PotentialMinimum,
        true_vacuum: &PotentialMinimum,
    ) -> f64 {
        let scale_squared = self.renormalization_scale * self.renormalization_scale;
        scale_squared
            .max(false_vacuum.length_squared())
            .max(true_vacuum.length_squared())
    }

    fn dsb_field_values(&self) -> FieldConfiguration {
        self.dsb_field_values.clone()
    }
}

impl StationaritySource for PolynomialPotential {
    fn number_of_fields(&self) -> usize {
        self.number_of_fields
    }

    fn stationarity_system(&self, parameter_values: &[f64]) -> Result<ConstraintSystem> {
        let tree = self.substitute(parameter_values)?;
        ConstraintSystem::stationarity_of(self.number_of_fields, &tree)
    }
}

#[cfg(test)]
pub(crate) mod test_models {
    use super::*;

    /// V(f) = f^2 (f - 1)^2 = f^4 - 2 f^3 + f^2.
    pub fn degenerate_quartic() -> PolynomialPotential {
        PolynomialPotential::from_terms(
            1,
            &[
                PolynomialTerm::new(1.0, &[(0, 4)]),
                PolynomialTerm::new(-2.0, &[(0, 3)]),
                PolynomialTerm::new(1.0, &[(0, 2)]),
            ],
            vec![0.0],
        )
        .expect("quartic")
    }

    /// V(f) = 20 f^2 (1 - f)^2 - 0.5 (3 f^2 - 2 f^3): minima at 0 (V = 0) and
    /// 1 (V = -0.5) with a barrier of height 1 in between.
    pub fn tilted_double_well() -> PolynomialPotential {
        PolynomialPotential::from_terms(
            1,
            &[
                PolynomialTerm::new(20.0, &[(0, 2)]),
                PolynomialTerm::new(-40.0, &[(0, 3)]),
                PolynomialTerm::new(20.0, &[(0, 4)]),
                PolynomialTerm::new(-1.5, &[(0, 2)]),
                PolynomialTerm::new(1.0, &[(0, 3)]),
            ],
            vec![0.0],
        )
        .expect("double well")
    }

    /// Two decoupled tilted double wells, so the deepest vacuum sits at (1, 1).
    pub fn two_field_double_well() -> PolynomialPotential {
        let mut terms = Vec::new();
        for field in 0..2 {
            terms.push(PolynomialTerm::new(20.0, &[(field, 2)]));
            terms.push(PolynomialTerm::new(-40.0, &[(field, 3)]));
            terms.push(PolynomialTerm::new(20.0, &[(field, 4)]));
            terms.push(PolynomialTerm::new(-1.5, &[(field, 2)]));
            terms.push(PolynomialTerm::new(1.0, &[(field, 3)]));
        }
        PolynomialPotential::from_terms(2, &terms, vec![0.0, 0.0]).expect("two-field well")
    }
}

#[cfg(test)]
mod tests {
    use super::test_models::*;
    use super::*;
    use num_complex::Complex;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn term_merges_repeated_fields() {
        let term = PolynomialTerm::new(2.0, &[(1, 1), (0, 2), (1, 2)]);
        assert_eq!(term.powers, vec![(0, 2), (1, 3)]);
        assert_eq!(term.total_degree(), 5);
    }

    #[test]
    fn derivative_of_quartic_has_expected_roots() {
        let potential = degenerate_quartic();
        let system = potential
            .stationarity_system(&[])
            .expect("stationarity system");
        for root in [0.0, 0.5, 1.0] {
            let value = system.evaluate(&[root])[0];
            assert!(value.abs() < 1e-12, "dV/df({root}) = {value}");
        }
        assert_eq!(system.degrees(), vec![3]);
    }

    #[test]
    fn complex_evaluation_matches_real_on_real_axis() {
        let constraint = PolynomialConstraint::new(vec![
            PolynomialTerm::new(1.0, &[(0, 3)]),
            PolynomialTerm::new(-2.0, &[(0, 1), (1, 1)]),
            PolynomialTerm::constant(0.5),
        ]);
        let real: f64 = constraint.evaluate(&[1.5, -0.25]);
        let complex: Complex<f64> =
            constraint.evaluate(&[Complex::new(1.5, 0.0), Complex::new(-0.25, 0.0)]);
        assert!((complex.re - real).abs() < 1e-12);
        assert!(complex.im.abs() < 1e-12);
    }

    #[test]
    fn jacobian_of_stationarity_is_hessian() {
        let potential = degenerate_quartic();
        let system = potential.stationarity_system(&[]).expect("system");
        // V'' = 12 f^2 - 12 f + 2
        let hessian = system.jacobian_at(&[0.5]);
        assert!((hessian[(0, 0)] + 1.0).abs() < 1e-12);
        let hessian = system.jacobian_at(&[1.0]);
        assert!((hessian[(0, 0)] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn zero_term_constraint_is_rejected() {
        let empty = PolynomialConstraint::default();
        let fine = PolynomialConstraint::new(vec![PolynomialTerm::new(1.0, &[(0, 1)])]);
        assert_err_contains(
            ConstraintSystem::new(2, vec![fine, empty]),
            "has no non-zero terms",
        );
    }

    #[test]
    fn system_must_be_square() {
        let fine = PolynomialConstraint::new(vec![PolynomialTerm::new(1.0, &[(0, 1)])]);
        assert_err_contains(ConstraintSystem::new(2, vec![fine]), "one per field");
    }

    #[test]
    fn parameters_are_substituted_at_each_scale() {
        use crate::potential::{FixedParameterManager, ScaleDependent};

        // V = -mu2 f^2 + lambda f^4 with mu2 = params[0], lambda = params[1]
        let terms = vec![
            ParametrizedTerm::new(-1.0, &[0], &[(0, 2)]),
            ParametrizedTerm::new(1.0, &[1], &[(0, 4)]),
        ];
        let mut potential = PolynomialPotential::new(1, terms, vec![1.0]).expect("potential");
        let manager = FixedParameterManager::new(vec![2.0, 1.0], 100.0).expect("manager");
        potential
            .update_for_scale(&manager, 100.0f64.ln())
            .expect("update");
        // minimum at f^2 = mu2 / (2 lambda) = 1
        assert!((potential.evaluate(&[1.0], 0.0) + 1.0).abs() < 1e-12);
        assert!((potential.renormalization_scale() - 100.0).abs() < 1e-9);

        let system = potential.stationarity_system(&[2.0, 1.0]).expect("system");
        assert!(system.evaluate(&[1.0])[0].abs() < 1e-12);
    }

    #[test]
    fn missing_parameter_is_a_configuration_error() {
        let terms = vec![ParametrizedTerm::new(1.0, &[3], &[(0, 2)])];
        let potential = PolynomialPotential::new(1, terms, vec![0.0]).expect("potential");
        assert_err_contains(
            potential.stationarity_system(&[1.0, 2.0]),
            "refers to parameter 3",
        );
    }

    #[test]
    fn thermal_masses_lift_the_broken_phase() {
        let potential = tilted_double_well()
            .with_thermal_masses(vec![1.0])
            .expect("thermal");
        let cold = potential.evaluate(&[1.0], 0.0);
        let hot = potential.evaluate(&[1.0], 2.0);
        assert!((hot - cold - 4.0).abs() < 1e-12);
    }
}
