//! Paths through field space from the false vacuum (`p = 0`) to the true
//! vacuum (`p = 1`).
//!
//! Each field is a polynomial in the auxiliary variable `p`. The same
//! polynomial is also kept expanded around the true-vacuum end in the offset
//! `d = 1 - p`, so that points a tiny offset away from the true vacuum keep
//! full precision.

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, VacuumError};
use crate::potential::FieldConfiguration;
use crate::util::{dot, l2_norm, subtract};

#[derive(Debug, Clone, PartialEq)]
pub struct TunnelPath {
    false_vacuum: FieldConfiguration,
    true_vacuum: FieldConfiguration,
    /// `coefficients[field][k]` multiplies `p^k`.
    coefficients: Vec<Vec<f64>>,
    /// `offset_coefficients[field][k]` multiplies `d^k`.
    offset_coefficients: Vec<Vec<f64>>,
    temperature: f64,
}

impl TunnelPath {
    pub fn straight(
        false_vacuum: &[f64],
        true_vacuum: &[f64],
        temperature: f64,
    ) -> Result<Self> {
        check_endpoints(false_vacuum, true_vacuum)?;
        let coefficients = false_vacuum
            .iter()
            .zip(true_vacuum.iter())
            .map(|(a, b)| vec![*a, b - a])
            .collect();
        Ok(Self::from_coefficients(
            false_vacuum,
            true_vacuum,
            coefficients,
            temperature,
        ))
    }

    /// The interpolating polynomial path through `nodes`, node `k` (from 0)
    /// placed at `p = (k + 1) / (nodes.len() + 1)`.
    pub fn through_nodes(
        false_vacuum: &[f64],
        true_vacuum: &[f64],
        nodes: &[FieldConfiguration],
        temperature: f64,
    ) -> Result<Self> {
        check_endpoints(false_vacuum, true_vacuum)?;
        if nodes.is_empty() {
            return Self::straight(false_vacuum, true_vacuum, temperature);
        }
        let fields = false_vacuum.len();
        if let Some(node) = nodes.iter().find(|node| node.len() != fields) {
            return Err(VacuumError::configuration(format!(
                "path node has {} fields, vacua have {fields}",
                node.len()
            )));
        }

        let points = nodes.len() + 2;
        let spacing = 1.0 / (nodes.len() + 1) as f64;
        let vandermonde = DMatrix::from_fn(points, points, |row, column| {
            let p = if row == points - 1 { 1.0 } else { row as f64 * spacing };
            p.powi(column as i32)
        });
        let lu = vandermonde.lu();

        let mut coefficients = Vec::with_capacity(fields);
        for field in 0..fields {
            let values = DVector::from_iterator(
                points,
                std::iter::once(false_vacuum[field])
                    .chain(nodes.iter().map(|node| node[field]))
                    .chain(std::iter::once(true_vacuum[field])),
            );
            let solution = lu.solve(&values).ok_or_else(|| {
                VacuumError::Numerical(anyhow::anyhow!(
                    "singular interpolation matrix for {} path nodes",
                    nodes.len()
                ))
            })?;
            let mut field_coefficients: Vec<f64> = solution.iter().copied().collect();
            field_coefficients[0] = false_vacuum[field];
            coefficients.push(field_coefficients);
        }
        Ok(Self::from_coefficients(
            false_vacuum,
            true_vacuum,
            coefficients,
            temperature,
        ))
    }

    fn from_coefficients(
        false_vacuum: &[f64],
        true_vacuum: &[f64],
        coefficients: Vec<Vec<f64>>,
        temperature: f64,
    ) -> Self {
        let offset_coefficients = coefficients
            .iter()
            .zip(true_vacuum.iter())
            .map(|(field_coefficients, end)| {
                let mut shifted = taylor_shift_to_end(field_coefficients);
                shifted[0] = *end;
                shifted
            })
            .collect();
        Self {
            false_vacuum: false_vacuum.to_vec(),
            true_vacuum: true_vacuum.to_vec(),
            coefficients,
            offset_coefficients,
            temperature,
        }
    }

    pub fn false_vacuum(&self) -> &[f64] {
        &self.false_vacuum
    }

    pub fn true_vacuum(&self) -> &[f64] {
        &self.true_vacuum
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn number_of_fields(&self) -> usize {
        self.false_vacuum.len()
    }

    /// Polynomial degree of the field functions.
    pub fn degree(&self) -> usize {
        self.coefficients
            .first()
            .map(|coefficients| coefficients.len().saturating_sub(1))
            .unwrap_or(0)
    }

    /// `|true - false|`.
    pub fn vacuum_separation(&self) -> f64 {
        l2_norm(&subtract(&self.true_vacuum, &self.false_vacuum))
    }

    pub fn field_configuration(&self, p: f64) -> FieldConfiguration {
        if p == 0.0 {
            return self.false_vacuum.clone();
        }
        if p == 1.0 {
            return self.true_vacuum.clone();
        }
        if p > 0.5 {
            return self.field_configuration_at_offset(1.0 - p);
        }
        self.coefficients
            .iter()
            .map(|coefficients| horner(coefficients, p, 0))
            .collect()
    }

    /// Field values at `p = 1 - offset`, evaluated in the offset expansion.
    pub fn field_configuration_at_offset(&self, offset: f64) -> FieldConfiguration {
        if offset == 0.0 {
            return self.true_vacuum.clone();
        }
        if offset == 1.0 {
            return self.false_vacuum.clone();
        }
        self.offset_coefficients
            .iter()
            .map(|coefficients| horner(coefficients, offset, 0))
            .collect()
    }

    /// `df/dp`.
    pub fn field_derivative(&self, p: f64) -> Vec<f64> {
        self.coefficients
            .iter()
            .map(|coefficients| horner(coefficients, p, 1))
            .collect()
    }

    /// `d2f/dp2`.
    pub fn field_second_derivative(&self, p: f64) -> Vec<f64> {
        self.coefficients
            .iter()
            .map(|coefficients| horner(coefficients, p, 2))
            .collect()
    }

    /// `(|df/dd|^2, df/dd . d2f/dd2)` at offset `d`. These equal
    /// `|df/dp|^2` and `-df/dp . d2f/dp2` at `p = 1 - d`.
    pub fn offset_slope_terms(&self, offset: f64) -> (f64, f64) {
        let first: Vec<f64> = self
            .offset_coefficients
            .iter()
            .map(|coefficients| horner(coefficients, offset, 1))
            .collect();
        let second: Vec<f64> = self
            .offset_coefficients
            .iter()
            .map(|coefficients| horner(coefficients, offset, 2))
            .collect();
        (dot(&first, &first), dot(&first, &second))
    }
}

fn check_endpoints(false_vacuum: &[f64], true_vacuum: &[f64]) -> Result<()> {
    if false_vacuum.is_empty() || false_vacuum.len() != true_vacuum.len() {
        return Err(VacuumError::configuration(format!(
            "path endpoints have {} and {} fields",
            false_vacuum.len(),
            true_vacuum.len()
        )));
    }
    Ok(())
}

/// Evaluates the `derivative`-th derivative of `sum c_k x^k`.
fn horner(coefficients: &[f64], x: f64, derivative: usize) -> f64 {
    let mut value = 0.0;
    for k in (derivative..coefficients.len()).rev() {
        let factor: f64 = (0..derivative).map(|j| (k - j) as f64).product();
        value = value * x + coefficients[k] * factor;
    }
    value
}

/// Coefficients of `g(d) = f(1 - d)` given those of `f(p)`.
fn taylor_shift_to_end(coefficients: &[f64]) -> Vec<f64> {
    let n = coefficients.len();
    (0..n)
        .map(|j| {
            let sign = if j % 2 == 0 { 1.0 } else { -1.0 };
            let mut binomial = 1.0;
            let mut sum = 0.0;
            for k in j..n {
                if k > j {
                    binomial = binomial * k as f64 / (k - j) as f64;
                }
                sum += binomial * coefficients[k];
            }
            sign * sum
        })
        .collect()
}

/// Builds paths from free parameters: `number_of_varying_nodes` nodes, each
/// confined to the hyperplane perpendicular to the straight path at its
/// fraction `k / (N + 1)`, with the reference field fixed by that constraint.
#[derive(Debug, Clone)]
pub struct PathFromNodes {
    false_vacuum: FieldConfiguration,
    true_vacuum: FieldConfiguration,
    direction: Vec<f64>,
    reference_field: usize,
    number_of_varying_nodes: usize,
    temperature: f64,
}

impl PathFromNodes {
    pub fn new(
        false_vacuum: &[f64],
        true_vacuum: &[f64],
        number_of_varying_nodes: usize,
        temperature: f64,
    ) -> Result<Self> {
        check_endpoints(false_vacuum, true_vacuum)?;
        let direction = subtract(true_vacuum, false_vacuum);
        let reference_field = direction
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.abs().total_cmp(&b.abs()))
            .map(|(index, _)| index)
            .unwrap_or(0);
        if direction[reference_field] == 0.0 {
            return Err(VacuumError::configuration(
                "false and true vacuum coincide",
            ));
        }
        Ok(Self {
            false_vacuum: false_vacuum.to_vec(),
            true_vacuum: true_vacuum.to_vec(),
            direction,
            reference_field,
            number_of_varying_nodes,
            temperature,
        })
    }

    pub fn reference_field(&self) -> usize {
        self.reference_field
    }

    pub fn number_of_varying_nodes(&self) -> usize {
        self.number_of_varying_nodes
    }

    pub fn number_of_free_parameters(&self) -> usize {
        self.number_of_varying_nodes * (self.false_vacuum.len() - 1)
    }

    /// Position of node `k` along the straight path.
    pub fn node_fraction(&self, node: usize) -> f64 {
        (node + 1) as f64 / (self.number_of_varying_nodes + 1) as f64
    }

    /// The point of node `node`'s plane with the given non-reference fields.
    pub fn node_in_plane(&self, node: usize, free: &[f64]) -> FieldConfiguration {
        let fraction = self.node_fraction(node);
        let r = self.reference_field;
        let mut point = Vec::with_capacity(self.false_vacuum.len());
        let mut free_values = free.iter();
        let mut projection = 0.0;
        for field in 0..self.false_vacuum.len() {
            if field == r {
                point.push(0.0);
                continue;
            }
            let value = free_values.next().copied().unwrap_or(0.0);
            let on_line = self.false_vacuum[field] + fraction * self.direction[field];
            projection += (value - on_line) * self.direction[field];
            point.push(value);
        }
        point[r] = self.false_vacuum[r] + fraction * self.direction[r]
            - projection / self.direction[r];
        point
    }

    pub fn nodes(&self, free_parameters: &[f64]) -> Result<Vec<FieldConfiguration>> {
        if free_parameters.len() != self.number_of_free_parameters() {
            return Err(VacuumError::configuration(format!(
                "expected {} free path parameters, got {}",
                self.number_of_free_parameters(),
                free_parameters.len()
            )));
        }
        let per_node = self.false_vacuum.len() - 1;
        Ok((0..self.number_of_varying_nodes)
            .map(|node| {
                self.node_in_plane(node, &free_parameters[node * per_node..(node + 1) * per_node])
            })
            .collect())
    }

    pub fn path(&self, free_parameters: &[f64]) -> Result<TunnelPath> {
        let nodes = self.nodes(free_parameters)?;
        TunnelPath::through_nodes(&self.false_vacuum, &self.true_vacuum, &nodes, self.temperature)
    }

    /// The non-reference fields of `point`, in field order.
    pub fn free_fields_of(&self, point: &[f64]) -> Vec<f64> {
        point
            .iter()
            .enumerate()
            .filter(|(field, _)| *field != self.reference_field)
            .map(|(_, value)| *value)
            .collect()
    }

    /// Free parameters reproducing the nodes of `path` at the node fractions,
    /// each projected onto its plane.
    pub fn parameters_following(&self, path: &TunnelPath) -> Vec<f64> {
        (0..self.number_of_varying_nodes)
            .flat_map(|node| self.free_fields_of(&path.field_configuration(self.node_fraction(node))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straight_path_endpoints_are_exact() {
        let a = [0.1, -3.7, 1e-9];
        let b = [246.22, 0.3, -17.0];
        let path = TunnelPath::straight(&a, &b, 0.0).expect("path");
        assert_eq!(path.field_configuration(0.0), a.to_vec());
        assert_eq!(path.field_configuration(1.0), b.to_vec());
        assert_eq!(path.field_configuration_at_offset(0.0), b.to_vec());
        let middle = path.field_configuration(0.5);
        assert!((middle[0] - 123.16).abs() < 1e-9);
    }

    #[test]
    fn node_path_endpoints_are_exact_for_any_node_count() {
        let a = [0.3, 1.7];
        let b = [5.1, -2.2];
        for count in 1..7 {
            let nodes: Vec<Vec<f64>> = (0..count)
                .map(|k| vec![0.7 * k as f64, (k as f64).sin()])
                .collect();
            let path = TunnelPath::through_nodes(&a, &b, &nodes, 0.0).expect("path");
            assert_eq!(path.field_configuration(0.0), a.to_vec());
            assert_eq!(path.field_configuration(1.0), b.to_vec());
        }
    }

    #[test]
    fn path_interpolates_its_nodes() {
        let a = [0.0, 0.0];
        let b = [1.0, 0.0];
        let nodes = vec![vec![0.25, 0.3], vec![0.5, 0.4], vec![0.75, 0.3]];
        let path = TunnelPath::through_nodes(&a, &b, &nodes, 0.0).expect("path");
        for (k, node) in nodes.iter().enumerate() {
            let p = (k + 1) as f64 / 4.0;
            let point = path.field_configuration(p);
            assert!((point[0] - node[0]).abs() < 1e-12);
            assert!((point[1] - node[1]).abs() < 1e-12);
        }
    }

    #[test]
    fn offset_expansion_matches_direct_evaluation() {
        let a = [0.0, 1.0];
        let b = [2.0, -1.0];
        let nodes = vec![vec![0.4, 0.9], vec![1.5, 0.2]];
        let path = TunnelPath::through_nodes(&a, &b, &nodes, 0.0).expect("path");
        let p = 0.8;
        let direct: Vec<f64> = path
            .coefficients
            .iter()
            .map(|c| horner(c, p, 0))
            .collect();
        let shifted = path.field_configuration_at_offset(1.0 - p);
        for (x, y) in direct.iter().zip(shifted.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
        let slope = path.field_derivative(p);
        let curvature = path.field_second_derivative(p);
        let (slope_squared, slope_dot_curvature) = path.offset_slope_terms(1.0 - p);
        assert!((slope_squared - dot(&slope, &slope)).abs() < 1e-10);
        assert!((slope_dot_curvature + dot(&slope, &curvature)).abs() < 1e-10);
    }

    #[test]
    fn tiny_offsets_keep_precision() {
        let path = TunnelPath::straight(&[0.0], &[1.0], 0.0).expect("path");
        let near = path.field_configuration_at_offset(1e-150);
        assert_eq!(near[0], 1.0);
        assert_eq!(path.offset_slope_terms(1e-150).0, 1.0);
    }

    #[test]
    fn nodes_lie_in_perpendicular_planes() {
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 2.0, -0.5];
        let builder = PathFromNodes::new(&a, &b, 3, 0.0).expect("builder");
        assert_eq!(builder.reference_field(), 1);
        assert_eq!(builder.number_of_free_parameters(), 6);
        let parameters = [0.3, 0.1, -0.2, 0.4, 0.9, -0.1];
        let nodes = builder.nodes(&parameters).expect("nodes");
        let direction = subtract(&b, &a);
        for (k, node) in nodes.iter().enumerate() {
            let fraction = (k + 1) as f64 / 4.0;
            let on_line: Vec<f64> = a
                .iter()
                .zip(direction.iter())
                .map(|(x, u)| x + fraction * u)
                .collect();
            let offset = subtract(node, &on_line);
            assert!(dot(&offset, &direction).abs() < 1e-12);
        }
        let path = builder.path(&parameters).expect("path");
        assert_eq!(path.field_configuration(1.0), b.to_vec());
    }

    #[test]
    fn straight_parameters_reproduce_the_straight_path() {
        let a = [0.0, 0.0];
        let b = [3.0, 1.0];
        let straight = TunnelPath::straight(&a, &b, 0.0).expect("path");
        let builder = PathFromNodes::new(&a, &b, 2, 0.0).expect("builder");
        let path = builder
            .path(&builder.parameters_following(&straight))
            .expect("path");
        let point = path.field_configuration(0.3);
        assert!((point[0] - 0.9).abs() < 1e-12);
        assert!((point[1] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn coincident_vacua_are_rejected() {
        assert!(PathFromNodes::new(&[1.0, 2.0], &[1.0, 2.0], 2, 0.0).is_err());
        assert!(TunnelPath::straight(&[1.0], &[1.0, 2.0], 0.0).is_err());
    }
}
