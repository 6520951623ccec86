//! The `vacuum_core` crate decides whether the symmetry-breaking (DSB) vacuum
//! of a scalar potential is stable, metastable or short-lived.
//!
//! Pipeline, one parameter point at a time:
//! - **Stationary points**: the gradient of the tree-level polynomial is solved
//!   for all real roots ([`homotopy`]) at one or more renormalization scales
//!   ([`starting_points`]).
//! - **Minima**: each root is refined against the full potential
//!   ([`refiner`]) and classified against the DSB vacuum ([`minimizer`]).
//! - **Tunneling**: bounce actions along optimized paths give quantum and
//!   thermal survival probabilities ([`tunneling`]).
//!
//! Recoverable numerical trouble is logged with `tracing` and collected in a
//! [`Diagnostics`] sink; everything else is a [`VacuumError`].
pub mod error;
pub mod homotopy;
pub mod minimizer;
pub mod polynomial;
pub mod potential;
pub mod refiner;
pub mod solvers;
pub mod starting_points;
pub mod traits;
pub mod tunneling;
pub mod util;

pub use error::{Diagnostics, Result, VacuumError, Warning};
pub use minimizer::{MinimizerSettings, PotentialMinimizer};
pub use polynomial::{PolynomialPotential, PolynomialTerm};
pub use potential::{
    FieldConfiguration, FixedParameterManager, LagrangianParameterManager, PotentialFunction,
    PotentialMinimum, ScaleDependent,
};
pub use refiner::{GradientRefiner, RefinerSettings};
pub use starting_points::{FixedScaleSolver, StartingPointGenerator, StartingPointSettings};
pub use tunneling::{
    CancellationToken, TunnelingCalculator, TunnelingResult, TunnelingSettings, TunnelingStrategy,
};
