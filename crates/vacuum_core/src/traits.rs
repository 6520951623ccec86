use num_complex::Complex;
use num_traits::{Float, FromPrimitive, One, Zero};
use std::fmt::Debug;
use std::ops::{Add, Mul, Neg, Sub};

/// A trait for types that can be used as real scalars in the radial integrators.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Ring arithmetic needed to evaluate a polynomial constraint.
///
/// Implemented for `f64` (real verification and Hessians) and
/// `Complex<f64>` (homotopy path tracking).
pub trait PolynomialScalar:
    Copy
    + Debug
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Neg<Output = Self>
{
    fn from_real(value: f64) -> Self;

    fn powu(self, exponent: u32) -> Self {
        let mut result = Self::one();
        let mut base = self;
        let mut remaining = exponent;
        while remaining > 0 {
            if remaining & 1 == 1 {
                result = result * base;
            }
            base = base * base;
            remaining >>= 1;
        }
        result
    }
}

impl PolynomialScalar for f64 {
    fn from_real(value: f64) -> Self {
        value
    }
}

impl PolynomialScalar for Complex<f64> {
    fn from_real(value: f64) -> Self {
        Complex::new(value, 0.0)
    }
}

/// A first-order ODE system in the radial coordinate.
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates dy/dr at radius `r`.
    /// out: buffer to write the derivative
    fn apply(&self, r: T, y: &[T], out: &mut [T]);
}

/// Outcome of one attempted adaptive step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome<T> {
    /// The step was taken; `next_step` is the proposed size for the next one.
    Accepted { taken: T, next_step: T },
    /// The local error was too large; retry with `retry_step`.
    Rejected { retry_step: T },
}

/// A trait for solvers that advance a system with error control.
pub trait AdaptiveSteppable<T: Scalar> {
    /// Attempts one step of size `step` from (`r`, `state`).
    /// On acceptance, `r` and `state` are updated in place.
    fn try_step(
        &mut self,
        system: &impl DynamicalSystem<T>,
        r: &mut T,
        state: &mut [T],
        step: T,
    ) -> StepOutcome<T>;
}
