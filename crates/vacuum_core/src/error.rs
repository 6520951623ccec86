//! Error taxonomy and the diagnostics sink.
//!
//! Conditions that make the rest of a parameter point meaningless are
//! [`VacuumError`]s and propagate to the caller. Everything else is a
//! [`Warning`]: it is logged through `tracing`, recorded in the
//! [`Diagnostics`] handle owned by the component that hit it, and the
//! computation continues with a best-effort (usually conservative) number.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Fatal errors for the current parameter point.
#[derive(Debug, Error)]
pub enum VacuumError {
    /// Malformed input: zero-term constraints, zero scales, size mismatches.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The polynomial system could not be solved (process failure, timeout,
    /// or no real solutions).
    #[error("polynomial solver failure: {0}")]
    SolverFailure(String),

    /// A cooperative cancellation request was observed.
    #[error("calculation cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("numerical failure: {0}")]
    Numerical(#[from] anyhow::Error),
}

impl VacuumError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn solver_failure(message: impl Into<String>) -> Self {
        Self::SolverFailure(message.into())
    }
}

pub type Result<T> = std::result::Result<T, VacuumError>;

/// Non-fatal conditions recovered locally.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Warning {
    #[error("local optimizer did not converge after {iterations} iterations (EDM = {edm:e})")]
    OptimizationWarning { iterations: usize, edm: f64 },

    #[error("no energy barrier resolved along the path at T = {temperature} GeV; action taken as 0")]
    UnresolvedBarrierWarning { temperature: f64 },

    #[error("bubble shooting used all {attempts} attempts; best miss fraction was {best_miss_fraction:e}")]
    ShootingAttemptsExhaustedWarning {
        attempts: usize,
        best_miss_fraction: f64,
    },

    #[error("survival probability exponent {exponent:e} out of range; clamped to {clamped_to}")]
    NumericOverflow { exponent: f64, clamped_to: f64 },

    #[error("thermal search reached the Planck-scale cap at {temperature:e} GeV without the vacuum disappearing")]
    ThermalRangeCapped { temperature: f64 },

    #[error("polynomial solve failed at scale {scale} GeV: {message}")]
    ScaleSkipped { scale: f64, message: String },
}

/// Shared, cloneable sink for [`Warning`]s.
///
/// Each component receives a handle at construction; the orchestration layer
/// keeps one clone per parameter point and drains it afterwards.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    entries: Arc<Mutex<Vec<Warning>>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, warning: Warning) {
        tracing::warn!(%warning, "recoverable condition");
        self.lock().push(warning);
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns and clears the recorded warnings.
    pub fn drain(&self) -> Vec<Warning> {
        std::mem::take(&mut *self.lock())
    }

    /// A panic elsewhere while holding the lock leaves the list intact.
    fn lock(&self) -> MutexGuard<'_, Vec<Warning>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
