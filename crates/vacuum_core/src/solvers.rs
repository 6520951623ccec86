use crate::traits::{AdaptiveSteppable, DynamicalSystem, Scalar, StepOutcome};

/// Tsitouras 5/4 solver with embedded error estimate and step-size control.
///
/// Error per component is scaled by `absolute_tolerance[i] + relative_tolerance
/// * max(|y_i|, |y_i'|)`; a step is accepted when the RMS of the scaled error
/// is at most one.
pub struct Tsit5<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    k5: Vec<T>,
    k6: Vec<T>,
    k7: Vec<T>,
    tmp: Vec<T>,
    candidate: Vec<T>,
    relative_tolerance: T,
    absolute_tolerance: Vec<T>,
    min_step: T,
}

impl<T: Scalar> Tsit5<T> {
    pub fn new(dim: usize, relative_tolerance: T, absolute_tolerance: Vec<T>, min_step: T) -> Self {
        let z = T::zero();
        debug_assert_eq!(absolute_tolerance.len(), dim);
        Self {
            k1: vec![z; dim],
            k2: vec![z; dim],
            k3: vec![z; dim],
            k4: vec![z; dim],
            k5: vec![z; dim],
            k6: vec![z; dim],
            k7: vec![z; dim],
            tmp: vec![z; dim],
            candidate: vec![z; dim],
            relative_tolerance,
            absolute_tolerance,
            min_step,
        }
    }

    pub fn min_step(&self) -> T {
        self.min_step
    }

    fn c(value: f64) -> T {
        T::from_f64(value).unwrap_or_else(T::zero)
    }
}

impl<T: Scalar> AdaptiveSteppable<T> for Tsit5<T> {
    fn try_step(
        &mut self,
        system: &impl DynamicalSystem<T>,
        r: &mut T,
        state: &mut [T],
        dt: T,
    ) -> StepOutcome<T> {
        let r0 = *r;
        let n = state.len();

        // Tsit5 Coefficients
        let c2 = Self::c(0.161);
        let c3 = Self::c(0.327);
        let c4 = Self::c(0.9);
        let c5 = Self::c(0.9800255409045097);

        let a21 = Self::c(0.161);

        let a31 = Self::c(-0.008480655492356989);
        let a32 = Self::c(0.335480655492357);

        let a41 = Self::c(2.897153057105493);
        let a42 = Self::c(-6.359448489975075);
        let a43 = Self::c(4.3622954328695815);

        let a51 = Self::c(5.325864828439257);
        let a52 = Self::c(-11.748883564062828);
        let a53 = Self::c(7.4955393428898365);
        let a54 = Self::c(-0.09249506636175525);

        let a61 = Self::c(5.86145544294642);
        let a62 = Self::c(-12.92096931784711);
        let a63 = Self::c(8.159367898576159);
        let a64 = Self::c(-0.071584973281401);
        let a65 = Self::c(-0.028269050394068383);

        // b coefficients (5th order), FSAL with the seventh stage
        let b1 = Self::c(0.09646076681806523);
        let b2 = Self::c(0.01);
        let b3 = Self::c(0.4798896504144996);
        let b4 = Self::c(1.379008574103742);
        let b5 = Self::c(-3.290069515436081);
        let b6 = Self::c(2.324710524099774);

        // b - b_hat, for the embedded 4th order estimate
        let e1 = Self::c(-0.00178001105222577714);
        let e2 = Self::c(-0.0008164344596567469);
        let e3 = Self::c(0.007880878010261995);
        let e4 = Self::c(-0.1447110071732629);
        let e5 = Self::c(0.5823571654525552);
        let e6 = Self::c(-0.45808210592918697);
        let e7 = Self::c(1.0 / 66.0);

        system.apply(r0, state, &mut self.k1);

        for i in 0..n {
            self.tmp[i] = state[i] + dt * (a21 * self.k1[i]);
        }
        system.apply(r0 + c2 * dt, &self.tmp, &mut self.k2);

        for i in 0..n {
            self.tmp[i] = state[i] + dt * (a31 * self.k1[i] + a32 * self.k2[i]);
        }
        system.apply(r0 + c3 * dt, &self.tmp, &mut self.k3);

        for i in 0..n {
            self.tmp[i] = state[i] + dt * (a41 * self.k1[i] + a42 * self.k2[i] + a43 * self.k3[i]);
        }
        system.apply(r0 + c4 * dt, &self.tmp, &mut self.k4);

        for i in 0..n {
            self.tmp[i] = state[i]
                + dt * (a51 * self.k1[i] + a52 * self.k2[i] + a53 * self.k3[i] + a54 * self.k4[i]);
        }
        system.apply(r0 + c5 * dt, &self.tmp, &mut self.k5);

        for i in 0..n {
            self.tmp[i] = state[i]
                + dt * (a61 * self.k1[i]
                    + a62 * self.k2[i]
                    + a63 * self.k3[i]
                    + a64 * self.k4[i]
                    + a65 * self.k5[i]);
        }
        system.apply(r0 + dt, &self.tmp, &mut self.k6);

        for i in 0..n {
            self.candidate[i] = state[i]
                + dt * (b1 * self.k1[i]
                    + b2 * self.k2[i]
                    + b3 * self.k3[i]
                    + b4 * self.k4[i]
                    + b5 * self.k5[i]
                    + b6 * self.k6[i]);
        }
        system.apply(r0 + dt, &self.candidate, &mut self.k7);

        let mut sum_sq = T::zero();
        for i in 0..n {
            let error = dt
                * (e1 * self.k1[i]
                    + e2 * self.k2[i]
                    + e3 * self.k3[i]
                    + e4 * self.k4[i]
                    + e5 * self.k5[i]
                    + e6 * self.k6[i]
                    + e7 * self.k7[i]);
            let scale = self.absolute_tolerance[i]
                + self.relative_tolerance * state[i].abs().max(self.candidate[i].abs());
            let ratio = error / scale;
            sum_sq = sum_sq + ratio * ratio;
        }
        let count = T::from_usize(n.max(1)).unwrap_or_else(T::one);
        let error_norm = (sum_sq / count).sqrt();

        let safety = Self::c(0.9);
        let min_factor = Self::c(0.2);
        let max_factor = Self::c(5.0);
        let exponent = Self::c(-0.2);

        if !error_norm.is_finite() {
            return StepOutcome::Rejected {
                retry_step: dt * min_factor,
            };
        }

        if error_norm <= T::one() || dt.abs() <= self.min_step {
            let factor = if error_norm <= T::epsilon() {
                max_factor
            } else {
                (safety * error_norm.powf(exponent)).min(max_factor).max(min_factor)
            };
            state.copy_from_slice(&self.candidate);
            *r = r0 + dt;
            StepOutcome::Accepted {
                taken: dt,
                next_step: dt * factor,
            }
        } else {
            let factor = (safety * error_norm.powf(exponent)).max(min_factor);
            StepOutcome::Rejected {
                retry_step: dt * factor,
            }
        }
    }
}
