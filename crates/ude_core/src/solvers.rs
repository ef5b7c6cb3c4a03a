use crate::traits::{DynamicalSystem, Scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Absolute/relative error tolerances and step budget for adaptive integration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerances {
    pub abstol: f64,
    pub reltol: f64,
    pub max_steps: usize,
}

impl Tolerances {
    pub fn new(abstol: f64, reltol: f64) -> Self {
        Self {
            abstol,
            reltol,
            ..Self::default()
        }
    }
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            abstol: 1e-6,
            reltol: 1e-6,
            max_steps: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegrationFailure {
    #[error("Invalid integration request: {0}")]
    InvalidRequest(String),
    #[error("Step size underflow at t = {t} (dt = {dt})")]
    StepSizeUnderflow { t: f64, dt: f64 },
    #[error("Non-finite state encountered at t = {t}")]
    NonFinite { t: f64 },
    #[error("Exceeded {max_steps} steps before reaching t = {t_end}")]
    MaxStepsExceeded { max_steps: usize, t_end: f64 },
}

// Tsitouras 5(4) tableau.
const C2: f64 = 0.161;
const C3: f64 = 0.327;
const C4: f64 = 0.9;
const C5: f64 = 0.9800255409045097;

const A21: f64 = 0.161;
const A31: f64 = -0.008480655492356989;
const A32: f64 = 0.335480655492357;
const A41: f64 = 2.898;
const A42: f64 = -6.359447987781783;
const A43: f64 = 4.361447987781783;
const A51: f64 = 5.325864858437957;
const A52: f64 = -11.748883564062828;
const A53: f64 = 7.495539342889693;
const A54: f64 = -0.09249506636030195;
const A61: f64 = 5.86145544294642;
const A62: f64 = -12.92096931784711;
const A63: f64 = 8.159367898576159;
const A64: f64 = -0.071584973281401;
const A65: f64 = -0.02826857949054663;

// 5th order weights (also the last row of A, FSAL).
const B1: f64 = 0.09646076681806523;
const B2: f64 = 0.01;
const B3: f64 = 0.4798896504144996;
const B4: f64 = 1.379008574103742;
const B5: f64 = -3.290069515436099;
const B6: f64 = 2.324710524099774;

// Difference between the 5th and embedded 4th order weights.
const E1: f64 = -0.00178001105222577714;
const E2: f64 = -0.0008164344596567469;
const E3: f64 = 0.007880878010261995;
const E4: f64 = -0.1447110071732629;
const E5: f64 = 0.5823571654525552;
const E6: f64 = -0.45808210592918697;
const E7: f64 = 0.015151515151515152;

const SAFETY: f64 = 0.9;
const MIN_SCALE: f64 = 0.2;
const MAX_SCALE: f64 = 10.0;

/// Tsitouras 5/4 Solver with embedded error estimation.
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
}

impl<T: Scalar> Tsit5<T> {
    pub fn new(dim: usize) -> Self {
        let z = T::zero();
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
        }
    }

    /// Attempts one step of size `dt` from `(t, state)`.
    ///
    /// The proposed state is kept in an internal buffer; the return value is the
    /// weighted RMS error estimate (accept when <= 1). Error control only looks at
    /// primal values, so dual-number runs take the exact same steps as `f64` runs.
    fn attempt(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: f64,
        state: &[T],
        dt: f64,
        tol: &Tolerances,
    ) -> f64 {
        let n = state.len();
        let h = T::constant(dt);
        let c = T::constant;

        system.apply(c(t), state, &mut self.k1);

        for i in 0..n {
            self.tmp[i] = state[i] + h * (c(A21) * self.k1[i]);
        }
        system.apply(c(t + C2 * dt), &self.tmp, &mut self.k2);

        for i in 0..n {
            self.tmp[i] = state[i] + h * (c(A31) * self.k1[i] + c(A32) * self.k2[i]);
        }
        system.apply(c(t + C3 * dt), &self.tmp, &mut self.k3);

        for i in 0..n {
            self.tmp[i] = state[i]
                + h * (c(A41) * self.k1[i] + c(A42) * self.k2[i] + c(A43) * self.k3[i]);
        }
        system.apply(c(t + C4 * dt), &self.tmp, &mut self.k4);

        for i in 0..n {
            self.tmp[i] = state[i]
                + h * (c(A51) * self.k1[i]
                    + c(A52) * self.k2[i]
                    + c(A53) * self.k3[i]
                    + c(A54) * self.k4[i]);
        }
        system.apply(c(t + C5 * dt), &self.tmp, &mut self.k5);

        for i in 0..n {
            self.tmp[i] = state[i]
                + h * (c(A61) * self.k1[i]
                    + c(A62) * self.k2[i]
                    + c(A63) * self.k3[i]
                    + c(A64) * self.k4[i]
                    + c(A65) * self.k5[i]);
        }
        system.apply(c(t + dt), &self.tmp, &mut self.k6);

        for i in 0..n {
            self.candidate[i] = state[i]
                + h * (c(B1) * self.k1[i]
                    + c(B2) * self.k2[i]
                    + c(B3) * self.k3[i]
                    + c(B4) * self.k4[i]
                    + c(B5) * self.k5[i]
                    + c(B6) * self.k6[i]);
        }
        system.apply(c(t + dt), &self.candidate, &mut self.k7);

        let mut sum = 0.0;
        for i in 0..n {
            let err = dt
                * (E1 * self.k1[i].primal()
                    + E2 * self.k2[i].primal()
                    + E3 * self.k3[i].primal()
                    + E4 * self.k4[i].primal()
                    + E5 * self.k5[i].primal()
                    + E6 * self.k6[i].primal()
                    + E7 * self.k7[i].primal());
            let scale = tol.abstol
                + tol.reltol * state[i].primal().abs().max(self.candidate[i].primal().abs());
            sum += (err / scale).powi(2);
        }
        if n == 0 {
            0.0
        } else {
            (sum / n as f64).sqrt()
        }
    }
}

/// Integrates `system` from `u0` at `saveat[0]` and returns the state at every
/// entry of `saveat`. Steps are shortened to land exactly on each sample time.
pub fn integrate<T, S>(
    system: &S,
    u0: &[T],
    saveat: &[f64],
    tol: &Tolerances,
) -> Result<Vec<Vec<T>>, IntegrationFailure>
where
    T: Scalar,
    S: DynamicalSystem<T>,
{
    if saveat.is_empty() {
        return Err(IntegrationFailure::InvalidRequest(
            "at least one sample time is required".to_string(),
        ));
    }
    if u0.len() != system.dimension() {
        return Err(IntegrationFailure::InvalidRequest(format!(
            "initial state has dimension {}, system expects {}",
            u0.len(),
            system.dimension()
        )));
    }
    if saveat.windows(2).any(|w| w[1] <= w[0]) {
        return Err(IntegrationFailure::InvalidRequest(
            "sample times must be strictly increasing".to_string(),
        ));
    }
    if tol.abstol <= 0.0 || tol.reltol <= 0.0 {
        return Err(IntegrationFailure::InvalidRequest(
            "tolerances must be positive".to_string(),
        ));
    }

    let dim = u0.len();
    let mut stepper = Tsit5::new(dim);
    let mut state = u0.to_vec();
    let mut t = saveat[0];
    let t_end = saveat[saveat.len() - 1];
    let mut out = Vec::with_capacity(saveat.len());
    out.push(state.clone());

    let mut dt = initial_step(system, t, &state, t_end - t, tol);
    let mut steps = 0usize;

    for &target in &saveat[1..] {
        while t < target {
            if steps >= tol.max_steps {
                return Err(IntegrationFailure::MaxStepsExceeded {
                    max_steps: tol.max_steps,
                    t_end,
                });
            }
            if dt <= 1e-14 * t.abs().max(1.0) {
                return Err(IntegrationFailure::StepSizeUnderflow { t, dt });
            }

            let remaining = target - t;
            let clamped = remaining <= dt * (1.0 + 1e-12);
            let h = if clamped { remaining } else { dt };

            let err = stepper.attempt(system, t, &state, h, tol);
            steps += 1;

            if !err.is_finite() {
                // Shrink hard and retry; persistent blow-up ends in underflow.
                dt = h * MIN_SCALE;
                continue;
            }

            let factor = if err == 0.0 {
                MAX_SCALE
            } else {
                (SAFETY * err.powf(-0.2)).clamp(MIN_SCALE, MAX_SCALE)
            };

            if err <= 1.0 {
                if stepper.candidate.iter().any(|v| !v.primal().is_finite()) {
                    return Err(IntegrationFailure::NonFinite { t: t + h });
                }
                state.copy_from_slice(&stepper.candidate);
                t = if clamped { target } else { t + h };
                // A clamped step says nothing about the natural step length.
                if !clamped || h * factor > dt {
                    dt = h * factor;
                }
            } else {
                dt = h * factor.min(1.0);
            }
        }
        out.push(state.clone());
    }

    Ok(out)
}

/// Starting step estimate (Hairer, Nørsett & Wanner, II.4).
fn initial_step<T, S>(system: &S, t0: f64, u0: &[T], span: f64, tol: &Tolerances) -> f64
where
    T: Scalar,
    S: DynamicalSystem<T>,
{
    let n = u0.len();
    if n == 0 || span <= 0.0 {
        return span.max(1e-6);
    }
    let mut f0 = vec![T::zero(); n];
    system.apply(T::constant(t0), u0, &mut f0);

    let scale: Vec<f64> = u0
        .iter()
        .map(|u| tol.abstol + tol.reltol * u.primal().abs())
        .collect();
    let rms = |v: &dyn Fn(usize) -> f64| -> f64 {
        ((0..n).map(|i| (v(i) / scale[i]).powi(2)).sum::<f64>() / n as f64).sqrt()
    };
    let d0 = rms(&|i| u0[i].primal());
    let d1 = rms(&|i| f0[i].primal());
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    };
    let h0 = h0.min(span);

    let u1: Vec<T> = (0..n)
        .map(|i| u0[i] + T::constant(h0) * f0[i])
        .collect();
    let mut f1 = vec![T::zero(); n];
    system.apply(T::constant(t0 + h0), &u1, &mut f1);
    let d2 = rms(&|i| f1[i].primal() - f0[i].primal()) / h0;

    let h1 = if d1.max(d2) <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(0.2)
    };
    let h = (100.0 * h0).min(h1).min(span);
    if h.is_finite() && h > 0.0 {
        h
    } else {
        1e-6
    }
}

#[cfg(test)]
mod tests {
    use super::{integrate, IntegrationFailure, Tolerances};
    use crate::autodiff::Dual;
    use crate::traits::{DynamicalSystem, Scalar};
    use approx::assert_relative_eq;

    struct Decay {
        rate: f64,
    }

    impl<T: Scalar> DynamicalSystem<T> for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
            out[0] = T::constant(-self.rate) * x[0];
        }
    }

    struct Rotation;

    impl<T: Scalar> DynamicalSystem<T> for Rotation {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
            out[0] = -x[1];
            out[1] = x[0];
        }
    }

    struct Blowup;

    impl<T: Scalar> DynamicalSystem<T> for Blowup {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
            out[0] = x[0] * x[0];
        }
    }

    fn grid(n: usize, dt: f64) -> Vec<f64> {
        (0..n).map(|i| i as f64 * dt).collect()
    }

    #[test]
    fn decay_matches_exponential_at_every_sample() {
        let times = grid(31, 0.1);
        let sol = integrate(&Decay { rate: 1.3 }, &[2.0], &times, &Tolerances::new(1e-10, 1e-10))
            .expect("integration should succeed");
        assert_eq!(sol.len(), times.len());
        for (state, &t) in sol.iter().zip(&times) {
            assert_relative_eq!(state[0], 2.0 * (-1.3 * t).exp(), epsilon = 1e-8);
        }
    }

    #[test]
    fn rotation_preserves_radius_with_tight_tolerances() {
        let times = grid(11, 0.5);
        let sol = integrate(&Rotation, &[1.0, 0.0], &times, &Tolerances::new(1e-12, 1e-12))
            .expect("integration should succeed");
        let last = &sol[10];
        assert_relative_eq!(last[0], 5.0f64.cos(), epsilon = 1e-9);
        assert_relative_eq!(last[1], 5.0f64.sin(), epsilon = 1e-9);
    }

    #[test]
    fn dual_pass_carries_parameter_sensitivity() {
        // x' = -x, x(0) = p  =>  dx(t)/dp = exp(-t)
        let times = grid(6, 0.2);
        let sol = integrate(
            &Decay { rate: 1.0 },
            &[Dual::new(1.5, 1.0)],
            &times,
            &Tolerances::new(1e-10, 1e-10),
        )
        .expect("integration should succeed");
        for (state, &t) in sol.iter().zip(&times) {
            assert_relative_eq!(state[0].eps, (-t).exp(), epsilon = 1e-8);
            assert_relative_eq!(state[0].val, 1.5 * (-t).exp(), epsilon = 1e-8);
        }
    }

    #[test]
    fn finite_time_blowup_is_reported() {
        let times = grid(4, 1.0);
        let result = integrate(&Blowup, &[1.0], &times, &Tolerances::default());
        assert!(result.is_err(), "x' = x^2 from x(0) = 1 blows up at t = 1");
    }

    #[test]
    fn rejects_non_increasing_sample_times() {
        let result = integrate(&Decay { rate: 1.0 }, &[1.0], &[0.0, 0.2, 0.2], &Tolerances::default());
        assert!(matches!(result, Err(IntegrationFailure::InvalidRequest(_))));
    }

    #[test]
    fn rejects_dimension_mismatch() {
        let result = integrate(&Rotation, &[1.0], &[0.0, 1.0], &Tolerances::default());
        assert!(matches!(result, Err(IntegrationFailure::InvalidRequest(_))));
    }
}
