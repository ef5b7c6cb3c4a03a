//! First-order (Adam) and quasi-Newton (BFGS) minimizers over flat parameter vectors.
//!
//! Both report every iterate through an `on_step(params, loss) -> continue?` callback
//! before moving, so a caller can log or record the loss at each iteration.

use crate::traits::Objective;
use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamSettings {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub max_iterations: usize,
}

impl Default for AdamSettings {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            max_iterations: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BfgsSettings {
    /// Length of the very first step; sets the scale of the initial inverse Hessian.
    pub initial_step_norm: f64,
    pub max_iterations: usize,
    pub gradient_tolerance: f64,
    /// Sufficient-decrease constant of the Armijo condition.
    pub armijo: f64,
    pub max_backtracks: usize,
}

impl Default for BfgsSettings {
    fn default() -> Self {
        Self {
            initial_step_norm: 0.01,
            max_iterations: 10_000,
            gradient_tolerance: 1e-8,
            armijo: 1e-4,
            max_backtracks: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    pub minimizer: Vec<f64>,
    pub minimum: f64,
    /// Number of iterations started, which equals the number of callback invocations.
    pub iterations: usize,
    pub converged: bool,
}

fn check_start(objective: &impl Objective, initial: &[f64]) -> Result<()> {
    if initial.len() != objective.parameter_count() {
        bail!(
            "Initial parameter dimension mismatch. Expected {}, got {}.",
            objective.parameter_count(),
            initial.len()
        );
    }
    Ok(())
}

/// Adam with bias-corrected moment estimates. Runs until the iteration budget is
/// spent or the callback asks to stop; there is no other stopping rule.
pub fn adam<O, F>(
    objective: &O,
    initial: &[f64],
    settings: AdamSettings,
    mut on_step: F,
) -> Result<OptimizationOutcome>
where
    O: Objective,
    F: FnMut(&[f64], f64) -> bool,
{
    check_start(objective, initial)?;
    if settings.learning_rate <= 0.0 {
        bail!("learning_rate must be positive.");
    }

    let n = initial.len();
    let mut theta = initial.to_vec();
    let mut m = vec![0.0; n];
    let mut v = vec![0.0; n];
    let mut iterations = 0usize;
    let mut last_loss = f64::INFINITY;

    while iterations < settings.max_iterations {
        let (loss, grad) = objective.value_and_gradient(&theta);
        iterations += 1;
        last_loss = loss;
        if !on_step(&theta, loss) {
            return Ok(OptimizationOutcome {
                minimizer: theta,
                minimum: loss,
                iterations,
                converged: false,
            });
        }

        let t = iterations as i32;
        let bias1 = 1.0 - settings.beta1.powi(t);
        let bias2 = 1.0 - settings.beta2.powi(t);
        for i in 0..n {
            let g = grad[i];
            if !g.is_finite() {
                continue;
            }
            m[i] = settings.beta1 * m[i] + (1.0 - settings.beta1) * g;
            v[i] = settings.beta2 * v[i] + (1.0 - settings.beta2) * g * g;
            let m_hat = m[i] / bias1;
            let v_hat = v[i] / bias2;
            theta[i] -= settings.learning_rate * m_hat / (v_hat.sqrt() + settings.epsilon);
        }
    }

    // The last update moved theta away from the last recorded loss.
    let minimum = if iterations > 0 {
        objective.value(&theta)
    } else {
        last_loss
    };
    Ok(OptimizationOutcome {
        minimizer: theta,
        minimum,
        iterations,
        converged: false,
    })
}

/// BFGS on the inverse Hessian with a backtracking Armijo line search.
///
/// Stops on gradient tolerance, on a line search that cannot find decrease, on
/// the iteration budget, or when the callback returns `false`. In every case the
/// best accepted iterate is returned.
pub fn bfgs<O, F>(
    objective: &O,
    initial: &[f64],
    settings: BfgsSettings,
    mut on_step: F,
) -> Result<OptimizationOutcome>
where
    O: Objective,
    F: FnMut(&[f64], f64) -> bool,
{
    check_start(objective, initial)?;
    if settings.initial_step_norm <= 0.0 {
        bail!("initial_step_norm must be positive.");
    }

    let n = initial.len();
    let mut x = DVector::from_column_slice(initial);
    let (mut f, g0) = objective.value_and_gradient(x.as_slice());
    let mut g = DVector::from_vec(g0);
    let mut h_inv = scaled_identity(n, settings.initial_step_norm, g.norm());
    let mut iterations = 0usize;
    let mut converged = false;

    while iterations < settings.max_iterations {
        iterations += 1;
        if !on_step(x.as_slice(), f) {
            break;
        }
        if !f.is_finite() || !g.iter().all(|v| v.is_finite()) {
            break;
        }
        if g.amax() <= settings.gradient_tolerance {
            converged = true;
            break;
        }

        let mut direction = -(&h_inv * &g);
        let mut slope = g.dot(&direction);
        if slope >= 0.0 || !slope.is_finite() {
            // Lost positive definiteness; restart from steepest descent.
            h_inv = scaled_identity(n, settings.initial_step_norm, g.norm());
            direction = -(&h_inv * &g);
            slope = g.dot(&direction);
        }

        let mut alpha = 1.0;
        let mut accepted = None;
        for _ in 0..settings.max_backtracks {
            let trial = &x + &direction * alpha;
            let f_trial = objective.value(trial.as_slice());
            if f_trial.is_finite() && f_trial <= f + settings.armijo * alpha * slope {
                accepted = Some(trial);
                break;
            }
            alpha *= 0.5;
        }
        let Some(x_new) = accepted else {
            // No decrease along the search direction: treat as converged to tolerance.
            converged = true;
            break;
        };

        let (f_new, g_new) = objective.value_and_gradient(x_new.as_slice());
        let g_new = DVector::from_vec(g_new);
        let s = &x_new - &x;
        let y = &g_new - &g;
        let sy = s.dot(&y);
        if sy > 1e-12 * s.norm() * y.norm() && sy.is_finite() {
            let rho = 1.0 / sy;
            let identity = DMatrix::<f64>::identity(n, n);
            let left = &identity - (&s * y.transpose()) * rho;
            let right = &identity - (&y * s.transpose()) * rho;
            h_inv = &left * &h_inv * &right + (&s * s.transpose()) * rho;
        }

        x = x_new;
        f = f_new;
        g = g_new;
    }

    Ok(OptimizationOutcome {
        minimizer: x.as_slice().to_vec(),
        minimum: f,
        iterations,
        converged,
    })
}

fn scaled_identity(n: usize, step_norm: f64, grad_norm: f64) -> DMatrix<f64> {
    let scale = if grad_norm > 0.0 && grad_norm.is_finite() {
        step_norm / grad_norm
    } else {
        step_norm
    };
    DMatrix::<f64>::identity(n, n) * scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Rosenbrock in two dimensions.
    struct Rosenbrock;

    impl Objective for Rosenbrock {
        fn parameter_count(&self) -> usize {
            2
        }

        fn value(&self, p: &[f64]) -> f64 {
            (1.0 - p[0]).powi(2) + 100.0 * (p[1] - p[0] * p[0]).powi(2)
        }

        fn value_and_gradient(&self, p: &[f64]) -> (f64, Vec<f64>) {
            let g0 = -2.0 * (1.0 - p[0]) - 400.0 * p[0] * (p[1] - p[0] * p[0]);
            let g1 = 200.0 * (p[1] - p[0] * p[0]);
            (self.value(p), vec![g0, g1])
        }
    }

    struct Bowl {
        center: Vec<f64>,
    }

    impl Objective for Bowl {
        fn parameter_count(&self) -> usize {
            self.center.len()
        }

        fn value(&self, p: &[f64]) -> f64 {
            p.iter()
                .zip(&self.center)
                .enumerate()
                .map(|(i, (x, c))| (i as f64 + 1.0) * (x - c).powi(2))
                .sum()
        }

        fn value_and_gradient(&self, p: &[f64]) -> (f64, Vec<f64>) {
            let grad = p
                .iter()
                .zip(&self.center)
                .enumerate()
                .map(|(i, (x, c))| 2.0 * (i as f64 + 1.0) * (x - c))
                .collect();
            (self.value(p), grad)
        }
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: anyhow::Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn adam_reports_every_iteration_and_descends() {
        let bowl = Bowl {
            center: vec![1.0, -2.0, 0.5],
        };
        let mut trace = Vec::new();
        let outcome = adam(
            &bowl,
            &[0.0, 0.0, 0.0],
            AdamSettings {
                max_iterations: 300,
                ..AdamSettings::default()
            },
            |_, loss| {
                trace.push(loss);
                true
            },
        )
        .expect("adam");
        assert_eq!(trace.len(), 300);
        assert_eq!(outcome.iterations, 300);
        assert!(outcome.minimum < trace[0] * 1e-2);
    }

    #[test]
    fn adam_honours_stop_request() {
        let bowl = Bowl { center: vec![1.0] };
        let mut calls = 0;
        let outcome = adam(&bowl, &[0.0], AdamSettings::default(), |_, _| {
            calls += 1;
            calls < 5
        })
        .expect("adam");
        assert_eq!(calls, 5);
        assert_eq!(outcome.iterations, 5);
    }

    #[test]
    fn bfgs_solves_rosenbrock() {
        let mut trace = Vec::new();
        let outcome = bfgs(&Rosenbrock, &[-1.2, 1.0], BfgsSettings::default(), |_, loss| {
            trace.push(loss);
            true
        })
        .expect("bfgs");
        assert!(outcome.converged);
        assert_relative_eq!(outcome.minimizer[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(outcome.minimizer[1], 1.0, epsilon = 1e-4);
        assert_eq!(trace.len(), outcome.iterations);
        assert!(trace.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn bfgs_first_step_has_requested_length() {
        let bowl = Bowl {
            center: vec![3.0, 3.0],
        };
        let mut iterates: Vec<Vec<f64>> = Vec::new();
        bfgs(
            &bowl,
            &[0.0, 0.0],
            BfgsSettings {
                max_iterations: 2,
                ..BfgsSettings::default()
            },
            |p, _| {
                iterates.push(p.to_vec());
                true
            },
        )
        .expect("bfgs");
        let step: f64 = iterates[1]
            .iter()
            .zip(&iterates[0])
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt();
        assert_relative_eq!(step, 0.01, epsilon = 1e-12);
    }

    #[test]
    fn optimizers_validate_inputs() {
        let bowl = Bowl {
            center: vec![1.0, 2.0],
        };
        assert_err_contains(
            adam(&bowl, &[0.0], AdamSettings::default(), |_, _| true),
            "dimension mismatch",
        );
        assert_err_contains(
            bfgs(
                &bowl,
                &[0.0, 0.0],
                BfgsSettings {
                    initial_step_norm: 0.0,
                    ..BfgsSettings::default()
                },
                |_, _| true,
            ),
            "initial_step_norm",
        );
    }
}
