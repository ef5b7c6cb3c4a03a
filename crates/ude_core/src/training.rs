//! Fitting the network inside the hybrid model to an observed trajectory.
//!
//! The loss is differentiated straight through the integrator with dual numbers;
//! optimization runs Adam first, then BFGS from wherever Adam stopped.

use crate::autodiff::{gradient, Dual};
use crate::hybrid::{learned_terms, predict};
use crate::network::Mlp;
use crate::optimize::{adam, bfgs, AdamSettings, BfgsSettings};
use crate::solvers::Tolerances;
use crate::trajectory::{KnownParameters, Trajectory};
use crate::traits::{Objective, Scalar};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSettings {
    pub adam: AdamSettings,
    pub bfgs: BfgsSettings,
    pub tolerances: Tolerances,
    /// Weight of the mean squared parameter penalty.
    pub penalty: f64,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            adam: AdamSettings::default(),
            bfgs: BfgsSettings::default(),
            tolerances: Tolerances::new(1e-6, 1e-6),
            penalty: 1e-4,
        }
    }
}

/// Loss values in the order the optimizers reported them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossTrace {
    #[serde(with = "crate::persistence::nonfinite::vec")]
    values: Vec<f64>,
    phase_one_len: usize,
}

impl LossTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, loss: f64) {
        self.values.push(loss);
    }

    /// Marks everything recorded so far as belonging to the first phase.
    pub fn close_phase_one(&mut self) {
        self.phase_one_len = self.values.len();
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn phase_one(&self) -> &[f64] {
        &self.values[..self.phase_one_len]
    }

    pub fn phase_two(&self) -> &[f64] {
        &self.values[self.phase_one_len..]
    }
}

/// Sum of squared trajectory errors plus `penalty * mean(theta^2)`.
pub struct TrajectoryLoss<'a> {
    network: &'a Mlp,
    known: KnownParameters,
    observed: &'a Trajectory,
    tolerances: Tolerances,
    penalty: f64,
}

impl<'a> TrajectoryLoss<'a> {
    pub fn new(
        network: &'a Mlp,
        known: KnownParameters,
        observed: &'a Trajectory,
        tolerances: Tolerances,
        penalty: f64,
    ) -> Result<Self> {
        if observed.dimension() != network.input_dim() || observed.dimension() != network.output_dim() {
            bail!(
                "Observed trajectory has dimension {}, network maps {} -> {}.",
                observed.dimension(),
                network.input_dim(),
                network.output_dim()
            );
        }
        Ok(Self {
            network,
            known,
            observed,
            tolerances,
            penalty,
        })
    }

    fn evaluate<T: Scalar>(&self, params: &[T]) -> T {
        let u0: Vec<T> = self
            .observed
            .initial_state()
            .iter()
            .map(|&v| T::constant(v))
            .collect();
        let predicted = match predict(
            self.network,
            self.known,
            params,
            &u0,
            self.observed.times(),
            &self.tolerances,
        ) {
            Ok(states) => states,
            Err(_) => return T::infinity(),
        };

        let mut sse = T::zero();
        for (target, state) in self.observed.states().iter().zip(&predicted) {
            for (&x, &p) in target.iter().zip(state) {
                let r = T::constant(x) - p;
                sse = sse + r * r;
            }
        }
        let n = params.len().max(1) as f64;
        let norm = params.iter().fold(T::zero(), |acc, &p| acc + p * p);
        sse + T::constant(self.penalty / n) * norm
    }
}

impl<'a> Objective for TrajectoryLoss<'a> {
    fn parameter_count(&self) -> usize {
        self.network.parameter_count()
    }

    fn value(&self, params: &[f64]) -> f64 {
        self.evaluate(params)
    }

    fn value_and_gradient(&self, params: &[f64]) -> (f64, Vec<f64>) {
        let (value, grad) = gradient(|p: &[Dual]| self.evaluate(p), params);
        if !value.is_finite() || grad.iter().any(|g| !g.is_finite()) {
            warn!("prediction failed during gradient evaluation; loss treated as infinite");
            return (f64::INFINITY, vec![0.0; params.len()]);
        }
        (value, grad)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingOutcome {
    pub parameters: Vec<f64>,
    pub loss_trace: LossTrace,
    pub phase_one_loss: f64,
    pub final_loss: f64,
    /// Hybrid-model states on the observation grid (X-hat).
    pub reconstruction: Vec<Vec<f64>>,
    /// Network output at the reconstructed states (Y-hat).
    pub learned: Vec<Vec<f64>>,
}

/// Two-phase fit of the network parameters to `observed`.
pub fn train(
    network: &Mlp,
    known: KnownParameters,
    observed: &Trajectory,
    initial: &[f64],
    settings: &TrainerSettings,
) -> Result<TrainingOutcome> {
    let loss = TrajectoryLoss::new(
        network,
        known,
        observed,
        settings.tolerances,
        settings.penalty,
    )?;
    let mut trace = LossTrace::new();

    let phase_one = adam(&loss, initial, settings.adam, |_, value| {
        trace.push(value);
        if trace.len() % 50 == 0 {
            debug!(phase = 1, iteration = trace.len(), loss = value, "training");
        }
        true
    })?;
    trace.close_phase_one();
    info!(
        phase = 1,
        iterations = phase_one.iterations,
        loss = phase_one.minimum,
        "first-order phase finished"
    );

    let phase_two = bfgs(&loss, &phase_one.minimizer, settings.bfgs, |_, value| {
        trace.push(value);
        if trace.phase_two().len() % 500 == 0 {
            debug!(phase = 2, iteration = trace.phase_two().len(), loss = value, "training");
        }
        true
    })?;
    info!(
        phase = 2,
        iterations = phase_two.iterations,
        converged = phase_two.converged,
        loss = phase_two.minimum,
        "quasi-Newton phase finished"
    );

    let parameters = phase_two.minimizer;
    let u0 = observed.initial_state().to_vec();
    let reconstruction = predict(
        network,
        known,
        &parameters,
        &u0,
        observed.times(),
        &settings.tolerances,
    )
    .context("Trained model could not be integrated over the observation grid.")?;
    let learned = learned_terms(network, &parameters, &reconstruction);

    Ok(TrainingOutcome {
        parameters,
        loss_trace: trace,
        phase_one_loss: phase_one.minimum,
        final_loss: phase_two.minimum,
        reconstruction,
        learned,
    })
}
