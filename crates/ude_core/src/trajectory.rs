//! Sampled trajectories and the ground-truth generator.
//!
//! The reference system is the Lotka-Volterra predator-prey model, compiled by the
//! equation engine from source so the same text can be shown in logs and records.

use crate::equation_engine::EquationSystem;
use crate::solvers::{integrate, Tolerances};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const STATE_NAMES: [&str; 2] = ["u1", "u2"];
pub const KNOWN_PARAMETER_NAMES: [&str; 4] = ["alpha", "beta", "gamma", "delta"];
pub const LOTKA_VOLTERRA: [&str; 2] = ["alpha*u1 - beta*u1*u2", "gamma*u1*u2 - delta*u2"];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrajectoryError {
    #[error("Trajectory has {states} states but {times} sample times")]
    LengthMismatch { states: usize, times: usize },
    #[error("Sample times must be strictly increasing (index {index})")]
    NonIncreasingTimes { index: usize },
    #[error("State {index} has dimension {found}, expected {expected}")]
    RaggedStates {
        index: usize,
        found: usize,
        expected: usize,
    },
    #[error("Trajectory is empty")]
    Empty,
}

/// States sampled at strictly increasing times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTrajectory")]
pub struct Trajectory {
    times: Vec<f64>,
    states: Vec<Vec<f64>>,
}

#[derive(Deserialize)]
struct RawTrajectory {
    times: Vec<f64>,
    states: Vec<Vec<f64>>,
}

impl TryFrom<RawTrajectory> for Trajectory {
    type Error = TrajectoryError;

    fn try_from(raw: RawTrajectory) -> Result<Self, Self::Error> {
        Trajectory::new(raw.times, raw.states)
    }
}

impl Trajectory {
    pub fn new(times: Vec<f64>, states: Vec<Vec<f64>>) -> Result<Self, TrajectoryError> {
        if states.len() != times.len() {
            return Err(TrajectoryError::LengthMismatch {
                states: states.len(),
                times: times.len(),
            });
        }
        if times.is_empty() {
            return Err(TrajectoryError::Empty);
        }
        if let Some(index) = times.windows(2).position(|w| w[1] <= w[0]) {
            return Err(TrajectoryError::NonIncreasingTimes { index: index + 1 });
        }
        let expected = states[0].len();
        if let Some((index, s)) = states.iter().enumerate().find(|(_, s)| s.len() != expected) {
            return Err(TrajectoryError::RaggedStates {
                index,
                found: s.len(),
                expected,
            });
        }
        Ok(Self { times, states })
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn states(&self) -> &[Vec<f64>] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.states.first().map_or(0, Vec::len)
    }

    pub fn initial_state(&self) -> &[f64] {
        &self.states[0]
    }

    /// Time average of |x_d| for every state dimension d.
    pub fn mean_abs(&self) -> Vec<f64> {
        let n = self.len() as f64;
        (0..self.dimension())
            .map(|d| self.states.iter().map(|s| s[d].abs()).sum::<f64>() / n)
            .collect()
    }

    /// Sum of squared differences against another set of states on the same grid.
    pub fn sum_squared_error(&self, other: &[Vec<f64>]) -> f64 {
        if other.len() != self.states.len() {
            return f64::INFINITY;
        }
        self.states
            .iter()
            .zip(other)
            .flat_map(|(a, b)| a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)))
            .sum()
    }

    /// Same sample times, new states.
    pub fn with_states(&self, states: Vec<Vec<f64>>) -> Result<Self, TrajectoryError> {
        Self::new(self.times.clone(), states)
    }
}

/// Mechanistic constants of the Lotka-Volterra model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnownParameters {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub delta: f64,
}

impl KnownParameters {
    pub fn to_vec(self) -> Vec<f64> {
        vec![self.alpha, self.beta, self.gamma, self.delta]
    }
}

impl Default for KnownParameters {
    fn default() -> Self {
        Self {
            alpha: 1.3,
            beta: 0.9,
            gamma: 0.8,
            delta: 1.8,
        }
    }
}

/// Everything needed to produce the ground-truth trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub known: KnownParameters,
    pub initial_state: [f64; 2],
    pub t_start: f64,
    pub t_end: f64,
    pub sample_step: f64,
    pub tolerances: Tolerances,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            known: KnownParameters::default(),
            initial_state: [0.4425, 4.6281],
            t_start: 0.0,
            t_end: 3.0,
            sample_step: 0.1,
            tolerances: Tolerances::new(1e-12, 1e-12),
        }
    }
}

impl ScenarioConfig {
    /// Uniform grid from `t_start` up to `t_end`, inclusive when the span is a whole
    /// number of steps. No sample lies past `t_end`.
    pub fn sample_times(&self) -> Vec<f64> {
        let steps = ((self.t_end - self.t_start) / self.sample_step + 1e-9).floor() as usize;
        (0..=steps)
            .map(|k| self.t_start + k as f64 * self.sample_step)
            .collect()
    }
}

/// The full reference model with the given constants.
pub fn lotka_volterra(known: KnownParameters) -> Result<EquationSystem<f64>> {
    EquationSystem::from_sources(
        &LOTKA_VOLTERRA,
        &STATE_NAMES,
        &KNOWN_PARAMETER_NAMES,
        known.to_vec(),
    )
}

/// Integrates the reference model to produce the noiseless trajectory.
pub fn generate_ground_truth(config: &ScenarioConfig) -> Result<Trajectory> {
    let system = lotka_volterra(config.known)?;
    let times = config.sample_times();
    let states = integrate(&system, &config.initial_state[..], &times, &config.tolerances)
        .context("Ground-truth integration failed.")?;
    debug!(samples = times.len(), "generated ground-truth trajectory");
    Ok(Trajectory::new(times, states)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn new_validates_invariants() {
        assert_eq!(
            Trajectory::new(vec![0.0, 1.0], vec![vec![1.0]]),
            Err(TrajectoryError::LengthMismatch {
                states: 1,
                times: 2
            })
        );
        assert_eq!(
            Trajectory::new(vec![0.0, 0.0], vec![vec![1.0], vec![2.0]]),
            Err(TrajectoryError::NonIncreasingTimes { index: 1 })
        );
        assert!(matches!(
            Trajectory::new(vec![0.0, 1.0], vec![vec![1.0], vec![2.0, 3.0]]),
            Err(TrajectoryError::RaggedStates { index: 1, .. })
        ));
        assert_eq!(Trajectory::new(vec![], vec![]), Err(TrajectoryError::Empty));
    }

    #[test]
    fn sample_grid_covers_span_inclusively() {
        let times = ScenarioConfig::default().sample_times();
        assert_eq!(times.len(), 31);
        assert_relative_eq!(times[0], 0.0);
        assert_relative_eq!(times[30], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn sample_grid_stops_at_span_end() {
        let config = ScenarioConfig {
            t_end: 1.0,
            sample_step: 0.4,
            ..ScenarioConfig::default()
        };
        let times = config.sample_times();
        assert_eq!(times.len(), 3);
        assert_relative_eq!(times[2], 0.8, epsilon = 1e-12);
        assert!(times.iter().all(|t| *t <= config.t_end));
    }

    #[test]
    fn deserialization_enforces_invariants() {
        let good: Trajectory =
            serde_json::from_str(r#"{"times": [0.0, 0.5], "states": [[1.0, 2.0], [1.5, 2.5]]}"#)
                .expect("valid trajectory");
        assert_eq!(good.initial_state(), &[1.0, 2.0]);

        let empty = serde_json::from_str::<Trajectory>(r#"{"times": [], "states": []}"#);
        assert!(empty.expect_err("empty").to_string().contains("Trajectory is empty"));
        let backwards =
            serde_json::from_str::<Trajectory>(r#"{"times": [1.0, 0.5], "states": [[1.0], [2.0]]}"#);
        assert!(backwards.is_err());
    }

    #[test]
    fn mean_abs_and_error_helpers() {
        let traj = Trajectory::new(vec![0.0, 1.0], vec![vec![1.0, -2.0], vec![-3.0, 4.0]])
            .expect("valid trajectory");
        assert_eq!(traj.mean_abs(), vec![2.0, 3.0]);
        let err = traj.sum_squared_error(&[vec![1.0, -2.0], vec![-2.0, 4.0]]);
        assert_relative_eq!(err, 1.0);
        assert!(traj.sum_squared_error(&[vec![0.0, 0.0]]).is_infinite());
    }

    #[test]
    fn ground_truth_conserves_lotka_volterra_invariant() {
        // V = gamma*u1 - delta*ln(u1) + beta*u2 - alpha*ln(u2) is a first integral.
        let config = ScenarioConfig::default();
        let truth = generate_ground_truth(&config).expect("ground truth");
        let k = config.known;
        let invariant =
            |s: &[f64]| k.gamma * s[0] - k.delta * s[0].ln() + k.beta * s[1] - k.alpha * s[1].ln();
        let v0 = invariant(truth.initial_state());
        for state in truth.states() {
            assert_relative_eq!(invariant(state), v0, epsilon = 1e-9);
        }
        assert_eq!(truth.initial_state(), &config.initial_state);
    }
}
