//! Noisy observation sets derived from a ground-truth trajectory.

use crate::trajectory::Trajectory;
use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Step schedule mapping a 1-based run index to a relative noise magnitude.
///
/// Run `i` uses `magnitudes[k]` for the first `k` with `i <= thresholds[k]`, and the
/// last magnitude once every threshold is passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSchedule {
    pub thresholds: Vec<usize>,
    pub magnitudes: Vec<f64>,
}

impl Default for NoiseSchedule {
    fn default() -> Self {
        Self {
            thresholds: vec![40, 80, 120, 160],
            magnitudes: vec![1e-3, 5e-3, 1e-2, 2.5e-2, 5e-2],
        }
    }
}

impl NoiseSchedule {
    pub fn validate(&self) -> Result<()> {
        if self.magnitudes.len() != self.thresholds.len() + 1 {
            bail!(
                "Noise schedule needs one more magnitude than thresholds (got {} and {}).",
                self.magnitudes.len(),
                self.thresholds.len()
            );
        }
        if self.thresholds.windows(2).any(|w| w[1] <= w[0]) {
            bail!("Noise schedule thresholds must be strictly increasing.");
        }
        if self.magnitudes.iter().any(|m| !m.is_finite() || *m < 0.0) {
            bail!("Noise magnitudes must be finite and non-negative.");
        }
        Ok(())
    }

    pub fn magnitude(&self, run: usize) -> f64 {
        self.thresholds
            .iter()
            .position(|&limit| run <= limit)
            .map_or_else(
                || self.magnitudes.last().copied().unwrap_or(0.0),
                |k| self.magnitudes[k],
            )
    }
}

/// How random draws are shared between runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomStream {
    /// One stream seeded once; run `i` continues where run `i - 1` stopped.
    #[default]
    Shared,
    /// Every run reseeds from `(seed, run)` and is reproducible on its own.
    PerRun,
}

/// Derives an independent seed for a run index (SplitMix64 finalizer).
pub fn run_seed(seed: u64, run: usize) -> u64 {
    let mut z = seed ^ (run as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Adds `magnitude * reference[d] * N(0, 1)` to every entry of dimension `d`.
pub fn perturb<R: Rng + ?Sized>(
    truth: &Trajectory,
    reference: &[f64],
    magnitude: f64,
    rng: &mut R,
) -> Result<Trajectory> {
    if reference.len() != truth.dimension() {
        bail!(
            "Noise reference has {} entries for a {}-dimensional trajectory.",
            reference.len(),
            truth.dimension()
        );
    }
    let states = truth
        .states()
        .iter()
        .map(|state| {
            state
                .iter()
                .zip(reference)
                .map(|(&x, &scale)| {
                    let xi: f64 = rng.sample(StandardNormal);
                    x + magnitude * scale * xi
                })
                .collect()
        })
        .collect();
    Ok(truth.with_states(states)?)
}

/// One noisy observation set, tagged with the run it belongs to.
#[derive(Debug, Clone)]
pub struct NoisyRealization {
    pub run: usize,
    pub magnitude: f64,
    pub observed: Trajectory,
}

/// Produces noisy realizations for runs `1..=runs`.
///
/// Draws happen here, sequentially and in run order, so a later parallel pass
/// over the realizations cannot change which numbers each run received.
pub struct NoiseInjector<'a> {
    truth: &'a Trajectory,
    reference: Vec<f64>,
    schedule: NoiseSchedule,
}

impl<'a> NoiseInjector<'a> {
    pub fn new(truth: &'a Trajectory, schedule: NoiseSchedule) -> Result<Self> {
        schedule.validate()?;
        Ok(Self {
            truth,
            reference: truth.mean_abs(),
            schedule,
        })
    }

    pub fn reference(&self) -> &[f64] {
        &self.reference
    }

    pub fn realization<R: Rng + ?Sized>(&self, run: usize, rng: &mut R) -> Result<NoisyRealization> {
        let magnitude = self.schedule.magnitude(run);
        let observed = perturb(self.truth, &self.reference, magnitude, rng)?;
        Ok(NoisyRealization {
            run,
            magnitude,
            observed,
        })
    }

    /// `shared` is the process-wide stream, used only in `RandomStream::Shared` mode.
    pub fn realizations(
        &self,
        runs: usize,
        mode: RandomStream,
        seed: u64,
        shared: &mut StdRng,
    ) -> Result<Vec<NoisyRealization>> {
        (1..=runs)
            .map(|run| match mode {
                RandomStream::Shared => self.realization(run, shared),
                RandomStream::PerRun => {
                    let mut rng = StdRng::seed_from_u64(run_seed(seed, run));
                    self.realization(run, &mut rng)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp() -> Trajectory {
        let times: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let states = times.iter().map(|t| vec![1.0 + t, -2.0 - t]).collect();
        Trajectory::new(times, states).expect("valid trajectory")
    }

    #[test]
    fn schedule_matches_documented_steps() {
        let schedule = NoiseSchedule::default();
        schedule.validate().expect("default schedule is valid");
        assert_eq!(schedule.magnitude(1), 1e-3);
        assert_eq!(schedule.magnitude(40), 1e-3);
        assert_eq!(schedule.magnitude(41), 5e-3);
        assert_eq!(schedule.magnitude(80), 5e-3);
        assert_eq!(schedule.magnitude(81), 1e-2);
        assert_eq!(schedule.magnitude(120), 1e-2);
        assert_eq!(schedule.magnitude(121), 2.5e-2);
        assert_eq!(schedule.magnitude(160), 2.5e-2);
        assert_eq!(schedule.magnitude(161), 5e-2);
        assert_eq!(schedule.magnitude(200), 5e-2);
    }

    #[test]
    fn schedule_is_non_decreasing() {
        let schedule = NoiseSchedule::default();
        let values: Vec<f64> = (1..=200).map(|i| schedule.magnitude(i)).collect();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn schedule_validation_catches_shape_errors() {
        let bad = NoiseSchedule {
            thresholds: vec![10, 5],
            magnitudes: vec![0.1, 0.2, 0.3],
        };
        assert!(bad.validate().is_err());
        let short = NoiseSchedule {
            thresholds: vec![10],
            magnitudes: vec![0.1],
        };
        assert!(short.validate().is_err());
    }

    #[test]
    fn zero_magnitude_reproduces_truth() {
        let truth = ramp();
        let mut rng = StdRng::seed_from_u64(7);
        let noisy = perturb(&truth, &truth.mean_abs(), 0.0, &mut rng).expect("perturb");
        assert_eq!(noisy, truth);
    }

    #[test]
    fn noise_scales_with_reference_per_dimension() {
        let truth = ramp();
        let reference = vec![1.0, 100.0];
        let mut rng = StdRng::seed_from_u64(11);
        let noisy = perturb(&truth, &reference, 0.1, &mut rng).expect("perturb");
        let spread = |d: usize| {
            noisy
                .states()
                .iter()
                .zip(truth.states())
                .map(|(a, b)| (a[d] - b[d]).abs())
                .fold(0.0, f64::max)
        };
        assert!(spread(1) > spread(0));
        assert_eq!(noisy.times(), truth.times());
    }

    #[test]
    fn random_stream_defaults_to_shared() {
        assert_eq!(RandomStream::default(), RandomStream::Shared);
        let parsed: RandomStream = serde_json::from_str(r#""per_run""#).expect("parse");
        assert_eq!(parsed, RandomStream::PerRun);
    }

    #[test]
    fn shared_stream_is_cumulative_and_per_run_is_independent() {
        let truth = ramp();
        let injector = NoiseInjector::new(&truth, NoiseSchedule::default()).expect("injector");

        let mut shared = StdRng::seed_from_u64(42);
        let a = injector
            .realizations(3, RandomStream::Shared, 42, &mut shared)
            .expect("shared");
        let mut shared = StdRng::seed_from_u64(42);
        let b = injector
            .realizations(3, RandomStream::Shared, 42, &mut shared)
            .expect("shared");
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.observed, y.observed);
        }
        assert_ne!(a[0].observed, a[1].observed);

        let mut unused = StdRng::seed_from_u64(0);
        let per_run = injector
            .realizations(3, RandomStream::PerRun, 42, &mut unused)
            .expect("per run");
        let mut rng = StdRng::seed_from_u64(run_seed(42, 3));
        let third = injector.realization(3, &mut rng).expect("single run");
        assert_eq!(per_run[2].observed, third.observed);
        assert_relative_eq!(per_run[2].magnitude, 1e-3);
    }
}
