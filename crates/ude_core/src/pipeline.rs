//! Batch orchestration: noise, training, discovery and persistence for N runs.
//!
//! All randomness is consumed in [`Pipeline::prepare`], before any run starts:
//! first the initial network parameters, then every noisy realization in run order.
//! Runs then execute on a rayon pool in any order without changing their inputs.
//! The store append is the only point where runs synchronize.

use crate::discovery::{discover, CandidateBasis, DiscoveryConfig};
use crate::network::Mlp;
use crate::noise::{NoiseInjector, NoiseSchedule, NoisyRealization, RandomStream};
use crate::persistence::{ScenarioRecord, ScenarioStore};
use crate::training::{train, TrainerSettings};
use crate::trajectory::{generate_ground_truth, ScenarioConfig, Trajectory, STATE_NAMES};
use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub scenario: ScenarioConfig,
    pub schedule: NoiseSchedule,
    pub stream: RandomStream,
    pub seed: u64,
    pub runs: usize,
    /// Prefix of every scenario key.
    pub family: String,
    pub store_path: PathBuf,
    /// Worker threads; `None` uses one per CPU.
    pub workers: Option<usize>,
    pub network: Mlp,
    pub trainer: TrainerSettings,
    pub discovery: DiscoveryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scenario: ScenarioConfig::default(),
            schedule: NoiseSchedule::default(),
            stream: RandomStream::default(),
            seed: 1111,
            runs: 200,
            family: "lotka_volterra".to_string(),
            store_path: PathBuf::from("scenarios.jsonl"),
            workers: None,
            network: Mlp::default(),
            trainer: TrainerSettings::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).context("Invalid pipeline configuration.")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.runs == 0 {
            bail!("runs must be at least 1.");
        }
        if self.family.is_empty() || self.family.contains('/') {
            bail!("family must be a non-empty name without '/'.");
        }
        if self.workers == Some(0) {
            bail!("workers must be positive when given.");
        }
        if self.scenario.sample_step <= 0.0 || self.scenario.t_end <= self.scenario.t_start {
            bail!("Sampling grid must have a positive step and a non-empty span.");
        }
        self.schedule.validate()?;
        self.network.validate()?;
        if self.network.input_dim() != STATE_NAMES.len() || self.network.output_dim() != STATE_NAMES.len() {
            bail!(
                "Network must map {} states to {} outputs.",
                STATE_NAMES.len(),
                STATE_NAMES.len()
            );
        }
        Ok(())
    }
}

/// `"{family}/{run}"`.
pub fn scenario_key(family: &str, run: usize) -> String {
    format!("{family}/{run}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub completed: Vec<usize>,
    /// Runs whose key was already in the store.
    pub skipped: Vec<usize>,
    pub failed: Vec<usize>,
}

enum RunStatus {
    Completed,
    Skipped,
    Failed,
}

/// Shared, read-only inputs of a batch.
pub struct Pipeline {
    config: PipelineConfig,
    truth: Trajectory,
    basis: CandidateBasis,
    initial_parameters: Vec<f64>,
    realizations: Vec<NoisyRealization>,
}

impl Pipeline {
    /// Builds the ground truth and draws all random inputs. A ground-truth failure
    /// is fatal for the whole batch.
    pub fn prepare(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let truth = generate_ground_truth(&config.scenario)?;
        let basis = config.discovery.basis(&STATE_NAMES)?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let initial_parameters = config.network.initial_parameters(&mut rng);
        let injector = NoiseInjector::new(&truth, config.schedule.clone())?;
        let realizations = injector.realizations(config.runs, config.stream, config.seed, &mut rng)?;
        info!(
            runs = config.runs,
            parameters = initial_parameters.len(),
            basis = basis.len(),
            "pipeline prepared"
        );

        Ok(Self {
            config,
            truth,
            basis,
            initial_parameters,
            realizations,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn truth(&self) -> &Trajectory {
        &self.truth
    }

    pub fn initial_parameters(&self) -> &[f64] {
        &self.initial_parameters
    }

    pub fn realizations(&self) -> &[NoisyRealization] {
        &self.realizations
    }

    /// Train, then discover, for one realization. Discovery failures are recorded
    /// in the result; training failures are returned.
    pub fn run_scenario(&self, realization: &NoisyRealization) -> Result<ScenarioRecord> {
        let run = realization.run;
        let known = self.config.scenario.known;
        let observed = &realization.observed;
        info!(run, magnitude = realization.magnitude, "run started");

        let outcome = train(
            &self.config.network,
            known,
            observed,
            &self.initial_parameters,
            &self.config.trainer,
        )
        .with_context(|| format!("Training failed for run {run}."))?;
        info!(
            run,
            phase_one_loss = outcome.phase_one_loss,
            final_loss = outcome.final_loss,
            "training finished"
        );

        let mut record = ScenarioRecord {
            run,
            magnitude: realization.magnitude,
            observed: observed.clone(),
            initial_parameters: self.initial_parameters.clone(),
            trained_parameters: outcome.parameters,
            loss_trace: outcome.loss_trace,
            phase_one_loss: outcome.phase_one_loss,
            final_loss: outcome.final_loss,
            discovery: None,
            equations: Vec::new(),
            discovery_failure: None,
            recovered_error: None,
        };

        match discover(&outcome.reconstruction, &outcome.learned, &self.basis, &self.config.discovery) {
            Ok(found) => {
                record.equations = found.model.equations();
                info!(
                    run,
                    equations = ?record.equations,
                    coefficients = ?found.model.parameters(),
                    "discovered model"
                );
                match found.model.simulate(
                    known,
                    observed.initial_state(),
                    observed.times(),
                    &self.config.trainer.tolerances,
                ) {
                    Ok(states) => {
                        let err = observed.sum_squared_error(&states);
                        info!(run, error = err, "recovered system integrated");
                        record.recovered_error = Some(err).filter(|e| e.is_finite());
                    }
                    Err(e) => warn!(run, error = %format!("{e:#}"), "recovered system failed to integrate"),
                }
                record.discovery = Some(found);
            }
            Err(e) => {
                warn!(run, error = %e, "discovery failed");
                record.discovery_failure = Some(e.to_string());
            }
        }
        Ok(record)
    }

    /// Runs every realization whose key is not yet in `store`.
    pub fn run_batch(&self, store: &ScenarioStore) -> Result<BatchSummary> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(n) = self.config.workers {
            builder = builder.num_threads(n);
        }
        let pool = builder.build().context("Failed to start worker pool.")?;

        let statuses: Vec<(usize, RunStatus)> = pool.install(|| {
            self.realizations
                .par_iter()
                .map(|r| (r.run, self.run_and_store(r, store)))
                .collect()
        });

        let mut summary = BatchSummary::default();
        for (run, status) in statuses {
            match status {
                RunStatus::Completed => summary.completed.push(run),
                RunStatus::Skipped => summary.skipped.push(run),
                RunStatus::Failed => summary.failed.push(run),
            }
        }
        info!(
            completed = summary.completed.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "batch finished"
        );
        Ok(summary)
    }

    fn run_and_store(&self, realization: &NoisyRealization, store: &ScenarioStore) -> RunStatus {
        let run = realization.run;
        let key = scenario_key(&self.config.family, run);
        let result = store.contains(&key).map_err(anyhow::Error::from).and_then(|present| {
            if present {
                return Ok(false);
            }
            let record = self.run_scenario(realization)?;
            store.append(&key, &record)?;
            Ok(true)
        });
        match result {
            Ok(true) => {
                info!(run, key = %key, "run finished");
                RunStatus::Completed
            }
            Ok(false) => {
                info!(run, key = %key, "already stored, skipping");
                RunStatus::Skipped
            }
            Err(e) => {
                error!(run, key = %key, error = %format!("{e:#}"), "run failed");
                RunStatus::Failed
            }
        }
    }
}

/// Prepares the batch and runs it against the configured store.
pub fn run_batch(config: PipelineConfig) -> Result<BatchSummary> {
    let store = ScenarioStore::open(&config.store_path)
        .with_context(|| format!("Failed to open store {}", config.store_path.display()))?;
    let pipeline = Pipeline::prepare(config)?;
    pipeline.run_batch(&store)
}
