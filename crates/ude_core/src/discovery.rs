//! Sparse identification of the learned interaction terms.
//!
//! Discovery runs in two passes. The first sweeps SR3 over log-spaced sparsity
//! thresholds on the full candidate library, refits every SR3 support by least
//! squares, lets a greedy forward-selection path compete, and keeps the best-scoring
//! fit per output equation. The second restricts the library to every term the first pass kept and
//! refits with sequentially thresholded least squares on the raw data.

pub mod basis;
pub mod model;
pub mod sparse;

pub use basis::CandidateBasis;
pub use model::SymbolicModel;
pub use sparse::{Sr3Settings, StlsqSettings, ThresholdSweep};

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("No threshold produced a model with at least one active term for equation {equation}")]
    NoFeasibleModel { equation: usize },
    #[error("Invalid regression data: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Highest total degree of the polynomial terms.
    pub degree: u32,
    /// Append `sin` of every state variable to the library.
    pub sines: bool,
    pub sweep: ThresholdSweep,
    pub sr3: Sr3Settings,
    pub refit: StlsqSettings,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            degree: 5,
            sines: true,
            sweep: ThresholdSweep::default(),
            sr3: Sr3Settings::default(),
            refit: StlsqSettings::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn basis<S: AsRef<str>>(&self, variables: &[S]) -> anyhow::Result<CandidateBasis> {
        CandidateBasis::polynomial(variables, self.degree, self.sines)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    /// First-pass model over the full library.
    pub intermediate: SymbolicModel,
    /// Refitted model over the reduced library.
    pub model: SymbolicModel,
    /// SR3 threshold selected for each equation in the first pass; `None` where the
    /// forward-selection path supplied the fit.
    pub selected_thresholds: Vec<Option<f64>>,
}

/// Finds a sparse model `targets ~ basis(states) * coefficients`.
///
/// `states[i]` and `targets[i]` are paired samples. Fails with
/// [`DiscoveryError::NoFeasibleModel`] when some equation admits no fit with an
/// active term.
pub fn discover(
    states: &[Vec<f64>],
    targets: &[Vec<f64>],
    basis: &CandidateBasis,
    config: &DiscoveryConfig,
) -> Result<Discovery, DiscoveryError> {
    let outputs = check_data(states, targets)?;
    let thresholds = config.sweep.values();
    if thresholds.is_empty() {
        return Err(DiscoveryError::InvalidData(
            "threshold sweep is empty".to_string(),
        ));
    }

    let theta = basis.evaluate(states);
    if theta.iter().any(|v| !v.is_finite()) {
        return Err(DiscoveryError::InvalidData(
            "candidate library is not finite on the given states".to_string(),
        ));
    }

    let mut coefficients = Vec::with_capacity(outputs);
    let mut errors = Vec::with_capacity(outputs);
    let mut selected_thresholds = Vec::with_capacity(outputs);
    for equation in 0..outputs {
        let y = target_column(targets, equation);
        let selection = sparse::sweep(&theta, &y, &thresholds, &config.sr3)
            .ok_or(DiscoveryError::NoFeasibleModel { equation })?;
        debug!(
            equation,
            threshold = ?selection.threshold,
            support = selection.fit.support(),
            score = selection.score,
            "threshold selected"
        );
        selected_thresholds.push(selection.threshold);
        errors.push(selection.fit.error);
        coefficients.push(selection.fit.coefficients);
    }
    let intermediate = SymbolicModel {
        variables: basis.variables().to_vec(),
        terms: basis.names(),
        coefficients,
        errors,
    };

    let reduced = basis.subset(&intermediate.active_indices())?;
    let theta = reduced.evaluate(states);
    let mut coefficients = Vec::with_capacity(outputs);
    let mut errors = Vec::with_capacity(outputs);
    for equation in 0..outputs {
        let y = target_column(targets, equation);
        let fit = sparse::stlsq(&theta, &y, &config.refit);
        if fit.support() == 0 {
            return Err(DiscoveryError::NoFeasibleModel { equation });
        }
        errors.push(fit.error);
        coefficients.push(fit.coefficients);
    }
    let model = SymbolicModel {
        variables: reduced.variables().to_vec(),
        terms: reduced.names(),
        coefficients,
        errors,
    };

    Ok(Discovery {
        intermediate,
        model,
        selected_thresholds,
    })
}

fn check_data(states: &[Vec<f64>], targets: &[Vec<f64>]) -> Result<usize, DiscoveryError> {
    if states.is_empty() {
        return Err(DiscoveryError::InvalidData("no samples".to_string()));
    }
    if states.len() != targets.len() {
        return Err(DiscoveryError::InvalidData(format!(
            "{} states but {} targets",
            states.len(),
            targets.len()
        )));
    }
    let outputs = targets[0].len();
    if outputs == 0 || targets.iter().any(|t| t.len() != outputs) {
        return Err(DiscoveryError::InvalidData(
            "targets must share a non-zero dimension".to_string(),
        ));
    }
    if targets.iter().flatten().any(|v| !v.is_finite()) {
        return Err(DiscoveryError::InvalidData(
            "targets contain non-finite values".to_string(),
        ));
    }
    Ok(outputs)
}

fn target_column(targets: &[Vec<f64>], equation: usize) -> DVector<f64> {
    DVector::from_iterator(targets.len(), targets.iter().map(|t| t[equation]))
}
