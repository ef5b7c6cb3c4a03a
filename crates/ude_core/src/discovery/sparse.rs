//! Sparse regression solvers and the threshold sweep that drives them.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Sparse relaxed regularized regression (SR3) with a hard-threshold prox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Sr3Settings {
    /// Relaxation parameter coupling the least-squares and sparse variables.
    pub relaxation: f64,
    pub max_iterations: usize,
    pub convergence: f64,
    /// Scale every column to unit norm before fitting.
    pub normalize: bool,
    /// Drop singular values of the design matrix below the Gavish-Donoho threshold.
    pub denoise: bool,
}

impl Default for Sr3Settings {
    fn default() -> Self {
        Self {
            relaxation: 1.0,
            max_iterations: 50_000,
            convergence: 1e-10,
            normalize: true,
            denoise: true,
        }
    }
}

/// Sequentially thresholded least squares.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct StlsqSettings {
    pub threshold: f64,
    pub max_iterations: usize,
    pub convergence: f64,
}

impl Default for StlsqSettings {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            max_iterations: 100,
            convergence: 1e-18,
        }
    }
}

/// Log-spaced sparsity thresholds `10^start, 10^(start+step), ..., 10^end`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdSweep {
    pub log10_start: f64,
    pub log10_end: f64,
    pub log10_step: f64,
}

impl Default for ThresholdSweep {
    fn default() -> Self {
        Self {
            log10_start: -7.0,
            log10_end: 5.0,
            log10_step: 0.1,
        }
    }
}

impl ThresholdSweep {
    pub fn values(&self) -> Vec<f64> {
        if self.log10_step <= 0.0 || self.log10_end < self.log10_start {
            return Vec::new();
        }
        let count = ((self.log10_end - self.log10_start) / self.log10_step + 1e-9).floor() as usize;
        (0..=count)
            .map(|k| 10f64.powf(self.log10_start + k as f64 * self.log10_step))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseFit {
    pub coefficients: Vec<f64>,
    /// L2 norm of the residual against the unprocessed design matrix.
    pub error: f64,
    pub iterations: usize,
}

impl SparseFit {
    pub fn support(&self) -> usize {
        self.coefficients.iter().filter(|c| **c != 0.0).count()
    }
}

/// Fits with no active terms are infeasible; otherwise `|(support, error)|_2`.
pub fn score(fit: &SparseFit) -> f64 {
    let support = fit.support() as f64;
    if support < 1.0 || !fit.error.is_finite() {
        return f64::INFINITY;
    }
    support.hypot(fit.error)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepSelection {
    /// SR3 threshold that produced the fit; `None` for a forward-selection fit.
    pub threshold: Option<f64>,
    pub fit: SparseFit,
    pub score: f64,
}

/// Least-squares solution via SVD, treating tiny singular values as zero.
pub fn least_squares(theta: &DMatrix<f64>, y: &DVector<f64>) -> DVector<f64> {
    if theta.ncols() == 0 {
        return DVector::zeros(0);
    }
    let svd = theta.clone().svd(true, true);
    let largest = svd.singular_values.max();
    let eps = largest * theta.nrows().max(theta.ncols()) as f64 * f64::EPSILON;
    svd.solve(y, eps)
        .unwrap_or_else(|_| DVector::zeros(theta.ncols()))
}

pub fn residual_norm(theta: &DMatrix<f64>, y: &DVector<f64>, coefficients: &[f64]) -> f64 {
    let xi = DVector::from_column_slice(coefficients);
    (y - theta * xi).norm()
}

/// Column norms, with zero columns mapped to one so scaling is a no-op there.
pub fn column_scales(theta: &DMatrix<f64>) -> Vec<f64> {
    theta
        .column_iter()
        .map(|c| {
            let n = c.norm();
            if n > 0.0 && n.is_finite() {
                n
            } else {
                1.0
            }
        })
        .collect()
}

/// Optimal hard threshold for singular values (Gavish & Donoho, unknown noise level).
pub fn denoise(theta: &DMatrix<f64>) -> DMatrix<f64> {
    let (m, n) = theta.shape();
    if m == 0 || n == 0 {
        return theta.clone();
    }
    let beta = m.min(n) as f64 / m.max(n) as f64;
    let omega = 0.56 * beta.powi(3) - 0.95 * beta.powi(2) + 1.82 * beta + 1.43;

    let mut svd = theta.clone().svd(true, true);
    let mut sorted: Vec<f64> = svd.singular_values.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = if sorted.len() % 2 == 1 {
        sorted[sorted.len() / 2]
    } else {
        0.5 * (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2])
    };
    let cutoff = omega * median;

    for s in svd.singular_values.iter_mut() {
        if *s < cutoff {
            *s = 0.0;
        }
    }
    svd.recompose().unwrap_or_else(|_| theta.clone())
}

fn hard_threshold(values: &DVector<f64>, cutoff: f64) -> DVector<f64> {
    values.map(|v| if v.abs() < cutoff { 0.0 } else { v })
}

/// SR3 on a prepared design matrix. Returns the sparse variable `w`.
///
/// Iterates `xi = (T'T + I/nu)^-1 (T'y + w/nu)`, `w = H(xi)` with hard threshold
/// `sqrt(2 lambda nu)`, starting from the thresholded least-squares solution.
pub fn sr3(
    theta: &DMatrix<f64>,
    y: &DVector<f64>,
    lambda: f64,
    settings: &Sr3Settings,
) -> (DVector<f64>, usize) {
    let n = theta.ncols();
    let nu = settings.relaxation;
    let cutoff = (2.0 * lambda * nu).sqrt();

    let gram = theta.transpose() * theta + DMatrix::<f64>::identity(n, n) / nu;
    let rhs = theta.transpose() * y;
    let Some(chol) = gram.cholesky() else {
        return (DVector::zeros(n), 0);
    };

    let mut w = hard_threshold(&least_squares(theta, y), cutoff);
    let mut iterations = 0;
    while iterations < settings.max_iterations {
        iterations += 1;
        let xi = chol.solve(&(&rhs + &w / nu));
        let w_next = hard_threshold(&xi, cutoff);
        let change = (&w_next - &w).norm();
        w = w_next;
        if change < settings.convergence {
            break;
        }
    }
    (w, iterations)
}

/// Sequentially thresholded least squares on the raw design matrix.
pub fn stlsq(theta: &DMatrix<f64>, y: &DVector<f64>, settings: &StlsqSettings) -> SparseFit {
    let n = theta.ncols();
    let mut xi = least_squares(theta, y);
    let mut iterations = 0;

    while iterations < settings.max_iterations {
        iterations += 1;
        let active: Vec<usize> = (0..n).filter(|&i| xi[i].abs() >= settings.threshold).collect();
        let mut next = DVector::zeros(n);
        if !active.is_empty() {
            let reduced = theta.select_columns(active.iter());
            let sub = least_squares(&reduced, y);
            for (k, &i) in active.iter().enumerate() {
                next[i] = sub[k];
            }
        }
        let change = (&next - &xi).norm();
        xi = next;
        if change < settings.convergence {
            break;
        }
    }

    let coefficients: Vec<f64> = xi.iter().copied().collect();
    SparseFit {
        error: residual_norm(theta, y, &coefficients),
        coefficients,
        iterations,
    }
}

/// Least-squares fit on the given columns of the raw design matrix.
fn refit_support(
    theta: &DMatrix<f64>,
    y: &DVector<f64>,
    active: &[usize],
    iterations: usize,
) -> SparseFit {
    let mut coefficients = vec![0.0; theta.ncols()];
    if !active.is_empty() {
        let sub = least_squares(&theta.select_columns(active.iter()), y);
        for (k, &i) in active.iter().enumerate() {
            coefficients[i] = sub[k];
        }
    }
    SparseFit {
        error: residual_norm(theta, y, &coefficients),
        coefficients,
        iterations,
    }
}

/// Greedy forward selection: each step adds the column that most reduces the
/// least-squares residual. Stops once the support alone would score above `bound`
/// or the residual vanishes.
pub fn forward_path(theta: &DMatrix<f64>, y: &DVector<f64>, bound: f64) -> Vec<SparseFit> {
    let n = theta.ncols();
    let exhausted = 1e-10 * y.norm();
    let mut active: Vec<usize> = Vec::new();
    let mut path = Vec::new();

    while active.len() < n && ((active.len() + 1) as f64) <= bound {
        let best = (0..n)
            .into_par_iter()
            .filter(|j| !active.contains(j))
            .map(|j| {
                let mut trial = active.clone();
                trial.push(j);
                trial.sort_unstable();
                refit_support(theta, y, &trial, active.len() + 1)
            })
            .filter(|fit| fit.error.is_finite())
            .min_by(|a, b| a.error.total_cmp(&b.error));
        // A step that does not grow the support has nothing left to explain.
        let Some(fit) = best.filter(|fit| fit.support() > active.len()) else {
            break;
        };
        active = (0..n).filter(|&i| fit.coefficients[i] != 0.0).collect();
        let exact = fit.error <= exhausted;
        path.push(fit);
        if exact {
            break;
        }
    }
    path
}

/// Runs SR3 for every threshold and keeps the lowest-scoring feasible fit.
///
/// Each SR3 support is refitted by least squares on the raw library before it is
/// scored, and the forward-selection path over the raw library competes alongside.
/// Thresholds are fitted in parallel; selection is a sequential fold in sweep order
/// so ties resolve to the smallest threshold, then to SR3 over the forward path.
pub fn sweep(
    theta: &DMatrix<f64>,
    y: &DVector<f64>,
    thresholds: &[f64],
    settings: &Sr3Settings,
) -> Option<SweepSelection> {
    let prepared = if settings.denoise {
        denoise(theta)
    } else {
        theta.clone()
    };
    let scales = if settings.normalize {
        column_scales(&prepared)
    } else {
        vec![1.0; theta.ncols()]
    };
    let mut normalized = prepared;
    for (j, s) in scales.iter().enumerate() {
        normalized.column_mut(j).scale_mut(1.0 / s);
    }

    let mut candidates: Vec<SweepSelection> = thresholds
        .par_iter()
        .map(|&lambda| {
            let (w, iterations) = sr3(&normalized, y, lambda, settings);
            let active: Vec<usize> = (0..w.len()).filter(|&i| w[i] != 0.0).collect();
            let fit = refit_support(theta, y, &active, iterations);
            SweepSelection {
                threshold: Some(lambda),
                score: score(&fit),
                fit,
            }
        })
        .collect();

    let bound = candidates
        .iter()
        .map(|c| c.score)
        .filter(|s| s.is_finite())
        .fold(theta.ncols() as f64, f64::min);
    candidates.extend(forward_path(theta, y, bound).into_iter().map(|fit| SweepSelection {
        threshold: None,
        score: score(&fit),
        fit,
    }));

    candidates
        .into_iter()
        .filter(|c| c.score.is_finite())
        .fold(None, |best: Option<SweepSelection>, c| match best {
            Some(b) if b.score <= c.score => Some(b),
            _ => Some(c),
        })
}
