use super::basis::CandidateBasis;
use crate::equation_engine::EquationSystem;
use crate::solvers::{integrate, Tolerances};
use crate::trajectory::{KnownParameters, KNOWN_PARAMETER_NAMES};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// A sparse linear combination of basis terms for each output dimension.
///
/// `coefficients[j][k]` multiplies `terms[k]` in equation `j`; zero entries are
/// inactive terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolicModel {
    pub variables: Vec<String>,
    pub terms: Vec<String>,
    pub coefficients: Vec<Vec<f64>>,
    /// Residual norm per equation on the data the model was fitted to.
    pub errors: Vec<f64>,
}

impl SymbolicModel {
    pub fn outputs(&self) -> usize {
        self.coefficients.len()
    }

    /// Number of active terms across all equations.
    pub fn support(&self) -> usize {
        self.coefficients
            .iter()
            .flatten()
            .filter(|c| **c != 0.0)
            .count()
    }

    /// Indices of terms active in at least one equation, ascending.
    pub fn active_indices(&self) -> Vec<usize> {
        (0..self.terms.len())
            .filter(|&k| self.coefficients.iter().any(|row| row[k] != 0.0))
            .collect()
    }

    pub fn active_terms(&self, equation: usize) -> Vec<(&str, f64)> {
        self.coefficients
            .get(equation)
            .map(|row| {
                row.iter()
                    .zip(&self.terms)
                    .filter(|(c, _)| **c != 0.0)
                    .map(|(c, t)| (t.as_str(), *c))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Active coefficients, equation by equation, in term order.
    pub fn parameters(&self) -> Vec<f64> {
        self.coefficients
            .iter()
            .flatten()
            .copied()
            .filter(|c| *c != 0.0)
            .collect()
    }

    /// Human-readable right-hand sides, e.g. `-0.9*u1*u2 - 0.1*sin(u1)`.
    pub fn equations(&self) -> Vec<String> {
        (0..self.outputs())
            .map(|j| {
                let mut line = String::new();
                for (t, c) in self.active_terms(j) {
                    let magnitude = if line.is_empty() {
                        c
                    } else {
                        line.push_str(if c < 0.0 { " - " } else { " + " });
                        c.abs()
                    };
                    if t == "1" {
                        line.push_str(&format!("{magnitude}"));
                    } else {
                        line.push_str(&format!("{magnitude}*{t}"));
                    }
                }
                if line.is_empty() {
                    "0".to_string()
                } else {
                    line
                }
            })
            .collect()
    }

    /// Model output at each state.
    pub fn evaluate(&self, states: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        let basis = CandidateBasis::from_sources(&self.terms, &self.variables)?;
        let theta = basis.evaluate(states);
        Ok((0..theta.nrows())
            .map(|r| {
                self.coefficients
                    .iter()
                    .map(|row| row.iter().enumerate().map(|(k, c)| c * theta[(r, k)]).sum::<f64>())
                    .collect()
            })
            .collect())
    }

    /// Known linear terms plus the discovered interactions as an ODE.
    ///
    /// Coefficients become parameters `p0, p1, ...` after the four known ones.
    pub fn recovered_system(&self, known: KnownParameters) -> Result<EquationSystem<f64>> {
        if self.outputs() != 2 || self.variables.len() != 2 {
            bail!(
                "Recovered system needs a two-equation model over two states, got {} equations over {} states.",
                self.outputs(),
                self.variables.len()
            );
        }
        let (u1, u2) = (&self.variables[0], &self.variables[1]);
        let mut sources = vec![format!("alpha*{u1}"), format!("-delta*{u2}")];
        let mut names: Vec<String> = KNOWN_PARAMETER_NAMES.iter().map(|s| s.to_string()).collect();
        let mut values = known.to_vec();

        for (j, source) in sources.iter_mut().enumerate() {
            for (term, c) in self.active_terms(j) {
                let name = format!("p{}", values.len() - KNOWN_PARAMETER_NAMES.len());
                source.push_str(&format!(" + {name}*({term})"));
                names.push(name);
                values.push(c);
            }
        }
        EquationSystem::from_sources(&sources, &self.variables, &names, values)
            .context("Failed to compile the recovered system.")
    }

    /// Integrates the recovered system from `u0`, sampled at `times`.
    pub fn simulate(
        &self,
        known: KnownParameters,
        u0: &[f64],
        times: &[f64],
        tol: &Tolerances,
    ) -> Result<Vec<Vec<f64>>> {
        let system = self.recovered_system(known)?;
        Ok(integrate(&system, u0, times, tol)?)
    }
}
