//! Candidate function libraries for sparse regression.
//!
//! Every term is kept both as source text (its display and storage name) and as
//! bytecode compiled by the equation engine, so a persisted model can rebuild its
//! basis from names alone.

use crate::equation_engine::{Bytecode, Compiler, VM};
use anyhow::{bail, Result};
use nalgebra::DMatrix;

#[derive(Debug, Clone)]
pub struct BasisTerm {
    pub name: String,
    code: Bytecode,
}

#[derive(Debug, Clone)]
pub struct CandidateBasis {
    variables: Vec<String>,
    terms: Vec<BasisTerm>,
}

impl CandidateBasis {
    /// Compiles each source over the given state variables.
    pub fn from_sources<S: AsRef<str>>(sources: &[S], variables: &[S]) -> Result<Self> {
        if sources.is_empty() {
            bail!("A candidate basis needs at least one term.");
        }
        let no_params: [&str; 0] = [];
        let var_names: Vec<&str> = variables.iter().map(AsRef::as_ref).collect();
        let compiler = Compiler::new(&var_names, &no_params);
        let terms = sources
            .iter()
            .map(|src| {
                let name = src.as_ref().to_string();
                let code = compiler.compile_str(&name)?;
                Ok(BasisTerm { name, code })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            variables: var_names.iter().map(|v| v.to_string()).collect(),
            terms,
        })
    }

    /// All monomials of total degree `<= degree` (constant first), optionally
    /// followed by `sin` of every variable.
    pub fn polynomial<S: AsRef<str>>(variables: &[S], degree: u32, sines: bool) -> Result<Self> {
        let names: Vec<&str> = variables.iter().map(AsRef::as_ref).collect();
        let mut sources = Vec::new();
        for d in 0..=degree {
            let mut exponents = vec![0u32; names.len()];
            push_monomials(&names, d, 0, &mut exponents, &mut sources);
        }
        if sines {
            sources.extend(names.iter().map(|v| format!("sin({v})")));
        }
        let vars: Vec<String> = names.iter().map(|v| v.to_string()).collect();
        Self::from_sources(&sources, &vars)
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn names(&self) -> Vec<String> {
        self.terms.iter().map(|t| t.name.clone()).collect()
    }

    /// Keeps only the terms at `indices`, in the given order.
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        let terms = indices
            .iter()
            .map(|&i| {
                self.terms
                    .get(i)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("Basis index {i} out of range."))
            })
            .collect::<Result<Vec<_>>>()?;
        if terms.is_empty() {
            bail!("A candidate basis needs at least one term.");
        }
        Ok(Self {
            variables: self.variables.clone(),
            terms,
        })
    }

    /// Design matrix with one row per state and one column per term.
    pub fn evaluate(&self, states: &[Vec<f64>]) -> DMatrix<f64> {
        let mut stack = Vec::with_capacity(16);
        let no_params: [f64; 0] = [];
        DMatrix::from_fn(states.len(), self.terms.len(), |r, c| {
            VM::execute(&self.terms[c].code, &states[r], &no_params, &mut stack)
        })
    }
}

fn push_monomials(
    names: &[&str],
    remaining: u32,
    index: usize,
    exponents: &mut Vec<u32>,
    out: &mut Vec<String>,
) {
    if index + 1 == names.len() {
        exponents[index] = remaining;
        out.push(monomial_name(names, exponents));
        return;
    }
    for e in (0..=remaining).rev() {
        exponents[index] = e;
        push_monomials(names, remaining - e, index + 1, exponents, out);
    }
}

fn monomial_name(names: &[&str], exponents: &[u32]) -> String {
    let factors: Vec<String> = names
        .iter()
        .zip(exponents)
        .filter(|(_, &e)| e > 0)
        .map(|(n, &e)| if e == 1 { n.to_string() } else { format!("{n}^{e}") })
        .collect();
    if factors.is_empty() {
        "1".to_string()
    } else {
        factors.join("*")
    }
}

#[cfg(test)]
mod tests {
    use super::CandidateBasis;
    use approx::assert_relative_eq;

    #[test]
    fn default_library_has_monomials_then_sines() {
        let basis = CandidateBasis::polynomial(&["u1", "u2"], 5, true).expect("basis");
        let names = basis.names();
        assert_eq!(basis.len(), 21 + 2);
        assert_eq!(&names[..6], &["1", "u1", "u2", "u1^2", "u1*u2", "u2^2"]);
        assert_eq!(names[20], "u2^5");
        assert_eq!(&names[21..], &["sin(u1)", "sin(u2)"]);
    }

    #[test]
    fn design_matrix_evaluates_every_term() {
        let basis = CandidateBasis::polynomial(&["u1", "u2"], 2, true).expect("basis");
        let theta = basis.evaluate(&[vec![2.0, 3.0]]);
        let expected = [1.0, 2.0, 3.0, 4.0, 6.0, 9.0, 2.0f64.sin(), 3.0f64.sin()];
        assert_eq!(theta.ncols(), expected.len());
        for (c, e) in expected.iter().enumerate() {
            assert_relative_eq!(theta[(0, c)], *e, epsilon = 1e-14);
        }
    }

    #[test]
    fn subset_keeps_order_and_rejects_bad_indices() {
        let basis = CandidateBasis::polynomial(&["u1", "u2"], 2, false).expect("basis");
        let reduced = basis.subset(&[4, 1]).expect("subset");
        assert_eq!(reduced.names(), vec!["u1*u2".to_string(), "u1".to_string()]);
        assert!(basis.subset(&[99]).is_err());
        assert!(basis.subset(&[]).is_err());
    }

    #[test]
    fn names_round_trip_through_from_sources() {
        let basis = CandidateBasis::polynomial(&["u1", "u2"], 3, true).expect("basis");
        let rebuilt =
            CandidateBasis::from_sources(&basis.names(), &basis.variables().to_vec()).expect("rebuild");
        let states = vec![vec![0.3, -1.2], vec![2.0, 0.5]];
        assert_eq!(basis.evaluate(&states), rebuilt.evaluate(&states));
    }
}
