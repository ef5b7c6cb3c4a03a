//! Dense feed-forward network used as the trainable part of the vector field.
//!
//! The network owns no weights. It is a topology plus a pure function from
//! `(input, parameters)` to output, so the same parameter vector can be pushed
//! through `f64` or dual-number evaluation without conversion.

use crate::traits::Scalar;
use anyhow::{bail, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// exp(-x^2)
    RadialBasis,
    Tanh,
    Identity,
}

impl Activation {
    pub fn apply<T: Scalar>(self, x: T) -> T {
        match self {
            Activation::RadialBasis => (-(x * x)).exp(),
            Activation::Tanh => x.tanh(),
            Activation::Identity => x,
        }
    }
}

/// Layer widths and activations of a fully connected network.
///
/// Parameters are laid out layer by layer, each layer as its row-major weight
/// matrix (`outputs x inputs`) followed by its bias vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    widths: Vec<usize>,
    hidden: Activation,
    output: Activation,
}

impl Default for Mlp {
    fn default() -> Self {
        Self {
            widths: vec![2, 5, 5, 5, 2],
            hidden: Activation::RadialBasis,
            output: Activation::Identity,
        }
    }
}

impl Mlp {
    pub fn new(widths: Vec<usize>, hidden: Activation, output: Activation) -> Result<Self> {
        let mlp = Self {
            widths,
            hidden,
            output,
        };
        mlp.validate()?;
        Ok(mlp)
    }

    /// Checks the topology; needed for networks that arrive through deserialization.
    pub fn validate(&self) -> Result<()> {
        if self.widths.len() < 2 {
            bail!("A network needs at least an input and an output layer.");
        }
        if self.widths.iter().any(|&w| w == 0) {
            bail!("Layer widths must be positive.");
        }
        Ok(())
    }

    pub fn input_dim(&self) -> usize {
        self.widths[0]
    }

    pub fn output_dim(&self) -> usize {
        self.widths[self.widths.len() - 1]
    }

    pub fn parameter_count(&self) -> usize {
        self.widths.windows(2).map(|w| w[0] * w[1] + w[1]).sum()
    }

    fn widest(&self) -> usize {
        self.widths.iter().copied().max().unwrap_or(0)
    }

    /// Evaluates the network at `input`, writing into `out`.
    ///
    /// Panics if slice lengths disagree with the topology; callers size them from
    /// `input_dim`, `output_dim` and `parameter_count`.
    pub fn forward<T: Scalar>(&self, input: &[T], params: &[T], out: &mut [T]) {
        assert_eq!(input.len(), self.input_dim(), "network input dimension");
        assert_eq!(params.len(), self.parameter_count(), "network parameter count");
        assert_eq!(out.len(), self.output_dim(), "network output dimension");

        let width = self.widest();
        let mut current = vec![T::zero(); width];
        let mut next = vec![T::zero(); width];
        current[..input.len()].copy_from_slice(input);

        let layers = self.widths.len() - 1;
        let mut offset = 0;
        for (layer, w) in self.widths.windows(2).enumerate() {
            let (n_in, n_out) = (w[0], w[1]);
            let weights = &params[offset..offset + n_in * n_out];
            let biases = &params[offset + n_in * n_out..offset + n_in * n_out + n_out];
            offset += n_in * n_out + n_out;

            let activation = if layer + 1 == layers {
                self.output
            } else {
                self.hidden
            };
            for r in 0..n_out {
                let mut acc = biases[r];
                for c in 0..n_in {
                    acc = acc + weights[r * n_in + c] * current[c];
                }
                next[r] = activation.apply(acc);
            }
            std::mem::swap(&mut current, &mut next);
        }
        out.copy_from_slice(&current[..self.output_dim()]);
    }

    /// Convenience wrapper returning a fresh output vector.
    pub fn evaluate<T: Scalar>(&self, input: &[T], params: &[T]) -> Vec<T> {
        let mut out = vec![T::zero(); self.output_dim()];
        self.forward(input, params, &mut out);
        out
    }

    /// Glorot-uniform weights and zero biases.
    pub fn initial_parameters<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let mut params = Vec::with_capacity(self.parameter_count());
        for w in self.widths.windows(2) {
            let (n_in, n_out) = (w[0], w[1]);
            let limit = (6.0 / (n_in + n_out) as f64).sqrt();
            params.extend((0..n_in * n_out).map(|_| rng.gen_range(-limit..limit)));
            params.extend(std::iter::repeat(0.0).take(n_out));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::{Activation, Mlp};
    use crate::autodiff::Dual;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn default_topology_has_expected_parameter_count() {
        // (2*5+5) + (5*5+5) + (5*5+5) + (5*2+2)
        assert_eq!(Mlp::default().parameter_count(), 87);
    }

    #[test]
    fn rejects_degenerate_topologies() {
        assert!(Mlp::new(vec![3], Activation::Tanh, Activation::Identity).is_err());
        assert!(Mlp::new(vec![2, 0, 1], Activation::Tanh, Activation::Identity).is_err());
    }

    #[test]
    fn forward_matches_hand_computation() {
        let net = Mlp::new(vec![2, 1, 1], Activation::RadialBasis, Activation::Identity)
            .expect("valid topology");
        // hidden = rbf(0.5*x0 - 1.0*x1 + 0.2), out = 3*hidden - 1
        let params = [0.5, -1.0, 0.2, 3.0, -1.0];
        let out = net.evaluate(&[1.0, 0.3], &params);
        let hidden = (-(0.4f64 * 0.4)).exp();
        assert_relative_eq!(out[0], 3.0 * hidden - 1.0, epsilon = 1e-15);
    }

    #[test]
    fn dual_evaluation_matches_f64_and_finite_differences() {
        let net = Mlp::default();
        let mut rng = StdRng::seed_from_u64(3);
        let params = net.initial_parameters(&mut rng);
        let input = [0.7, 1.9];
        let base = net.evaluate(&input, &params);

        let j = 17;
        let dual_params: Vec<Dual> = params
            .iter()
            .enumerate()
            .map(|(i, &p)| Dual::new(p, if i == j { 1.0 } else { 0.0 }))
            .collect();
        let dual_input = [Dual::constant(input[0]), Dual::constant(input[1])];
        let dual_out = net.evaluate(&dual_input, &dual_params);

        let h = 1e-6;
        let mut bumped = params.clone();
        bumped[j] += h;
        let plus = net.evaluate(&input, &bumped);
        for k in 0..2 {
            assert_relative_eq!(dual_out[k].val, base[k], epsilon = 1e-15);
            assert_relative_eq!(dual_out[k].eps, (plus[k] - base[k]) / h, epsilon = 1e-5);
        }
    }

    #[test]
    fn initialization_is_reproducible_and_bounded() {
        let net = Mlp::default();
        let a = net.initial_parameters(&mut StdRng::seed_from_u64(9));
        let b = net.initial_parameters(&mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
        assert_eq!(a.len(), net.parameter_count());
        // First layer: fan 2 -> 5, limit sqrt(6/7); biases zero.
        let limit = (6.0f64 / 7.0).sqrt();
        assert!(a[..10].iter().all(|w| w.abs() <= limit));
        assert!(a[10..15].iter().all(|&b| b == 0.0));
    }
}
