//! Universal differential equation: known linear growth/decay plus a learned term.

use crate::network::Mlp;
use crate::solvers::{integrate, IntegrationFailure, Tolerances};
use crate::trajectory::KnownParameters;
use crate::traits::{DynamicalSystem, Scalar};

/// du1 = alpha*u1 + F1(u; theta), du2 = -delta*u2 + F2(u; theta).
///
/// The interaction terms of the mechanistic model are left to the network.
pub struct HybridDynamics<'a, T: Scalar> {
    pub network: &'a Mlp,
    pub known: KnownParameters,
    pub params: &'a [T],
}

impl<'a, T: Scalar> HybridDynamics<'a, T> {
    pub fn new(network: &'a Mlp, known: KnownParameters, params: &'a [T]) -> Self {
        Self {
            network,
            known,
            params,
        }
    }
}

impl<'a, T: Scalar> DynamicalSystem<T> for HybridDynamics<'a, T> {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        self.network.forward(x, self.params, out);
        out[0] = out[0] + T::constant(self.known.alpha) * x[0];
        out[1] = out[1] - T::constant(self.known.delta) * x[1];
    }
}

/// Solves the hybrid model from `u0` and samples it at `times`.
pub fn predict<T: Scalar>(
    network: &Mlp,
    known: KnownParameters,
    params: &[T],
    u0: &[T],
    times: &[f64],
    tol: &Tolerances,
) -> Result<Vec<Vec<T>>, IntegrationFailure> {
    let system = HybridDynamics::new(network, known, params);
    integrate(&system, u0, times, tol)
}

/// Raw network output at each state: the learned missing terms.
pub fn learned_terms(network: &Mlp, params: &[f64], states: &[Vec<f64>]) -> Vec<Vec<f64>> {
    states
        .iter()
        .map(|s| network.evaluate(s, params))
        .collect()
}
