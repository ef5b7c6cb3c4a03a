use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars in our dynamical systems.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + Send + Sync + 'static {
    /// Lifts a plain constant into the scalar type.
    fn constant(value: f64) -> Self {
        Self::from_f64(value).unwrap_or_else(Self::nan)
    }

    /// The real (primal) part of the value.
    fn primal(self) -> f64 {
        self.to_f64().unwrap_or(f64::NAN)
    }
}

impl<T: Float + FromPrimitive + Debug + Send + Sync + 'static> Scalar for T {}

/// Represents a continuous-time dynamical system.
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// x: current state
    /// t: current time
    /// out: buffer to write dx/dt into
    fn apply(&self, t: T, x: &[T], out: &mut [T]);
}

/// A scalar objective over a flat parameter vector.
///
/// Optimizers only ever see parameters through this trait; the meaning of each
/// entry belongs to whoever implements it.
pub trait Objective {
    /// Number of parameters the objective expects.
    fn parameter_count(&self) -> usize;

    /// Objective value at `params`.
    fn value(&self, params: &[f64]) -> f64;

    /// Objective value and gradient at `params`.
    fn value_and_gradient(&self, params: &[f64]) -> (f64, Vec<f64>);
}
