pub mod autodiff;
pub mod discovery;
pub mod equation_engine;
pub mod hybrid;
pub mod network;
pub mod noise;
pub mod optimize;
pub mod persistence;
pub mod pipeline;
pub mod solvers;
pub mod training;
pub mod trajectory;
/// The `ude_core` crate recovers missing terms of a dynamical system from noisy trajectories.
/// Integration, the network and the loss are all generic over `Scalar`, so the same code runs
/// on `f64` and on Dual numbers when the loss is differentiated.
///
/// Key components:
/// - **Traits**: `Scalar` (numeric type abstraction), `DynamicalSystem` (ODEs), `Objective` (optimizer input).
/// - **Equation Engine**: A custom bytecode VM for the reference model, candidate terms and recovered systems.
/// - **Solvers**: Adaptive Tsit5 integration sampled on a fixed grid.
/// - **Training**: Hybrid model fitted with Adam then BFGS through forward-mode sensitivities.
/// - **Discovery**: SR3 threshold sweep followed by a least-squares refit on the reduced library.
/// - **Pipeline**: Noise schedule, per-run recovery, and an append-only JSON-lines scenario store.
pub mod traits;
