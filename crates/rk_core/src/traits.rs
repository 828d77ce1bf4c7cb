use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars by the stepping engine.
/// Must support floating-point arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Right-hand side of a first-order ODE system, dy/dt = f(t, y).
pub trait OdeSystem<T: Scalar> {
    /// Evaluates the derivative.
    /// t: current time
    /// vars: current state
    /// dydt: buffer to write the result, same length as `vars`
    fn eval(&mut self, t: T, vars: &[T], dydt: &mut [T]);
}

/// Any closure of the right shape is a system. External parameters (forcing
/// terms, physical constants) live in the closure's captured state.
impl<T: Scalar, F> OdeSystem<T> for F
where
    F: FnMut(T, &[T], &mut [T]),
{
    fn eval(&mut self, t: T, vars: &[T], dydt: &mut [T]) {
        self(t, vars, dydt)
    }
}

/// Receives stepping diagnostics from an [`Integrator`](crate::integrator::Integrator).
///
/// Every hook defaults to a no-op, so implementors only override what they
/// care about (step counters, rejection logs, profiling sinks).
pub trait StepObserver<T: Scalar> {
    /// A step was accepted and the state advanced by `dt`, landing at `t`.
    fn step_taken(&mut self, _t: T, _dt: T, _error: T) {}

    /// An adaptive trial at step size `dt` exceeded the tolerance.
    fn step_rejected(&mut self, _t: T, _dt: T, _error: T) {}

    /// A generated solution contained NaN or Inf.
    fn non_finite(&mut self, _t: T) {}

    /// Iterative refinement ran on a tableau with an embedded pair, which
    /// the embedded policy would integrate with far fewer evaluations.
    fn embedded_unused(&mut self) {}
}

/// Default observer; discards everything.
pub struct NoOpObserver;

impl<T: Scalar> StepObserver<T> for NoOpObserver {}
