//! Explicit Runge-Kutta stepping engine for first-order ODE systems.
//!
//! The crate is built around three pieces:
//! - **Tableau**: [`tableau::ButcherTableau`], the immutable coefficient
//!   description of one explicit method, plus a library of named methods
//!   from order 1 through 8, with and without embedded pairs.
//! - **State**: [`state::IntegratorState`], the mutable state vector and
//!   per-stage derivative buffers.
//! - **Integrator**: [`integrator::Integrator`], which owns both and
//!   advances the state through a fixed-step policy or one of two adaptive
//!   policies with step-size control.
//!
//! Everything is generic over a floating-point [`traits::Scalar`], and the
//! derivative callback is any [`traits::OdeSystem`] implementor, including
//! plain closures. One integrator serves one ODE system on one thread;
//! integrating several systems, or the same system from several threads,
//! takes one integrator each.

pub mod integrator;
pub mod state;
pub mod tableau;
pub mod traits;
