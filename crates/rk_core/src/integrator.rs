use crate::state::IntegratorState;
use crate::tableau::ButcherTableau;
use crate::traits::{NoOpObserver, OdeSystem, Scalar, StepObserver};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// After an adaptive step the stored error is floored at
/// `tolerance / ERROR_FLOOR_RATIO`, so the next pre-scale cannot grow the
/// step by more than the factor clamp allows.
const ERROR_FLOOR_RATIO: f64 = 256.0;

/// Bounds on the step-size factor. Keeping the factor away from both zero
/// and infinity prevents oscillatory step-size hunting.
const MIN_FACTOR: f64 = 0.1;
const MAX_FACTOR: f64 = 5.0;

/// Which of the tableau's weight vectors assembles a solution.
#[derive(Clone, Copy)]
enum Weights {
    Coefs1,
    Coefs2,
}

/// Explicit Runge-Kutta stepping engine.
///
/// Owns a [`ButcherTableau`] and an [`IntegratorState`] and advances the
/// state one step per call, through one of three policies:
///
/// - [`fixed_step`](Self::fixed_step): one step of exactly `dt`;
/// - [`reiterative_step`](Self::reiterative_step): adaptive, estimating the
///   local error by re-integrating the same span with chained sub-steps;
/// - [`embedded_step`](Self::embedded_step): adaptive, estimating the local
///   error from the tableau's embedded weight pair.
///
/// Misuse (a step size outside the configured limits while limits are
/// enforced, too few sub-steps, the embedded policy on a plain tableau)
/// panics. A NaN or Inf produced by the system or the solution assembly is
/// reported by returning `false`; the state keeps whatever values were
/// produced and the caller decides how to recover.
pub struct Integrator<T: Scalar> {
    tableau: ButcherTableau<T>,
    state: IntegratorState<T>,
    tolerance: T,
    min_dt: T,
    max_dt: T,
    error: T,
    valid: bool,
    reversed: bool,
    limited_timestep: bool,
    observer: Box<dyn StepObserver<T>>,
    aux: Vec<T>,
}

impl<T: Scalar> Integrator<T> {
    /// Creates an integrator over `tableau` starting from `vars`, with a
    /// tolerance of `1e-4` and step limits `[1e-6, 1]`.
    pub fn new(tableau: ButcherTableau<T>, vars: Vec<T>) -> Self {
        let state = IntegratorState::new(vars, tableau.stages());
        Self {
            tableau,
            state,
            tolerance: T::from_f64(1e-4).unwrap(),
            min_dt: T::from_f64(1e-6).unwrap(),
            max_dt: T::one(),
            error: T::zero(),
            valid: true,
            reversed: false,
            limited_timestep: true,
            observer: Box::new(NoOpObserver),
            aux: Vec::new(),
        }
    }

    pub fn with_tolerance(mut self, tolerance: T) -> Self {
        self.set_tolerance(tolerance);
        self
    }

    pub fn with_step_limits(mut self, min_dt: T, max_dt: T) -> Self {
        self.set_step_limits(min_dt, max_dt);
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn StepObserver<T>>) -> Self {
        self.observer = observer;
        self
    }

    /// Advances by exactly `dt` (sign chosen by `reversed`) using the
    /// primary weights. When the tableau is embedded, a second solution is
    /// assembled from the secondary weights purely to refresh the `error`
    /// diagnostic; it does not influence the step. Returns the validity of
    /// the produced solution.
    pub fn fixed_step<S: OdeSystem<T>>(&mut self, system: &mut S, t: &mut T, dt: T) -> bool {
        self.assert_dt_bounds(dt);
        self.valid = true;
        let sdt = if self.reversed { -dt } else { dt };

        let base = self.state.vars.clone();
        self.update_kvec(system, *t, sdt, &base);
        if self.tableau.embedded() {
            let aux_sol = self.generate_solution(*t, sdt, &base, Weights::Coefs2);
            let sol = self.generate_solution(*t, sdt, &base, Weights::Coefs1);
            self.error = Self::max_difference(&sol, &aux_sol);
            self.state.vars = sol;
        } else {
            self.state.vars = self.generate_solution(*t, sdt, &base, Weights::Coefs1);
        }
        *t = *t + sdt;
        self.observer.step_taken(*t, sdt, self.error);
        self.valid
    }

    /// Adaptive step that estimates the local error by comparing one full
    /// `dt` step against `reiterations` chained sub-steps of
    /// `dt / reiterations` over the same span, shrinking `dt` until the
    /// estimate meets the tolerance or the step floor is reached. The
    /// refined solution is the one accepted. `dt` is updated in place.
    ///
    /// Needs `reiterations >= 2`; works with any tableau, but on an
    /// embedded one each accepted step costs `reiterations + 1` full stage
    /// evaluations where [`embedded_step`](Self::embedded_step) needs one.
    pub fn reiterative_step<S: OdeSystem<T>>(
        &mut self,
        system: &mut S,
        t: &mut T,
        dt: &mut T,
        reiterations: u32,
    ) -> bool {
        assert!(
            reiterations >= 2,
            "refinement needs at least two sub-steps, got {reiterations}"
        );
        self.assert_dt_bounds(*dt);
        if self.tableau.embedded() {
            self.observer.embedded_unused();
        }

        self.valid = true;
        self.prescale_dt(dt);
        let m = T::from_u32(reiterations).unwrap();
        loop {
            let sdt = if self.reversed { -*dt } else { *dt };
            let base = self.state.vars.clone();
            self.update_kvec(system, *t, sdt, &base);
            let sol2 = self.generate_solution(*t, sdt, &base, Weights::Coefs1);

            let sub = sdt / m;
            let mut sol1 = base;
            for _ in 0..reiterations {
                self.update_kvec(system, *t, sub, &sol1);
                sol1 = self.generate_solution(*t, sub, &sol1, Weights::Coefs1);
            }
            self.error = Self::max_difference(&sol1, &sol2);

            if self.accept_or_shrink(t, dt, sol1) {
                break;
            }
        }
        self.finish_adaptive(t, *dt)
    }

    /// Adaptive step that assembles both of an embedded tableau's solutions
    /// from a single set of stage derivatives and uses their difference as
    /// the local error, shrinking `dt` until the estimate meets the
    /// tolerance or the step floor is reached. The primary-weight solution
    /// is the one accepted. `dt` is updated in place.
    pub fn embedded_step<S: OdeSystem<T>>(&mut self, system: &mut S, t: &mut T, dt: &mut T) -> bool {
        assert!(
            self.tableau.embedded(),
            "embedded stepping requires a tableau with a second weight vector"
        );
        self.assert_dt_bounds(*dt);

        self.valid = true;
        self.prescale_dt(dt);
        loop {
            let sdt = if self.reversed { -*dt } else { *dt };
            let base = self.state.vars.clone();
            self.update_kvec(system, *t, sdt, &base);
            let sol2 = self.generate_solution(*t, sdt, &base, Weights::Coefs2);
            let sol1 = self.generate_solution(*t, sdt, &base, Weights::Coefs1);
            self.error = Self::max_difference(&sol1, &sol2);

            if self.accept_or_shrink(t, dt, sol1) {
                break;
            }
        }
        self.finish_adaptive(t, *dt)
    }

    /// Scales `dt` by the step factor derived from the previous error
    /// estimate, keeping it inside the configured limits. Skipped on the
    /// first call, before any estimate exists.
    fn prescale_dt(&self, dt: &mut T) {
        if self.error > T::zero() {
            *dt = (*dt * self.timestep_factor())
                .max(self.min_dt)
                .min(self.max_dt);
        }
    }

    /// One acceptance decision of the adaptive loop. Accepts `sol` when the
    /// error estimate meets the tolerance, when shrinking further would fall
    /// through the step floor (pinning `dt` there), or when the trial went
    /// non-finite and retrying cannot help. Otherwise shrinks `dt` and
    /// reports the rejection. Returns whether the loop is done.
    fn accept_or_shrink(&mut self, t: &mut T, dt: &mut T, sol: Vec<T>) -> bool {
        if !self.valid {
            self.state.vars = sol;
            return true;
        }
        let too_small = self.dt_too_small(*dt);
        if self.error <= self.tolerance || too_small {
            self.state.vars = sol;
            if too_small {
                *dt = self.min_dt;
            }
            return true;
        }
        self.observer.step_rejected(*t, *dt, self.error);
        *dt = *dt * self.timestep_factor();
        false
    }

    /// Shared tail of the adaptive policies: floors the stored error,
    /// advances time by the accepted signed step, and reports it.
    fn finish_adaptive(&mut self, t: &mut T, dt: T) -> bool {
        self.error = self
            .error
            .max(self.tolerance / T::from_f64(ERROR_FLOOR_RATIO).unwrap());
        let sdt = if self.reversed { -dt } else { dt };
        *t = *t + sdt;
        self.observer.step_taken(*t, sdt, self.error);
        self.valid
    }

    /// Recomputes every k-vector for a step of signed size `dt` from the
    /// base state `vars`:
    ///
    /// ```text
    /// k[0] = f(t, y)
    /// k[i] = f(t + alpha[i-1] * dt, y + dt * sum(beta[i-1][s] * k[s]))
    /// ```
    ///
    /// Every stage offsets from the same base `y`, not from the previous
    /// stage's auxiliary state.
    fn update_kvec<S: OdeSystem<T>>(&mut self, system: &mut S, t: T, dt: T, vars: &[T]) {
        let stages = self.tableau.stages() as usize;
        let n = vars.len();
        debug_assert_eq!(self.state.kvec.len(), stages);
        debug_assert_eq!(self.state.kvec[0].len(), n);
        self.aux.resize(n, T::zero());

        system.eval(t, vars, &mut self.state.kvec[0]);
        for i in 1..stages {
            for j in 0..n {
                let mut k_sum = T::zero();
                for s in 0..i {
                    k_sum = k_sum + self.tableau.beta()[i - 1][s] * self.state.kvec[s][j];
                }
                self.aux[j] = vars[j] + k_sum * dt;
            }
            system.eval(
                t + self.tableau.alpha()[i - 1] * dt,
                &self.aux,
                &mut self.state.kvec[i],
            );
        }
    }

    /// Assembles `y + dt * sum(coefs[s] * k[s])` from the current
    /// k-vectors. A NaN or Inf anywhere in the result clears the validity
    /// flag and notifies the observer, once per generated solution.
    fn generate_solution(&mut self, t: T, dt: T, vars: &[T], weights: Weights) -> Vec<T> {
        let coefs = match weights {
            Weights::Coefs1 => self.tableau.coefs1(),
            Weights::Coefs2 => self
                .tableau
                .coefs2()
                .expect("secondary weights require an embedded tableau"),
        };
        let mut sol = vars.to_vec();
        for (s, &c) in coefs.iter().enumerate() {
            let k = &self.state.kvec[s];
            for j in 0..sol.len() {
                sol[j] = sol[j] + dt * c * k[j];
            }
        }
        if sol.iter().any(|v| !v.is_finite()) {
            self.valid = false;
            self.observer.non_finite(t);
        }
        sol
    }

    fn max_difference(sol1: &[T], sol2: &[T]) -> T {
        sol1.iter()
            .zip(sol2)
            .fold(T::zero(), |acc, (&a, &b)| acc.max((a - b).abs()))
    }

    /// `(tolerance / error)^(1/order)`, clamped into
    /// `[MIN_FACTOR, MAX_FACTOR]`. Greater than one when the last estimate
    /// beat the tolerance, smaller when it missed.
    fn timestep_factor(&self) -> T {
        let order = T::from_u32(self.tableau.order()).unwrap();
        let factor = (self.tolerance / self.error.max(T::epsilon())).powf(T::one() / order);
        factor
            .max(T::from_f64(MIN_FACTOR).unwrap())
            .min(T::from_f64(MAX_FACTOR).unwrap())
    }

    /// The step floor is reached when the next candidate step would not stay
    /// above `min_dt`; the adaptive loops then accept the current trial,
    /// which bounds the number of shrink iterations.
    fn dt_too_small(&self, dt: T) -> bool {
        dt * self.timestep_factor() <= self.min_dt
    }

    fn assert_dt_bounds(&self, dt: T) {
        if self.limited_timestep {
            assert!(
                dt >= self.min_dt && dt <= self.max_dt,
                "timestep {:?} is outside the configured limits [{:?}, {:?}]; \
                 change the timestep, adjust the limits, or disable them",
                dt,
                self.min_dt,
                self.max_dt
            );
        }
    }

    pub fn tableau(&self) -> &ButcherTableau<T> {
        &self.tableau
    }

    /// Replaces the tableau and re-derives the state's k-vectors for the
    /// new stage count.
    pub fn set_tableau(&mut self, tableau: ButcherTableau<T>) {
        self.state.set_stage_count(tableau.stages());
        let n = self.state.vars.len();
        self.state.resize(n);
        self.tableau = tableau;
    }

    pub fn state(&self) -> &IntegratorState<T> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut IntegratorState<T> {
        &mut self.state
    }

    pub fn tolerance(&self) -> T {
        self.tolerance
    }

    pub fn set_tolerance(&mut self, tolerance: T) {
        assert!(
            tolerance > T::zero(),
            "tolerance must be positive, got {tolerance:?}"
        );
        self.tolerance = tolerance;
    }

    pub fn min_dt(&self) -> T {
        self.min_dt
    }

    pub fn max_dt(&self) -> T {
        self.max_dt
    }

    pub fn set_step_limits(&mut self, min_dt: T, max_dt: T) {
        assert!(
            min_dt > T::zero() && min_dt <= max_dt,
            "step limits must satisfy 0 < min_dt <= max_dt, got [{min_dt:?}, {max_dt:?}]"
        );
        self.min_dt = min_dt;
        self.max_dt = max_dt;
    }

    /// Local error estimated by the most recent adaptive trial, or by the
    /// embedded diagnostic of a fixed step.
    pub fn error(&self) -> T {
        self.error
    }

    /// Whether the most recent step produced only finite values.
    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn reversed(&self) -> bool {
        self.reversed
    }

    /// When set, steps advance with decreasing time.
    pub fn set_reversed(&mut self, reversed: bool) {
        self.reversed = reversed;
    }

    pub fn limited_timestep(&self) -> bool {
        self.limited_timestep
    }

    /// When cleared, the step limits are not enforced against caller-passed
    /// step sizes.
    pub fn set_limited_timestep(&mut self, limited_timestep: bool) {
        self.limited_timestep = limited_timestep;
    }

    pub fn set_observer(&mut self, observer: Box<dyn StepObserver<T>>) {
        self.observer = observer;
    }
}

impl<T: Scalar + Serialize> Serialize for Integrator<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut record = serializer.serialize_struct("Integrator", 8)?;
        record.serialize_field("Tableau", &self.tableau)?;
        record.serialize_field("State", &self.state)?;
        record.serialize_field("Tolerance", &self.tolerance)?;
        record.serialize_field("MinDt", &self.min_dt)?;
        record.serialize_field("MaxDt", &self.max_dt)?;
        record.serialize_field("Error", &self.error)?;
        record.serialize_field("Reversed", &self.reversed)?;
        record.serialize_field("LimitedTimestep", &self.limited_timestep)?;
        record.end()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IntegratorRecord<T: Scalar> {
    tableau: ButcherTableau<T>,
    state: IntegratorState<T>,
    tolerance: T,
    min_dt: T,
    max_dt: T,
    error: T,
    reversed: bool,
    limited_timestep: bool,
}

impl<'de, T> Deserialize<'de> for Integrator<T>
where
    T: Scalar + Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let record = IntegratorRecord::<T>::deserialize(deserializer)?;
        let mut integrator = Integrator::new(record.tableau, record.state.vars);
        integrator.tolerance = record.tolerance;
        integrator.min_dt = record.min_dt;
        integrator.max_dt = record.max_dt;
        integrator.error = record.error;
        integrator.reversed = record.reversed;
        integrator.limited_timestep = record.limited_timestep;
        Ok(integrator)
    }
}

#[cfg(test)]
mod tests {
    use super::Integrator;
    use crate::tableau::ButcherTableau;
    use crate::traits::{Scalar, StepObserver};
    use approx::assert_abs_diff_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn growth<T: Scalar>(_t: T, y: &[T], dydt: &mut [T]) {
        dydt[0] = y[0];
    }

    fn decay<T: Scalar>(_t: T, y: &[T], dydt: &mut [T]) {
        dydt[0] = -y[0];
    }

    #[derive(Default)]
    struct Counts {
        taken: usize,
        rejected: usize,
        non_finite: usize,
        embedded_unused: usize,
    }

    struct CountingObserver {
        counts: Rc<RefCell<Counts>>,
    }

    impl StepObserver<f64> for CountingObserver {
        fn step_taken(&mut self, _t: f64, _dt: f64, _error: f64) {
            self.counts.borrow_mut().taken += 1;
        }

        fn step_rejected(&mut self, _t: f64, _dt: f64, _error: f64) {
            self.counts.borrow_mut().rejected += 1;
        }

        fn non_finite(&mut self, _t: f64) {
            self.counts.borrow_mut().non_finite += 1;
        }

        fn embedded_unused(&mut self) {
            self.counts.borrow_mut().embedded_unused += 1;
        }
    }

    #[test]
    fn euler_step_is_exact() {
        let mut integrator = Integrator::new(ButcherTableau::rk1(), vec![1.0_f64]);
        let mut system = growth::<f64>;
        let mut t = 0.0;
        assert!(integrator.fixed_step(&mut system, &mut t, 0.1));
        assert_eq!(integrator.state().vars(), &[1.0 + 0.1 * 1.0]);
        assert_eq!(t, 0.1);
    }

    #[test]
    fn rk4_tracks_exponential_decay() {
        let mut integrator = Integrator::new(ButcherTableau::rk4(), vec![1.0_f64]);
        let mut system = decay::<f64>;
        let mut t = 0.0;
        for _ in 0..100 {
            assert!(integrator.fixed_step(&mut system, &mut t, 0.01));
        }
        assert_abs_diff_eq!(t, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(integrator.state().vars()[0], (-1.0_f64).exp(), epsilon = 1e-6);
    }

    #[test]
    fn rk38_matches_rk4_closely() {
        let mut a = Integrator::new(ButcherTableau::rk4(), vec![1.0_f64]);
        let mut b = Integrator::new(ButcherTableau::rk38(), vec![1.0_f64]);
        let mut system = decay::<f64>;
        let (mut ta, mut tb) = (0.0, 0.0);
        for _ in 0..50 {
            a.fixed_step(&mut system, &mut ta, 0.02);
            b.fixed_step(&mut system, &mut tb, 0.02);
        }
        assert_abs_diff_eq!(a.state().vars()[0], b.state().vars()[0], epsilon = 1e-9);
    }

    #[test]
    fn generic_scalar_instantiates_at_f32() {
        let mut integrator = Integrator::new(ButcherTableau::<f32>::rk4(), vec![1.0_f32]);
        let mut system = decay::<f32>;
        let mut t = 0.0_f32;
        for _ in 0..10 {
            assert!(integrator.fixed_step(&mut system, &mut t, 0.1));
        }
        assert_abs_diff_eq!(integrator.state().vars()[0], (-1.0_f32).exp(), epsilon = 1e-4);
    }

    #[test]
    fn reversed_integration_runs_time_backwards() {
        let mut integrator = Integrator::new(ButcherTableau::rk4(), vec![(-1.0_f64).exp()]);
        integrator.set_reversed(true);
        let mut system = decay::<f64>;
        let mut t = 1.0;
        for _ in 0..100 {
            assert!(integrator.fixed_step(&mut system, &mut t, 0.01));
        }
        assert_abs_diff_eq!(t, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(integrator.state().vars()[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn fixed_step_with_embedded_tableau_refreshes_the_error_diagnostic() {
        let mut integrator = Integrator::new(ButcherTableau::rkf45(), vec![1.0_f64]);
        let mut system = decay::<f64>;
        let mut t = 0.0;
        assert!(integrator.fixed_step(&mut system, &mut t, 0.1));
        // The second solution only feeds the diagnostic; the step itself is
        // the plain primary-weight step.
        assert!(integrator.error() > 0.0);
        assert!(integrator.error() < 1e-6);
        assert_abs_diff_eq!(integrator.state().vars()[0], (-0.1_f64).exp(), epsilon = 1e-8);
    }

    #[test]
    fn non_finite_derivative_invalidates_the_step() {
        let mut integrator = Integrator::new(ButcherTableau::rk4(), vec![1.0_f64]);
        let mut system = |_t: f64, _y: &[f64], dydt: &mut [f64]| dydt[0] = f64::NAN;
        let mut t = 0.0;
        assert!(!integrator.fixed_step(&mut system, &mut t, 0.1));
        assert!(!integrator.valid());
        // Validity is re-evaluated per call, not latched forever.
        let mut system = decay::<f64>;
        integrator.state_mut().set_vars(vec![1.0]);
        assert!(integrator.fixed_step(&mut system, &mut t, 0.1));
        assert!(integrator.valid());
    }

    #[test]
    fn embedded_step_terminates_on_non_finite_trials() {
        let mut integrator = Integrator::new(ButcherTableau::rkf45(), vec![1.0_f64]);
        let mut system = |_t: f64, _y: &[f64], dydt: &mut [f64]| dydt[0] = f64::INFINITY;
        let mut t = 0.0;
        let mut dt = 0.1;
        assert!(!integrator.embedded_step(&mut system, &mut t, &mut dt));
        assert!(!integrator.valid());
    }

    #[test]
    fn embedded_step_converges_on_decay() {
        let mut integrator = Integrator::new(ButcherTableau::rkf45(), vec![1.0_f64])
            .with_tolerance(1e-6)
            .with_step_limits(1e-6, 0.5);
        let mut system = decay::<f64>;
        let mut t = 0.0;
        let mut dt = 0.1;
        while t < 1.0 {
            assert!(integrator.embedded_step(&mut system, &mut t, &mut dt));
        }
        assert_abs_diff_eq!(integrator.state().vars()[0], (-t).exp(), epsilon = 1e-3);
        assert!(integrator.error() >= integrator.tolerance() / 256.0);
    }

    #[test]
    fn reiterative_step_converges_on_decay() {
        let mut integrator = Integrator::new(ButcherTableau::rk4(), vec![1.0_f64])
            .with_tolerance(1e-6)
            .with_step_limits(1e-6, 0.5);
        let mut system = decay::<f64>;
        let mut t = 0.0;
        let mut dt = 0.1;
        while t < 1.0 {
            assert!(integrator.reiterative_step(&mut system, &mut t, &mut dt, 2));
        }
        assert_abs_diff_eq!(integrator.state().vars()[0], (-t).exp(), epsilon = 1e-3);
    }

    #[test]
    fn adaptive_policies_agree_from_the_same_state() {
        let mut embedded = Integrator::new(ButcherTableau::rkf45(), vec![1.0_f64])
            .with_tolerance(1e-6)
            .with_step_limits(1e-6, 0.5);
        let mut reiterative = Integrator::new(ButcherTableau::rkf45(), vec![1.0_f64])
            .with_tolerance(1e-6)
            .with_step_limits(1e-6, 0.5);
        let mut system = decay::<f64>;

        let mut te = 0.0;
        let mut dte = 0.02;
        assert!(embedded.embedded_step(&mut system, &mut te, &mut dte));

        let mut tr = 0.0;
        let mut dtr = 0.02;
        assert!(reiterative.reiterative_step(&mut system, &mut tr, &mut dtr, 2));

        // Both accept the first trial at this step size, so they cover the
        // same span and must land within a few tolerances of each other.
        assert_eq!(te, tr);
        assert_abs_diff_eq!(
            embedded.state().vars()[0],
            reiterative.state().vars()[0],
            epsilon = 1e-5
        );
    }

    #[test]
    fn shrink_loop_reaches_the_floor_in_bounded_iterations() {
        let counts = Rc::new(RefCell::new(Counts::default()));
        let mut integrator = Integrator::new(ButcherTableau::rkf45(), vec![1.0_f64])
            .with_tolerance(1e-12)
            .with_step_limits(1e-2, 1.0)
            .with_observer(Box::new(CountingObserver {
                counts: Rc::clone(&counts),
            }));
        let mut system = |_t: f64, y: &[f64], dydt: &mut [f64]| dydt[0] = 25.0 * y[0];
        let mut t = 0.0;
        let mut dt = 1.0;
        assert!(integrator.embedded_step(&mut system, &mut t, &mut dt));

        // The factor clamp shrinks dt at most tenfold per rejection, so the
        // rejection count is bounded by log10(max_dt / min_dt) plus slack.
        let counts = counts.borrow();
        assert_eq!(counts.taken, 1);
        assert!(counts.rejected <= 5, "rejected {} trials", counts.rejected);
        assert_eq!(dt, integrator.min_dt());
        assert!(integrator.error() >= integrator.tolerance() / 256.0);
    }

    #[test]
    fn reiterative_step_flags_an_unused_embedded_pair() {
        let counts = Rc::new(RefCell::new(Counts::default()));
        let mut integrator = Integrator::new(ButcherTableau::rkf45(), vec![1.0_f64])
            .with_tolerance(1e-4)
            .with_observer(Box::new(CountingObserver {
                counts: Rc::clone(&counts),
            }));
        let mut system = decay::<f64>;
        let mut t = 0.0;
        let mut dt = 0.1;
        assert!(integrator.reiterative_step(&mut system, &mut t, &mut dt, 2));
        assert_eq!(counts.borrow().embedded_unused, 1);
        assert_eq!(counts.borrow().taken, 1);
    }

    #[test]
    #[should_panic(expected = "outside the configured limits")]
    fn fixed_step_rejects_an_out_of_bounds_timestep() {
        let mut integrator = Integrator::new(ButcherTableau::rk4(), vec![1.0_f64]);
        let mut system = decay::<f64>;
        let mut t = 0.0;
        integrator.fixed_step(&mut system, &mut t, 2.0);
    }

    #[test]
    fn unlimited_timestep_skips_the_bounds_check() {
        let mut integrator = Integrator::new(ButcherTableau::rk4(), vec![1.0_f64]);
        integrator.set_limited_timestep(false);
        let mut system = decay::<f64>;
        let mut t = 0.0;
        assert!(integrator.fixed_step(&mut system, &mut t, 2.0));
        assert_eq!(t, 2.0);
    }

    #[test]
    #[should_panic(expected = "at least two sub-steps")]
    fn reiterative_step_rejects_a_single_sub_step() {
        let mut integrator = Integrator::new(ButcherTableau::rk4(), vec![1.0_f64]);
        let mut system = decay::<f64>;
        let mut t = 0.0;
        let mut dt = 0.1;
        integrator.reiterative_step(&mut system, &mut t, &mut dt, 1);
    }

    #[test]
    #[should_panic(expected = "embedded stepping requires")]
    fn embedded_step_rejects_a_plain_tableau() {
        let mut integrator = Integrator::new(ButcherTableau::rk4(), vec![1.0_f64]);
        let mut system = decay::<f64>;
        let mut t = 0.0;
        let mut dt = 0.1;
        integrator.embedded_step(&mut system, &mut t, &mut dt);
    }

    #[test]
    #[should_panic(expected = "step limits")]
    fn zero_min_dt_is_rejected() {
        let _ = Integrator::new(ButcherTableau::<f64>::rk4(), vec![1.0]).with_step_limits(0.0, 1.0);
    }

    #[test]
    #[should_panic(expected = "tolerance must be positive")]
    fn zero_tolerance_is_rejected() {
        let _ = Integrator::new(ButcherTableau::<f64>::rk4(), vec![1.0]).with_tolerance(0.0);
    }

    #[test]
    fn replacing_the_tableau_rederives_the_stage_buffers() {
        let mut integrator = Integrator::new(ButcherTableau::rk4(), vec![1.0_f64, 2.0]);
        integrator.set_tableau(ButcherTableau::rkf78());
        assert_eq!(integrator.state().kvec.len(), 13);
        assert!(integrator.state().kvec.iter().all(|k| k.len() == 2));

        let mut system = |_t: f64, y: &[f64], dydt: &mut [f64]| {
            dydt[0] = -y[0];
            dydt[1] = -y[1];
        };
        let mut t = 0.0;
        assert!(integrator.fixed_step(&mut system, &mut t, 0.1));
        assert_abs_diff_eq!(integrator.state().vars()[0], (-0.1_f64).exp(), epsilon = 1e-9);
    }

    #[test]
    fn round_trip_preserves_the_integrator() {
        let mut original = Integrator::new(ButcherTableau::rkf45(), vec![1.0_f64, -0.5])
            .with_tolerance(1e-5)
            .with_step_limits(1e-7, 0.25);
        original.set_reversed(false);
        let mut system = |_t: f64, y: &[f64], dydt: &mut [f64]| {
            dydt[0] = -y[0];
            dydt[1] = y[0] - y[1];
        };
        let mut t = 0.0;
        let mut dt = 0.1;
        assert!(original.embedded_step(&mut system, &mut t, &mut dt));

        let encoded = serde_json::to_value(&original).unwrap();
        let mut decoded: Integrator<f64> = serde_json::from_value(encoded.clone()).unwrap();
        assert_eq!(serde_json::to_value(&decoded).unwrap(), encoded);
        assert_eq!(decoded.state().vars(), original.state().vars());
        assert_eq!(decoded.tolerance(), original.tolerance());
        assert_eq!(decoded.error(), original.error());

        // The decoded engine steps identically to the live one.
        let (mut t1, mut dt1) = (t, dt);
        let (mut t2, mut dt2) = (t, dt);
        assert!(original.embedded_step(&mut system, &mut t1, &mut dt1));
        assert!(decoded.embedded_step(&mut system, &mut t2, &mut dt2));
        assert_eq!(t1, t2);
        assert_eq!(original.state().vars(), decoded.state().vars());
    }
}
