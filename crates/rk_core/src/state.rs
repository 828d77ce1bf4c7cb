use crate::traits::Scalar;
use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};

/// Mutable numeric buffers for one integrator: the state vector and one
/// derivative vector per stage of the active tableau.
///
/// Invariant: `kvec.len()` equals the owning tableau's stage count and every
/// k-vector has the same length as `vars`. The owning integrator
/// re-establishes it whenever the tableau is replaced; the vars-mutating
/// operations here re-derive the k-vector lengths themselves.
///
/// Only `vars` is persisted. After decoding, the k-vectors are empty until
/// the owner re-derives them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", bound(deserialize = "T: Scalar + Deserialize<'de>"))]
pub struct IntegratorState<T: Scalar> {
    pub(crate) vars: Vec<T>,
    #[serde(skip)]
    pub(crate) kvec: Vec<Vec<T>>,
}

impl<T: Scalar> IntegratorState<T> {
    pub(crate) fn new(vars: Vec<T>, stages: u32) -> Self {
        let n = vars.len();
        let mut state = Self {
            vars,
            kvec: Vec::new(),
        };
        state.set_stage_count(stages);
        state.resize(n);
        state
    }

    /// Sets the state dimension to `n`, preserving existing values and
    /// zero-filling new slots, then re-derives every k-vector's length.
    pub fn resize(&mut self, n: usize) {
        self.vars.resize(n, T::zero());
        self.sync_kvec();
    }

    /// Re-derives the number of k-vectors. Fresh vectors stay empty until
    /// the next `resize`.
    pub(crate) fn set_stage_count(&mut self, stages: u32) {
        self.kvec.resize(stages as usize, Vec::new());
    }

    pub fn vars(&self) -> &[T] {
        &self.vars
    }

    /// Replaces the state vector wholesale.
    pub fn set_vars(&mut self, vars: Vec<T>) {
        self.vars = vars;
        self.sync_kvec();
    }

    pub fn push(&mut self, value: T) {
        self.vars.push(value);
        self.sync_kvec();
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = T>) {
        self.vars.extend(values);
        self.sync_kvec();
    }

    pub fn reserve(&mut self, capacity: usize) {
        self.vars.reserve(capacity);
    }

    pub fn clear(&mut self) {
        self.vars.clear();
        self.sync_kvec();
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    fn sync_kvec(&mut self) {
        let n = self.vars.len();
        for k in &mut self.kvec {
            k.resize(n, T::zero());
        }
    }
}

impl<T: Scalar> Index<usize> for IntegratorState<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.vars[index]
    }
}

impl<T: Scalar> IndexMut<usize> for IntegratorState<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.vars[index]
    }
}

#[cfg(test)]
mod tests {
    use super::IntegratorState;

    #[test]
    fn construction_derives_kvec_shape() {
        let state = IntegratorState::new(vec![1.0_f64, 2.0], 4);
        assert_eq!(state.len(), 2);
        assert_eq!(state.kvec.len(), 4);
        assert!(state.kvec.iter().all(|k| k.len() == 2));
    }

    #[test]
    fn resize_preserves_values_and_zero_fills() {
        let mut state = IntegratorState::new(vec![1.0_f64, 2.0], 2);
        state.resize(4);
        assert_eq!(state.vars(), &[1.0, 2.0, 0.0, 0.0]);
        assert!(state.kvec.iter().all(|k| k.len() == 4));

        state.resize(1);
        assert_eq!(state.vars(), &[1.0]);
        assert!(state.kvec.iter().all(|k| k.len() == 1));
    }

    #[test]
    fn resize_is_idempotent() {
        let mut state = IntegratorState::new(vec![3.0_f64, 4.0, 5.0], 3);
        state.resize(5);
        let snapshot = state.clone();
        state.resize(5);
        assert_eq!(state, snapshot);
    }

    #[test]
    fn set_vars_rederives_kvec_lengths() {
        let mut state = IntegratorState::new(vec![0.0_f64], 3);
        state.set_vars(vec![1.0, 2.0, 3.0]);
        assert_eq!(state.len(), 3);
        assert!(state.kvec.iter().all(|k| k.len() == 3));
    }

    #[test]
    fn stage_count_changes_leave_new_vectors_empty_until_resize() {
        let mut state = IntegratorState::new(vec![1.0_f64, 2.0], 2);
        state.set_stage_count(4);
        assert_eq!(state.kvec.len(), 4);
        assert_eq!(state.kvec[2].len(), 0);
        state.resize(2);
        assert!(state.kvec.iter().all(|k| k.len() == 2));
    }

    #[test]
    fn push_extend_and_clear_track_the_dimension() {
        let mut state = IntegratorState::new(Vec::new(), 2);
        state.push(1.0_f64);
        state.extend([2.0, 3.0]);
        assert_eq!(state.vars(), &[1.0, 2.0, 3.0]);
        assert!(state.kvec.iter().all(|k| k.len() == 3));

        state.clear();
        assert!(state.is_empty());
        assert!(state.kvec.iter().all(|k| k.is_empty()));
    }

    #[test]
    fn indexed_access_reads_and_writes_vars() {
        let mut state = IntegratorState::new(vec![1.0_f64, 2.0], 1);
        state[1] = 7.5;
        assert_eq!(state[1], 7.5);
    }

    #[test]
    fn only_vars_are_persisted() {
        let state = IntegratorState::new(vec![1.5_f64, -2.5], 3);
        let encoded = serde_json::to_value(&state).unwrap();
        assert_eq!(encoded, serde_json::json!({ "Vars": [1.5, -2.5] }));

        let decoded: IntegratorState<f64> = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.vars(), state.vars());
        assert!(decoded.kvec.is_empty());
    }
}
