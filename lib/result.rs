//! Containers for the output of a run and of a gradient computation.

use std::time::{ Duration, Instant };
use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::{
    config::{ Method, Options },
    error::{ Error, Result },
};

/// Step counters for a single run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of accepted steps.
    pub steps: usize,
    /// Number of rejected steps (adaptive methods only).
    pub rejected: usize,
}

/// Derivatives of the saved data with respect to each parameter, computed
/// with [`GradientAlg::Forward`][crate::config::GradientAlg::Forward].
#[derive(Clone, Debug)]
pub struct Sensitivities {
    /// Parameter names, in the order they were given.
    pub names: Vec<String>,
    /// `∂states/∂p`, one array per parameter, shaped like
    /// [`SolveResult::states`].
    pub states: Vec<nd::Array4<C64>>,
    /// `∂expects/∂p`, one array per parameter, shaped like
    /// [`SolveResult::expects`].
    pub expects: Vec<nd::Array3<C64>>,
}

impl Sensitivities {
    fn index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// `∂states/∂p` for the parameter called `name`.
    pub fn states(&self, name: &str) -> Option<&nd::Array4<C64>> {
        self.index(name).map(|k| &self.states[k])
    }

    /// `∂expects/∂p` for the parameter called `name`.
    pub fn expects(&self, name: &str) -> Option<&nd::Array3<C64>> {
        self.index(name).map(|k| &self.expects[k])
    }
}

/// Output of a forward run.
///
/// Arrays are stored with a single flat batch axis of length `B`; the logical
/// batch shape is kept in `batch_shape` and applied by [`Self::states_dyn`] and
/// [`Self::expects_dyn`].
#[derive(Clone, Debug)]
pub struct SolveResult {
    /// Save times.
    pub tsave: nd::Array1<f64>,
    /// Initial time of the run.
    pub t0: f64,
    /// Saved states, `(B, len(tsave), n, m)`, or `(B, 1, n, m)` holding only
    /// the final state when intermediate states were not kept.
    pub states: nd::Array4<C64>,
    /// Expectation values, `(B, len(exp_ops), len(tsave))`.
    pub expects: nd::Array3<C64>,
    /// Forward-mode derivatives of `states` and `expects`, if requested.
    pub sensitivities: Option<Sensitivities>,
    /// Logical batch shape, with `B` equal to its product.
    pub batch_shape: Vec<usize>,
    /// Whether the states are kets `(n, 1)`.
    pub is_ket: bool,
    pub method: Method,
    pub options: Options,
    pub stats: Stats,
    pub start_time: Instant,
    pub end_time: Instant,
}

impl SolveResult {
    /// Number of members in the flat batch.
    pub fn batch_len(&self) -> usize { self.states.len_of(nd::Axis(0)) }

    /// Whether `states` holds every save time rather than only the last.
    pub fn saved_all(&self) -> bool {
        self.states.len_of(nd::Axis(1)) == self.tsave.len()
    }

    /// State of every batch member at the final save time, `(B, n, m)`.
    pub fn final_state(&self) -> nd::ArrayView3<'_, C64> {
        let last = self.states.len_of(nd::Axis(1)) - 1;
        self.states.index_axis(nd::Axis(1), last)
    }

    /// Expectation values of the `k`-th observable, `(B, len(tsave))`.
    pub fn expect(&self, k: usize) -> nd::ArrayView2<'_, C64> {
        self.expects.index_axis(nd::Axis(1), k)
    }

    /// Saved states reshaped to `(batch..., len(tsave) or 1, n, m)`.
    pub fn states_dyn(&self) -> Result<nd::ArrayD<C64>> {
        let mut shape = self.batch_shape.clone();
        shape.extend_from_slice(&self.states.shape()[1..]);
        self.states.clone().into_shape(nd::IxDyn(&shape))
            .map_err(|e| Error::shape(e.to_string()))
    }

    /// Expectation values reshaped to `(batch..., len(exp_ops), len(tsave))`.
    pub fn expects_dyn(&self) -> Result<nd::ArrayD<C64>> {
        let mut shape = self.batch_shape.clone();
        shape.extend_from_slice(&self.expects.shape()[1..]);
        self.expects.clone().into_shape(nd::IxDyn(&shape))
            .map_err(|e| Error::shape(e.to_string()))
    }

    /// Wall-clock duration of the run.
    pub fn elapsed(&self) -> Duration { self.end_time - self.start_time }
}

/// Output of [`sepropagator`][crate::dynamics::sepropagator].
#[derive(Clone, Debug)]
pub struct PropagatorResult {
    /// Save times.
    pub tsave: nd::Array1<f64>,
    /// Propagators `U(t)` from the initial time, `(b_H, len(tsave), n, n)`,
    /// or `(b_H, 1, n, n)` when only the final one was kept.
    pub propagators: nd::Array4<C64>,
    /// Logical batch shape, empty for an unbatched Hamiltonian.
    pub batch_shape: Vec<usize>,
    pub method: Method,
    pub stats: Stats,
    pub start_time: Instant,
    pub end_time: Instant,
}

impl PropagatorResult {
    /// Propagator of every Hamiltonian at the final save time, `(b_H, n, n)`.
    pub fn final_propagator(&self) -> nd::ArrayView3<'_, C64> {
        let last = self.propagators.len_of(nd::Axis(1)) - 1;
        self.propagators.index_axis(nd::Axis(1), last)
    }

    /// Propagators reshaped to `(batch..., len(tsave) or 1, n, n)`.
    pub fn propagators_dyn(&self) -> Result<nd::ArrayD<C64>> {
        let mut shape = self.batch_shape.clone();
        shape.extend_from_slice(&self.propagators.shape()[1..]);
        self.propagators.clone().into_shape(nd::IxDyn(&shape))
            .map_err(|e| Error::shape(e.to_string()))
    }

    /// Wall-clock duration of the run.
    pub fn elapsed(&self) -> Duration { self.end_time - self.start_time }
}

/// Output of a backward (adjoint) pass.
#[derive(Clone, Debug)]
pub struct Gradients {
    /// `∂L/∂y0`, shaped like the initial state that was supplied: `(n, m)`
    /// or `(b_y, n, m)`.
    pub y0: nd::ArrayD<C64>,
    /// One gradient per parameter, in the order the parameters were given.
    ///
    /// Real parameters carry `∂L/∂p`; complex ones carry
    /// `∂L/∂Re(p) + i ∂L/∂Im(p)`.
    pub params: Vec<(String, C64)>,
    pub stats: Stats,
}

impl Gradients {
    /// Gradient with respect to the parameter called `name`.
    pub fn get(&self, name: &str) -> Option<C64> {
        self.params.iter()
            .find(|(n, _)| n == name)
            .map(|(_, g)| *g)
    }
}
