//! Problem description, validation, and dispatch to the integration drivers.
//!
//! A [`Problem`] collects a Hamiltonian, optional jump operators, an initial
//! state, save times, observables, and the parameters to differentiate with
//! respect to. [`Problem::solve`] runs the forward integration;
//! [`Problem::backward`] consumes the result of a forward run and computes
//! gradients of a scalar loss with the checkpointed adjoint method.
//!
//! Batches of Hamiltonians and of initial states are flattened into a single
//! batch axis of length `B` before integration; see [`BatchLayout`].

use std::collections::HashSet;
use ndarray as nd;
use num_complex::Complex64 as C64;
use num_traits::Zero;
use crate::{
    config::{ GradientAlg, Method, Options },
    error::{ Error, Result },
    qutils::dag,
    result::{ Gradients, PropagatorResult, SolveResult },
    timeop::TimeOp,
    utils::isclose,
};

pub(crate) mod model;
pub(crate) mod schemes;
pub(crate) mod dopri;
pub(crate) mod forward;
pub(crate) mod adjoint;

use model::{ DOps, Ops };
use schemes::Scheme;

/// Governing equation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Equation {
    /// `dψ/dt = -i H ψ` for kets `(n, 1)`.
    Schrodinger,
    /// `dρ/dt = -i [H, ρ] + Σ (L ρ L† - ½{L†L, ρ})` for density matrices
    /// `(n, n)`.
    Lindblad,
}

/// Initial state, either a single `(n, m)` array or a batch `(b, n, m)`.
#[derive(Clone, Debug)]
pub enum InitialState {
    Single(nd::Array2<C64>),
    Batch(nd::Array3<C64>),
}

impl From<nd::Array2<C64>> for InitialState {
    fn from(y: nd::Array2<C64>) -> Self { Self::Single(y) }
}

impl From<nd::Array3<C64>> for InitialState {
    fn from(y: nd::Array3<C64>) -> Self { Self::Batch(y) }
}

impl InitialState {
    /// Whether a batch axis was supplied.
    pub fn is_batched(&self) -> bool { matches!(self, Self::Batch(_)) }

    /// View as a batch `(b, n, m)`, with `b = 1` for a single state.
    pub fn as_batch(&self) -> nd::ArrayView3<'_, C64> {
        match self {
            Self::Single(y) => y.view().insert_axis(nd::Axis(0)),
            Self::Batch(y) => y.view(),
        }
    }

    /// Shape of the supplied array.
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Single(y) => y.shape(),
            Self::Batch(y) => y.shape(),
        }
    }
}

/// Whether a parameter is real or complex.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParamKind {
    /// Gradients keep only their real part.
    Real,
    /// Gradients are reported as `∂L/∂Re(p) + i ∂L/∂Im(p)` for model data
    /// depending holomorphically on `p`.
    Complex,
}

/// A differentiable parameter, described by the derivatives of the model data
/// with respect to it.
#[derive(Clone, Debug)]
pub struct Param<'a> {
    pub name: String,
    pub kind: ParamKind,
    /// `∂H/∂p`.
    pub dH: Option<TimeOp<'a>>,
    /// `(k, ∂L_k/∂p)` for every jump operator that depends on `p`.
    pub djump_ops: Vec<(usize, nd::Array2<C64>)>,
    /// `∂y0/∂p`, shaped like the initial state.
    pub dy0: Option<InitialState>,
}

impl<'a> Param<'a> {
    fn new(name: String, kind: ParamKind) -> Self {
        Self { name, kind, dH: None, djump_ops: Vec::new(), dy0: None }
    }

    /// A real parameter with no dependencies yet.
    pub fn real<S: Into<String>>(name: S) -> Self {
        Self::new(name.into(), ParamKind::Real)
    }

    /// A complex parameter with no dependencies yet.
    pub fn complex<S: Into<String>>(name: S) -> Self {
        Self::new(name.into(), ParamKind::Complex)
    }

    /// Set `∂H/∂p`.
    pub fn with_dH<O: Into<TimeOp<'a>>>(mut self, dH: O) -> Self {
        self.dH = Some(dH.into());
        self
    }

    /// Set `∂L_k/∂p` for the `k`-th jump operator.
    pub fn with_djump(mut self, k: usize, dL: nd::Array2<C64>) -> Self {
        self.djump_ops.push((k, dL));
        self
    }

    /// Set `∂y0/∂p`.
    pub fn with_dy0<Y: Into<InitialState>>(mut self, dy0: Y) -> Self {
        self.dy0 = Some(dy0.into());
        self
    }
}

/// Derivative of a real scalar loss with respect to the saved outputs of a
/// forward run.
///
/// Expectation-value cotangents `g` follow `dL = Re(conj(g) de)`, so a loss
/// `L = Re(e)` has `g = 1`.
#[derive(Clone, Debug)]
pub struct Cotangent {
    /// `∂L/∂states`, shaped like [`SolveResult::states`].
    pub states: nd::Array4<C64>,
    /// `∂L/∂expects`, shaped like [`SolveResult::expects`].
    pub expects: nd::Array3<C64>,
}

impl Cotangent {
    /// A zero cotangent for the outputs of `result`.
    pub fn zeros(result: &SolveResult) -> Self {
        Self {
            states: nd::Array4::zeros(result.states.raw_dim()),
            expects: nd::Array3::zeros(result.expects.raw_dim()),
        }
    }

    /// Cotangent of `L = Σ_b Re⟨O_k⟩(T)`, the real part of the `k`-th
    /// expectation value at the final save time summed over the batch.
    ///
    /// Fails if the run has no `k`-th observable.
    pub fn final_expect(result: &SolveResult, k: usize) -> Result<Self> {
        let nexp = result.expects.len_of(nd::Axis(1));
        if k >= nexp {
            return Err(Error::shape(format!(
                "observable index {k} out of range for {nexp} observables")));
        }
        let mut ct = Self::zeros(result);
        let last = result.tsave.len() - 1;
        ct.expects.slice_mut(nd::s![.., k, last]).fill(C64::from(1.0));
        Ok(ct)
    }
}

/// Flattening of the Hamiltonian and initial-state batches into one axis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BatchLayout {
    pub b_h: usize,
    pub b_y: usize,
    pub cartesian: bool,
    /// Number of flat batch members.
    pub len: usize,
    /// Logical batch shape reported in results.
    pub batch_shape: Vec<usize>,
}

impl BatchLayout {
    pub fn new(
        b_h: usize,
        h_batched: bool,
        b_y: usize,
        y_batched: bool,
        cartesian: bool,
    ) -> Result<Self>
    {
        if cartesian {
            let mut batch_shape: Vec<usize> = Vec::new();
            if h_batched { batch_shape.push(b_h); }
            if y_batched { batch_shape.push(b_y); }
            Ok(Self { b_h, b_y, cartesian, len: b_h * b_y, batch_shape })
        } else {
            if b_h != b_y && b_h != 1 && b_y != 1 {
                return Err(Error::shape(format!(
                    "flat batching requires equal batch sizes or a batch of \
                    one, but the Hamiltonian has {b_h} and the initial state \
                    {b_y}"
                )));
            }
            let len = b_h.max(b_y);
            let batch_shape
                = if h_batched || y_batched { vec![len] } else { Vec::new() };
            Ok(Self { b_h, b_y, cartesian, len, batch_shape })
        }
    }

    /// Hamiltonian index of flat member `i`.
    pub fn h_idx(&self, i: usize) -> usize {
        if self.cartesian { i / self.b_y }
        else if self.b_h == 1 { 0 }
        else { i }
    }

    /// Initial-state index of flat member `i`.
    pub fn y_idx(&self, i: usize) -> usize {
        if self.cartesian { i % self.b_y }
        else if self.b_y == 1 { 0 }
        else { i }
    }
}

fn expand_batch(layout: &BatchLayout, y: nd::ArrayView3<C64>) -> nd::Array3<C64> {
    let (_, n, m) = y.dim();
    let mut out: nd::Array3<C64> = nd::Array3::zeros((layout.len, n, m));
    out.outer_iter_mut().enumerate()
        .for_each(|(i, mut yi)| {
            yi.assign(&y.index_axis(nd::Axis(0), layout.y_idx(i)));
        });
    out
}

// pick the entry for batch index `k`, broadcasting a batch of one
fn bcast<T>(v: &[T], k: usize) -> &T { &v[if v.len() == 1 { 0 } else { k }] }

/// Everything the drivers need for one run, validated and expanded to the
/// flat batch.
pub(crate) struct Run<'p, 'a> {
    pub eq: Equation,
    pub H: &'p TimeOp<'a>,
    pub Ls: &'p [nd::Array2<C64>],
    pub LdagL: nd::Array2<C64>,
    pub params: &'p [Param<'a>],
    /// Full list of `∂L_k/∂p` for every parameter.
    pub dLs: Vec<Vec<nd::Array2<C64>>>,
    pub exp_ops: &'p [nd::Array2<C64>],
    pub layout: BatchLayout,
    /// Initial state of every flat member, `(B, n, m)`.
    pub y0: nd::Array3<C64>,
    pub y0_supplied: &'p InitialState,
    pub tsave: &'p nd::Array1<f64>,
    pub t0: f64,
    pub method: Method,
    pub options: Options,
    pub scheme: Option<Scheme>,
}

impl<'p, 'a> Run<'p, 'a> {
    /// Batch size `B`.
    pub fn len(&self) -> usize { self.layout.len }

    pub fn is_ket(&self) -> bool { self.eq == Equation::Schrodinger }

    /// Expand an array shaped like the initial state to the flat batch.
    pub fn expand(&self, y: &InitialState) -> nd::Array3<C64> {
        expand_batch(&self.layout, y.as_batch())
    }

    /// Operators at time `t`, one per Hamiltonian batch index.
    pub fn ops_at(&self, t: f64) -> Result<Vec<Ops<'_>>> {
        let H = self.H.eval(t)?;
        Ok(
            H.outer_iter()
                .map(|Hb| Ops::new(self.eq, Hb.to_owned(), self.Ls, &self.LdagL))
                .collect()
        )
    }

    /// Operator derivatives for parameter `p` at time `t`, one per
    /// Hamiltonian batch index (or a single one shared by all).
    pub fn dops_at(&self, t: f64, p: usize) -> Result<Vec<DOps>> {
        let n = self.H.dim();
        let dH: nd::Array3<C64>
            = match &self.params[p].dH {
                Some(op) => op.eval(t)?,
                None => nd::Array3::zeros((1, n, n)),
            };
        Ok(
            dH.outer_iter()
                .map(|dHb| {
                    DOps::new(self.eq, dHb.to_owned(), self.dLs[p].clone(), self.Ls)
                })
                .collect()
        )
    }

    /// Operators for flat member `i`.
    pub fn member_ops<'v, 'o>(&self, ops: &'v [Ops<'o>], i: usize) -> &'v Ops<'o> {
        bcast(ops, self.layout.h_idx(i))
    }

    /// Operator derivatives for flat member `i`.
    pub fn member_dops<'v>(&self, dops: &'v [DOps], i: usize) -> &'v DOps {
        bcast(dops, self.layout.h_idx(i))
    }

    /// Steps `(start, length)` covering `[t0, t1]` for the fixed-step scheme.
    pub fn fixed_grid(&self, t0: f64, t1: f64) -> Vec<(f64, f64)> {
        if !(t1 > t0) { return Vec::new(); }
        match (self.scheme, self.method.dt()) {
            (Some(Scheme::Expm), _) | (_, None) => {
                let mut points: Vec<f64> = vec![t0];
                self.H.discontinuities().into_iter()
                    .chain(
                        self.params.iter()
                            .filter_map(|p| p.dH.as_ref())
                            .flat_map(|op| op.discontinuities())
                    )
                    .filter(|d| *d > t0 && *d < t1 && !isclose(*d, t1))
                    .for_each(|d| crate::utils::insert_sorted_unique(&mut points, d));
                points.push(t1);
                points.windows(2).map(|w| (w[0], w[1] - w[0])).collect()
            },
            (_, Some(dt)) => {
                let nsteps = ((t1 - t0) / dt).round().max(1.0) as usize;
                let h = (t1 - t0) / nsteps as f64;
                (0..nsteps).map(|k| (t0 + k as f64 * h, h)).collect()
            },
        }
    }

    /// Adjoint contribution `Σ_j g_j ∂e_j/∂y` of expectation-value cotangents
    /// `g` (one per observable) for a single member in state `y`.
    pub fn expect_cotangent(&self, g: nd::ArrayView1<C64>, y: nd::ArrayView2<C64>)
        -> nd::Array2<C64>
    {
        let mut a: nd::Array2<C64> = nd::Array2::zeros(y.raw_dim());
        for (O, gj) in self.exp_ops.iter().zip(g) {
            if gj.is_zero() { continue; }
            if self.is_ket() {
                a += &(dag(O).dot(&y) * *gj);
                a += &(O.dot(&y) * gj.conj());
            } else {
                a += &(dag(O) * *gj);
            }
        }
        a
    }
}

/// A simulation to be integrated forward and, optionally, differentiated.
#[derive(Clone, Debug)]
pub struct Problem<'a> {
    equation: Equation,
    H: TimeOp<'a>,
    jump_ops: Vec<nd::Array2<C64>>,
    y0: InitialState,
    tsave: nd::Array1<f64>,
    exp_ops: Vec<nd::Array2<C64>>,
    method: Method,
    options: Options,
    params: Vec<Param<'a>>,
}

impl<'a> Problem<'a> {
    fn new(
        equation: Equation,
        H: TimeOp<'a>,
        jump_ops: Vec<nd::Array2<C64>>,
        y0: InitialState,
        tsave: nd::Array1<f64>,
    ) -> Self
    {
        Self {
            equation,
            H,
            jump_ops,
            y0,
            tsave,
            exp_ops: Vec::new(),
            method: Method::default(),
            options: Options::default(),
            params: Vec::new(),
        }
    }

    /// Schrödinger equation for a ket `(n, 1)` or a batch of kets
    /// `(b, n, 1)`.
    pub fn schrodinger<H, Y, T>(H: H, psi0: Y, tsave: T) -> Self
    where
        H: Into<TimeOp<'a>>,
        Y: Into<InitialState>,
        T: Into<nd::Array1<f64>>,
    {
        Self::new(
            Equation::Schrodinger, H.into(), Vec::new(), psi0.into(), tsave.into())
    }

    /// Lindblad master equation for a density matrix `(n, n)` or a batch
    /// `(b, n, n)`.
    pub fn lindblad<H, Y, T>(
        H: H,
        jump_ops: Vec<nd::Array2<C64>>,
        rho0: Y,
        tsave: T,
    ) -> Self
    where
        H: Into<TimeOp<'a>>,
        Y: Into<InitialState>,
        T: Into<nd::Array1<f64>>,
    {
        Self::new(
            Equation::Lindblad, H.into(), jump_ops, rho0.into(), tsave.into())
    }

    /// Observables whose expectation values are saved.
    pub fn exp_ops(mut self, exp_ops: Vec<nd::Array2<C64>>) -> Self {
        self.exp_ops = exp_ops;
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Parameters to differentiate with respect to.
    pub fn params(mut self, params: Vec<Param<'a>>) -> Self {
        self.params = params;
        self
    }

    pub fn equation(&self) -> Equation { self.equation }

    /// Integrate forward, saving states and expectation values at every save
    /// time.
    pub fn solve(&self) -> Result<SolveResult> {
        let run = self.prepare()?;
        if run.options.gradient == GradientAlg::Adjoint {
            if let Some(scheme) = run.scheme {
                if !scheme.has_backward() {
                    return Err(Error::NotImplemented(format!(
                        "adjoint gradients for method `{}`", run.method.name())));
                }
            }
        }
        forward::run(&run)
    }

    /// Compute gradients of a scalar loss with the checkpointed adjoint
    /// method, given the result of [`Self::solve`] and the derivative of the
    /// loss with respect to the saved outputs.
    pub fn backward(&self, result: &SolveResult, cotangent: &Cotangent)
        -> Result<Gradients>
    {
        let run = self.prepare()?;
        if let Some(scheme) = run.scheme {
            if !scheme.has_backward() {
                return Err(Error::NotImplemented(format!(
                    "adjoint gradients for method `{}`", run.method.name())));
            }
        }
        adjoint::run(&run, result, cotangent)
    }

    fn validate(&self) -> Result<()> {
        let n = self.H.dim();
        let m = match self.equation { Equation::Schrodinger => 1, Equation::Lindblad => n };

        // save times
        if self.tsave.is_empty() {
            return Err(Error::config("`tsave` must not be empty"));
        }
        if self.tsave.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(Error::config("`tsave` must hold finite, non-negative values"));
        }
        if self.tsave.windows(2).into_iter().any(|w| !(w[1] > w[0])) {
            return Err(Error::config("`tsave` must be strictly increasing"));
        }
        let t0 = self.options.t0.unwrap_or(0.0);
        if !t0.is_finite() || t0 > self.tsave[0] {
            return Err(Error::config(format!(
                "initial time {t0} must be finite and not after the first save \
                time {}", self.tsave[0],
            )));
        }

        // states and operators
        let y0_shape = self.y0.shape();
        let trailing = &y0_shape[y0_shape.len() - 2..];
        if trailing != [n, m] {
            let what = match self.equation {
                Equation::Schrodinger => "ket",
                Equation::Lindblad => "density matrix",
            };
            return Err(Error::shape(format!(
                "initial {what} must have trailing shape ({n}, {m}), but has \
                shape {y0_shape:?}"
            )));
        }
        if self.y0.as_batch().len_of(nd::Axis(0)) == 0 {
            return Err(Error::shape("initial state batch must not be empty"));
        }
        if self.equation == Equation::Lindblad && self.jump_ops.is_empty() {
            return Err(Error::config(
                "the Lindblad equation requires at least one jump operator"));
        }
        for (k, L) in self.jump_ops.iter().enumerate() {
            if L.dim() != (n, n) {
                return Err(Error::shape(format!(
                    "jump operator {k} must have shape ({n}, {n}), but has {:?}",
                    L.shape(),
                )));
            }
        }
        for (k, O) in self.exp_ops.iter().enumerate() {
            if O.dim() != (n, n) {
                return Err(Error::shape(format!(
                    "observable {k} must have shape ({n}, {n}), but has {:?}",
                    O.shape(),
                )));
            }
        }

        // method
        self.method.validate()?;
        match (&self.method, self.equation) {
            (method, Equation::Schrodinger) if method.is_rouchon() => {
                return Err(Error::config(format!(
                    "method `{}` integrates the Lindblad equation only",
                    method.name(),
                )));
            },
            (Method::Expm, Equation::Lindblad) => {
                return Err(Error::config(
                    "method `expm` integrates the Schrödinger equation only"));
            },
            (Method::Expm, Equation::Schrodinger) => {
                let all_pwc
                    = self.H.is_pwc()
                    && self.params.iter()
                        .filter_map(|p| p.dH.as_ref())
                        .all(|op| op.is_pwc());
                if !all_pwc {
                    return Err(Error::config(
                        "method `expm` requires a piecewise-constant Hamiltonian"));
                }
            },
            _ => { },
        }
        if let Some(dt) = self.method.dt() {
            for (k, t) in self.tsave.iter().enumerate() {
                let x = (t - t0) / dt;
                if !isclose(x.round(), x) {
                    return Err(Error::NotMultipleOfDt {
                        name: "tsave",
                        index: k,
                        value: *t,
                        dt,
                    });
                }
            }
        }

        // parameters
        let mut names: HashSet<&str> = HashSet::new();
        for p in self.params.iter() {
            if !names.insert(p.name.as_str()) {
                return Err(Error::config(format!(
                    "duplicate parameter name `{}`", p.name)));
            }
            if let Some(dH) = &p.dH {
                if dH.dim() != n || (dH.batch() != 1 && dH.batch() != self.H.batch()) {
                    return Err(Error::shape(format!(
                        "`∂H/∂{}` must have shape (1 or {}, {n}, {n})",
                        p.name, self.H.batch(),
                    )));
                }
            }
            for (k, dL) in p.djump_ops.iter() {
                if *k >= self.jump_ops.len() || dL.dim() != (n, n) {
                    return Err(Error::shape(format!(
                        "`∂L_{k}/∂{}` does not match a jump operator of shape \
                        ({n}, {n})", p.name,
                    )));
                }
            }
            if let Some(dy0) = &p.dy0 {
                if dy0.shape() != y0_shape {
                    return Err(Error::shape(format!(
                        "`∂y0/∂{}` must have shape {y0_shape:?}", p.name)));
                }
            }
        }
        Ok(())
    }

    fn prepare(&self) -> Result<Run<'_, 'a>> {
        self.validate()?;
        let n = self.H.dim();
        let y0_batch = self.y0.as_batch();
        let layout = BatchLayout::new(
            self.H.batch(),
            self.H.batch() > 1,
            y0_batch.len_of(nd::Axis(0)),
            self.y0.is_batched(),
            self.options.cartesian_batching,
        )?;
        let y0 = expand_batch(&layout, y0_batch);
        let LdagL: nd::Array2<C64>
            = self.jump_ops.iter()
            .fold(nd::Array2::zeros((n, n)), |acc, L| acc + dag(L).dot(L));
        let dLs: Vec<Vec<nd::Array2<C64>>>
            = self.params.iter()
            .map(|p| {
                let mut dLs = vec![nd::Array2::zeros((n, n)); self.jump_ops.len()];
                p.djump_ops.iter().for_each(|(k, dL)| { dLs[*k] += dL; });
                dLs
            })
            .collect();
        Ok(Run {
            eq: self.equation,
            H: &self.H,
            Ls: &self.jump_ops,
            LdagL,
            params: &self.params,
            dLs,
            exp_ops: &self.exp_ops,
            layout,
            y0,
            y0_supplied: &self.y0,
            tsave: &self.tsave,
            t0: self.options.t0.unwrap_or(0.0),
            method: self.method,
            options: self.options,
            scheme: Scheme::from_method(&self.method),
        })
    }
}

/// Solve the Schrödinger equation.
pub fn sesolve<'a, H, Y, T>(
    H: H,
    psi0: Y,
    tsave: T,
    exp_ops: Vec<nd::Array2<C64>>,
    method: Method,
    options: Options,
) -> Result<SolveResult>
where
    H: Into<TimeOp<'a>>,
    Y: Into<InitialState>,
    T: Into<nd::Array1<f64>>,
{
    Problem::schrodinger(H, psi0, tsave)
        .exp_ops(exp_ops)
        .method(method)
        .options(options)
        .solve()
}

/// Solve the Lindblad master equation.
pub fn mesolve<'a, H, Y, T>(
    H: H,
    jump_ops: Vec<nd::Array2<C64>>,
    rho0: Y,
    tsave: T,
    exp_ops: Vec<nd::Array2<C64>>,
    method: Method,
    options: Options,
) -> Result<SolveResult>
where
    H: Into<TimeOp<'a>>,
    Y: Into<InitialState>,
    T: Into<nd::Array1<f64>>,
{
    Problem::lindblad(H, jump_ops, rho0, tsave)
        .exp_ops(exp_ops)
        .method(method)
        .options(options)
        .solve()
}

/// Compute the propagator `U(t)` of the Schrödinger equation at every save
/// time, by evolving each basis ket.
///
/// Without a `method`, piecewise-constant Hamiltonians are exponentiated
/// exactly and others use the default adaptive method. A batched Hamiltonian
/// gives one propagator per batch member.
pub fn sepropagator<'a, H, T>(
    H: H,
    tsave: T,
    method: Option<Method>,
    options: Options,
) -> Result<PropagatorResult>
where
    H: Into<TimeOp<'a>>,
    T: Into<nd::Array1<f64>>,
{
    let H: TimeOp<'a> = H.into();
    let n = H.dim();
    let h_batched = H.batch() > 1;
    let method
        = method.unwrap_or_else(|| {
            if H.is_pwc() { Method::Expm } else { Method::default() }
        });
    let basis: nd::Array3<C64>
        = nd::Array3::from_shape_fn(
            (n, n, 1),
            |(j, k, _)| if j == k { C64::from(1.0) } else { C64::zero() },
        );
    let result
        = Problem::schrodinger(H, basis, tsave)
        .method(method)
        .options(options.cartesian_batching(true).gradient(GradientAlg::None))
        .solve()?;

    // member `h n + j` carries column `j` of the `h`-th propagator
    let (B, nslots, _, _) = result.states.dim();
    let mut propagators: nd::Array4<C64> = nd::Array4::zeros((B / n, nslots, n, n));
    for (i, psi) in result.states.outer_iter().enumerate() {
        propagators.index_axis_mut(nd::Axis(0), i / n)
            .slice_mut(nd::s![.., .., i % n])
            .assign(&psi.index_axis(nd::Axis(2), 0));
    }
    Ok(PropagatorResult {
        tsave: result.tsave,
        propagators,
        batch_shape: if h_batched { vec![B / n] } else { Vec::new() },
        method: result.method,
        stats: result.stats,
        start_time: result.start_time,
        end_time: result.end_time,
    })
}
