//! Fixed-step schemes.
//!
//! Every scheme maps the state of one batch member at time `t` to its value at
//! `t + dt` using operators evaluated at `t`. Besides the step itself, each
//! provides its first-order change with respect to the input state and to the
//! operators (used by the forward-sensitivity pass and by the adjoint
//! parameter gradients), and, where available, a backward step that
//! reconstructs `y(t - dt)` and pulls the adjoint variable back through the
//! step.

use ndarray as nd;
use num_complex::Complex64 as C64;
use tracing::warn;
use crate::{
    c,
    config::Method,
    error::{ Error, Result },
    qutils::{
        cholesky_lower,
        cholesky_tangent,
        dag,
        eigh,
        inner,
        inv,
        inv_sqrtm,
        inv_sqrtm_tangent,
        kraus_map,
        kraus_map_tangent,
        trace,
    },
};
use super::model::{ DOps, Ops, rhs, rhs_adjoint, rhs_param };

/// Discretization used by the fixed-step drivers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Scheme {
    Euler,
    Rouchon1,
    Rouchon1Cholesky,
    Rouchon15,
    Rouchon2,
    Expm,
}

impl Scheme {
    /// Fixed-step scheme for a method, or `None` for adaptive methods.
    pub fn from_method(method: &Method) -> Option<Self> {
        match method {
            Method::Euler { .. } => Some(Self::Euler),
            Method::Rouchon1 { cholesky: false, .. } => Some(Self::Rouchon1),
            Method::Rouchon1 { cholesky: true, .. } => Some(Self::Rouchon1Cholesky),
            Method::Rouchon15 { .. } => Some(Self::Rouchon15),
            Method::Rouchon2 { .. } => Some(Self::Rouchon2),
            Method::Expm => Some(Self::Expm),
            Method::Dopri5(_) => None,
        }
    }

    /// Whether [`Self::backward_augmented`] is available.
    pub fn has_backward(&self) -> bool { !matches!(self, Self::Rouchon15) }

    /// Compute `y(t + dt)`.
    pub fn forward(&self, ops: &Ops, dt: f64, y: &nd::ArrayView2<C64>)
        -> Result<nd::Array2<C64>>
    {
        match self {
            Self::Euler => Ok(y + &(rhs(ops, y) * dt)),
            Self::Rouchon1 => {
                let Ms = rouchon1_kraus(ops, dt);
                Ok(normalize(kraus_map(y, &Ms)).0)
            },
            Self::Rouchon1Cholesky => {
                let Ms = rouchon1_kraus(ops, dt);
                let T = cholesky_lower(&kraus_map(&eye_like(ops), &dagged(&Ms)))?;
                let Tinv = inv(&T)?;
                let y_t = dag(&Tinv).dot(y).dot(&Tinv);
                Ok(kraus_map(&y_t, &Ms))
            },
            Self::Rouchon15 => {
                let Ms = rouchon1_kraus(ops, dt);
                let X = inv_sqrtm(&kraus_map(&eye_like(ops), &dagged(&Ms)))?;
                let y_t = X.dot(y).dot(&X);
                Ok(kraus_map(&y_t, &Ms))
            },
            Self::Rouchon2 => {
                let (M0, M1s) = rouchon2_kraus(ops, dt);
                let (K, _) = rouchon2_map(y, &M0, &M1s);
                Ok(normalize(K).0)
            },
            Self::Expm => {
                let U = eigh(&ops.H)?.apply(|l| c!(e -l * dt));
                Ok(U.dot(y))
            },
        }
    }

    /// First-order change of [`Self::forward`] for a change `dy` of the input
    /// state and `dops` of the operators. `None` stands for no change.
    pub fn tangent(
        &self,
        ops: &Ops,
        dt: f64,
        y: &nd::ArrayView2<C64>,
        dy: Option<&nd::ArrayView2<C64>>,
        dops: Option<&DOps>,
    ) -> Result<nd::Array2<C64>>
    {
        let dy: nd::Array2<C64>
            = dy.map(|dy| dy.to_owned())
            .unwrap_or_else(|| nd::Array2::zeros(y.raw_dim()));
        let zero_dops: DOps;
        let dops: &DOps
            = match dops {
                Some(d) => d,
                None => {
                    zero_dops = DOps::from_dH(
                        ops.eq, nd::Array2::zeros(ops.H.raw_dim()), ops.Ls);
                    &zero_dops
                },
            };
        match self {
            Self::Euler => {
                let mut out = rhs(ops, &dy.view()) + rhs_param(ops, dops, y);
                out *= C64::from(dt);
                Ok(out + dy)
            },
            Self::Rouchon1 => {
                let Ms = rouchon1_kraus(ops, dt);
                let dMs = rouchon1_kraus_tangent(dops, dt);
                let dK = kraus_map_tangent(&y.to_owned(), &dy, &Ms, &dMs);
                let (N, c) = normalize(kraus_map(y, &Ms));
                Ok(normalize_tangent(&N, c, dK))
            },
            Self::Rouchon1Cholesky => {
                let Ms = rouchon1_kraus(ops, dt);
                let dMs = rouchon1_kraus_tangent(dops, dt);
                let S = kraus_map(&eye_like(ops), &dagged(&Ms));
                let dS = normal_matrix_tangent(&Ms, &dMs);
                let T = cholesky_lower(&S)?;
                let Tinv = inv(&T)?;
                let dT = cholesky_tangent(&T, &Tinv, &dS);
                let dTinv = -Tinv.dot(&dT).dot(&Tinv);
                let Tinv_dag = dag(&Tinv);
                let y_t = Tinv_dag.dot(y).dot(&Tinv);
                let dy_t
                    = dag(&dTinv).dot(y).dot(&Tinv)
                    + Tinv_dag.dot(&dy).dot(&Tinv)
                    + Tinv_dag.dot(y).dot(&dTinv);
                Ok(kraus_map_tangent(&y_t, &dy_t, &Ms, &dMs))
            },
            Self::Rouchon15 => {
                let Ms = rouchon1_kraus(ops, dt);
                let dMs = rouchon1_kraus_tangent(dops, dt);
                let S = kraus_map(&eye_like(ops), &dagged(&Ms));
                let dS = normal_matrix_tangent(&Ms, &dMs);
                let (X, dX) = inv_sqrtm_tangent(&S, &dS)?;
                let y_t = X.dot(y).dot(&X);
                let dy_t
                    = dX.dot(y).dot(&X)
                    + X.dot(&dy).dot(&X)
                    + X.dot(y).dot(&dX);
                Ok(kraus_map_tangent(&y_t, &dy_t, &Ms, &dMs))
            },
            Self::Rouchon2 => {
                let (M0, M1s) = rouchon2_kraus(ops, dt);
                let (dM0, dM1s) = rouchon2_kraus_tangent(ops, dops, dt, &M0);
                let y = y.to_owned();
                let tmp = kraus_map(&y, &M1s);
                let dtmp = kraus_map_tangent(&y, &dy, &M1s, &dM1s);
                let K
                    = kraus_map(&y, std::slice::from_ref(&M0))
                    + &tmp
                    + kraus_map(&tmp, &M1s) * 0.5;
                let dK
                    = kraus_map_tangent(
                        &y, &dy,
                        std::slice::from_ref(&M0), std::slice::from_ref(&dM0),
                    )
                    + &dtmp
                    + kraus_map_tangent(&tmp, &dtmp, &M1s, &dM1s) * 0.5;
                let (N, c) = normalize(K);
                Ok(normalize_tangent(&N, c, dK))
            },
            Self::Expm => {
                let eig = eigh(&ops.H)?;
                let U = eig.apply(|l| c!(e -l * dt));
                let dU = eig.apply_tangent(
                    &dops.dH,
                    |l| c!(e -l * dt),
                    |l| c!(e -l * dt) * c!(i -dt),
                );
                Ok(dU.dot(y) + U.dot(&dy))
            },
        }
    }

    /// Reconstruct `y(t - dt)` from `y(t)` and compute the adjoint `a(t - dt)`
    /// of the step from `t - dt` to `t`, given `a(t)`. `ops` are the operators
    /// at `t - dt`.
    pub fn backward_augmented(
        &self,
        ops: &Ops,
        dt: f64,
        y: &nd::ArrayView2<C64>,
        a: &nd::ArrayView2<C64>,
    ) -> Result<(nd::Array2<C64>, nd::Array2<C64>)>
    {
        match self {
            Self::Euler => {
                let y_prev = y - &(rhs(ops, y) * dt);
                let a_prev = a + &(rhs_adjoint(ops, a) * dt);
                Ok((y_prev, a_prev))
            },
            Self::Rouchon1 => {
                let Ms = rouchon1_kraus(ops, dt);
                let M0rev = rouchon1_rev(ops, dt);
                let y_rev
                    = kraus_map(y, std::slice::from_ref(&M0rev))
                    - kraus_map(y, &Ms[1..]);
                let (y_prev, _) = normalize(y_rev);
                // exact linearization of the normalized map at y(t - dt)
                let (N, c) = normalize(kraus_map(&y_prev, &Ms));
                let Mdags = dagged(&Ms);
                let Ka = kraus_map(a, &Mdags);
                let KI = kraus_map(&eye_like(ops), &Mdags);
                let a_prev = (Ka - KI * inner(a, &N).re) / c;
                Ok((y_prev, a_prev))
            },
            Self::Rouchon1Cholesky => {
                let Ms = rouchon1_kraus(ops, dt);
                let M0rev = rouchon1_rev(ops, dt);
                let Srev
                    = dag(&M0rev).dot(&M0rev) - ops.LdagL * C64::from(dt);
                let Trev = cholesky_lower(&Srev)?;
                let Trev_inv = inv(&Trev)?;
                let y_t = dag(&Trev_inv).dot(y).dot(&Trev_inv);
                let y_prev
                    = kraus_map(&y_t, std::slice::from_ref(&M0rev))
                    - kraus_map(&y_t, &Ms[1..]);
                let T = cholesky_lower(&kraus_map(&eye_like(ops), &dagged(&Ms)))?;
                let Tinv = inv(&T)?;
                let a_prev = Tinv.dot(&kraus_map(a, &dagged(&Ms))).dot(&dag(&Tinv));
                Ok((y_prev, a_prev))
            },
            Self::Rouchon15 => Err(Error::NotImplemented(
                "backward pass of the Rouchon 1.5 scheme".into())),
            Self::Rouchon2 => {
                let (M0, M1s) = rouchon2_kraus(ops, dt);
                let (M0rev, M1revs) = rouchon2_rev_kraus(ops, dt);
                let tmp = kraus_map(y, &M1revs);
                let y_rev
                    = kraus_map(y, std::slice::from_ref(&M0rev))
                    - &tmp
                    + kraus_map(&tmp, &M1revs) * 0.5;
                let (y_prev, _) = normalize(y_rev);
                let (K, _) = rouchon2_map(&y_prev.view(), &M0, &M1s);
                let (N, c) = normalize(K);
                let M0dag = dag(&M0);
                let M1dags = dagged(&M1s);
                let adj = |x: &nd::Array2<C64>| {
                    let tmp = kraus_map(x, &M1dags);
                    kraus_map(x, std::slice::from_ref(&M0dag))
                        + &tmp
                        + kraus_map(&tmp, &M1dags) * 0.5
                };
                let Ka = adj(&a.to_owned());
                let KI = adj(&eye_like(ops));
                let a_prev = (Ka - KI * inner(a, &N).re) / c;
                Ok((y_prev, a_prev))
            },
            Self::Expm => {
                let U = eigh(&ops.H)?.apply(|l| c!(e -l * dt));
                let Udag = dag(&U);
                Ok((Udag.dot(y), Udag.dot(a)))
            },
        }
    }
}

fn eye_like(ops: &Ops) -> nd::Array2<C64> { nd::Array2::eye(ops.dim()) }

fn dagged(Ms: &[nd::Array2<C64>]) -> Vec<nd::Array2<C64>> {
    Ms.iter().map(dag).collect()
}

// divide by the real part of the trace, returning the trace
fn normalize(K: nd::Array2<C64>) -> (nd::Array2<C64>, f64) {
    let c = trace(&K).re;
    if c <= 0.0 {
        warn!("non-positive trace {c:.3e} in a Rouchon step; decrease `dt`");
    }
    (K / c, c)
}

// first-order change of K / Re tr K, given N = K / c and dK
fn normalize_tangent(N: &nd::Array2<C64>, c: f64, dK: nd::Array2<C64>)
    -> nd::Array2<C64>
{
    let dc = trace(&dK).re;
    (dK - N * dc) / c
}

// `Σ (dM† M + M† dM)`, the change of `Σ M† M`
fn normal_matrix_tangent(Ms: &[nd::Array2<C64>], dMs: &[nd::Array2<C64>])
    -> nd::Array2<C64>
{
    let n = Ms[0].nrows();
    let mut acc: nd::Array2<C64> = nd::Array2::zeros((n, n));
    for (M, dM) in Ms.iter().zip(dMs) {
        acc += &dag(dM).dot(M);
        acc += &dag(M).dot(dM);
    }
    acc
}

// [M0, M1_1, ..., M1_k] with M0 = I - i dt H_nh, M1_k = √dt L_k
fn rouchon1_kraus(ops: &Ops, dt: f64) -> Vec<nd::Array2<C64>> {
    let M0 = eye_like(ops) - &ops.Hnh * c!(i dt);
    let sqrt_dt = dt.sqrt();
    std::iter::once(M0)
        .chain(ops.Ls.iter().map(|L| L * sqrt_dt))
        .collect()
}

fn rouchon1_kraus_tangent(dops: &DOps, dt: f64) -> Vec<nd::Array2<C64>> {
    let dM0 = &dops.dHnh * c!(i -dt);
    let sqrt_dt = dt.sqrt();
    std::iter::once(dM0)
        .chain(dops.dLs.iter().map(|dL| dL * sqrt_dt))
        .collect()
}

fn rouchon1_rev(ops: &Ops, dt: f64) -> nd::Array2<C64> {
    eye_like(ops) + &ops.Hnh * c!(i dt)
}

fn rouchon2_kraus(ops: &Ops, dt: f64) -> (nd::Array2<C64>, Vec<nd::Array2<C64>>) {
    let Hnh2 = ops.Hnh.dot(&ops.Hnh);
    let M0
        = eye_like(ops)
        - &ops.Hnh * c!(i dt)
        - Hnh2 * (0.5 * dt * dt);
    let M1s = rouchon2_jumps(ops, &M0, dt);
    (M0, M1s)
}

// M1_k = √dt (L_k M0 + M0 L_k) / 2
fn rouchon2_jumps(ops: &Ops, M0: &nd::Array2<C64>, dt: f64) -> Vec<nd::Array2<C64>> {
    let pref = 0.5 * dt.sqrt();
    ops.Ls.iter()
        .map(|L| (L.dot(M0) + M0.dot(L)) * pref)
        .collect()
}

fn rouchon2_kraus_tangent(ops: &Ops, dops: &DOps, dt: f64, M0: &nd::Array2<C64>)
    -> (nd::Array2<C64>, Vec<nd::Array2<C64>>)
{
    let dHnh2 = dops.dHnh.dot(&ops.Hnh) + ops.Hnh.dot(&dops.dHnh);
    let dM0 = &dops.dHnh * c!(i -dt) - dHnh2 * (0.5 * dt * dt);
    let pref = 0.5 * dt.sqrt();
    let dM1s: Vec<nd::Array2<C64>>
        = ops.Ls.iter().zip(&dops.dLs)
        .map(|(L, dL)| {
            (dL.dot(M0) + L.dot(&dM0) + dM0.dot(L) + M0.dot(dL)) * pref
        })
        .collect();
    (dM0, dM1s)
}

// reverse-time Kraus operators; the jump terms are built from the reversed M0
fn rouchon2_rev_kraus(ops: &Ops, dt: f64) -> (nd::Array2<C64>, Vec<nd::Array2<C64>>) {
    let Hnh2 = ops.Hnh.dot(&ops.Hnh);
    let M0rev = eye_like(ops) + &ops.Hnh * c!(i dt) - Hnh2 * (0.5 * dt * dt);
    let M1revs = rouchon2_jumps(ops, &M0rev, dt);
    (M0rev, M1revs)
}

// unnormalized order-2 map, returning it and the intermediate jump term
fn rouchon2_map(
    y: &nd::ArrayView2<C64>,
    M0: &nd::Array2<C64>,
    M1s: &[nd::Array2<C64>],
) -> (nd::Array2<C64>, nd::Array2<C64>)
{
    let tmp = kraus_map(y, M1s);
    let K
        = kraus_map(y, std::slice::from_ref(M0))
        + &tmp
        + kraus_map(&tmp, M1s) * 0.5;
    (K, tmp)
}
