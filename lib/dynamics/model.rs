//! Right-hand sides of the Schrödinger and Lindblad equations for a single
//! batch member, together with their adjoints and parameter derivatives.
//!
//! With `H_nh = H - ½i ΣL†L`, the Lindblad right-hand side is
//! ```text
//! f(ρ) = -i (H_nh ρ - ρ H_nh†) + Σ L ρ L†
//! ```
//! and its adjoint with respect to `⟨a, x⟩ = Re tr(a† x)` is
//! ```text
//! f†(a) = i (H_nh† a - a H_nh) + Σ L† a L
//! ```
//! For kets, `f(ψ) = -i H ψ` and `f†(a) = i H† a`.

use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::{
    c,
    qutils::dag,
};
use super::Equation;

/// Operators of the equation at one instant for one batch member.
#[derive(Clone, Debug)]
pub(crate) struct Ops<'o> {
    pub eq: Equation,
    pub H: nd::Array2<C64>,
    /// `H - ½i ΣL†L`, or `H` for the Schrödinger equation.
    pub Hnh: nd::Array2<C64>,
    pub Ls: &'o [nd::Array2<C64>],
    /// `ΣL†L`.
    pub LdagL: &'o nd::Array2<C64>,
}

impl<'o> Ops<'o> {
    pub fn new(
        eq: Equation,
        H: nd::Array2<C64>,
        Ls: &'o [nd::Array2<C64>],
        LdagL: &'o nd::Array2<C64>,
    ) -> Self
    {
        let Hnh: nd::Array2<C64>
            = match eq {
                Equation::Schrodinger => H.clone(),
                Equation::Lindblad => &H - &(LdagL * c!(i 0.5)),
            };
        Self { eq, H, Hnh, Ls, LdagL }
    }

    pub fn dim(&self) -> usize { self.H.nrows() }
}

/// Derivatives of [`Ops`] with respect to one parameter.
#[derive(Clone, Debug)]
pub(crate) struct DOps {
    pub dH: nd::Array2<C64>,
    /// `∂L_k/∂p` for every jump operator, zero where `L_k` does not depend on
    /// the parameter.
    pub dLs: Vec<nd::Array2<C64>>,
    /// `Σ(∂L†L + L†∂L)`.
    pub dLdagL: nd::Array2<C64>,
    /// `∂H - ½i Σ(∂L†L + L†∂L)`.
    pub dHnh: nd::Array2<C64>,
}

impl DOps {
    pub fn new(
        eq: Equation,
        dH: nd::Array2<C64>,
        dLs: Vec<nd::Array2<C64>>,
        Ls: &[nd::Array2<C64>],
    ) -> Self
    {
        let n = dH.nrows();
        let mut dLdagL: nd::Array2<C64> = nd::Array2::zeros((n, n));
        for (L, dL) in Ls.iter().zip(&dLs) {
            dLdagL += &dag(dL).dot(L);
            dLdagL += &dag(L).dot(dL);
        }
        let dHnh: nd::Array2<C64>
            = match eq {
                Equation::Schrodinger => dH.clone(),
                Equation::Lindblad => &dH - &(&dLdagL * c!(i 0.5)),
            };
        Self { dH, dLs, dLdagL, dHnh }
    }

    /// Derivative of the operators in the direction of a change `dH` of the
    /// Hamiltonian only.
    pub fn from_dH(eq: Equation, dH: nd::Array2<C64>, Ls: &[nd::Array2<C64>])
        -> Self
    {
        let n = dH.nrows();
        let dLs = vec![nd::Array2::zeros((n, n)); Ls.len()];
        Self::new(eq, dH, dLs, Ls)
    }
}

/// `f(y)`.
pub(crate) fn rhs(ops: &Ops, y: &nd::ArrayView2<C64>) -> nd::Array2<C64> {
    match ops.eq {
        Equation::Schrodinger => ops.H.dot(y) * c!(i -1.0),
        Equation::Lindblad => {
            let Hy = ops.Hnh.dot(y);
            let yHdag = y.dot(&dag(&ops.Hnh));
            let mut out = (Hy - yHdag) * c!(i -1.0);
            ops.Ls.iter()
                .for_each(|L| { out += &L.dot(y).dot(&dag(L)); });
            out
        },
    }
}

/// `f†(a)`.
pub(crate) fn rhs_adjoint(ops: &Ops, a: &nd::ArrayView2<C64>) -> nd::Array2<C64> {
    match ops.eq {
        Equation::Schrodinger => dag(&ops.H).dot(a) * c!(i 1.0),
        Equation::Lindblad => {
            let Hdag_a = dag(&ops.Hnh).dot(a);
            let aH = a.dot(&ops.Hnh);
            let mut out = (Hdag_a - aH) * c!(i 1.0);
            ops.Ls.iter()
                .for_each(|L| { out += &dag(L).dot(a).dot(L); });
            out
        },
    }
}

/// `∂f/∂p (y)` for the parameter whose operator derivatives are `dops`.
pub(crate) fn rhs_param(ops: &Ops, dops: &DOps, y: &nd::ArrayView2<C64>)
    -> nd::Array2<C64>
{
    match ops.eq {
        Equation::Schrodinger => dops.dH.dot(y) * c!(i -1.0),
        Equation::Lindblad => {
            let dHy = dops.dHnh.dot(y);
            let ydHdag = y.dot(&dag(&dops.dHnh));
            let mut out = (dHy - ydHdag) * c!(i -1.0);
            for (L, dL) in ops.Ls.iter().zip(&dops.dLs) {
                let dLy = dL.dot(y);
                out += &dLy.dot(&dag(L));
                out += &L.dot(y).dot(&dag(dL));
            }
            out
        },
    }
}
