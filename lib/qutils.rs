//! Linear algebra on states and operators.
//!
//! Everything here works on single (unbatched) matrices; batching is handled
//! by the callers iterating over the leading axis of a batched array.

use ndarray::{ self as nd, Zip };
use ndarray_linalg::{ self as la, Cholesky, Eigh, Inverse };
use num_complex::Complex64 as C64;
use num_traits::Zero;
use crate::error::Result;

/// Conjugate transpose.
pub fn dag<S>(A: &nd::ArrayBase<S, nd::Ix2>) -> nd::Array2<C64>
where S: nd::Data<Elem = C64>
{
    A.t().mapv(|a| a.conj())
}

/// Sum of the main diagonal.
pub fn trace<S>(A: &nd::ArrayBase<S, nd::Ix2>) -> C64
where S: nd::Data<Elem = C64>
{
    A.diag().sum()
}

/// Compute `M ρ M†`.
pub fn sandwich<SA, SB>(
    M: &nd::ArrayBase<SA, nd::Ix2>,
    rho: &nd::ArrayBase<SB, nd::Ix2>,
) -> nd::Array2<C64>
where
    SA: nd::Data<Elem = C64>,
    SB: nd::Data<Elem = C64>,
{
    M.dot(rho).dot(&dag(M))
}

/// Apply the Kraus map `ρ ↦ Σ_k M_k ρ M_k†`.
///
/// The sum runs over `Ms` in order.
pub fn kraus_map<S>(rho: &nd::ArrayBase<S, nd::Ix2>, Ms: &[nd::Array2<C64>])
    -> nd::Array2<C64>
where S: nd::Data<Elem = C64>
{
    let mut acc: nd::Array2<C64> = nd::Array2::zeros(rho.raw_dim());
    Ms.iter().for_each(|M| { acc += &sandwich(M, rho); });
    acc
}

/// First-order change of `Σ_k M_k ρ M_k†` for a change `dρ` of the input and
/// `dM_k` of the Kraus operators.
pub fn kraus_map_tangent(
    rho: &nd::Array2<C64>,
    drho: &nd::Array2<C64>,
    Ms: &[nd::Array2<C64>],
    dMs: &[nd::Array2<C64>],
) -> nd::Array2<C64>
{
    let mut acc: nd::Array2<C64> = nd::Array2::zeros(rho.raw_dim());
    for (M, dM) in Ms.iter().zip(dMs) {
        let Mdag = dag(M);
        acc += &dM.dot(rho).dot(&Mdag);
        acc += &M.dot(rho).dot(&dag(dM));
        acc += &M.dot(drho).dot(&Mdag);
    }
    acc
}


/// Frobenius inner product `Σ conj(a_ij) b_ij`.
pub fn inner<SA, SB, D>(
    a: &nd::ArrayBase<SA, D>,
    b: &nd::ArrayBase<SB, D>,
) -> C64
where
    SA: nd::Data<Elem = C64>,
    SB: nd::Data<Elem = C64>,
    D: nd::Dimension,
{
    Zip::from(a).and(b).fold(C64::zero(), |acc, x, y| acc + x.conj() * y)
}

/// Expectation value of `O` for a ket `(n, 1)` or a density matrix `(n, n)`,
/// told apart by [`is_ket`]. A `(1, 1)` state counts as a density matrix; use
/// [`expect_state`] when the kind of state is known.
pub fn expect<SA, SB>(
    O: &nd::ArrayBase<SA, nd::Ix2>,
    y: &nd::ArrayBase<SB, nd::Ix2>,
) -> C64
where
    SA: nd::Data<Elem = C64>,
    SB: nd::Data<Elem = C64>,
{
    expect_state(O, y, is_ket(y))
}

/// Expectation value of `O` for a ket (`ket == true`) or a density matrix.
pub fn expect_state<SA, SB>(
    O: &nd::ArrayBase<SA, nd::Ix2>,
    y: &nd::ArrayBase<SB, nd::Ix2>,
    ket: bool,
) -> C64
where
    SA: nd::Data<Elem = C64>,
    SB: nd::Data<Elem = C64>,
{
    if ket {
        inner(y, &O.dot(y))
    } else {
        Zip::from(O).and(&y.t()).fold(C64::zero(), |acc, o, r| acc + o * r)
    }
}

/// First-order change of [`expect_state`] for a change `dy` of the state.
pub fn expect_tangent(
    O: &nd::Array2<C64>,
    y: nd::ArrayView2<C64>,
    dy: nd::ArrayView2<C64>,
    ket: bool,
) -> C64
{
    if ket {
        inner(&dy, &O.dot(&y)) + inner(&y, &O.dot(&dy))
    } else {
        expect_state(O, &dy, false)
    }
}

/// Root-mean-square of the absolute values of all elements.
pub fn hairer_norm<S, D>(x: &nd::ArrayBase<S, D>) -> f64
where
    S: nd::Data<Elem = C64>,
    D: nd::Dimension,
{
    if x.is_empty() { return 0.0; }
    (x.iter().map(|a| a.norm_sqr()).sum::<f64>() / x.len() as f64).sqrt()
}

/// Eigendecomposition of a Hermitian matrix, `A = V diag(λ) V†`.
#[derive(Clone, Debug)]
pub struct EigenH {
    pub vals: nd::Array1<f64>,
    pub vecs: nd::Array2<C64>,
}

/// Diagonalize a Hermitian matrix using its lower triangle.
pub fn eigh<S>(A: &nd::ArrayBase<S, nd::Ix2>) -> Result<EigenH>
where S: nd::Data<Elem = C64>
{
    let (vals, vecs) = A.eigh(la::UPLO::Lower)?;
    Ok(EigenH { vals, vecs })
}

impl EigenH {
    /// Compute `f(A) = V diag(f(λ)) V†`.
    pub fn apply<F>(&self, f: F) -> nd::Array2<C64>
    where F: Fn(f64) -> C64
    {
        let fl: nd::Array1<C64> = self.vals.mapv(f);
        let scaled = &self.vecs * &fl.view().insert_axis(nd::Axis(0));
        scaled.dot(&dag(&self.vecs))
    }

    /// First-order change of `f(A)` for a Hermitian perturbation `dA`
    /// (Daleckii–Krein formula).
    pub fn apply_tangent<F, G>(&self, dA: &nd::Array2<C64>, f: F, fprime: G)
        -> nd::Array2<C64>
    where
        F: Fn(f64) -> C64,
        G: Fn(f64) -> C64,
    {
        let V = &self.vecs;
        let Vdag = dag(V);
        let mut X: nd::Array2<C64> = Vdag.dot(dA).dot(V);
        let fl: Vec<C64> = self.vals.iter().map(|l| f(*l)).collect();
        for ((i, j), x) in X.indexed_iter_mut() {
            let (li, lj) = (self.vals[i], self.vals[j]);
            let scale = 1.0_f64.max(li.abs()).max(lj.abs());
            let gamma
                = if (li - lj).abs() <= 1e-10 * scale {
                    fprime(0.5 * (li + lj))
                } else {
                    (fl[i] - fl[j]) / (li - lj)
                };
            *x *= gamma;
        }
        V.dot(&X).dot(&Vdag)
    }
}

/// Inverse square root of a positive-definite Hermitian matrix.
pub fn inv_sqrtm<S>(A: &nd::ArrayBase<S, nd::Ix2>) -> Result<nd::Array2<C64>>
where S: nd::Data<Elem = C64>
{
    Ok(eigh(A)?.apply(|l| C64::from(l.powf(-0.5))))
}

/// `A^(-1/2)` together with its first-order change for a change `dA`.
pub fn inv_sqrtm_tangent<S>(A: &nd::ArrayBase<S, nd::Ix2>, dA: &nd::Array2<C64>)
    -> Result<(nd::Array2<C64>, nd::Array2<C64>)>
where S: nd::Data<Elem = C64>
{
    let eig = eigh(A)?;
    let X = eig.apply(|l| C64::from(l.powf(-0.5)));
    let dX = eig.apply_tangent(
        dA,
        |l| C64::from(l.powf(-0.5)),
        |l| C64::from(-0.5 * l.powf(-1.5)),
    );
    Ok((X, dX))
}

/// Lower Cholesky factor `L` of a positive-definite Hermitian matrix,
/// `A = L L†`.
pub fn cholesky_lower<S>(A: &nd::ArrayBase<S, nd::Ix2>) -> Result<nd::Array2<C64>>
where S: nd::Data<Elem = C64>
{
    Ok(A.cholesky(la::UPLO::Lower)?)
}

/// First-order change of the lower Cholesky factor `L` of `A` for a Hermitian
/// perturbation `dA`, given `L` and its inverse.
pub fn cholesky_tangent(
    L: &nd::Array2<C64>,
    Linv: &nd::Array2<C64>,
    dA: &nd::Array2<C64>,
) -> nd::Array2<C64>
{
    let mut W: nd::Array2<C64> = Linv.dot(dA).dot(&dag(Linv));
    for ((i, j), w) in W.indexed_iter_mut() {
        if j > i {
            *w = C64::zero();
        } else if i == j {
            *w = C64::from(0.5 * w.re);
        }
    }
    L.dot(&W)
}

/// Matrix inverse.
pub fn inv<S>(A: &nd::ArrayBase<S, nd::Ix2>) -> Result<nd::Array2<C64>>
where S: nd::Data<Elem = C64>
{
    Ok(A.inv()?)
}

/// Compute the commutator `[A, B] = A B - B A`.
pub fn commutator<SA, SB>(
    A: &nd::ArrayBase<SA, nd::Ix2>,
    B: &nd::ArrayBase<SB, nd::Ix2>,
) -> nd::Array2<C64>
where
    SA: nd::Data<Elem = C64>,
    SB: nd::Data<Elem = C64>,
{
    A.dot(B) - B.dot(A)
}

/// Convert a ket `(n, 1)` to the density matrix `|ψ⟩⟨ψ|`.
pub fn todm<S>(psi: &nd::ArrayBase<S, nd::Ix2>) -> nd::Array2<C64>
where S: nd::Data<Elem = C64>
{
    psi.dot(&dag(psi))
}

/// Return `true` if the matrix is a column vector with more than one row.
pub fn is_ket<S>(y: &nd::ArrayBase<S, nd::Ix2>) -> bool
where S: nd::Data<Elem = C64>
{
    y.ncols() == 1 && y.nrows() > 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::{ c, operators::eye };

    fn herm2() -> nd::Array2<C64> {
        nd::array![[c!(2.0), c!(0.5, -0.3)], [c!(0.5, 0.3), c!(1.0)]]
    }

    #[test]
    fn kraus_identity() {
        let rho = herm2();
        let out = kraus_map(&rho, &[eye(2)]);
        assert_abs_diff_eq!((out - &rho).mapv(|a| a.norm()).sum(), 0.0);
    }

    #[test]
    fn inverse_square_root() {
        let A = herm2();
        let X = inv_sqrtm(&A).unwrap();
        let prod = X.dot(&A).dot(&X);
        assert_abs_diff_eq!((prod - eye(2)).mapv(|a| a.norm()).sum(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn daleckii_krein_matches_finite_difference() {
        let A = herm2();
        let dA = nd::array![[c!(0.1), c!(0.0, 0.2)], [c!(0.0, -0.2), c!(-0.3)]];
        let eps = 1e-6;
        let f = |l: f64| C64::from(l.powf(-0.5));
        let fp = |l: f64| C64::from(-0.5 * l.powf(-1.5));
        let analytic = eigh(&A).unwrap().apply_tangent(&dA, f, fp);
        let plus = eigh(&(&A + &(&dA * eps))).unwrap().apply(f);
        let minus = eigh(&(&A - &(&dA * eps))).unwrap().apply(f);
        let numeric = (plus - minus) / (2.0 * eps);
        assert_abs_diff_eq!((analytic - numeric).mapv(|a| a.norm()).sum(), 0.0, epsilon = 1e-7);
    }

    #[test]
    fn cholesky_derivative() {
        let A = herm2();
        let dA = nd::array![[c!(0.1), c!(0.05, 0.2)], [c!(0.05, -0.2), c!(-0.3)]];
        let L = cholesky_lower(&A).unwrap();
        let Linv = inv(&L).unwrap();
        let dL = cholesky_tangent(&L, &Linv, &dA);
        let eps = 1e-6;
        let plus = cholesky_lower(&(&A + &(&dA * eps))).unwrap();
        let minus = cholesky_lower(&(&A - &(&dA * eps))).unwrap();
        let numeric = (plus - minus) / (2.0 * eps);
        assert_abs_diff_eq!((dL - numeric).mapv(|a| a.norm()).sum(), 0.0, epsilon = 1e-7);
    }

    #[test]
    fn expectation_ket_and_dm() {
        let psi = nd::array![[c!(0.6)], [c!(0.0, 0.8)]];
        let O = herm2();
        let e_ket = expect(&O, &psi);
        let e_dm = expect(&O, &todm(&psi));
        assert_abs_diff_eq!(e_ket.re, e_dm.re, epsilon = 1e-12);
        assert_abs_diff_eq!(e_ket.im, e_dm.im, epsilon = 1e-12);
    }

    #[test]
    fn one_level_ket_expectation() {
        let psi = nd::array![[c!(0.0, 0.5)]];
        let O = nd::array![[c!(3.0)]];
        assert_abs_diff_eq!(expect_state(&O, &psi, true).re, 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(expect_state(&O, &psi, true).im, 0.0, epsilon = 1e-12);
        // without the hint, a single element is read as a density matrix
        assert!(!is_ket(&psi));
        assert_abs_diff_eq!(expect(&O, &psi).im, 1.5, epsilon = 1e-12);
        let dpsi = nd::array![[c!(1.0)]];
        let d = expect_tangent(&O, psi.view(), dpsi.view(), true);
        assert_abs_diff_eq!(d.re, 0.0, epsilon = 1e-12);
    }
}
