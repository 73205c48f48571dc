//! Standard operators and states in truncated Fock or two-level spaces.

use std::f64::consts::FRAC_1_SQRT_2;
use ndarray as nd;
use num_complex::Complex64 as C64;
use rand::Rng;
use crate::{
    c,
    error::{ Error, Result },
    qutils::{ dag, eigh, todm },
};

/// Annihilation operator on the first `n` Fock states.
pub fn destroy(n: usize) -> nd::Array2<C64> {
    let mut a: nd::Array2<C64> = nd::Array2::zeros((n, n));
    (1..n).for_each(|k| { a[[k - 1, k]] = C64::from((k as f64).sqrt()); });
    a
}

/// Creation operator on the first `n` Fock states.
pub fn create(n: usize) -> nd::Array2<C64> { dag(&destroy(n)) }

/// Photon-number operator `a†a`.
pub fn number(n: usize) -> nd::Array2<C64> {
    nd::Array2::from_diag(&(0..n).map(|k| C64::from(k as f64)).collect::<nd::Array1<C64>>())
}

/// Identity operator.
pub fn eye(n: usize) -> nd::Array2<C64> { nd::Array2::eye(n) }

/// Quadrature `(a + a†) / 2`.
pub fn position(n: usize) -> nd::Array2<C64> {
    let a = destroy(n);
    (&a + &dag(&a)) * 0.5
}

/// Quadrature `i (a† - a) / 2`.
pub fn momentum(n: usize) -> nd::Array2<C64> {
    let a = destroy(n);
    (&dag(&a) - &a) * c!(i 0.5)
}

// two-level operators use the basis ordering { |e⟩, |g⟩ } so that `σ-` takes
// index 0 to index 1

/// Lowering operator `|g⟩⟨e|` of a two-level system.
pub fn sigmam() -> nd::Array2<C64> {
    nd::array![[c!(0.0), c!(0.0)], [c!(1.0), c!(0.0)]]
}

/// Raising operator `|e⟩⟨g|` of a two-level system.
pub fn sigmap() -> nd::Array2<C64> { dag(&sigmam()) }

pub fn sigmax() -> nd::Array2<C64> {
    nd::array![[c!(0.0), c!(1.0)], [c!(1.0), c!(0.0)]]
}

pub fn sigmay() -> nd::Array2<C64> {
    nd::array![[c!(0.0), c!(i -1.0)], [c!(i 1.0), c!(0.0)]]
}

pub fn sigmaz() -> nd::Array2<C64> {
    nd::array![[c!(1.0), c!(0.0)], [c!(0.0), c!(-1.0)]]
}

/// Fock state `|k⟩` as an `(n, 1)` ket.
pub fn fock(n: usize, k: usize) -> Result<nd::Array2<C64>> {
    if k >= n {
        return Err(Error::config(
            format!("Fock index {k} out of range for dimension {n}")));
    }
    let mut psi: nd::Array2<C64> = nd::Array2::zeros((n, 1));
    psi[[k, 0]] = c!(1.0);
    Ok(psi)
}

/// Fock state `|k⟩⟨k|` as a density matrix.
pub fn fock_dm(n: usize, k: usize) -> Result<nd::Array2<C64>> {
    fock(n, k).map(|psi| todm(&psi))
}

/// Displacement operator `exp(α a† - α* a)` on the first `n` Fock states.
pub fn displace(n: usize, alpha: C64) -> Result<nd::Array2<C64>> {
    let a = destroy(n);
    // α a† - α* a = i K with K Hermitian
    let K: nd::Array2<C64>
        = (&dag(&a) * alpha - &a * alpha.conj()) * c!(i -1.0);
    Ok(eigh(&K)?.apply(|l| c!(e l)))
}

/// Coherent state `D(α)|0⟩` as an `(n, 1)` ket.
pub fn coherent(n: usize, alpha: C64) -> Result<nd::Array2<C64>> {
    Ok(displace(n, alpha)?.dot(&fock(n, 0)?))
}

/// Coherent state `D(α)|0⟩⟨0|D(α)†` as a density matrix.
pub fn coherent_dm(n: usize, alpha: C64) -> Result<nd::Array2<C64>> {
    coherent(n, alpha).map(|psi| todm(&psi))
}

/// Equal superposition `(|e⟩ + |g⟩) / √2` of a two-level system.
pub fn plus() -> nd::Array2<C64> {
    nd::array![[c!(FRAC_1_SQRT_2)], [c!(FRAC_1_SQRT_2)]]
}

/// Random Hermitian matrix with entries of order one.
pub fn rand_herm<R: Rng>(n: usize, rng: &mut R) -> nd::Array2<C64> {
    let X: nd::Array2<C64>
        = nd::Array2::from_shape_simple_fn(
            (n, n),
            || c!(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)),
        );
    (&X + &dag(&X)) * 0.5
}

/// Random normalized ket.
pub fn rand_ket<R: Rng>(n: usize, rng: &mut R) -> nd::Array2<C64> {
    let psi: nd::Array2<C64>
        = nd::Array2::from_shape_simple_fn(
            (n, 1),
            || c!(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)),
        );
    let norm = psi.iter().map(|a| a.norm_sqr()).sum::<f64>().sqrt();
    psi / norm
}

/// Random full-rank density matrix `X X† / tr(X X†)`.
pub fn rand_dm<R: Rng>(n: usize, rng: &mut R) -> nd::Array2<C64> {
    let X: nd::Array2<C64>
        = nd::Array2::from_shape_simple_fn(
            (n, n),
            || c!(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)),
        );
    let rho = X.dot(&dag(&X));
    let tr = rho.diag().iter().map(|a| a.re).sum::<f64>();
    rho / tr
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::qutils::{ commutator, expect, todm, trace };

    #[test]
    fn ladder_commutator() {
        let n = 6;
        let a = destroy(n);
        let comm = commutator(&a, &create(n));
        // identity except for the truncated last level
        for k in 0..n - 1 {
            assert_abs_diff_eq!(comm[[k, k]].re, 1.0, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(comm[[n - 1, n - 1]].re, 1.0 - n as f64, epsilon = 1e-12);
    }

    #[test]
    fn coherent_amplitude() {
        let alpha = c!(0.3, -0.2);
        let psi = coherent(12, alpha).unwrap();
        let a_exp = expect(&destroy(12), &psi);
        assert_abs_diff_eq!(a_exp.re, alpha.re, epsilon = 1e-8);
        assert_abs_diff_eq!(a_exp.im, alpha.im, epsilon = 1e-8);
        let x = expect(&position(12), &coherent_dm(12, alpha).unwrap());
        assert_abs_diff_eq!(x.re, alpha.re, epsilon = 1e-8);
        let p = expect(&momentum(12), &psi);
        assert_abs_diff_eq!(p.re, alpha.im, epsilon = 1e-8);
    }

    #[test]
    fn pauli_algebra() {
        let xy = sigmax().dot(&sigmay());
        let iz = sigmaz() * c!(i 1.0);
        assert_abs_diff_eq!((xy - iz).mapv(|a| a.norm()).sum(), 0.0);
        let pop = expect(&sigmap().dot(&sigmam()), &fock_dm(2, 0).unwrap());
        assert_abs_diff_eq!(pop.re, 1.0);
    }

    #[test]
    fn random_states() {
        let mut rng = StdRng::seed_from_u64(10546);
        let rho = rand_dm(4, &mut rng);
        assert_abs_diff_eq!(trace(&rho).re, 1.0, epsilon = 1e-12);
        let evals = eigh(&rho).unwrap().vals;
        assert!(evals.iter().all(|l| *l >= -1e-12));
        let psi = rand_ket(4, &mut rng);
        assert_abs_diff_eq!(trace(&todm(&psi)).re, 1.0, epsilon = 1e-12);
        let H = rand_herm(4, &mut rng);
        assert_abs_diff_eq!((&H - &dag(&H)).mapv(|a| a.norm()).sum(), 0.0);
        assert!(fock(3, 3).is_err());
    }
}
