//! Time-dependent operators.
//!
//! A [`TimeOp`] maps a time `t` to a batch of square matrices of fixed shape
//! `(b, n, n)`. Operators are built from constant matrices, piecewise-constant
//! pulses, scalar modulations of a constant matrix, or arbitrary callables,
//! and combined with [`TimeOp::try_add`] and multiplication by a complex
//! scalar.

use std::rc::Rc;
use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::{
    error::{ Error, Result },
    utils::insert_sorted_unique,
};

/// Heap-allocated [`Fn`] trait object giving a complex time-dependent
/// coefficient.
pub type CoeffFn<'a> = Rc<dyn Fn(f64) -> C64 + 'a>;

/// Heap-allocated [`Fn`] trait object giving a batch of operators at a time
/// `t`.
pub type OpFn<'a> = Rc<dyn Fn(f64) -> nd::Array3<C64> + 'a>;

#[derive(Clone)]
enum Kind<'a> {
    Constant(nd::Array3<C64>),
    Pwc {
        times: Vec<f64>,
        values: nd::Array2<C64>,
        op: nd::Array2<C64>,
    },
    Modulated {
        f: CoeffFn<'a>,
        op: nd::Array3<C64>,
    },
    Callable(OpFn<'a>),
    Sum(Vec<TimeOp<'a>>),
    Scaled(C64, Box<TimeOp<'a>>),
}

/// An operator-valued function of time with static shape `(b, n, n)`.
#[derive(Clone)]
pub struct TimeOp<'a> {
    kind: Kind<'a>,
    batch: usize,
    dim: usize,
}

impl<'a> std::fmt::Debug for TimeOp<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind
            = match &self.kind {
                Kind::Constant(_) => "Constant",
                Kind::Pwc { .. } => "Pwc",
                Kind::Modulated { .. } => "Modulated",
                Kind::Callable(_) => "Callable",
                Kind::Sum(_) => "Sum",
                Kind::Scaled(..) => "Scaled",
            };
        write!(f, "TimeOp {{ {}, shape: ({}, {}, {}) }}",
            kind, self.batch, self.dim, self.dim)
    }
}

fn check_square(shape: &[usize], what: &str) -> Result<()> {
    if shape.len() < 2 || shape[shape.len() - 1] != shape[shape.len() - 2] {
        return Err(Error::shape(
            format!("{what} must be square, but has shape {shape:?}")));
    }
    Ok(())
}

impl<'a> From<nd::Array2<C64>> for TimeOp<'a> {
    fn from(op: nd::Array2<C64>) -> Self {
        let dim = op.nrows();
        let op3 = op.insert_axis(nd::Axis(0));
        Self { kind: Kind::Constant(op3), batch: 1, dim }
    }
}

impl<'a> TimeOp<'a> {
    /// A constant operator `(n, n)`.
    pub fn constant(op: nd::Array2<C64>) -> Result<Self> {
        check_square(op.shape(), "constant operator")?;
        Ok(op.into())
    }

    /// A batch of constant operators `(b, n, n)`.
    pub fn constant_batched(ops: nd::Array3<C64>) -> Result<Self> {
        check_square(ops.shape(), "constant operator")?;
        let (batch, dim, _) = ops.dim();
        if batch == 0 {
            return Err(Error::shape("operator batch must not be empty"));
        }
        Ok(Self { kind: Kind::Constant(ops), batch, dim })
    }

    /// A piecewise-constant operator equal to `values[b, k] * op` for
    /// `times[k] <= t < times[k + 1]` and zero outside `[times[0],
    /// times[-1])`.
    ///
    /// `values` has shape `(b, times.len() - 1)`, its leading axis giving the
    /// batch.
    pub fn pwc(times: &[f64], values: nd::Array2<C64>, op: nd::Array2<C64>)
        -> Result<Self>
    {
        check_square(op.shape(), "piecewise-constant operator")?;
        if times.len() < 2 {
            return Err(Error::shape("`times` must have at least two entries"));
        }
        if times.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(Error::config("`times` must be strictly increasing"));
        }
        if values.ncols() != times.len() - 1 || values.nrows() == 0 {
            return Err(Error::shape(format!(
                "`values` must have shape (b, {}), but has shape {:?}",
                times.len() - 1, values.shape(),
            )));
        }
        let batch = values.nrows();
        let dim = op.nrows();
        Ok(Self {
            kind: Kind::Pwc { times: times.to_vec(), values, op },
            batch,
            dim,
        })
    }

    /// The operator `f(t) * op` for a constant `(n, n)` matrix `op`.
    pub fn modulated<F>(f: F, op: nd::Array2<C64>) -> Result<Self>
    where F: Fn(f64) -> C64 + 'a
    {
        check_square(op.shape(), "modulated operator")?;
        let dim = op.nrows();
        Ok(Self {
            kind: Kind::Modulated {
                f: Rc::new(f),
                op: op.insert_axis(nd::Axis(0)),
            },
            batch: 1,
            dim,
        })
    }

    /// An arbitrary function of time declared to return arrays of shape
    /// `(batch, dim, dim)`. A mismatch is reported when the operator is
    /// evaluated.
    pub fn callable<F>(f: F, batch: usize, dim: usize) -> Self
    where F: Fn(f64) -> nd::Array3<C64> + 'a
    {
        Self { kind: Kind::Callable(Rc::new(f)), batch, dim }
    }

    /// Add two operators. Batch sizes must be equal or one of them must be
    /// one; dimensions must agree.
    pub fn try_add(self, other: Self) -> Result<Self> {
        if self.dim != other.dim {
            return Err(Error::shape(format!(
                "cannot add operators of dimensions {} and {}",
                self.dim, other.dim,
            )));
        }
        let batch
            = match (self.batch, other.batch) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                (a, b) => {
                    return Err(Error::shape(format!(
                        "cannot add operators with batch sizes {a} and {b}")));
                },
            };
        let dim = self.dim;
        let terms: Vec<TimeOp<'a>>
            = match (self.kind, other.kind) {
                (Kind::Sum(mut l), Kind::Sum(r)) => { l.extend(r); l },
                (Kind::Sum(mut l), r) => {
                    l.push(Self { kind: r, batch: other.batch, dim });
                    l
                },
                (l, r) => vec![
                    Self { kind: l, batch: self.batch, dim },
                    Self { kind: r, batch: other.batch, dim },
                ],
            };
        Ok(Self { kind: Kind::Sum(terms), batch, dim })
    }

    /// Batch size `b`.
    pub fn batch(&self) -> usize { self.batch }

    /// Matrix dimension `n`.
    pub fn dim(&self) -> usize { self.dim }

    /// Return `true` if the operator is constant or piecewise-constant in
    /// time.
    pub fn is_pwc(&self) -> bool {
        match &self.kind {
            Kind::Constant(_) | Kind::Pwc { .. } => true,
            Kind::Modulated { .. } | Kind::Callable(_) => false,
            Kind::Sum(terms) => terms.iter().all(|op| op.is_pwc()),
            Kind::Scaled(_, op) => op.is_pwc(),
        }
    }

    /// Sorted times at which a piecewise-constant part of the operator
    /// switches value.
    pub fn discontinuities(&self) -> Vec<f64> {
        let mut acc: Vec<f64> = Vec::new();
        self.collect_discontinuities(&mut acc);
        acc
    }

    fn collect_discontinuities(&self, acc: &mut Vec<f64>) {
        match &self.kind {
            Kind::Pwc { times, .. } => {
                times.iter().for_each(|t| insert_sorted_unique(acc, *t));
            },
            Kind::Sum(terms) => {
                terms.iter().for_each(|op| op.collect_discontinuities(acc));
            },
            Kind::Scaled(_, op) => op.collect_discontinuities(acc),
            _ => { },
        }
    }

    /// Evaluate at time `t`, returning an array of shape `(b, n, n)`.
    pub fn eval(&self, t: f64) -> Result<nd::Array3<C64>> {
        let out: nd::Array3<C64>
            = match &self.kind {
                Kind::Constant(ops) => ops.clone(),
                Kind::Pwc { times, values, op } => {
                    let mut out: nd::Array3<C64>
                        = nd::Array3::zeros((self.batch, self.dim, self.dim));
                    let last = times.len() - 1;
                    if t >= times[0] && t < times[last] {
                        let k
                            = times.partition_point(|tk| *tk <= t)
                            .saturating_sub(1)
                            .min(last - 1);
                        out.outer_iter_mut()
                            .zip(values.column(k))
                            .for_each(|(mut o, v)| o.assign(&(op * *v)));
                    }
                    out
                },
                Kind::Modulated { f, op } => op * f(t),
                Kind::Callable(f) => {
                    let out = f(t);
                    if out.dim() != (self.batch, self.dim, self.dim) {
                        return Err(Error::shape(format!(
                            "callable operator declared shape ({}, {}, {}) \
                            but returned {:?} at t = {}",
                            self.batch, self.dim, self.dim, out.shape(), t,
                        )));
                    }
                    out
                },
                Kind::Sum(terms) => {
                    let mut out: nd::Array3<C64>
                        = nd::Array3::zeros((self.batch, self.dim, self.dim));
                    for op in terms.iter() {
                        let term = op.eval(t)?;
                        // broadcasts a batch of one against the full batch
                        out += &term;
                    }
                    out
                },
                Kind::Scaled(s, op) => op.eval(t)? * *s,
            };
        Ok(out)
    }
}

impl<'a> std::ops::Mul<C64> for TimeOp<'a> {
    type Output = TimeOp<'a>;

    fn mul(self, s: C64) -> Self::Output {
        let (batch, dim) = (self.batch, self.dim);
        Self { kind: Kind::Scaled(s, Box::new(self)), batch, dim }
    }
}

impl<'a> std::ops::Mul<f64> for TimeOp<'a> {
    type Output = TimeOp<'a>;

    fn mul(self, s: f64) -> Self::Output { self * C64::from(s) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ c, operators::{ sigmax, sigmaz } };

    #[test]
    fn pwc_values() {
        let op = TimeOp::pwc(
            &[0.0, 1.0, 2.0],
            nd::array![[c!(1.0), c!(3.0)]],
            sigmax(),
        ).unwrap();
        assert!(op.is_pwc());
        assert_eq!(op.discontinuities(), vec![0.0, 1.0, 2.0]);
        assert_eq!(op.eval(0.5).unwrap()[[0, 0, 1]], c!(1.0));
        assert_eq!(op.eval(1.0).unwrap()[[0, 0, 1]], c!(3.0));
        assert_eq!(op.eval(2.0).unwrap()[[0, 0, 1]], c!(0.0));
        assert_eq!(op.eval(-0.1).unwrap()[[0, 0, 1]], c!(0.0));
    }

    #[test]
    fn sum_broadcasts_batch() {
        let batched = TimeOp::constant_batched(
            nd::stack![nd::Axis(0), sigmaz(), sigmaz() * 2.0]
        ).unwrap();
        let modulated = TimeOp::modulated(|t| c!(t), sigmax()).unwrap();
        let sum = (batched.try_add(modulated).unwrap()) * c!(2.0);
        assert_eq!(sum.batch(), 2);
        assert!(!sum.is_pwc());
        let H = sum.eval(0.5).unwrap();
        assert_eq!(H.dim(), (2, 2, 2));
        assert_eq!(H[[1, 0, 0]], c!(4.0));
        assert_eq!(H[[1, 0, 1]], c!(1.0));
        assert_eq!(H[[0, 0, 0]], c!(2.0));
    }

    #[test]
    fn shape_errors() {
        let a = TimeOp::constant(sigmax()).unwrap();
        let b = TimeOp::constant(nd::Array2::eye(3)).unwrap();
        assert!(matches!(a.try_add(b), Err(Error::Shape(_))));
        let bad = TimeOp::callable(|_| nd::Array3::zeros((1, 3, 3)), 1, 2);
        assert!(matches!(bad.eval(0.0), Err(Error::Shape(_))));
        assert!(TimeOp::pwc(&[1.0, 0.0], nd::array![[c!(1.0)]], sigmax()).is_err());
    }
}
