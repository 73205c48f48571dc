//! Adaptive Dormand–Prince 5(4) integration with Hairer error control.
//!
//! See Hairer, Nørsett, and Wanner, *Solving Ordinary Differential Equations
//! I* (1993), chapter II.4, for the step-size initialization and update rules.

use ndarray as nd;
use num_complex::Complex64 as C64;
use tracing::trace;
use crate::{
    config::Tolerances,
    error::{ Error, Result },
    qutils::hairer_norm,
    result::Stats,
};

/// A state that can be advanced by the adaptive integrator.
///
/// States are batched over their leading axis; error norms are taken as the
/// maximum over batch members.
pub(crate) trait OdeState: Clone {
    /// Compute `self + Σ c_k x_k`.
    fn add_scaled(&self, terms: &[(f64, &Self)]) -> Self;

    /// Compute `c · self`.
    fn scale(&self, c: f64) -> Self;

    /// Maximum over batch members of the Hairer norm of `x / scale`, where
    /// `scale = atol + rtol · max(|y0|, |y1|)` elementwise, and `y1 = y0` if
    /// not given. Only the error-controlled parts of a state contribute.
    fn scaled_norm(x: &Self, y0: &Self, y1: Option<&Self>, tol: &Tolerances) -> f64;
}

fn scaled_norm3(
    x: &nd::Array3<C64>,
    y0: &nd::Array3<C64>,
    y1: Option<&nd::Array3<C64>>,
    tol: &Tolerances,
) -> f64
{
    let mut scaled: nd::Array3<C64> = x.clone();
    match y1 {
        Some(y1) => {
            nd::Zip::from(&mut scaled).and(y0).and(y1)
                .for_each(|s, a, b| {
                    *s /= tol.atol + tol.rtol * a.norm().max(b.norm());
                });
        },
        None => {
            nd::Zip::from(&mut scaled).and(y0)
                .for_each(|s, a| { *s /= tol.atol + tol.rtol * a.norm(); });
        },
    }
    scaled.outer_iter()
        .map(|member| hairer_norm(&member))
        .fold(0.0, f64::max)
}

impl OdeState for nd::Array3<C64> {
    fn add_scaled(&self, terms: &[(f64, &Self)]) -> Self {
        let mut out = self.clone();
        terms.iter()
            .filter(|(c, _)| *c != 0.0)
            .for_each(|(c, x)| { out.scaled_add(C64::from(*c), *x); });
        out
    }

    fn scale(&self, c: f64) -> Self { self * C64::from(c) }

    fn scaled_norm(x: &Self, y0: &Self, y1: Option<&Self>, tol: &Tolerances)
        -> f64
    {
        scaled_norm3(x, y0, y1, tol)
    }
}

/// Several batched arrays integrated together, the first `n_controlled` of
/// which take part in error control.
#[derive(Clone, Debug)]
pub(crate) struct Bundle {
    pub parts: Vec<nd::Array3<C64>>,
    pub n_controlled: usize,
}

impl OdeState for Bundle {
    fn add_scaled(&self, terms: &[(f64, &Self)]) -> Self {
        let parts: Vec<nd::Array3<C64>>
            = self.parts.iter().enumerate()
            .map(|(k, part)| {
                let mut out = part.clone();
                terms.iter()
                    .filter(|(c, _)| *c != 0.0)
                    .for_each(|(c, x)| {
                        out.scaled_add(C64::from(*c), &x.parts[k]);
                    });
                out
            })
            .collect();
        Self { parts, n_controlled: self.n_controlled }
    }

    fn scale(&self, c: f64) -> Self {
        let parts: Vec<nd::Array3<C64>>
            = self.parts.iter().map(|part| part * C64::from(c)).collect();
        Self { parts, n_controlled: self.n_controlled }
    }

    fn scaled_norm(x: &Self, y0: &Self, y1: Option<&Self>, tol: &Tolerances)
        -> f64
    {
        (0..x.n_controlled)
            .map(|k| {
                scaled_norm3(
                    &x.parts[k], &y0.parts[k], y1.map(|y| &y.parts[k]), tol)
            })
            .fold(0.0, f64::max)
    }
}

// Butcher tableau
const ALPHA: [f64; 6] = [1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];
const BETA: [[f64; 6]; 6] = [
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
    [
        19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0,
        0.0, 0.0,
    ],
    [
        9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0, 49.0 / 176.0,
        -5103.0 / 18656.0, 0.0,
    ],
    [
        35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0,
        11.0 / 84.0,
    ],
];
const CSOL5: [f64; 7] = [
    35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0,
    11.0 / 84.0, 0.0,
];
const CSOL4: [f64; 7] = [
    1951.0 / 21600.0, 0.0, 22642.0 / 50085.0, 451.0 / 720.0,
    -12231.0 / 42400.0, 649.0 / 6300.0, 1.0 / 60.0,
];

/// Carried controller state: the current step-size proposal and the error of
/// the last attempted step.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct StepControl {
    pub dt: f64,
    pub error: f64,
}

/// Dormand–Prince 5(4) integrator.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Dopri5 {
    pub tol: Tolerances,
}

impl Dopri5 {
    pub const order: usize = 5;

    pub fn new(tol: Tolerances) -> Self { Self { tol } }

    /// Take a single step of size `dt` from `(t0, y0)`, given `f0 = f(t0,
    /// y0)`. Returns `(f1, y1, y1_err)` where `f1 = f(t0 + dt, y1)`.
    pub fn step<S, F>(&self, f: &mut F, t0: f64, dt: f64, y0: &S, f0: &S)
        -> Result<(S, S, S)>
    where
        S: OdeState,
        F: FnMut(f64, &S) -> Result<S>,
    {
        let mut k: Vec<S> = Vec::with_capacity(7);
        k.push(f0.clone());
        for i in 1..7 {
            let ti = t0 + dt * ALPHA[i - 1];
            let terms: Vec<(f64, &S)>
                = (0..i).map(|j| (dt * BETA[i - 1][j], &k[j])).collect();
            let yi = y0.add_scaled(&terms);
            let ki = f(ti, &yi)?;
            k.push(ki);
        }
        // the last stage is evaluated at y1 itself
        let terms: Vec<(f64, &S)>
            = (0..6).map(|j| (dt * CSOL5[j], &k[j])).collect();
        let y1 = y0.add_scaled(&terms);
        let err_terms: Vec<(f64, &S)>
            = (1..7).map(|j| (dt * (CSOL5[j] - CSOL4[j]), &k[j])).collect();
        let y1_err
            = k[0].scale(dt * (CSOL5[0] - CSOL4[0]))
            .add_scaled(&err_terms);
        let f1 = k.pop().unwrap_or_else(|| f0.clone());
        Ok((f1, y1, y1_err))
    }

    /// Scaled error norm of a step.
    pub fn get_error<S: OdeState>(&self, y_err: &S, y0: &S, y1: &S) -> f64 {
        S::scaled_norm(y_err, y0, Some(y1), &self.tol)
    }

    /// Initial step size from the two-trial heuristic.
    pub fn init_tstep<S, F>(&self, f: &mut F, t0: f64, y0: &S, f0: &S)
        -> Result<f64>
    where
        S: OdeState,
        F: FnMut(f64, &S) -> Result<S>,
    {
        let d0 = S::scaled_norm(y0, y0, None, &self.tol);
        let d1 = S::scaled_norm(f0, y0, None, &self.tol);
        let h0 = if d0 < 1e-5 || d1 < 1e-5 { 1e-6 } else { 0.01 * d0 / d1 };
        let y1 = y0.add_scaled(&[(h0, f0)]);
        let f1 = f(t0 + h0, &y1)?;
        let df = f1.add_scaled(&[(-1.0, f0)]);
        let d2 = S::scaled_norm(&df, y0, None, &self.tol) / h0;
        let h1
            = if d1 <= 1e-15 && d2 <= 1e-15 {
                (h0 * 1e-3).max(1e-6)
            } else {
                (0.01 / d1.max(d2)).powf(1.0 / (Self::order + 1) as f64)
            };
        Ok((100.0 * h0).min(h1))
    }

    /// Propose the next step size given the error of the last step.
    pub fn update_tstep(&self, dt: f64, error: f64) -> f64 {
        if error == 0.0 {
            return dt * self.tol.max_factor;
        }
        let scale = self.tol.factor * error.powf(-1.0 / Self::order as f64);
        if error <= 1.0 {
            dt * self.tol.max_factor.min(scale.max(1.0))
        } else {
            dt * 0.9_f64.min(scale.max(self.tol.min_factor))
        }
    }

    /// Integrate from `t0` to `t1`, given `y(t0)` and `f(t0, y(t0))`.
    ///
    /// Returns `(y(t1), f(t1, y(t1)))`. The controller state is updated in
    /// place; when the last step is shortened to land on `t1`, the step size
    /// proposed before shortening is carried on.
    pub fn integrate<S, F>(
        &self,
        f: &mut F,
        t0: f64,
        t1: f64,
        y: S,
        ft: S,
        ctrl: &mut StepControl,
        stats: &mut Stats,
    ) -> Result<(S, S)>
    where
        S: OdeState,
        F: FnMut(f64, &S) -> Result<S>,
    {
        let mut cache: StepControl = *ctrl;
        let mut t = t0;
        let mut y = y;
        let mut ft = ft;
        let mut dt = ctrl.dt;
        let mut error = ctrl.error;
        while t < t1 {
            if stats.steps + stats.rejected >= self.tol.max_steps {
                return Err(Error::MaxStepsReached(self.tol.max_steps));
            }
            dt = self.update_tstep(dt, error);
            let mut last = false;
            if t + dt >= t1 {
                // `dt` already includes the update for `error`
                cache = StepControl { dt, error: 1.0 };
                dt = t1 - t;
                last = true;
            }
            if !(dt > 0.0) || t + dt == t {
                return Err(Error::StepSizeUnderflow { t, dt });
            }
            let (f_new, y_new, y_err) = self.step(f, t, dt, &y, &ft)?;
            error = self.get_error(&y_err, &y, &y_new);
            if !error.is_finite() {
                // treat as a hard rejection
                error = f64::MAX;
            }
            if error <= 1.0 {
                t = if last { t1 } else { t + dt };
                y = y_new;
                ft = f_new;
                stats.steps += 1;
            } else {
                trace!(t, dt, error, "rejected step");
                stats.rejected += 1;
            }
        }
        *ctrl = cache;
        Ok((y, ft))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn dp() -> Dopri5 {
        Dopri5::new(Tolerances {
            atol: 1e-8,
            rtol: 1e-6,
            factor: 0.9,
            min_factor: 0.2,
            max_factor: 5.0,
            max_steps: 100_000,
        })
    }

    #[test]
    fn update_zero_error_grows_by_max_factor() {
        assert_eq!(dp().update_tstep(0.1, 0.0), 0.1 * 5.0);
    }

    #[test]
    fn update_rejection_shrinks() {
        let dt = 0.1;
        let new = dp().update_tstep(dt, 1.0 + 1e-9);
        assert!(new < dt);
        assert!(new >= 0.2 * dt);
        // accepted steps never shrink
        assert!(dp().update_tstep(dt, 0.999) >= dt);
        assert!(dp().update_tstep(dt, 1e-12) <= 5.0 * dt);
    }

    #[test]
    fn exponential_decay() {
        // dy/dt = -y, batched over two members with different initial values
        let y0: nd::Array3<C64>
            = nd::Array3::from_shape_vec(
                (2, 1, 1), vec![C64::from(1.0), C64::from(2.0)]).unwrap();
        let mut f = |_t: f64, y: &nd::Array3<C64>| -> Result<nd::Array3<C64>> {
            Ok(y * C64::from(-1.0))
        };
        let d = dp();
        let f0 = f(0.0, &y0).unwrap();
        let mut ctrl = StepControl {
            dt: d.init_tstep(&mut f, 0.0, &y0, &f0).unwrap(),
            error: 1.0,
        };
        let mut stats = Stats::default();
        let (y1, _) = d.integrate(&mut f, 0.0, 2.0, y0, f0, &mut ctrl, &mut stats)
            .unwrap();
        assert_relative_eq!(y1[[0, 0, 0]].re, (-2.0_f64).exp(), max_relative = 1e-5);
        assert_relative_eq!(y1[[1, 0, 0]].re, 2.0 * (-2.0_f64).exp(), max_relative = 1e-5);
        assert!(stats.steps > 5);
    }

    #[test]
    fn checkpoints_carry_the_proposed_step() {
        let y0: nd::Array3<C64> = nd::Array3::from_elem((1, 1, 1), C64::from(1.0));
        let mut f = |_t: f64, y: &nd::Array3<C64>| -> Result<nd::Array3<C64>> {
            Ok(y * C64::from(-1.0))
        };
        let d = dp();
        let f0 = f(0.0, &y0).unwrap();
        let mut ctrl = StepControl { dt: 0.1, error: 0.5 };
        let mut stats = Stats::default();
        let (y1, f1) = d.integrate(&mut f, 0.0, 1e-3, y0, f0, &mut ctrl, &mut stats)
            .unwrap();
        let proposed = d.update_tstep(0.1, 0.5);
        assert_eq!(ctrl, StepControl { dt: proposed, error: 1.0 });
        // the next segment starts from the proposal without growing it again
        d.integrate(&mut f, 1e-3, 2e-3, y1, f1, &mut ctrl, &mut stats).unwrap();
        assert_eq!(ctrl.dt, proposed);
    }

    #[test]
    fn step_budget_is_enforced() {
        let y0: nd::Array3<C64> = nd::Array3::from_elem((1, 1, 1), C64::from(1.0));
        let mut f = |_t: f64, y: &nd::Array3<C64>| -> Result<nd::Array3<C64>> {
            Ok(y * C64::from(-1.0))
        };
        let mut tol = dp().tol;
        tol.max_steps = 3;
        let d = Dopri5::new(tol);
        let f0 = f(0.0, &y0).unwrap();
        let mut ctrl = StepControl { dt: 1e-3, error: 1.0 };
        let mut stats = Stats::default();
        let res = d.integrate(&mut f, 0.0, 10.0, y0, f0, &mut ctrl, &mut stats);
        assert!(matches!(res, Err(Error::MaxStepsReached(3))));
    }
}
