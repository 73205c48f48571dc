//! Forward integration drivers.
//!
//! Both drivers advance the whole flat batch from the initial time through
//! every save time, recording states and expectation values on the way. When
//! forward-mode gradients are requested, the state derivatives `∂y/∂p` are
//! carried along with the state: by the tangent of each fixed step, or as
//! extra components of the adaptive integrator's state obeying
//! `d(∂y/∂p)/dt = f(∂y/∂p) + ∂f/∂p(y)`.

use std::{ iter, time::Instant };
use ndarray as nd;
use num_complex::Complex64 as C64;
use tracing::{ debug, info };
use crate::{
    config::{ GradientAlg, Method, Tolerances },
    error::{ Error, Result },
    qutils::{ expect_state, expect_tangent },
    result::{ Sensitivities, SolveResult, Stats },
};
use super::{
    Run,
    dopri::{ Bundle, Dopri5, StepControl },
    model::{ DOps, rhs, rhs_param },
    schemes::Scheme,
};

/// Accumulates the saved outputs of a run.
struct Saver {
    states: nd::Array4<C64>,
    expects: nd::Array3<C64>,
    dstates: Vec<nd::Array4<C64>>,
    dexpects: Vec<nd::Array3<C64>>,
    save_states: bool,
}

impl Saver {
    fn new(run: &Run, nparams: usize) -> Self {
        let (B, n, m) = run.y0.dim();
        let nsave = run.tsave.len();
        let nslots = if run.options.save_states { nsave } else { 1 };
        let nexp = run.exp_ops.len();
        Self {
            states: nd::Array4::zeros((B, nslots, n, m)),
            expects: nd::Array3::zeros((B, nexp, nsave)),
            dstates: vec![nd::Array4::zeros((B, nslots, n, m)); nparams],
            dexpects: vec![nd::Array3::zeros((B, nexp, nsave)); nparams],
            save_states: run.options.save_states,
        }
    }

    // without `save_states`, slot 0 always holds the latest state
    fn save(&mut self, run: &Run, k: usize, y: &nd::Array3<C64>, dys: &[nd::Array3<C64>]) {
        let slot = if self.save_states { k } else { 0 };
        let ket = run.is_ket();
        self.states.index_axis_mut(nd::Axis(1), slot).assign(y);
        for (dstates, dy) in self.dstates.iter_mut().zip(dys) {
            dstates.index_axis_mut(nd::Axis(1), slot).assign(dy);
        }
        for (i, yi) in y.outer_iter().enumerate() {
            for (j, O) in run.exp_ops.iter().enumerate() {
                self.expects[[i, j, k]] = expect_state(O, &yi, ket);
                for (dexpects, dy) in self.dexpects.iter_mut().zip(dys) {
                    dexpects[[i, j, k]]
                        = expect_tangent(O, yi, dy.index_axis(nd::Axis(0), i), ket);
                }
            }
        }
    }
}

/// Integrate a validated run forward.
pub(crate) fn run(run: &Run) -> Result<SolveResult> {
    let start_time = Instant::now();
    let nparams
        = if run.options.gradient == GradientAlg::Forward { run.params.len() }
        else { 0 };
    if run.options.verbose {
        info!(
            method = run.method.name(),
            batch = run.len(),
            nsave = run.tsave.len(),
            nparams,
            "starting forward integration",
        );
    } else {
        debug!(method = run.method.name(), batch = run.len(), "forward integration");
    }

    let y0 = run.y0.clone();
    let dy0: Vec<nd::Array3<C64>>
        = run.params.iter().take(nparams)
        .map(|p| match &p.dy0 {
            Some(dy0) => run.expand(dy0),
            None => nd::Array3::zeros(y0.raw_dim()),
        })
        .collect();
    let mut saver = Saver::new(run, nparams);
    let mut stats = Stats::default();
    match (run.method, run.scheme) {
        (Method::Dopri5(tol), _) => {
            adaptive(run, tol, y0, dy0, &mut saver, &mut stats)?;
        },
        (_, Some(scheme)) => {
            fixed(run, scheme, y0, dy0, &mut saver, &mut stats)?;
        },
        (method, None) => {
            return Err(Error::NotImplemented(format!(
                "forward integration with method `{}`", method.name())));
        },
    }

    let end_time = Instant::now();
    if run.options.verbose {
        info!(
            steps = stats.steps,
            rejected = stats.rejected,
            elapsed = ?(end_time - start_time),
            "finished forward integration",
        );
    }
    let sensitivities
        = (nparams > 0).then(|| Sensitivities {
            names: run.params.iter().map(|p| p.name.clone()).collect(),
            states: saver.dstates,
            expects: saver.dexpects,
        });
    Ok(SolveResult {
        tsave: run.tsave.clone(),
        t0: run.t0,
        states: saver.states,
        expects: saver.expects,
        sensitivities,
        batch_shape: run.layout.batch_shape.clone(),
        is_ket: run.is_ket(),
        method: run.method,
        options: run.options,
        stats,
        start_time,
        end_time,
    })
}

/// Operator derivatives for the first `nparams` parameters at time `t`.
pub(crate) fn all_dops(run: &Run, t: f64, nparams: usize) -> Result<Vec<Vec<DOps>>> {
    (0..nparams).map(|p| run.dops_at(t, p)).collect()
}

fn fixed(
    run: &Run,
    scheme: Scheme,
    mut y: nd::Array3<C64>,
    mut dys: Vec<nd::Array3<C64>>,
    saver: &mut Saver,
    stats: &mut Stats,
) -> Result<()>
{
    let mut t = run.t0;
    for (k, &ts) in run.tsave.iter().enumerate() {
        for (s, h) in run.fixed_grid(t, ts) {
            let ops = run.ops_at(s)?;
            let dops = all_dops(run, s, dys.len())?;
            let mut y_new: nd::Array3<C64> = nd::Array3::zeros(y.raw_dim());
            let mut dys_new: Vec<nd::Array3<C64>>
                = vec![nd::Array3::zeros(y.raw_dim()); dys.len()];
            for (i, yi) in y.outer_iter().enumerate() {
                let op = run.member_ops(&ops, i);
                y_new.index_axis_mut(nd::Axis(0), i)
                    .assign(&scheme.forward(op, h, &yi)?);
                for ((dy, dy_new), dops_p) in dys.iter().zip(dys_new.iter_mut()).zip(&dops) {
                    let dyi = dy.index_axis(nd::Axis(0), i);
                    let step
                        = scheme.tangent(
                            op, h, &yi, Some(&dyi), Some(run.member_dops(dops_p, i)))?;
                    dy_new.index_axis_mut(nd::Axis(0), i).assign(&step);
                }
            }
            y = y_new;
            dys = dys_new;
            stats.steps += 1;
        }
        t = ts;
        debug!(t, k, "checkpoint");
        saver.save(run, k, &y, &dys);
    }
    Ok(())
}

fn adaptive(
    run: &Run,
    tol: Tolerances,
    y: nd::Array3<C64>,
    dys: Vec<nd::Array3<C64>>,
    saver: &mut Saver,
    stats: &mut Stats,
) -> Result<()>
{
    let nparams = dys.len();
    let mut f = |t: f64, x: &Bundle| -> Result<Bundle> {
        let ops = run.ops_at(t)?;
        let dops = all_dops(run, t, nparams)?;
        let mut parts: Vec<nd::Array3<C64>>
            = vec![nd::Array3::zeros(x.parts[0].raw_dim()); nparams + 1];
        for (i, yi) in x.parts[0].outer_iter().enumerate() {
            let op = run.member_ops(&ops, i);
            parts[0].index_axis_mut(nd::Axis(0), i).assign(&rhs(op, &yi));
            for (p, dops_p) in dops.iter().enumerate() {
                let dyi = x.parts[p + 1].index_axis(nd::Axis(0), i);
                let dfi
                    = rhs(op, &dyi) + rhs_param(op, run.member_dops(dops_p, i), &yi);
                parts[p + 1].index_axis_mut(nd::Axis(0), i).assign(&dfi);
            }
        }
        Ok(Bundle { parts, n_controlled: x.n_controlled })
    };

    let dp = Dopri5::new(tol);
    let mut x = Bundle {
        parts: iter::once(y).chain(dys).collect(),
        n_controlled: nparams + 1,
    };
    let mut fx = f(run.t0, &x)?;
    let mut ctrl = StepControl {
        dt: dp.init_tstep(&mut f, run.t0, &x, &fx)?,
        error: 1.0,
    };
    debug!(dt = ctrl.dt, "initial step size");
    let mut t = run.t0;
    for (k, &ts) in run.tsave.iter().enumerate() {
        let (x_new, f_new) = dp.integrate(&mut f, t, ts, x, fx, &mut ctrl, stats)?;
        x = x_new;
        fx = f_new;
        t = ts;
        debug!(t, k, dt = ctrl.dt, "checkpoint");
        saver.save(run, k, &x.parts[0], &x.parts[1..]);
    }
    Ok(())
}
