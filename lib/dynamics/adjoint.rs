//! Checkpointed adjoint drivers.
//!
//! The backward pass starts from the final state of a forward run and the
//! cotangent of the loss at the final save time, then walks back through the
//! save times, which serve as checkpoints. On each segment the state is
//! reconstructed backward in time together with the adjoint variable `a`; at
//! every checkpoint the reconstructed state is replaced by the saved one (when
//! all states were kept) and the cotangents of the loss at that save time are
//! added to `a`. The parameter gradients accumulate `⟨a, ∂Φ/∂p⟩` over every
//! step `Φ` of the scheme (fixed-step methods) or `∫⟨a, ∂f/∂p⟩ dt` (adaptive
//! method), with `⟨x, y⟩ = Σ conj(x) y`.
//!
//! For the adaptive method the augmented system is integrated in reversed
//! time `s = -t`:
//! ```text
//! dy/ds = -f(y)
//! da/ds = f†(a)
//! dg/ds = ⟨a, ∂f/∂p(y)⟩
//! ```
//! with error control on `y` and `a`.

use std::time::Instant;
use ndarray as nd;
use num_complex::Complex64 as C64;
use num_traits::Zero;
use tracing::{ debug, info, trace };
use crate::{
    config::{ Method, Tolerances },
    error::{ Error, Result },
    qutils::inner,
    result::{ Gradients, SolveResult, Stats },
};
use super::{
    Cotangent,
    ParamKind,
    Run,
    dopri::{ Bundle, Dopri5, StepControl },
    forward::all_dops,
    model::{ rhs, rhs_adjoint, rhs_param },
    schemes::Scheme,
};

fn check_compatible(run: &Run, result: &SolveResult, ct: &Cotangent) -> Result<()> {
    let (B, n, m) = run.y0.dim();
    let nsave = run.tsave.len();
    let (rb, rslots, rn, rm) = result.states.dim();
    if rb != B || rn != n || rm != m || (rslots != nsave && rslots != 1) {
        return Err(Error::shape(format!(
            "forward result has states of shape {:?}, which does not match a \
            batch of {B} states of shape ({n}, {m})",
            result.states.shape(),
        )));
    }
    if result.tsave != *run.tsave || result.t0 != run.t0 {
        return Err(Error::config(
            "forward result was computed for different save times"));
    }
    if result.expects.dim() != (B, run.exp_ops.len(), nsave) {
        return Err(Error::shape(format!(
            "forward result has expectation values of shape {:?}, expected \
            ({B}, {}, {nsave})",
            result.expects.shape(), run.exp_ops.len(),
        )));
    }
    if ct.states.dim() != result.states.dim()
        || ct.expects.dim() != result.expects.dim()
    {
        return Err(Error::shape(format!(
            "cotangent shapes {:?} and {:?} do not match the forward result \
            shapes {:?} and {:?}",
            ct.states.shape(), ct.expects.shape(),
            result.states.shape(), result.expects.shape(),
        )));
    }
    Ok(())
}

/// Add the cotangents of the loss at save index `k` to the adjoint variable,
/// given the states `y` at that save time.
fn add_cotangent(
    run: &Run,
    ct: &Cotangent,
    k: usize,
    slot: Option<usize>,
    y: &nd::Array3<C64>,
    a: &mut nd::Array3<C64>,
)
{
    if let Some(slot) = slot {
        *a += &ct.states.index_axis(nd::Axis(1), slot);
    }
    if run.exp_ops.is_empty() { return; }
    for (i, (mut ai, yi)) in a.outer_iter_mut().zip(y.outer_iter()).enumerate() {
        let g = ct.expects.slice(nd::s![i, .., k]);
        ai += &run.expect_cotangent(g, yi);
    }
}

/// Run the backward pass for a validated run.
pub(crate) fn run(run: &Run, result: &SolveResult, ct: &Cotangent)
    -> Result<Gradients>
{
    check_compatible(run, result, ct)?;
    let start_time = Instant::now();
    let nparams = run.params.len();
    let nsave = run.tsave.len();
    let last = nsave - 1;
    let saved_all = result.saved_all();
    if run.options.verbose {
        info!(
            method = run.method.name(),
            batch = run.len(),
            nparams,
            checkpoints = if saved_all { nsave } else { 1 },
            "starting backward pass",
        );
    }

    let mut stats = Stats::default();
    let mut g: Vec<C64> = vec![C64::zero(); nparams];
    let mut y: nd::Array3<C64> = result.final_state().to_owned();
    let mut a: nd::Array3<C64> = nd::Array3::zeros(y.raw_dim());
    let last_slot = if saved_all { last } else { 0 };
    add_cotangent(run, ct, last, Some(last_slot), &y, &mut a);

    let mut t = run.tsave[last];
    let targets
        = (0..last).rev()
        .map(|k| (run.tsave[k], Some(k)))
        .chain(std::iter::once((run.t0, None)));
    for (t_to, k) in targets {
        if t_to < t {
            debug!(t_from = t, t_to, "backward segment");
            segment(run, t, t_to, &mut y, &mut a, &mut g, &mut stats)?;
        }
        if let Some(k) = k {
            if saved_all {
                y.assign(&result.states.index_axis(nd::Axis(1), k));
            }
            let slot = saved_all.then_some(k);
            add_cotangent(run, ct, k, slot, &y, &mut a);
        }
        t = t_to;
    }

    // a(t0) = ∂L/∂y0 for every flat member
    let y0_batch = run.y0_supplied.as_batch();
    let mut grad_y0: nd::Array3<C64> = nd::Array3::zeros(y0_batch.raw_dim());
    for (i, ai) in a.outer_iter().enumerate() {
        let mut target = grad_y0.index_axis_mut(nd::Axis(0), run.layout.y_idx(i));
        target += &ai;
    }
    for (gp, param) in g.iter_mut().zip(run.params) {
        if let Some(dy0) = &param.dy0 {
            let dy0 = dy0.as_batch();
            *gp += grad_y0.outer_iter().zip(dy0.outer_iter())
                .map(|(ak, dk)| inner(&ak, &dk))
                .sum::<C64>();
        }
    }
    let y0: nd::ArrayD<C64>
        = if run.y0_supplied.is_batched() {
            grad_y0.into_dyn()
        } else {
            grad_y0.index_axis_move(nd::Axis(0), 0).into_dyn()
        };
    let params: Vec<(String, C64)>
        = run.params.iter().zip(g)
        .map(|(param, gp)| {
            let grad
                = match param.kind {
                    ParamKind::Real => C64::from(gp.re),
                    ParamKind::Complex => gp.conj(),
                };
            (param.name.clone(), grad)
        })
        .collect();

    if run.options.verbose {
        info!(
            steps = stats.steps,
            rejected = stats.rejected,
            elapsed = ?start_time.elapsed(),
            "finished backward pass",
        );
    } else {
        debug!(steps = stats.steps, "backward pass");
    }
    Ok(Gradients { y0, params, stats })
}

// integrate the state and adjoint from `t_from` back to `t_to < t_from`
fn segment(
    run: &Run,
    t_from: f64,
    t_to: f64,
    y: &mut nd::Array3<C64>,
    a: &mut nd::Array3<C64>,
    g: &mut [C64],
    stats: &mut Stats,
) -> Result<()>
{
    match (run.method, run.scheme) {
        (Method::Dopri5(tol), _) => adaptive_segment(run, tol, t_from, t_to, y, a, g, stats),
        (_, Some(scheme)) => fixed_segment(run, scheme, t_from, t_to, y, a, g, stats),
        (method, None) => Err(Error::NotImplemented(format!(
            "adjoint gradients for method `{}`", method.name()))),
    }
}

fn fixed_segment(
    run: &Run,
    scheme: Scheme,
    t_from: f64,
    t_to: f64,
    y: &mut nd::Array3<C64>,
    a: &mut nd::Array3<C64>,
    g: &mut [C64],
    stats: &mut Stats,
) -> Result<()>
{
    // same steps as the forward pass over this segment, taken in reverse
    for (s, h) in run.fixed_grid(t_to, t_from).into_iter().rev() {
        let ops = run.ops_at(s)?;
        let dops = all_dops(run, s, g.len())?;
        let mut y_prev: nd::Array3<C64> = nd::Array3::zeros(y.raw_dim());
        let mut a_prev: nd::Array3<C64> = nd::Array3::zeros(a.raw_dim());
        for (i, (yi, ai)) in y.outer_iter().zip(a.outer_iter()).enumerate() {
            let op = run.member_ops(&ops, i);
            let (yp, ap) = scheme.backward_augmented(op, h, &yi, &ai)?;
            for (gp, dops_p) in g.iter_mut().zip(&dops) {
                let dstep
                    = scheme.tangent(
                        op, h, &yp.view(), None, Some(run.member_dops(dops_p, i)))?;
                *gp += inner(&ai, &dstep);
            }
            y_prev.index_axis_mut(nd::Axis(0), i).assign(&yp);
            a_prev.index_axis_mut(nd::Axis(0), i).assign(&ap);
        }
        *y = y_prev;
        *a = a_prev;
        stats.steps += 1;
    }
    Ok(())
}

fn adaptive_segment(
    run: &Run,
    tol: Tolerances,
    t_from: f64,
    t_to: f64,
    y: &mut nd::Array3<C64>,
    a: &mut nd::Array3<C64>,
    g: &mut [C64],
    stats: &mut Stats,
) -> Result<()>
{
    let nparams = g.len();
    let B = run.len();
    let mut f = |s: f64, x: &Bundle| -> Result<Bundle> {
        let t = -s;
        let ops = run.ops_at(t)?;
        let dops = all_dops(run, t, nparams)?;
        let mut dy: nd::Array3<C64> = nd::Array3::zeros(x.parts[0].raw_dim());
        let mut da: nd::Array3<C64> = nd::Array3::zeros(x.parts[1].raw_dim());
        let mut dg: nd::Array3<C64> = nd::Array3::zeros((B, nparams, 1));
        let members = x.parts[0].outer_iter().zip(x.parts[1].outer_iter());
        for (i, (yi, ai)) in members.enumerate() {
            let op = run.member_ops(&ops, i);
            dy.index_axis_mut(nd::Axis(0), i).assign(&(rhs(op, &yi) * -1.0));
            da.index_axis_mut(nd::Axis(0), i).assign(&rhs_adjoint(op, &ai));
            for (p, dops_p) in dops.iter().enumerate() {
                dg[[i, p, 0]]
                    = inner(&ai, &rhs_param(op, run.member_dops(dops_p, i), &yi));
            }
        }
        Ok(Bundle { parts: vec![dy, da, dg], n_controlled: 2 })
    };

    let dp = Dopri5::new(tol);
    let s0 = -t_from;
    let s1 = -t_to;
    let x = Bundle {
        parts: vec![y.clone(), a.clone(), nd::Array3::zeros((B, nparams, 1))],
        n_controlled: 2,
    };
    let fx = f(s0, &x)?;
    let mut ctrl = StepControl { dt: init_tstep(run, &dp, s0, y, a)?, error: 1.0 };
    trace!(dt = ctrl.dt, "initial backward step size");
    let (x, _) = dp.integrate(&mut f, s0, s1, x, fx, &mut ctrl, stats)?;
    let mut parts = x.parts.into_iter();
    if let (Some(y1), Some(a1), Some(g1)) = (parts.next(), parts.next(), parts.next()) {
        *y = y1;
        *a = a1;
        for (p, gp) in g.iter_mut().enumerate() {
            *gp += g1.slice(nd::s![.., p, 0]).sum();
        }
    }
    Ok(())
}

// initial step for a backward segment: the smaller of the proposals for the
// state and for the adjoint variable on their own
fn init_tstep(
    run: &Run,
    dp: &Dopri5,
    s0: f64,
    y: &nd::Array3<C64>,
    a: &nd::Array3<C64>,
) -> Result<f64>
{
    let mut fy = |s: f64, y: &nd::Array3<C64>| -> Result<nd::Array3<C64>> {
        let ops = run.ops_at(-s)?;
        let mut out: nd::Array3<C64> = nd::Array3::zeros(y.raw_dim());
        for (i, yi) in y.outer_iter().enumerate() {
            out.index_axis_mut(nd::Axis(0), i)
                .assign(&(rhs(run.member_ops(&ops, i), &yi) * -1.0));
        }
        Ok(out)
    };
    let mut fa = |s: f64, a: &nd::Array3<C64>| -> Result<nd::Array3<C64>> {
        let ops = run.ops_at(-s)?;
        let mut out: nd::Array3<C64> = nd::Array3::zeros(a.raw_dim());
        for (i, ai) in a.outer_iter().enumerate() {
            out.index_axis_mut(nd::Axis(0), i)
                .assign(&rhs_adjoint(run.member_ops(&ops, i), &ai));
        }
        Ok(out)
    };
    let fy0 = fy(s0, y)?;
    let fa0 = fa(s0, a)?;
    let dt_y = dp.init_tstep(&mut fy, s0, y, &fy0)?;
    let dt_a = dp.init_tstep(&mut fa, s0, a, &fa0)?;
    Ok(dt_y.min(dt_a))
}
