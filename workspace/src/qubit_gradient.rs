#![allow(dead_code, non_snake_case, non_upper_case_globals)]

//! Gradient ascent on the amplitudes of a piecewise-constant pulse driving a
//! decaying qubit from `|g⟩` to `|e⟩`, with gradients from the checkpointed
//! adjoint pass.

use itertools::Itertools;
use ndarray as nd;
use num_complex::Complex64 as C64;
use qdynamics_sim::{
    c,
    Cotangent,
    Method,
    Options,
    Param,
    Problem,
    TimeOp,
    operators::{ fock_dm, sigmam, sigmap, sigmax },
};
use tracing::{ debug, info };
use tracing_subscriber::{ fmt, prelude::*, EnvFilter };

const NSEG: usize = 8;
const TMAX: f64 = 2.0;
const GAMMA: f64 = 0.05; // decay rate
const DT: f64 = 1e-3;
const RATE: f64 = 2.0; // ascent step
const MAXITERS: usize = 100;
const EPSILON: f64 = 1e-6;

fn init_logging(level: &str) {
    let filter
        = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

fn segment_times() -> Vec<f64> {
    (0..=NSEG).map(|k| TMAX * k as f64 / NSEG as f64).collect()
}

fn pulse(amps: &[f64]) -> anyhow::Result<TimeOp<'static>> {
    let values: nd::Array2<C64>
        = nd::Array2::from_shape_fn((1, NSEG), |(_, k)| c!(amps[k]));
    Ok(TimeOp::pwc(&segment_times(), values, sigmax() * 0.5)?)
}

// derivative of the pulse with respect to the amplitude of segment `k`
fn dpulse(k: usize) -> anyhow::Result<TimeOp<'static>> {
    let values: nd::Array2<C64>
        = nd::Array2::from_shape_fn((1, NSEG), |(_, j)| {
            if j == k { c!(1.0) } else { c!(0.0) }
        });
    Ok(TimeOp::pwc(&segment_times(), values, sigmax() * 0.5)?)
}

/// Excited-state population at `TMAX` and its gradient.
fn population_and_gradient(amps: &[f64]) -> anyhow::Result<(f64, Vec<f64>)> {
    let params: Vec<Param>
        = (0..NSEG)
        .map(|k| -> anyhow::Result<Param> {
            Ok(Param::real(format!("a{k}")).with_dH(dpulse(k)?))
        })
        .collect::<anyhow::Result<_>>()?;
    let problem
        = Problem::lindblad(
            pulse(amps)?,
            vec![sigmam() * GAMMA.sqrt()],
            fock_dm(2, 1)?,
            segment_times()[1..].to_vec(),
        )
        .exp_ops(vec![sigmap().dot(&sigmam())])
        .method(Method::Rouchon2 { dt: DT })
        .options(Options::default().save_states(true))
        .params(params);
    let result = problem.solve()?;
    let last = result.tsave.len() - 1;
    let pop = result.expects[[0, 0, last]].re;
    let grads = problem.backward(&result, &Cotangent::final_expect(&result, 0)?)?;
    debug!(steps = grads.stats.steps, "backward pass");
    let grad: Vec<f64> = grads.params.iter().map(|(_, g)| g.re).collect();
    Ok((pop, grad))
}

fn main() -> anyhow::Result<()> {
    init_logging("info");

    let mut amps: Vec<f64> = vec![0.5; NSEG];
    let mut pop = 0.0;
    for iter in 0..MAXITERS {
        let (p, grad) = population_and_gradient(&amps)?;
        let norm = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        info!(iter, population = p, grad_norm = norm);
        pop = p;
        if norm < EPSILON { break; }
        amps.iter_mut().zip(&grad).for_each(|(a, g)| { *a += RATE * g; });
    }
    println!("final population: {pop:.6}");
    println!("amplitudes: [{}]", amps.iter().map(|a| format!("{a:.4}")).join(", "));
    Ok(())
}
