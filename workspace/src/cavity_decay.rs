#![allow(dead_code, non_snake_case, non_upper_case_globals)]

//! Driven, damped cavity over a batch of detunings, integrated with a Rouchon
//! scheme and with the adaptive integrator for comparison.
//!
//! Usage: `cavity_decay [method.toml]`, where the optional file holds a
//! method description such as
//! ```toml
//! kind = "rouchon2"
//! dt = 0.001
//! ```

use anyhow::Context;
use itertools::Itertools;
use ndarray as nd;
use num_complex::Complex64 as C64;
use qdynamics_sim::{
    c,
    Method,
    Options,
    TimeOp,
    mesolve,
    operators::{ coherent_dm, create, destroy, number },
};
use tracing::info;
use tracing_subscriber::{ fmt, prelude::*, EnvFilter };

const NMAX: usize = 15;
const KAPPA: f64 = 0.5; // decay rate
const DRIVE: f64 = 0.8; // drive amplitude
const DETUNINGS: [f64; 3] = [-1.0, 0.0, 1.0];
const ALPHA0: f64 = 1.5;
const TMAX: f64 = 10.0;
const NSAVE: usize = 21;

fn init_logging(level: &str) {
    let filter
        = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

fn hamiltonians() -> anyhow::Result<TimeOp<'static>> {
    let a = destroy(NMAX);
    let drive = (&a + &create(NMAX)) * DRIVE;
    let Hs: Vec<nd::Array2<C64>>
        = DETUNINGS.iter()
        .map(|delta| number(NMAX) * *delta + &drive)
        .collect();
    let H: nd::Array3<C64>
        = nd::stack(nd::Axis(0), &Hs.iter().map(|H| H.view()).collect::<Vec<_>>())?;
    Ok(TimeOp::constant_batched(H)?)
}

fn main() -> anyhow::Result<()> {
    init_logging("info");

    let method: Method
        = match std::env::args().nth(1) {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading method from {path}"))?;
                Method::from_toml_str(&text)?
            },
            None => Method::Rouchon2 { dt: 1e-3 },
        };
    let tsave: Vec<f64>
        = (0..NSAVE).map(|k| TMAX * k as f64 / (NSAVE - 1) as f64).collect();
    let jump_ops = vec![destroy(NMAX) * KAPPA.sqrt()];
    let rho0 = coherent_dm(NMAX, c!(ALPHA0))?;
    let exp_ops = vec![number(NMAX)];
    let options = Options::default().save_states(false).verbose(true);

    let fixed = mesolve(
        hamiltonians()?, jump_ops.clone(), rho0.clone(), tsave.clone(),
        exp_ops.clone(), method, options,
    )?;
    let adaptive = mesolve(
        hamiltonians()?, jump_ops, rho0, tsave.clone(),
        exp_ops, Method::default(), options,
    )?;
    info!(
        fixed = ?fixed.elapsed(),
        adaptive = ?adaptive.elapsed(),
        adaptive_steps = adaptive.stats.steps,
        "finished",
    );

    println!("# t, {}", DETUNINGS.iter().map(|d| format!("<n>(Δ={d:+.1})")).join(", "));
    for (k, t) in tsave.iter().enumerate() {
        let row
            = (0..DETUNINGS.len())
            .map(|b| format!("{:.6}", fixed.expects[[b, 0, k]].re))
            .join(", ");
        println!("{t:.2}, {row}");
    }
    let max_dev: f64
        = (&fixed.expects - &adaptive.expects).iter()
        .map(|x| x.norm())
        .fold(0.0, f64::max);
    println!("# max |<n>_{} - <n>_dopri5| = {max_dev:.3e}", method.name());
    Ok(())
}
