#![allow(dead_code, non_snake_case, non_upper_case_globals)]

//! Numerical integration of the Schrödinger and Lindblad equations with
//! fixed-step (Euler, Rouchon) and adaptive (Dormand–Prince) schemes, and
//! gradients of scalar losses with respect to physical parameters via
//! checkpointed adjoint or forward-sensitivity passes.

#[doc(hidden)]
pub use num_complex;

pub mod error;
pub mod utils;
pub mod config;
pub mod qutils;
pub mod operators;
pub mod timeop;
pub mod result;
pub mod dynamics;

pub use error::{ Error, Result };
pub use config::{ GradientAlg, Method, Options, Tolerances };
pub use timeop::TimeOp;
pub use result::{ Gradients, PropagatorResult, SolveResult, Stats };
pub use dynamics::{
    Cotangent,
    Equation,
    InitialState,
    Param,
    ParamKind,
    Problem,
    mesolve,
    sepropagator,
    sesolve,
};
