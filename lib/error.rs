//! Error types for simulation setup and integration.

use ndarray_linalg::error::LinalgError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid arguments or options.
    #[error("configuration error: {0}")]
    Config(String),

    /// Arrays or operators with incompatible shapes.
    #[error("shape error: {0}")]
    Shape(String),

    /// A save time that cannot be reached with a whole number of fixed steps.
    #[error(
        "for fixed time step methods, every value of `{name}` must be a \
        multiple of the time step `dt`, but `dt={dt:.3e}` and \
        `{name}[{index}]={value:.3e}`"
    )]
    NotMultipleOfDt {
        name: &'static str,
        index: usize,
        value: f64,
        dt: f64,
    },

    /// The requested operation is not available for a given method.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("linear algebra error: {0}")]
    Linalg(#[from] LinalgError),

    /// The adaptive integrator exceeded its step budget.
    #[error("maximum number of steps ({0}) reached before the final time")]
    MaxStepsReached(usize),

    /// The adaptive step size collapsed below floating-point resolution.
    #[error("step size underflow at t = {t:.6e} (dt = {dt:.3e})")]
    StepSizeUnderflow { t: f64, dt: f64 },

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn shape<S: Into<String>>(msg: S) -> Self {
        Self::Shape(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dt_message_names_index() {
        let err = Error::NotMultipleOfDt {
            name: "tsave",
            index: 2,
            value: 0.25,
            dt: 0.1,
        };
        let msg = err.to_string();
        assert!(msg.contains("tsave[2]"));
        assert!(msg.contains("dt=1.000e-1"));
    }
}
