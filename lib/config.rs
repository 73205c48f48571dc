//! Solver options, integration methods, and process-wide defaults.
//!
//! Every run receives its settings explicitly through [`Options`] and
//! [`Method`]. The only global state is a single [`Defaults`] record, consulted
//! by the `Default` impls of [`Options`] and [`Tolerances`], and guarded by an
//! [`RwLock`] behind [`defaults`], [`set_defaults`], and [`reset_defaults`].

use std::sync::RwLock;
use serde::Deserialize;
use crate::error::{ Error, Result };

/// Tolerances and step-size factors for the adaptive Dormand–Prince
/// integrator.
#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Tolerances {
    /// Absolute tolerance.
    pub atol: f64,
    /// Relative tolerance.
    pub rtol: f64,
    /// Safety factor applied to the optimal step size.
    pub factor: f64,
    /// Smallest allowed shrinking of the step size after a rejection.
    pub min_factor: f64,
    /// Largest allowed growth of the step size after an acceptance.
    pub max_factor: f64,
    /// Maximum number of attempted steps over a whole run.
    pub max_steps: usize,
}

impl Default for Tolerances {
    fn default() -> Self { defaults().tolerances }
}

impl Tolerances {
    const BUILTIN: Self = Self {
        atol: 1e-8,
        rtol: 1e-6,
        factor: 0.9,
        min_factor: 0.2,
        max_factor: 5.0,
        max_steps: 100_000,
    };

    /// Check that all tolerances and factors are in range.
    pub fn validate(&self) -> Result<()> {
        if !(self.atol >= 0.0 && self.rtol >= 0.0 && self.atol + self.rtol > 0.0) {
            return Err(Error::config(
                "tolerances must be non-negative and not both zero"));
        }
        if !(self.factor > 0.0 && self.factor <= 1.0) {
            return Err(Error::config("`factor` must be in (0, 1]"));
        }
        if !(self.min_factor > 0.0 && self.min_factor <= 1.0) {
            return Err(Error::config("`min_factor` must be in (0, 1]"));
        }
        if self.max_factor < 1.0 {
            return Err(Error::config("`max_factor` must be at least 1"));
        }
        if self.max_steps == 0 {
            return Err(Error::config("`max_steps` must be positive"));
        }
        Ok(())
    }
}

/// Integration scheme.
#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Method {
    /// Explicit Euler with fixed step.
    Euler { dt: f64 },
    /// First-order Rouchon (Kraus) scheme. With `cholesky`, the state is
    /// normalized through the Cholesky factor of `M0†M0 + dt ΣL†L` instead of
    /// by dividing by its trace.
    Rouchon1 {
        dt: f64,
        #[serde(default)]
        cholesky: bool,
    },
    /// Rouchon scheme of order 1.5, trace preserving by construction.
    Rouchon15 { dt: f64 },
    /// Second-order Rouchon scheme.
    Rouchon2 { dt: f64 },
    /// Exact propagation `exp(-i H Δt)` for piecewise-constant Hamiltonians.
    Expm,
    /// Adaptive Dormand–Prince 5(4).
    Dopri5(Tolerances),
}

impl Default for Method {
    fn default() -> Self { Self::Dopri5(Tolerances::default()) }
}

impl Method {
    /// Read a method from a TOML document, e.g.
    ///
    /// ```toml
    /// kind = "rouchon2"
    /// dt = 0.001
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let method: Self = toml::from_str(s)?;
        method.validate()?;
        Ok(method)
    }

    /// Fixed time step, if the method has one.
    pub fn dt(&self) -> Option<f64> {
        match self {
            Self::Euler { dt }
            | Self::Rouchon1 { dt, .. }
            | Self::Rouchon15 { dt }
            | Self::Rouchon2 { dt } => Some(*dt),
            Self::Expm | Self::Dopri5(_) => None,
        }
    }

    /// Return `true` for the Kraus-map schemes.
    pub fn is_rouchon(&self) -> bool {
        matches!(
            self,
            Self::Rouchon1 { .. } | Self::Rouchon15 { .. } | Self::Rouchon2 { .. }
        )
    }

    /// Short lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Euler { .. } => "euler",
            Self::Rouchon1 { cholesky: false, .. } => "rouchon1",
            Self::Rouchon1 { cholesky: true, .. } => "rouchon1-cholesky",
            Self::Rouchon15 { .. } => "rouchon1_5",
            Self::Rouchon2 { .. } => "rouchon2",
            Self::Expm => "expm",
            Self::Dopri5(_) => "dopri5",
        }
    }

    /// Check that step sizes and tolerances are in range.
    pub fn validate(&self) -> Result<()> {
        if let Some(dt) = self.dt() {
            if !(dt.is_finite() && dt > 0.0) {
                return Err(Error::config(
                    format!("time step must be positive and finite, got {dt}")));
            }
        }
        if let Self::Dopri5(tol) = self { tol.validate()?; }
        Ok(())
    }
}

/// Method used to compute gradients with respect to parameters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradientAlg {
    /// No gradient support.
    #[default]
    None,
    /// Propagate `∂y/∂p` alongside the state during the forward pass.
    Forward,
    /// Checkpointed adjoint pass, run after the forward solve with
    /// [`Problem::backward`][crate::dynamics::Problem::backward].
    Adjoint,
}

/// Options controlling a single run.
#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Keep the state at every save time instead of only the final one.
    pub save_states: bool,
    /// Emit run-level `info` events.
    pub verbose: bool,
    /// Batch over every (Hamiltonian, initial state) pair instead of zipping
    /// them.
    pub cartesian_batching: bool,
    /// Initial time, if different from zero. Must not exceed the first save
    /// time.
    pub t0: Option<f64>,
    pub gradient: GradientAlg,
}

impl Default for Options {
    fn default() -> Self {
        let d = defaults();
        Self {
            save_states: true,
            verbose: false,
            cartesian_batching: d.cartesian_batching,
            t0: None,
            gradient: GradientAlg::None,
        }
    }
}

impl Options {
    /// Read options from a TOML document. Missing keys take their default
    /// values.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn save_states(mut self, save: bool) -> Self {
        self.save_states = save;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn cartesian_batching(mut self, cartesian: bool) -> Self {
        self.cartesian_batching = cartesian;
        self
    }

    pub fn t0(mut self, t0: f64) -> Self {
        self.t0 = Some(t0);
        self
    }

    pub fn gradient(mut self, gradient: GradientAlg) -> Self {
        self.gradient = gradient;
        self
    }
}

/// Process-wide defaults.
///
/// Access is serialized through a lock, but changing the defaults while
/// other threads construct [`Options`] or [`Tolerances`] makes the values
/// they receive depend on timing.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Defaults {
    pub tolerances: Tolerances,
    pub cartesian_batching: bool,
}

impl Defaults {
    const BUILTIN: Self = Self {
        tolerances: Tolerances::BUILTIN,
        cartesian_batching: true,
    };
}

static DEFAULTS: RwLock<Defaults> = RwLock::new(Defaults::BUILTIN);

/// Get a copy of the current defaults.
pub fn defaults() -> Defaults {
    match DEFAULTS.read() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

/// Replace the current defaults.
pub fn set_defaults(new: Defaults) -> Result<()> {
    new.tolerances.validate()?;
    match DEFAULTS.write() {
        Ok(mut guard) => { *guard = new; },
        Err(poisoned) => { *poisoned.into_inner() = new; },
    }
    Ok(())
}

/// Restore the built-in defaults.
pub fn reset_defaults() {
    match DEFAULTS.write() {
        Ok(mut guard) => { *guard = Defaults::BUILTIN; },
        Err(poisoned) => { *poisoned.into_inner() = Defaults::BUILTIN; },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_from_toml() {
        let m = Method::from_toml_str("kind = \"rouchon2\"\ndt = 0.01").unwrap();
        assert_eq!(m, Method::Rouchon2 { dt: 0.01 });
        let m = Method::from_toml_str("kind = \"rouchon1\"\ndt = 0.5").unwrap();
        assert_eq!(m, Method::Rouchon1 { dt: 0.5, cholesky: false });
        let m = Method::from_toml_str("kind = \"dopri5\"\nrtol = 1e-4").unwrap();
        match m {
            Method::Dopri5(tol) => {
                assert_eq!(tol.rtol, 1e-4);
                assert_eq!(tol.atol, 1e-8);
            },
            _ => panic!("expected dopri5"),
        }
    }

    #[test]
    fn bad_dt_rejected() {
        assert!(Method::from_toml_str("kind = \"euler\"\ndt = -1.0").is_err());
        assert!(Method::from_toml_str("kind = \"nope\"").is_err());
    }

    #[test]
    fn options_from_toml() {
        let opts = Options::from_toml_str(
            "save_states = false\ngradient = \"adjoint\"\nt0 = -1.0"
        ).unwrap();
        assert!(!opts.save_states);
        assert_eq!(opts.gradient, GradientAlg::Adjoint);
        assert_eq!(opts.t0, Some(-1.0));
        assert!(!opts.verbose);
    }

    #[test]
    fn builtin_tolerances() {
        let tol = Tolerances::BUILTIN;
        assert_eq!(tol.factor, 0.9);
        assert_eq!(tol.min_factor, 0.2);
        assert_eq!(tol.max_factor, 5.0);
        assert!(tol.validate().is_ok());
        let bad = Tolerances { factor: 0.0, ..tol };
        assert!(bad.validate().is_err());
    }
}
