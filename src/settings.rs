//! Run-time options of the linearizer and the linear solver backend.
use crate::Error;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearizerSettings {
    /// Also linearize elements outside of the interior partition.
    pub linearize_non_local_elements: bool,
    /// Serialize all accumulation into the global system behind a single lock.
    pub use_linearization_lock: bool,
    /// Query the problem for constraint DOFs.
    pub enable_constraints: bool,
    /// Number of worker threads. `None` uses the rayon default.
    pub num_threads: Option<usize>,
}

impl Default for LinearizerSettings {
    fn default() -> Self {
        Self {
            linearize_non_local_elements: false,
            use_linearization_lock: false,
            enable_constraints: false,
            num_threads: None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KrylovMethod {
    BiCgStab,
    Cg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearSolverSettings {
    /// Number of algebraic overlap layers.
    pub overlap_size: usize,
    /// Required reduction of the residual norm.
    pub tolerance: f64,
    /// Residual norm below which the solve is accepted regardless of the reduction.
    pub abs_tolerance: f64,
    pub max_iterations: usize,
    /// 0: silent, 1: summary per solve, 2: every iteration.
    pub verbosity: u32,
    pub method: KrylovMethod,
    /// Number of sweeps (Jacobi, SOR) or fill level (ILU) of the preconditioner.
    pub preconditioner_order: usize,
    pub preconditioner_relaxation: f64,
}

impl Default for LinearSolverSettings {
    fn default() -> Self {
        Self {
            overlap_size: 2,
            tolerance: 1e-8,
            abs_tolerance: 0.0,
            max_iterations: 1000,
            verbosity: 0,
            method: KrylovMethod::BiCgStab,
            preconditioner_order: 0,
            preconditioner_relaxation: 1.0,
        }
    }
}

macro_rules! impl_from_json {
    ($settings:ty) => {
        impl $settings {
            /// Parses settings from JSON. Missing fields take their default values.
            pub fn from_json_str(json: &str) -> Result<Self, Error> {
                serde_json::from_str(json).map_err(|err| Error::Configuration(err.to_string()))
            }

            pub fn to_json_string(&self) -> Result<String, Error> {
                serde_json::to_string_pretty(self).map_err(|err| Error::Configuration(err.to_string()))
            }
        }
    };
}

impl_from_json!(LinearizerSettings);
impl_from_json!(LinearSolverSettings);

impl LinearSolverSettings {
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.tolerance >= 0.0) || !(self.abs_tolerance >= 0.0) {
            return Err(Error::Configuration("Tolerances must be non-negative".to_string()));
        }
        if !(self.preconditioner_relaxation > 0.0) {
            return Err(Error::Configuration(
                "Preconditioner relaxation must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
