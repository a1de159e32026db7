//! Surface matcher parameters
//!
//! Loaded from an optional JSON file; every field has a default so a partial
//! file (or none at all) is valid.

use std::path::Path;

use anyhow::{Context, Result};
use lddmm_shoot::{KernelSpec, LddmmConfig};
use serde::{Deserialize, Serialize};

/// Kernel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelParams {
    /// Velocity kernel; must be of the `gaussian` family
    pub velocity: KernelSpec,
    /// Varifold kernel; must be of the `gaussian_linear` family
    pub varifold: KernelSpec,
}

impl Default for KernelParams {
    fn default() -> Self {
        Self {
            velocity: KernelSpec::gaussian(20.0),
            varifold: KernelSpec::gaussian_linear(20.0),
        }
    }
}

/// Geodesic shooting configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntegrationParams {
    pub time_steps: usize,
    pub horizon: f64,
}

impl Default for IntegrationParams {
    fn default() -> Self {
        Self {
            time_steps: 10,
            horizon: 1.0,
        }
    }
}

/// Optimizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerParams {
    /// Weight of the deformation energy
    pub gamma: f64,
    pub outer_iterations: usize,
    pub max_inner_iterations: usize,
    pub line_search: bool,
    pub learning_rate: f64,
    /// 0 disables early stopping on small relative decrease
    pub relative_tolerance: f64,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self {
            gamma: 0.0,
            outer_iterations: 5,
            max_inner_iterations: 20,
            line_search: true,
            learning_rate: 1.0,
            relative_tolerance: 0.0,
        }
    }
}

/// All matcher parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatcherParams {
    pub kernels: KernelParams,
    pub integration: IntegrationParams,
    pub optimizer: OptimizerParams,
}

impl MatcherParams {
    /// Load parameters from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read parameter file {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("invalid parameter file {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Library configuration, with kernel families checked
    pub fn to_config(&self) -> Result<LddmmConfig> {
        let velocity = self
            .kernels
            .velocity
            .build_gaussian()
            .context("kernels.velocity")?;
        let varifold = self
            .kernels
            .varifold
            .build_gaussian_linear()
            .context("kernels.varifold")?;

        Ok(LddmmConfig {
            velocity_sigma: velocity.sigma(),
            varifold_sigma: varifold.sigma(),
            gamma: self.optimizer.gamma,
            time_steps: self.integration.time_steps,
            horizon: self.integration.horizon,
            outer_iterations: self.optimizer.outer_iterations,
            max_inner_iterations: self.optimizer.max_inner_iterations,
            use_line_search: self.optimizer.line_search,
            learning_rate: self.optimizer.learning_rate,
            relative_tolerance: self.optimizer.relative_tolerance,
        })
    }
}
