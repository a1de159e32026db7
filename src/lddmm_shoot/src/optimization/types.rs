//! Type definitions for LDDMM momentum optimization.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use super::debug::IterationDebug;

/// Configuration for LDDMM surface matching.
#[derive(Debug, Clone)]
pub struct LddmmConfig {
    /// Bandwidth of the Gaussian velocity kernel.
    pub velocity_sigma: f64,

    /// Bandwidth of the Gaussian part of the varifold kernel.
    pub varifold_sigma: f64,

    /// Weight of the deformation energy in the loss (0 = pure matching).
    pub gamma: f64,

    /// Number of Ralston steps per shooting.
    pub time_steps: usize,

    /// Total integration time; the step is `horizon / time_steps`.
    pub horizon: f64,

    /// Number of outer optimizer steps.
    pub outer_iterations: usize,

    /// Quasi-Newton iterations per outer step.
    pub max_inner_iterations: usize,

    /// Use More-Thuente line search; otherwise a fixed learning rate.
    pub use_line_search: bool,

    /// Step length (line search start or fixed step).
    pub learning_rate: f64,

    /// Stop once the relative loss decrease of an outer step falls below this.
    /// Zero disables the check, so the full outer budget is used.
    pub relative_tolerance: f64,
}

impl Default for LddmmConfig {
    fn default() -> Self {
        Self {
            velocity_sigma: 20.0,
            varifold_sigma: 20.0,
            gamma: 0.0,
            time_steps: 10,
            horizon: 1.0,
            outer_iterations: 5,
            max_inner_iterations: 20,
            use_line_search: true,
            learning_rate: 1.0,
            relative_tolerance: 0.0,
        }
    }
}

impl LddmmConfig {
    /// Default configuration with both kernels at bandwidth `sigma`.
    pub fn with_sigma(sigma: f64) -> Self {
        Self {
            velocity_sigma: sigma,
            varifold_sigma: sigma,
            ..Default::default()
        }
    }
}

/// Status of LDDMM optimization convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    /// Gradient or loss change below tolerance.
    Converged,

    /// Outer step budget used up.
    MaxIterations,

    /// The line search could not decrease the loss.
    LineSearchFailed,
}

impl ConvergenceStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceStatus::Converged)
    }

    /// Converged or ran out of budget; the momentum is the best one found either way.
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            ConvergenceStatus::Converged | ConvergenceStatus::MaxIterations
        )
    }
}

/// Result of LDDMM surface matching.
#[derive(Debug, Clone)]
pub struct MatchResult {
    /// Optimized initial momentum (N×3, co-indexed with the source vertices).
    pub momentum: DMatrix<f64>,

    /// Source vertices shot with `momentum`.
    pub deformed: DMatrix<f64>,

    /// Data attachment at the initial momentum (the undeformed source when
    /// starting from zero).
    pub initial_data: f64,

    /// Data attachment of `deformed`.
    pub final_data: f64,

    /// `gamma * energy + final_data`.
    pub final_loss: f64,

    /// Hamiltonian at `(momentum, source)`.
    pub energy: f64,

    pub status: ConvergenceStatus,

    /// Outer steps performed.
    pub iterations: usize,

    /// Loss evaluations, line searches included.
    pub evaluations: usize,

    /// One record per outer step.
    pub history: Vec<IterationDebug>,
}

impl MatchResult {
    /// Relative data-attachment reduction, `1 - final / initial`.
    pub fn data_reduction(&self) -> f64 {
        if self.initial_data > 0.0 {
            1.0 - self.final_data / self.initial_data
        } else {
            0.0
        }
    }
}
