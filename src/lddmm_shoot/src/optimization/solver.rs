//! LDDMM momentum optimization driver.
//!
//! This module runs the outer loop of a registration:
//! 1. Evaluate the loss and its gradient at the current momentum
//!    (shooting, data attachment, backward pass through the integration)
//! 2. Run one L-BFGS step, which updates the momentum in place
//! 3. Record the loss parts and log progress
//! 4. Stop on convergence, line search failure, or after `outer_iterations`

use nalgebra::DMatrix;
use tracing::{debug, info, warn};

use super::debug::IterationDebug;
use super::lbfgs::{Lbfgs, LbfgsConfig, LineSearchKind, StepOutcome};
use super::types::{ConvergenceStatus, LddmmConfig, MatchResult};
use crate::autodiff::{GradientOracle, Var};
use crate::error::{ensure_shape, LddmmError, Result};
use crate::kernel::VelocityKernel;
use crate::loss::LddmmLoss;
use crate::time_phase;
use crate::timing::{MatchTiming, Phase, TimingCollector};
use crate::varifold::DataAttachment;

/// Configuration for the optimization process.
#[derive(Debug, Clone)]
pub struct OptimizationConfig {
    /// Number of outer L-BFGS steps.
    pub outer_iterations: usize,

    /// Inner optimizer configuration.
    pub lbfgs: LbfgsConfig,

    /// Stop once `(before - after) <= relative_tolerance * |before|` for an
    /// outer step. Zero disables the check.
    pub relative_tolerance: f64,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            outer_iterations: 5,
            lbfgs: LbfgsConfig::default(),
            relative_tolerance: 0.0,
        }
    }
}

impl From<&LddmmConfig> for OptimizationConfig {
    fn from(config: &LddmmConfig) -> Self {
        let line_search = if config.use_line_search {
            LineSearchKind::MoreThuente
        } else {
            LineSearchKind::Fixed
        };
        Self {
            outer_iterations: config.outer_iterations,
            lbfgs: LbfgsConfig {
                learning_rate: config.learning_rate,
                max_iterations: config.max_inner_iterations,
                max_evaluations: config.max_inner_iterations * 5 / 4,
                line_search,
                ..Default::default()
            },
            relative_tolerance: config.relative_tolerance,
        }
    }
}

/// Minimizes an [`LddmmLoss`] over the initial momentum with L-BFGS.
#[derive(Debug, Clone, Default)]
pub struct LddmmOptimizer {
    config: OptimizationConfig,
}

impl LddmmOptimizer {
    pub fn new(config: OptimizationConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::default()
    }

    pub fn config(&self) -> &OptimizationConfig {
        &self.config
    }

    /// Optimize the momentum starting from `initial_momentum`.
    ///
    /// Trial momenta whose shooting blows up or collapses a face count as
    /// `+inf` so the line search retreats; a non-finite loss at the starting
    /// momentum is an error.
    pub fn optimize<K, A, O>(
        &self,
        loss: &LddmmLoss<K, A, O>,
        initial_momentum: DMatrix<f64>,
    ) -> Result<MatchResult>
    where
        K: VelocityKernel,
        A: DataAttachment,
        O: GradientOracle,
    {
        self.optimize_timed(loss, initial_momentum)
            .map(|(result, _)| result)
    }

    /// Like [`optimize`](Self::optimize), also returning the timing breakdown
    /// (empty unless the `profiling` feature is enabled).
    pub fn optimize_timed<K, A, O>(
        &self,
        loss: &LddmmLoss<K, A, O>,
        initial_momentum: DMatrix<f64>,
    ) -> Result<(MatchResult, MatchTiming)>
    where
        K: VelocityKernel,
        A: DataAttachment,
        O: GradientOracle,
    {
        let source = loss.source();
        ensure_shape(
            "initial momentum",
            source.shape(),
            initial_momentum.shape(),
        )?;

        let mut collector = TimingCollector::new();
        collector.start_match();

        let mut momentum = initial_momentum;
        let initial = loss.evaluate(&Var::constant(momentum.clone()))?;
        let initial_total = initial.total.item();
        if !initial_total.is_finite() {
            return Err(LddmmError::NonFinite("initial loss"));
        }
        let initial_data = initial.data.item();
        debug!(
            vertices = source.nrows(),
            loss = initial_total,
            data = initial_data,
            "Starting LDDMM optimization"
        );

        let mut optimizer = Lbfgs::new(self.config.lbfgs.clone());
        let mut history = Vec::with_capacity(self.config.outer_iterations);
        let mut status = ConvergenceStatus::MaxIterations;
        let zero_gradient = DMatrix::zeros(source.nrows(), source.ncols());

        for iteration in 0..self.config.outer_iterations {
            collector.start_step(iteration);
            let report = optimizer.step(&mut momentum, |p| {
                let evaluated = time_phase!(collector, Phase::Evaluation, {
                    loss.value_and_gradient(p)
                });
                match evaluated {
                    Err(e @ (LddmmError::NonFinite(_) | LddmmError::DegenerateFace { .. })) => {
                        debug!(error = %e, "Trial momentum rejected, loss treated as +inf");
                        Ok((f64::INFINITY, zero_gradient.clone()))
                    }
                    other => other,
                }
            })?;
            let step_timing = collector.end_step();

            let terms = loss.evaluate(&Var::constant(momentum.clone()))?;
            let mut record = IterationDebug::from_report(iteration, &report);
            record.data = terms.data.item();
            record.energy = terms.energy.item();
            record.momentum_norm = momentum.norm();
            if cfg!(feature = "profiling") {
                record.set_timing(&step_timing);
            }
            info!("{}", record.to_log_line());

            let before = report.initial_value;
            let after = report.final_value;
            history.push(record);

            match report.outcome {
                StepOutcome::LineSearchFailed => {
                    warn!(iteration, loss = after, "Line search failed to decrease the loss");
                    status = ConvergenceStatus::LineSearchFailed;
                    break;
                }
                StepOutcome::GradientTolerance | StepOutcome::ChangeTolerance => {
                    status = ConvergenceStatus::Converged;
                    break;
                }
                StepOutcome::BudgetExhausted => {}
            }

            if self.config.relative_tolerance > 0.0
                && before - after <= self.config.relative_tolerance * before.abs()
            {
                status = ConvergenceStatus::Converged;
                break;
            }
        }

        let deformed = loss.deform(&momentum)?;
        let terms = loss.evaluate(&Var::constant(momentum.clone()))?;
        let result = MatchResult {
            momentum,
            deformed,
            initial_data,
            final_data: terms.data.item(),
            final_loss: terms.total.item(),
            energy: terms.energy.item(),
            status,
            iterations: history.len(),
            evaluations: optimizer.total_evaluations(),
            history,
        };
        info!(
            status = ?result.status,
            iterations = result.iterations,
            evaluations = result.evaluations,
            initial_data = result.initial_data,
            final_data = result.final_data,
            "LDDMM optimization finished"
        );

        Ok((result, collector.finish()))
    }
}
