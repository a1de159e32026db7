//! Debug types for LDDMM optimization iteration tracking.
//!
//! One [`IterationDebug`] is recorded per outer optimizer step; a
//! [`MatchDebug`] collects them for a whole registration so it can be dumped
//! as JSON next to the deformed mesh.

use serde::Serialize;

use super::lbfgs::{StepOutcome, StepReport};
use crate::timing::{MatchTiming, StepTiming};

/// Timing breakdown for a single outer step (only populated when profiling feature is enabled).
#[derive(Debug, Clone, Default, Serialize)]
pub struct IterationTimingDebug {
    /// Total step time in milliseconds.
    pub total_ms: f64,
    /// Mean time of one loss + gradient evaluation.
    pub evaluation_ms: f64,
}

/// Debug information captured at each outer optimizer step.
#[derive(Debug, Clone, Serialize)]
pub struct IterationDebug {
    /// Outer step number (0-indexed).
    pub iteration: usize,

    /// Total loss at the start of the step.
    pub loss_before: f64,

    /// Total loss at the end of the step.
    pub loss: f64,

    /// Data attachment at the end of the step.
    pub data: f64,

    /// Hamiltonian at the end of the step.
    pub energy: f64,

    /// `max |∇L|` at the end of the step.
    pub gradient_max: f64,

    /// Frobenius norm of the momentum after the step.
    pub momentum_norm: f64,

    /// Step length of the last accepted quasi-Newton iteration.
    pub step_length: f64,

    /// Quasi-Newton iterations inside the step.
    pub inner_iterations: usize,

    /// Loss evaluations inside the step.
    pub evaluations: usize,

    /// Of which spent in line searches.
    pub line_search_evaluations: usize,

    pub outcome: StepOutcome,

    /// Timing breakdown (populated when profiling feature is enabled).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<IterationTimingDebug>,
}

impl IterationDebug {
    /// Record built from the optimizer report; loss parts are filled in by the caller.
    pub fn from_report(iteration: usize, report: &StepReport) -> Self {
        Self {
            iteration,
            loss_before: report.initial_value,
            loss: report.final_value,
            data: 0.0,
            energy: 0.0,
            gradient_max: report.gradient_max,
            momentum_norm: 0.0,
            step_length: report.step_length,
            inner_iterations: report.iterations,
            evaluations: report.evaluations,
            line_search_evaluations: report.line_search_evaluations,
            outcome: report.outcome,
            timing: None,
        }
    }

    pub fn set_timing(&mut self, timing: &StepTiming) {
        self.timing = Some(IterationTimingDebug {
            total_ms: timing.total_ms,
            evaluation_ms: timing.mean_evaluation_ms(),
        });
    }

    /// Format as a compact log line.
    pub fn to_log_line(&self) -> String {
        format!(
            "iter={} loss={:.6e} data={:.6e} energy={:.6e} |g|max={:.3e} step={:.4e} inner={} evals={} outcome={:?}",
            self.iteration,
            self.loss,
            self.data,
            self.energy,
            self.gradient_max,
            self.step_length,
            self.inner_iterations,
            self.evaluations,
            self.outcome,
        )
    }
}

/// Complete debug history for one registration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchDebug {
    pub num_source_vertices: usize,
    pub num_source_faces: usize,
    pub num_target_faces: usize,

    /// Data attachment before optimization.
    pub initial_data: f64,

    /// Data attachment after optimization.
    pub final_data: f64,

    /// Final total loss.
    pub final_loss: f64,

    /// Iteration history.
    pub iterations: Vec<IterationDebug>,

    /// Final convergence status.
    pub convergence_status: String,

    /// Total loss evaluations.
    pub total_evaluations: usize,

    /// Timing breakdown (populated when profiling feature is enabled).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<MatchTiming>,
}

impl MatchDebug {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Format as compact multi-line log.
    pub fn to_log(&self) -> String {
        let mut lines = Vec::with_capacity(self.iterations.len() + 1);
        lines.push(format!(
            "=== LDDMM match vertices={} faces={}->{} status={} iters={} evals={} data={:.6e}->{:.6e} ===",
            self.num_source_vertices,
            self.num_source_faces,
            self.num_target_faces,
            self.convergence_status,
            self.iterations.len(),
            self.total_evaluations,
            self.initial_data,
            self.final_data,
        ));
        for iter in &self.iterations {
            lines.push(format!("  {}", iter.to_log_line()));
        }
        lines.join("\n")
    }
}
