//! Limited-memory BFGS.
//!
//! One call to [`Lbfgs::step`] runs a bounded number of quasi-Newton
//! iterations on a closure returning `(f(x), ∇f(x))`, updating `x` in place.
//! Curvature pairs are kept across calls so that repeated outer steps behave
//! like one long run.

use std::collections::VecDeque;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::line_search::{backtracking_line_search, directional_derivative, LineSearchConfig};
use super::more_thuente::{more_thuente_search, MoreThuenteConfig};

/// Curvature pairs with `yᵀs` at or below this are skipped.
const CURVATURE_EPSILON: f64 = 1e-10;

/// How the step length of each iteration is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineSearchKind {
    /// Strong Wolfe conditions via More-Thuente.
    MoreThuente,
    /// Armijo backtracking.
    Backtracking,
    /// Fixed step `learning_rate` (the first iteration is scaled by `1/|g|_1`).
    Fixed,
}

/// Configuration for [`Lbfgs`].
#[derive(Debug, Clone)]
pub struct LbfgsConfig {
    /// Initial step length handed to the line search.
    pub learning_rate: f64,

    /// Quasi-Newton iterations per call to `step`.
    pub max_iterations: usize,

    /// Objective evaluations per call to `step`.
    pub max_evaluations: usize,

    /// Stop once `max |∇f| <= tolerance_grad`.
    pub tolerance_grad: f64,

    /// Stop once the step or the change in `f` falls below this.
    pub tolerance_change: f64,

    /// Number of curvature pairs kept.
    pub history_size: usize,

    pub line_search: LineSearchKind,

    pub more_thuente: MoreThuenteConfig,

    pub backtracking: LineSearchConfig,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1.0,
            max_iterations: 20,
            max_evaluations: 25,
            tolerance_grad: 1e-7,
            tolerance_change: 1e-9,
            history_size: 100,
            line_search: LineSearchKind::MoreThuente,
            more_thuente: MoreThuenteConfig::default(),
            backtracking: LineSearchConfig::default(),
        }
    }
}

/// Why a call to [`Lbfgs::step`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Iteration or evaluation budget of the call used up.
    BudgetExhausted,
    /// Gradient small enough.
    GradientTolerance,
    /// Step, directional derivative or change in value below `tolerance_change`.
    ChangeTolerance,
    /// The line search found no point with a lower value; `x` was left unchanged.
    LineSearchFailed,
}

/// Summary of one call to [`Lbfgs::step`].
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Objective at `x` when the call started.
    pub initial_value: f64,
    /// Objective at `x` when the call returned.
    pub final_value: f64,
    /// `max |∇f|` at the returned `x`.
    pub gradient_max: f64,
    pub iterations: usize,
    /// Closure calls, line search included.
    pub evaluations: usize,
    /// Closure calls made by line searches.
    pub line_search_evaluations: usize,
    /// Step length of the last accepted iteration.
    pub step_length: f64,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone)]
struct CurvaturePair {
    s: DMatrix<f64>,
    y: DMatrix<f64>,
    rho: f64,
}

/// L-BFGS optimizer state.
#[derive(Debug, Clone)]
pub struct Lbfgs {
    config: LbfgsConfig,
    history: VecDeque<CurvaturePair>,
    direction: Option<DMatrix<f64>>,
    previous_gradient: Option<DMatrix<f64>>,
    step_length: f64,
    hessian_scale: f64,
    total_iterations: usize,
    total_evaluations: usize,
}

enum Trial {
    Accepted {
        value: f64,
        gradient: DMatrix<f64>,
        step: f64,
        evaluations: usize,
    },
    Failed {
        evaluations: usize,
    },
}

impl Lbfgs {
    pub fn new(config: LbfgsConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
            direction: None,
            previous_gradient: None,
            step_length: 0.0,
            hessian_scale: 1.0,
            total_iterations: 0,
            total_evaluations: 0,
        }
    }

    pub fn config(&self) -> &LbfgsConfig {
        &self.config
    }

    /// Number of curvature pairs currently stored.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Iterations over all calls to `step`.
    pub fn total_iterations(&self) -> usize {
        self.total_iterations
    }

    /// Closure calls over all calls to `step`.
    pub fn total_evaluations(&self) -> usize {
        self.total_evaluations
    }

    /// Forget all curvature information; the next iteration is steepest descent.
    pub fn reset(&mut self) {
        self.history.clear();
        self.direction = None;
        self.previous_gradient = None;
        self.step_length = 0.0;
        self.hessian_scale = 1.0;
    }

    /// Run up to `max_iterations` iterations from `x`, updating it in place.
    ///
    /// `closure` returns the objective value and gradient at a point. Its
    /// errors abort the step; `x` then holds the last accepted iterate.
    pub fn step<E, F>(&mut self, x: &mut DMatrix<f64>, mut closure: F) -> Result<StepReport, E>
    where
        F: FnMut(&DMatrix<f64>) -> Result<(f64, DMatrix<f64>), E>,
    {
        let (mut value, mut gradient) = closure(x)?;
        let mut evaluations = 1;
        let mut line_search_evaluations = 0;
        self.total_evaluations += 1;
        let initial_value = value;

        let mut iterations = 0;
        let outcome = if max_abs(&gradient) <= self.config.tolerance_grad {
            StepOutcome::GradientTolerance
        } else {
            loop {
                iterations += 1;
                self.total_iterations += 1;

                let first = self.previous_gradient.is_none();
                let direction = self.next_direction(&gradient);
                self.previous_gradient = Some(gradient.clone());
                let previous_value = value;

                let initial_step = if first {
                    (1.0 / l1_norm(&gradient)).min(1.0) * self.config.learning_rate
                } else {
                    self.config.learning_rate
                };

                let slope = directional_derivative(&gradient, &direction);
                if slope > -self.config.tolerance_change {
                    self.direction = Some(direction);
                    self.step_length = 0.0;
                    break StepOutcome::ChangeTolerance;
                }

                let remaining = self.config.max_evaluations.saturating_sub(evaluations).max(1);
                let trial = self.search(
                    x,
                    &direction,
                    value,
                    slope,
                    initial_step,
                    remaining,
                    &mut closure,
                )?;

                match trial {
                    Trial::Accepted {
                        value: new_value,
                        gradient: new_gradient,
                        step,
                        evaluations: used,
                    } => {
                        *x += &direction * step;
                        evaluations += used;
                        line_search_evaluations += used;
                        self.total_evaluations += used;
                        trace!(
                            iteration = self.total_iterations,
                            value = new_value,
                            step,
                            "L-BFGS iteration"
                        );

                        let step_max = max_abs(&direction) * step;
                        self.direction = Some(direction);
                        self.step_length = step;
                        value = new_value;
                        gradient = new_gradient;

                        if iterations >= self.config.max_iterations
                            || evaluations >= self.config.max_evaluations
                        {
                            break StepOutcome::BudgetExhausted;
                        }
                        if max_abs(&gradient) <= self.config.tolerance_grad {
                            break StepOutcome::GradientTolerance;
                        }
                        if step_max <= self.config.tolerance_change
                            || (value - previous_value).abs() < self.config.tolerance_change
                        {
                            break StepOutcome::ChangeTolerance;
                        }
                    }
                    Trial::Failed { evaluations: used } => {
                        evaluations += used;
                        line_search_evaluations += used;
                        self.total_evaluations += used;
                        self.reset();
                        break StepOutcome::LineSearchFailed;
                    }
                }
            }
        };

        Ok(StepReport {
            initial_value,
            final_value: value,
            gradient_max: max_abs(&gradient),
            iterations,
            evaluations,
            line_search_evaluations,
            step_length: self.step_length,
            outcome,
        })
    }

    /// Two-loop recursion: `-H ∇f` with the stored curvature pairs.
    fn next_direction(&mut self, gradient: &DMatrix<f64>) -> DMatrix<f64> {
        let (Some(direction), Some(previous)) = (&self.direction, &self.previous_gradient) else {
            self.history.clear();
            self.hessian_scale = 1.0;
            return -gradient;
        };

        let y = gradient - previous;
        let s = direction * self.step_length;
        let ys = y.dot(&s);
        if ys > CURVATURE_EPSILON {
            if self.history.len() >= self.config.history_size {
                self.history.pop_front();
            }
            self.hessian_scale = ys / y.dot(&y);
            self.history.push_back(CurvaturePair { s, y, rho: 1.0 / ys });
        }

        let mut q = -gradient;
        let mut alphas = Vec::with_capacity(self.history.len());
        for pair in self.history.iter().rev() {
            let alpha = pair.rho * pair.s.dot(&q);
            q -= &pair.y * alpha;
            alphas.push(alpha);
        }

        let mut r = q * self.hessian_scale;
        for (pair, alpha) in self.history.iter().zip(alphas.into_iter().rev()) {
            let beta = pair.rho * pair.y.dot(&r);
            r += &pair.s * (alpha - beta);
        }
        r
    }

    #[allow(clippy::too_many_arguments)]
    fn search<E, F>(
        &self,
        x: &DMatrix<f64>,
        direction: &DMatrix<f64>,
        value: f64,
        slope: f64,
        initial_step: f64,
        remaining: usize,
        closure: &mut F,
    ) -> Result<Trial, E>
    where
        F: FnMut(&DMatrix<f64>) -> Result<(f64, DMatrix<f64>), E>,
    {
        match self.config.line_search {
            LineSearchKind::MoreThuente => {
                let config = MoreThuenteConfig {
                    max_iterations: self.config.more_thuente.max_iterations.min(remaining),
                    ..self.config.more_thuente.clone()
                };
                let result = more_thuente_search(
                    |alpha| {
                        closure(&(x + direction * alpha)).map(|(f, g)| {
                            let d = directional_derivative(&g, direction);
                            (f, d, g)
                        })
                    },
                    value,
                    slope,
                    initial_step,
                    &config,
                )?;
                Ok(match result.payload {
                    Some(gradient) if result.final_value < value => Trial::Accepted {
                        value: result.final_value,
                        gradient,
                        step: result.step_length,
                        evaluations: result.evaluations,
                    },
                    _ => Trial::Failed {
                        evaluations: result.evaluations,
                    },
                })
            }
            LineSearchKind::Backtracking => {
                let config = LineSearchConfig {
                    max_iterations: self.config.backtracking.max_iterations.min(remaining),
                    ..self.config.backtracking.clone()
                };
                let result = backtracking_line_search(
                    |alpha| closure(&(x + direction * alpha)),
                    value,
                    slope,
                    initial_step,
                    &config,
                )?;
                Ok(match result.payload {
                    Some(gradient) if result.converged => Trial::Accepted {
                        value: result.value,
                        gradient,
                        step: result.alpha,
                        evaluations: result.evaluations,
                    },
                    _ => Trial::Failed {
                        evaluations: result.evaluations,
                    },
                })
            }
            LineSearchKind::Fixed => {
                let (f, g) = closure(&(x + direction * initial_step))?;
                if f.is_finite() {
                    Ok(Trial::Accepted {
                        value: f,
                        gradient: g,
                        step: initial_step,
                        evaluations: 1,
                    })
                } else {
                    Ok(Trial::Failed { evaluations: 1 })
                }
            }
        }
    }
}

fn max_abs(m: &DMatrix<f64>) -> f64 {
    m.iter().fold(0.0, |acc, v| acc.max(v.abs()))
}

fn l1_norm(m: &DMatrix<f64>) -> f64 {
    m.iter().map(|v| v.abs()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::convert::Infallible;

    type Objective = fn(&DMatrix<f64>) -> Result<(f64, DMatrix<f64>), Infallible>;

    /// f(x) = 0.5 sum a_i x_i^2 - sum x_i with a = (1, 10, 100); minimizer 1/a.
    fn ill_conditioned(x: &DMatrix<f64>) -> Result<(f64, DMatrix<f64>), Infallible> {
        let a = [1.0, 10.0, 100.0];
        let mut g = DMatrix::zeros(3, 1);
        let mut f = 0.0;
        for i in 0..3 {
            f += 0.5 * a[i] * x[i] * x[i] - x[i];
            g[i] = a[i] * x[i] - 1.0;
        }
        Ok((f, g))
    }

    fn rosenbrock(x: &DMatrix<f64>) -> Result<(f64, DMatrix<f64>), Infallible> {
        let (a, b) = (x[0], x[1]);
        let f = (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2);
        let g = DMatrix::from_row_slice(
            1,
            2,
            &[
                -2.0 * (1.0 - a) - 400.0 * a * (b - a * a),
                200.0 * (b - a * a),
            ],
        );
        Ok((f, g))
    }

    fn run(optimizer: &mut Lbfgs, x: &mut DMatrix<f64>, f: Objective) -> StepReport {
        match optimizer.step(x, f) {
            Ok(report) => report,
            Err(never) => match never {},
        }
    }

    #[test]
    fn test_config_default() {
        let config = LbfgsConfig::default();
        assert_eq!(config.max_iterations, 20);
        assert_eq!(config.max_evaluations, 25);
        assert_eq!(config.history_size, 100);
        assert_eq!(config.tolerance_grad, 1e-7);
        assert_eq!(config.tolerance_change, 1e-9);
        assert_eq!(config.line_search, LineSearchKind::MoreThuente);
    }

    #[test]
    fn test_quadratic_more_thuente() {
        let mut optimizer = Lbfgs::new(LbfgsConfig::default());
        let mut x = DMatrix::zeros(3, 1);
        let report = run(&mut optimizer, &mut x, ill_conditioned);

        assert!(report.final_value < report.initial_value);
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(x[1], 0.1, epsilon = 1e-6);
        assert_relative_eq!(x[2], 0.01, epsilon = 1e-6);
        assert!(optimizer.history_len() > 0);
    }

    #[test]
    fn test_quadratic_backtracking() {
        let mut optimizer = Lbfgs::new(LbfgsConfig {
            line_search: LineSearchKind::Backtracking,
            ..Default::default()
        });
        let mut x = DMatrix::zeros(3, 1);
        for _ in 0..5 {
            run(&mut optimizer, &mut x, ill_conditioned);
        }
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(x[2], 0.01, epsilon = 1e-5);
    }

    #[test]
    fn test_fixed_step_isotropic_quadratic() {
        // f = 0.5 |x - c|^2: the second iteration lands exactly on c.
        fn isotropic(x: &DMatrix<f64>) -> Result<(f64, DMatrix<f64>), Infallible> {
            let c = DMatrix::from_row_slice(2, 1, &[3.0, -1.0]);
            let diff = x - c;
            Ok((0.5 * diff.norm_squared(), diff))
        }

        let mut optimizer = Lbfgs::new(LbfgsConfig {
            line_search: LineSearchKind::Fixed,
            ..Default::default()
        });
        let mut x = DMatrix::zeros(2, 1);
        let report = run(&mut optimizer, &mut x, isotropic);

        assert_eq!(report.outcome, StepOutcome::GradientTolerance);
        assert_eq!(report.iterations, 2);
        assert_relative_eq!(x[0], 3.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rosenbrock() {
        let mut optimizer = Lbfgs::new(LbfgsConfig::default());
        let mut x = DMatrix::from_row_slice(1, 2, &[-1.2, 1.0]);

        for _ in 0..20 {
            let report = run(&mut optimizer, &mut x, rosenbrock);
            if report.outcome != StepOutcome::BudgetExhausted {
                break;
            }
        }
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(x[1], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut optimizer = Lbfgs::new(LbfgsConfig {
            history_size: 2,
            line_search: LineSearchKind::Backtracking,
            ..Default::default()
        });
        let mut x = DMatrix::from_row_slice(1, 2, &[-1.2, 1.0]);
        run(&mut optimizer, &mut x, rosenbrock);
        assert!(optimizer.history_len() <= 2);
    }

    #[test]
    fn test_stationary_start() {
        let mut optimizer = Lbfgs::new(LbfgsConfig::default());
        let mut x = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        let report = run(&mut optimizer, &mut x, rosenbrock);
        assert_eq!(report.iterations, 0);
        assert_eq!(report.evaluations, 1);
        assert_eq!(report.outcome, StepOutcome::GradientTolerance);
    }

    #[test]
    fn test_wrong_gradient_fails_line_search() {
        // The reported gradient points uphill, so no step can decrease f.
        fn lying(x: &DMatrix<f64>) -> Result<(f64, DMatrix<f64>), Infallible> {
            Ok((x.norm_squared(), x * -2.0))
        }

        let mut optimizer = Lbfgs::new(LbfgsConfig::default());
        let mut x = DMatrix::from_row_slice(1, 1, &[1.0]);
        let report = run(&mut optimizer, &mut x, lying);

        assert_eq!(report.outcome, StepOutcome::LineSearchFailed);
        assert_eq!(x[0], 1.0);
        assert!(report.evaluations <= 25);
    }

    #[test]
    fn test_closure_error_propagates() {
        let mut optimizer = Lbfgs::new(LbfgsConfig::default());
        let mut x = DMatrix::zeros(1, 1);
        let result = optimizer.step(&mut x, |_| Err::<(f64, DMatrix<f64>), _>("bad"));
        assert_eq!(result.unwrap_err(), "bad");
    }
}
