//! Backtracking line search and Wolfe condition checks.
//!
//! The conditions are stated for minimization of `phi(alpha) = f(x + alpha d)`:
//! 1. Sufficient decrease: f(x + αd) ≤ f(x) + c₁α∇f(x)ᵀd
//! 2. Curvature condition: |∇f(x + αd)ᵀd| ≤ c₂|∇f(x)ᵀd|
//!
//! [`backtracking_line_search`] only enforces the first one and is the cheap
//! alternative to [`super::more_thuente_search`].

use nalgebra::DMatrix;

/// Configuration for backtracking line search.
#[derive(Debug, Clone)]
pub struct LineSearchConfig {
    /// Sufficient decrease parameter (c₁ in Wolfe conditions).
    pub c1: f64,

    /// Factor applied to the step after each rejected trial.
    pub shrink: f64,

    /// Minimum step length.
    pub alpha_min: f64,

    /// Maximum number of function evaluations.
    pub max_iterations: usize,
}

impl Default for LineSearchConfig {
    fn default() -> Self {
        Self {
            c1: 1e-4,
            shrink: 0.5,
            alpha_min: 1e-10,
            max_iterations: 25,
        }
    }
}

/// Result of line search.
#[derive(Debug, Clone)]
pub struct LineSearchResult<T> {
    /// Accepted step length (0 on failure).
    pub alpha: f64,

    /// Objective value at the accepted step.
    pub value: f64,

    /// Whether the sufficient decrease condition holds at `alpha`.
    pub converged: bool,

    /// Number of function evaluations.
    pub evaluations: usize,

    /// Payload returned by the evaluation at `alpha`.
    pub payload: Option<T>,
}

impl<T> LineSearchResult<T> {
    /// Create a result indicating search failure.
    pub fn failed(initial_value: f64, evaluations: usize) -> Self {
        Self {
            alpha: 0.0,
            value: initial_value,
            converged: false,
            evaluations,
            payload: None,
        }
    }
}

/// Halve the step from `initial_step` until the sufficient decrease condition holds.
///
/// # Arguments
/// * `evaluate` - Returns `(f(x + αd), payload)`
/// * `initial_value` - f(x)
/// * `initial_derivative` - ∇f(x)ᵀd, negative for a descent direction
/// * `initial_step` - First step length to try
/// * `config` - Line search configuration
pub fn backtracking_line_search<T, E, F>(
    mut evaluate: F,
    initial_value: f64,
    initial_derivative: f64,
    initial_step: f64,
    config: &LineSearchConfig,
) -> Result<LineSearchResult<T>, E>
where
    F: FnMut(f64) -> Result<(f64, T), E>,
{
    if !(initial_derivative < 0.0) {
        return Ok(LineSearchResult::failed(initial_value, 0));
    }

    let mut alpha = initial_step;
    let mut evaluations = 0;

    while evaluations < config.max_iterations && alpha >= config.alpha_min {
        let (value, payload) = evaluate(alpha)?;
        evaluations += 1;

        if value.is_finite()
            && armijo_condition(value, initial_value, alpha, initial_derivative, config.c1)
        {
            return Ok(LineSearchResult {
                alpha,
                value,
                converged: true,
                evaluations,
                payload: Some(payload),
            });
        }

        alpha *= config.shrink;
    }

    Ok(LineSearchResult::failed(initial_value, evaluations))
}

/// Compute the directional derivative for a given step.
///
/// directional_derivative = g(x)ᵀ * d
pub fn directional_derivative(gradient: &DMatrix<f64>, direction: &DMatrix<f64>) -> f64 {
    gradient.dot(direction)
}

/// Check if a step satisfies the Armijo condition (sufficient decrease).
///
/// f(x + αd) ≤ f(x) + c₁α∇f(x)ᵀd
pub fn armijo_condition(
    new_value: f64,
    old_value: f64,
    alpha: f64,
    initial_derivative: f64,
    c1: f64,
) -> bool {
    new_value <= old_value + c1 * alpha * initial_derivative
}

/// Check if a step satisfies the curvature condition.
///
/// |∇f(x + αd)ᵀd| ≤ c₂|∇f(x)ᵀd|
pub fn curvature_condition(new_derivative: f64, initial_derivative: f64, c2: f64) -> bool {
    new_derivative.abs() <= c2 * initial_derivative.abs()
}
