//! More-Thuente line search algorithm.
//!
//! Finds a step length satisfying the strong Wolfe conditions for the
//! minimization of `phi(alpha) = f(x + alpha d)` along a descent direction
//! `d`. The search first works on the auxiliary function
//! `psi(alpha) = phi(alpha) - phi(0) - mu phi'(0) alpha` until a step with
//! `psi <= 0` and `phi' >= 0` is found, then switches to `phi` itself.
//! Trial steps come from safeguarded cubic, quadratic and secant
//! interpolation of the interval endpoints.
//!
//! # References
//!
//! - More, J.J. & Thuente, D.J. (1994). "Line search algorithms with guaranteed
//!   sufficient decrease". ACM Transactions on Mathematical Software.
//! - MINPACK-2 `dcsrch` / `dcstep`.

use super::line_search::{armijo_condition, curvature_condition};

/// Extrapolation factors for the step bounds while the minimizer is not bracketed.
const EXTRAPOLATE_LOWER: f64 = 1.1;
const EXTRAPOLATE_UPPER: f64 = 4.0;

/// Configuration for More-Thuente line search.
#[derive(Debug, Clone)]
pub struct MoreThuenteConfig {
    /// Maximum step length.
    pub step_max: f64,

    /// Minimum step length.
    pub step_min: f64,

    /// Sufficient decrease parameter (c1 in the Wolfe conditions).
    pub mu: f64,

    /// Curvature condition parameter (c2 in the Wolfe conditions).
    pub nu: f64,

    /// Relative width below which the bracketing interval is considered collapsed.
    pub xtol: f64,

    /// Maximum number of function evaluations.
    pub max_iterations: usize,
}

impl Default for MoreThuenteConfig {
    fn default() -> Self {
        Self {
            step_max: 1e10,
            step_min: 1e-20,
            mu: 1e-4,
            nu: 0.9,
            xtol: 1e-9,
            max_iterations: 25,
        }
    }
}

/// Result of More-Thuente line search.
#[derive(Debug, Clone)]
pub struct MoreThuenteResult<T> {
    /// Final step length. When the search did not converge this is the
    /// evaluated step with the lowest value.
    pub step_length: f64,

    /// Whether the strong Wolfe conditions hold at `step_length`.
    pub converged: bool,

    /// Number of function evaluations.
    pub evaluations: usize,

    /// `phi(step_length)`
    pub final_value: f64,

    /// `phi'(step_length)`
    pub final_derivative: f64,

    /// Whatever the evaluation returned alongside the value at `step_length`;
    /// `None` if nothing was evaluated.
    pub payload: Option<T>,
}

impl<T> MoreThuenteResult<T> {
    fn not_started(initial_value: f64, initial_derivative: f64) -> Self {
        Self {
            step_length: 0.0,
            converged: false,
            evaluations: 0,
            final_value: initial_value,
            final_derivative: initial_derivative,
            payload: None,
        }
    }
}

/// Step, value and derivative of one end of the search interval.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Endpoint {
    step: f64,
    value: f64,
    derivative: f64,
}

/// Auxiliary function psi used in More-Thuente algorithm.
///
/// psi(alpha) = phi(alpha) - phi(0) - mu * phi'(0) * alpha
///
/// Equation 1.6 in More-Thuente (1994)
#[inline]
fn auxiliary_psi(alpha: f64, phi_alpha: f64, phi_0: f64, dphi_0: f64, mu: f64) -> f64 {
    phi_alpha - phi_0 - mu * dphi_0 * alpha
}

/// Derivative of auxiliary function psi.
///
/// psi'(alpha) = phi'(alpha) - mu * phi'(0)
#[inline]
fn auxiliary_dpsi(dphi_alpha: f64, dphi_0: f64, mu: f64) -> f64 {
    dphi_alpha - mu * dphi_0
}

impl Endpoint {
    fn shifted_to_psi(self, phi_0: f64, dphi_0: f64, mu: f64) -> Self {
        Self {
            step: self.step,
            value: auxiliary_psi(self.step, self.value, phi_0, dphi_0, mu),
            derivative: auxiliary_dpsi(self.derivative, dphi_0, mu),
        }
    }

    fn shifted_to_phi(self, phi_0: f64, dphi_0: f64, mu: f64) -> Self {
        Self {
            step: self.step,
            value: self.value + phi_0 + mu * dphi_0 * self.step,
            derivative: self.derivative + mu * dphi_0,
        }
    }
}

/// `(theta, gamma)` of the cubic interpolating values and derivatives at `a` and `b`.
///
/// A negative discriminant is clamped to zero when `clamp` is set.
fn cubic_from(a: &Endpoint, b: &Endpoint, clamp: bool) -> (f64, f64) {
    let theta = 3.0 * (a.value - b.value) / (b.step - a.step) + a.derivative + b.derivative;
    let s = theta.abs().max(a.derivative.abs()).max(b.derivative.abs());
    let disc = (theta / s).powi(2) - (a.derivative / s) * (b.derivative / s);
    let disc = if clamp { disc.max(0.0) } else { disc };
    (theta, s * disc.sqrt())
}

/// Select trial value based on cubic/quadratic interpolation.
///
/// `x` is the endpoint with the lowest value so far, `y` the other endpoint
/// and `t` the current trial. Implements the four cases of More-Thuente
/// (1994), Section 4, and marks the minimizer bracketed when cases 1 or 2
/// apply.
fn trial_value_selection(
    x: &Endpoint,
    y: &Endpoint,
    t: &Endpoint,
    bracketed: &mut bool,
    step_min: f64,
    step_max: f64,
) -> f64 {
    let sign = t.derivative * x.derivative.signum();

    // Case 1: higher value, the minimizer is bracketed between x and t.
    if t.value > x.value {
        let (theta, mut gamma) = cubic_from(x, t, false);
        if t.step < x.step {
            gamma = -gamma;
        }
        let p = (gamma - x.derivative) + theta;
        let q = ((gamma - x.derivative) + gamma) + t.derivative;
        let cubic = x.step + (p / q) * (t.step - x.step);
        let quadratic = x.step
            + ((x.derivative / ((x.value - t.value) / (t.step - x.step) + x.derivative)) / 2.0)
                * (t.step - x.step);
        *bracketed = true;
        return if (cubic - x.step).abs() < (quadratic - x.step).abs() {
            cubic
        } else {
            cubic + (quadratic - cubic) / 2.0
        };
    }

    // Case 2: lower value, derivatives of opposite sign.
    if sign < 0.0 {
        let (theta, mut gamma) = cubic_from(x, t, false);
        if t.step > x.step {
            gamma = -gamma;
        }
        let p = (gamma - t.derivative) + theta;
        let q = ((gamma - t.derivative) + gamma) + x.derivative;
        let cubic = t.step + (p / q) * (x.step - t.step);
        let secant = t.step + (t.derivative / (t.derivative - x.derivative)) * (x.step - t.step);
        *bracketed = true;
        return if (cubic - t.step).abs() > (secant - t.step).abs() {
            cubic
        } else {
            secant
        };
    }

    // Case 3: lower value, same sign, decreasing derivative magnitude.
    if t.derivative.abs() < x.derivative.abs() {
        let (theta, mut gamma) = cubic_from(x, t, true);
        if t.step > x.step {
            gamma = -gamma;
        }
        let p = (gamma - t.derivative) + theta;
        let q = (gamma + (x.derivative - t.derivative)) + gamma;
        let r = p / q;
        let cubic = if r < 0.0 && gamma != 0.0 {
            t.step + r * (x.step - t.step)
        } else if t.step > x.step {
            step_max
        } else {
            step_min
        };
        let secant = t.step + (t.derivative / (t.derivative - x.derivative)) * (x.step - t.step);

        if *bracketed {
            let next = if (cubic - t.step).abs() < (secant - t.step).abs() {
                cubic
            } else {
                secant
            };
            let limit = t.step + 0.66 * (y.step - t.step);
            return if t.step > x.step {
                limit.min(next)
            } else {
                limit.max(next)
            };
        }
        let next = if (cubic - t.step).abs() > (secant - t.step).abs() {
            cubic
        } else {
            secant
        };
        return next.min(step_max).max(step_min);
    }

    // Case 4: lower value, same sign, derivative magnitude not decreasing.
    if *bracketed {
        let (theta, mut gamma) = cubic_from(y, t, false);
        if t.step > y.step {
            gamma = -gamma;
        }
        let p = (gamma - t.derivative) + theta;
        let q = ((gamma - t.derivative) + gamma) + y.derivative;
        return t.step + (p / q) * (y.step - t.step);
    }
    if t.step > x.step {
        step_max
    } else {
        step_min
    }
}

/// Update interval endpoints according to More-Thuente algorithm.
fn update_interval(x: &mut Endpoint, y: &mut Endpoint, t: Endpoint) {
    // Case U1: higher value, t becomes the far end.
    if t.value > x.value {
        *y = t;
        return;
    }
    // Case U3: derivative changes sign, x becomes the far end.
    if t.derivative * x.derivative.signum() < 0.0 {
        *y = *x;
    }
    // Cases U2/U3: t is the new best point.
    *x = t;
}

/// Perform More-Thuente line search.
///
/// Finds a step length `alpha` satisfying the strong Wolfe conditions:
/// 1. Sufficient decrease: phi(alpha) <= phi(0) + mu * alpha * phi'(0)
/// 2. Curvature condition: |phi'(alpha)| <= nu * |phi'(0)|
///
/// # Arguments
///
/// * `evaluate` - Returns `(phi(alpha), phi'(alpha), payload)`. The payload is
///   handed back for the returned step so callers need not re-evaluate.
/// * `initial_value` - phi(0)
/// * `initial_derivative` - phi'(0), negative for a descent direction
/// * `initial_step` - First step length to try
/// * `config` - Line search configuration
///
/// Errors of `evaluate` abort the search and are returned unchanged. A
/// non-descent direction returns immediately without evaluating anything.
pub fn more_thuente_search<T, E, F>(
    mut evaluate: F,
    initial_value: f64,
    initial_derivative: f64,
    initial_step: f64,
    config: &MoreThuenteConfig,
) -> Result<MoreThuenteResult<T>, E>
where
    F: FnMut(f64) -> Result<(f64, f64, T), E>,
{
    let phi_0 = initial_value;
    let dphi_0 = initial_derivative;
    if !(dphi_0 < 0.0) || !phi_0.is_finite() {
        return Ok(MoreThuenteResult::not_started(phi_0, dphi_0));
    }

    let decrease_slope = config.mu * dphi_0;
    let mut step = initial_step.min(config.step_max).max(config.step_min);
    let mut ceiling = f64::INFINITY;

    let origin = Endpoint {
        step: 0.0,
        value: phi_0,
        derivative: dphi_0,
    };
    let mut x = origin;
    let mut y = origin;

    let mut bracketed = false;
    let mut open_interval = true;
    let mut lower = 0.0;
    let mut upper = step + EXTRAPOLATE_UPPER * step;
    let mut width = config.step_max - config.step_min;
    let mut previous_width = 2.0 * width;

    let mut best: Option<(Endpoint, T)> = None;
    let mut evaluations = 0;

    while evaluations < config.max_iterations {
        let (value, derivative, payload) = evaluate(step)?;
        evaluations += 1;

        let t = Endpoint {
            step,
            value,
            derivative,
        };
        let sufficient_decrease = armijo_condition(value, phi_0, step, dphi_0, config.mu);

        if sufficient_decrease && curvature_condition(derivative, dphi_0, config.nu) {
            return Ok(MoreThuenteResult {
                step_length: step,
                converged: true,
                evaluations,
                final_value: value,
                final_derivative: derivative,
                payload: Some(payload),
            });
        }

        if best.as_ref().map_or(true, |(b, _)| value < b.value) {
            best = Some((t, payload));
        }

        if !value.is_finite() || !derivative.is_finite() {
            // Retreat toward the best point and never step this far again.
            ceiling = step;
            step = x.step + 0.5 * (step - x.step);
            if step - x.step <= config.xtol * step.max(config.step_min) {
                break;
            }
            continue;
        }

        let stalled = (bracketed && (step <= lower || step >= upper))
            || (bracketed && upper - lower <= config.xtol * upper)
            || (step >= config.step_max && sufficient_decrease && derivative <= decrease_slope)
            || (step <= config.step_min && (!sufficient_decrease || derivative >= decrease_slope));
        if stalled {
            break;
        }

        if open_interval && sufficient_decrease && derivative >= 0.0 {
            open_interval = false;
        }

        if open_interval && value <= x.value && !sufficient_decrease {
            let mut xp = x.shifted_to_psi(phi_0, dphi_0, config.mu);
            let mut yp = y.shifted_to_psi(phi_0, dphi_0, config.mu);
            let tp = t.shifted_to_psi(phi_0, dphi_0, config.mu);
            step = trial_value_selection(&xp, &yp, &tp, &mut bracketed, lower, upper);
            update_interval(&mut xp, &mut yp, tp);
            x = xp.shifted_to_phi(phi_0, dphi_0, config.mu);
            y = yp.shifted_to_phi(phi_0, dphi_0, config.mu);
        } else {
            step = trial_value_selection(&x, &y, &t, &mut bracketed, lower, upper);
            update_interval(&mut x, &mut y, t);
        }

        if bracketed {
            // Bisect when the interval does not shrink fast enough.
            if (y.step - x.step).abs() >= 0.66 * previous_width {
                step = x.step + 0.5 * (y.step - x.step);
            }
            previous_width = width;
            width = (y.step - x.step).abs();
            lower = x.step.min(y.step);
            upper = x.step.max(y.step);
        } else {
            lower = step + EXTRAPOLATE_LOWER * (step - x.step);
            upper = step + EXTRAPOLATE_UPPER * (step - x.step);
        }

        step = step.min(config.step_max).min(ceiling).max(config.step_min);
        if bracketed && (step <= lower || step >= upper || upper - lower <= config.xtol * upper) {
            step = x.step;
        }
    }

    Ok(match best {
        Some((point, payload)) => MoreThuenteResult {
            step_length: point.step,
            converged: false,
            evaluations,
            final_value: point.value,
            final_derivative: point.derivative,
            payload: Some(payload),
        },
        None => MoreThuenteResult {
            evaluations,
            ..MoreThuenteResult::not_started(phi_0, dphi_0)
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::convert::Infallible;

    fn search<F>(
        f: F,
        phi_0: f64,
        dphi_0: f64,
        step: f64,
        config: &MoreThuenteConfig,
    ) -> MoreThuenteResult<()>
    where
        F: Fn(f64) -> (f64, f64),
    {
        let result: Result<_, Infallible> = more_thuente_search(
            |alpha| {
                let (v, d) = f(alpha);
                Ok((v, d, ()))
            },
            phi_0,
            dphi_0,
            step,
            config,
        );
        match result {
            Ok(r) => r,
            Err(never) => match never {},
        }
    }

    fn assert_strong_wolfe<F>(f: F, result: &MoreThuenteResult<()>, config: &MoreThuenteConfig)
    where
        F: Fn(f64) -> (f64, f64),
    {
        let (phi_0, dphi_0) = f(0.0);
        let (value, derivative) = f(result.step_length);
        assert!(armijo_condition(value, phi_0, result.step_length, dphi_0, config.mu));
        assert!(curvature_condition(derivative, dphi_0, config.nu));
    }

    #[test]
    fn test_config_default() {
        let config = MoreThuenteConfig::default();
        assert_eq!(config.mu, 1e-4);
        assert_eq!(config.nu, 0.9);
        assert_eq!(config.max_iterations, 25);
    }

    #[test]
    fn test_auxiliary_psi() {
        // psi(0) should be 0
        let psi = auxiliary_psi(0.0, 1.0, 1.0, -0.5, 1e-4);
        assert_relative_eq!(psi, 0.0, epsilon = 1e-10);

        // psi(alpha) = phi(alpha) - phi(0) - mu * phi'(0) * alpha
        let psi = auxiliary_psi(1.0, 0.5, 1.0, -0.5, 1e-4);
        let expected = 0.5 - 1.0 - 1e-4 * (-0.5) * 1.0;
        assert_relative_eq!(psi, expected, epsilon = 1e-10);
    }

    #[test]
    fn test_psi_round_trip() {
        let e = Endpoint {
            step: 0.7,
            value: 2.5,
            derivative: -0.3,
        };
        let back = e.shifted_to_psi(3.0, -1.0, 1e-3).shifted_to_phi(3.0, -1.0, 1e-3);
        assert_relative_eq!(back.value, e.value, epsilon = 1e-14);
        assert_relative_eq!(back.derivative, e.derivative, epsilon = 1e-14);
    }

    #[test]
    fn test_quadratic_accepts_first_step() {
        // phi(alpha) = (alpha - 2)^2: phi(1) = 1 and |phi'(1)| = 2 <= 0.9 * 4
        let f = |a: f64| ((a - 2.0).powi(2), 2.0 * (a - 2.0));
        let config = MoreThuenteConfig::default();
        let result = search(f, 4.0, -4.0, 1.0, &config);

        assert!(result.converged);
        assert_eq!(result.evaluations, 1);
        assert_eq!(result.step_length, 1.0);
        assert_eq!(result.payload, Some(()));
    }

    #[test]
    fn test_quadratic_overshoot_interpolates_minimizer() {
        let f = |a: f64| ((a - 2.0).powi(2), 2.0 * (a - 2.0));
        let config = MoreThuenteConfig::default();
        let result = search(f, 4.0, -4.0, 10.0, &config);

        assert!(result.converged);
        assert!(result.evaluations <= 3, "evaluations = {}", result.evaluations);
        assert_relative_eq!(result.step_length, 2.0, epsilon = 1e-6);
        assert_strong_wolfe(f, &result, &config);
    }

    #[test]
    fn test_short_step_failing_curvature_is_extended() {
        // phi(alpha) = (alpha - 10)^2: alpha = 0.5 decreases phi enough but
        // |phi'(0.5)| = 19 > 0.9 * 20, so the search has to move further.
        let f = |a: f64| ((a - 10.0).powi(2), 2.0 * (a - 10.0));
        let config = MoreThuenteConfig::default();
        let (_, short_derivative) = f(0.5);
        assert!(!curvature_condition(short_derivative, -20.0, config.nu));

        let result = search(f, 100.0, -20.0, 0.5, &config);
        assert!(result.converged);
        assert!(result.evaluations > 1);
        assert!(result.step_length > 0.5);
        assert_strong_wolfe(f, &result, &config);
    }

    #[test]
    fn test_more_thuente_paper_function() {
        // Test function 1 of More-Thuente (1994) with beta = 2:
        // phi(a) = -a / (a^2 + 2), minimizer at sqrt(2).
        let f = |a: f64| {
            let d = a * a + 2.0;
            (-a / d, (a * a - 2.0) / (d * d))
        };
        let config = MoreThuenteConfig {
            mu: 1e-3,
            nu: 0.1,
            ..Default::default()
        };
        let (phi_0, dphi_0) = f(0.0);

        for &initial in &[1e-3, 1e-1, 1e1, 1e3] {
            let result = search(f, phi_0, dphi_0, initial, &config);
            assert!(result.converged, "initial step {initial} did not converge");
            assert!(result.evaluations <= 15, "initial {initial}: {}", result.evaluations);
            assert_strong_wolfe(f, &result, &config);
        }
    }

    #[test]
    fn test_non_descent_direction() {
        let config = MoreThuenteConfig::default();
        let calls = std::cell::Cell::new(0);
        let f = |_a: f64| {
            calls.set(calls.get() + 1);
            (0.0, 0.0)
        };

        let result = search(f, 1.0, 0.0, 0.1, &config);
        assert_eq!(result.step_length, 0.0);
        assert!(!result.converged);
        assert!(result.payload.is_none());

        let result = search(f, 1.0, 1.0, 0.1, &config);
        assert!(!result.converged);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_evaluation_error_aborts() {
        let config = MoreThuenteConfig::default();
        let result: Result<MoreThuenteResult<()>, &str> =
            more_thuente_search(|_| Err("boom"), 1.0, -1.0, 1.0, &config);
        assert_eq!(result.unwrap_err(), "boom");
    }

    #[test]
    fn test_retreats_from_non_finite_values() {
        // phi is infinite beyond alpha = 3.
        let f = |a: f64| {
            if a > 3.0 {
                (f64::INFINITY, f64::NAN)
            } else {
                ((a - 2.0).powi(2), 2.0 * (a - 2.0))
            }
        };
        let config = MoreThuenteConfig::default();
        let result = search(f, 4.0, -4.0, 100.0, &config);
        assert!(result.final_value < 4.0);
        assert!(result.step_length <= 3.0);
    }

    #[test]
    fn test_payload_of_returned_step() {
        let config = MoreThuenteConfig::default();
        let result: Result<MoreThuenteResult<f64>, Infallible> = more_thuente_search(
            |a| Ok(((a - 2.0).powi(2), 2.0 * (a - 2.0), a * 10.0)),
            4.0,
            -4.0,
            10.0,
            &config,
        );
        let result = result.unwrap();
        assert_relative_eq!(result.payload.unwrap(), result.step_length * 10.0);
    }
}
