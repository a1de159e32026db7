//! Fixed-step explicit integration of autonomous ODEs over Var tuples.

use crate::autodiff::Var;
use crate::error::{LddmmError, Result};

/// Default number of sub-steps per unit of time.
pub const DEFAULT_TIME_STEPS: usize = 10;

/// State of an ODE: a fixed tuple of matrices that supports linear combination.
pub trait OdeState: Sized {
    /// `self + factor * other`, component by component.
    fn axpy(&self, factor: f64, other: &Self) -> Self;

    /// Shape of every component, in order.
    fn shapes(&self) -> Vec<(usize, usize)>;

    fn is_finite(&self) -> bool;
}

impl OdeState for Var {
    fn axpy(&self, factor: f64, other: &Self) -> Self {
        Var::axpy(self, factor, other)
    }

    fn shapes(&self) -> Vec<(usize, usize)> {
        vec![self.shape()]
    }

    fn is_finite(&self) -> bool {
        Var::is_finite(self)
    }
}

/// Momentum and position, the state of geodesic shooting.
#[derive(Debug, Clone)]
pub struct PhaseState {
    pub p: Var,
    pub q: Var,
}

impl OdeState for PhaseState {
    fn axpy(&self, factor: f64, other: &Self) -> Self {
        Self {
            p: self.p.axpy(factor, &other.p),
            q: self.q.axpy(factor, &other.q),
        }
    }

    fn shapes(&self) -> Vec<(usize, usize)> {
        vec![self.p.shape(), self.q.shape()]
    }

    fn is_finite(&self) -> bool {
        self.p.is_finite() && self.q.is_finite()
    }
}

/// Advected points together with the phase state that drives them.
#[derive(Debug, Clone)]
pub struct FlowState {
    pub x: Var,
    pub p: Var,
    pub q: Var,
}

impl OdeState for FlowState {
    fn axpy(&self, factor: f64, other: &Self) -> Self {
        Self {
            x: self.x.axpy(factor, &other.x),
            p: self.p.axpy(factor, &other.p),
            q: self.q.axpy(factor, &other.q),
        }
    }

    fn shapes(&self) -> Vec<(usize, usize)> {
        vec![self.x.shape(), self.p.shape(), self.q.shape()]
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.p.is_finite() && self.q.is_finite()
    }
}

/// Ralston's second-order two-stage method.
///
/// ```text
/// k1 = F(x)
/// k2 = F(x + 2/3 dt k1)
/// x  = x + dt/4 (k1 + 3 k2)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RalstonIntegrator {
    steps: usize,
}

impl Default for RalstonIntegrator {
    fn default() -> Self {
        Self {
            steps: DEFAULT_TIME_STEPS,
        }
    }
}

impl RalstonIntegrator {
    /// # Errors
    /// `InvalidParameter` if `steps` is zero.
    pub fn new(steps: usize) -> Result<Self> {
        if steps == 0 {
            return Err(LddmmError::InvalidParameter {
                name: "time_steps",
                value: 0.0,
                reason: "at least one integration step is required",
            });
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Integrate `dx/dt = field(x)` from `init` over `horizon` and return the final state.
    ///
    /// `init` is never modified. Errors from `field` are returned unchanged.
    pub fn integrate<S, F>(&self, field: F, init: &S, horizon: f64) -> Result<S>
    where
        S: OdeState + Clone,
        F: FnMut(&S) -> Result<S>,
    {
        let mut last = None;
        self.run(field, init, horizon, |state| last = Some(state.clone()))?;
        Ok(last.unwrap_or_else(|| init.clone()))
    }

    /// Like [`integrate`](Self::integrate) but returns every intermediate state,
    /// starting with `init`.
    pub fn integrate_trajectory<S, F>(&self, field: F, init: &S, horizon: f64) -> Result<Vec<S>>
    where
        S: OdeState + Clone,
        F: FnMut(&S) -> Result<S>,
    {
        let mut path = Vec::with_capacity(self.steps + 1);
        path.push(init.clone());
        self.run(field, init, horizon, |state| path.push(state.clone()))?;
        Ok(path)
    }

    fn run<S, F, V>(&self, mut field: F, init: &S, horizon: f64, mut visit: V) -> Result<()>
    where
        S: OdeState + Clone,
        F: FnMut(&S) -> Result<S>,
        V: FnMut(&S),
    {
        if !horizon.is_finite() {
            return Err(LddmmError::InvalidParameter {
                name: "horizon",
                value: horizon,
                reason: "must be finite",
            });
        }

        let shapes = init.shapes();
        let mut eval = |state: &S| -> Result<S> {
            let derivative = field(state)?;
            let found = derivative.shapes();
            if found != shapes {
                return Err(LddmmError::ShapeMismatch {
                    context: "ode vector field",
                    expected: format!("{shapes:?}"),
                    found: format!("{found:?}"),
                });
            }
            Ok(derivative)
        };

        let dt = horizon / self.steps as f64;
        let mut state = init.clone();
        for _ in 0..self.steps {
            let k1 = eval(&state)?;
            let k2 = eval(&state.axpy(2.0 * dt / 3.0, &k1))?;
            state = state.axpy(0.25 * dt, &k1.axpy(3.0, &k2));
            if !state.is_finite() {
                return Err(LddmmError::NonFinite("ode state"));
            }
            visit(&state);
        }
        Ok(())
    }
}
