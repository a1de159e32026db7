//! Geodesic shooting and flow of extra points.

use crate::autodiff::{GradientOracle, ReverseMode, Var};
use crate::error::{ensure_dim, ensure_shape, Result};
use crate::hamiltonian::HamiltonianSystem;
use crate::integrator::{FlowState, PhaseState, RalstonIntegrator};
use crate::kernel::VelocityKernel;

/// Time horizon of a geodesic.
pub const DEFAULT_HORIZON: f64 = 1.0;

/// Integrates the Hamiltonian equations of a velocity kernel.
#[derive(Debug, Clone)]
pub struct Shooter<K, O = ReverseMode> {
    system: HamiltonianSystem<K, O>,
    integrator: RalstonIntegrator,
}

impl<K: VelocityKernel> Shooter<K> {
    pub fn new(kernel: K, integrator: RalstonIntegrator) -> Self {
        Self::from_system(HamiltonianSystem::new(kernel), integrator)
    }
}

impl<K: VelocityKernel, O: GradientOracle> Shooter<K, O> {
    pub fn from_system(system: HamiltonianSystem<K, O>, integrator: RalstonIntegrator) -> Self {
        Self { system, integrator }
    }

    pub fn system(&self) -> &HamiltonianSystem<K, O> {
        &self.system
    }

    pub fn integrator(&self) -> &RalstonIntegrator {
        &self.integrator
    }

    /// Final momentum and positions of the geodesic starting at `(p0, q0)`.
    ///
    /// The result stays differentiable with respect to tracked inputs.
    pub fn shoot(&self, p0: &Var, q0: &Var, horizon: f64) -> Result<PhaseState> {
        ensure_shape("shoot", q0.shape(), p0.shape())?;
        let init = PhaseState {
            p: p0.clone(),
            q: q0.clone(),
        };
        self.integrator
            .integrate(|s: &PhaseState| self.phase_field(s), &init, horizon)
    }

    /// Every sub-step of [`shoot`](Self::shoot), initial state first.
    pub fn shoot_trajectory(&self, p0: &Var, q0: &Var, horizon: f64) -> Result<Vec<PhaseState>> {
        ensure_shape("shoot", q0.shape(), p0.shape())?;
        let init = PhaseState {
            p: p0.clone(),
            q: q0.clone(),
        };
        self.integrator
            .integrate_trajectory(|s: &PhaseState| self.phase_field(s), &init, horizon)
    }

    /// Final position of the points `x0` carried by the velocity field of the geodesic.
    pub fn flow(&self, x0: &Var, p0: &Var, q0: &Var, horizon: f64) -> Result<Var> {
        ensure_shape("flow", q0.shape(), p0.shape())?;
        ensure_dim("flow", "point dimension", q0.ncols(), x0.ncols())?;
        let init = FlowState {
            x: x0.clone(),
            p: p0.clone(),
            q: q0.clone(),
        };
        let end = self.integrator.integrate(
            |s: &FlowState| {
                let (dp, dq) = self.system.vector_field(&s.p, &s.q)?;
                let dx = self.system.kernel().convolve(&s.x, &s.q, &s.p)?;
                Ok(FlowState { x: dx, p: dp, q: dq })
            },
            &init,
            horizon,
        )?;
        Ok(end.x)
    }

    fn phase_field(&self, state: &PhaseState) -> Result<PhaseState> {
        let (p, q) = self.system.vector_field(&state.p, &state.q)?;
        Ok(PhaseState { p, q })
    }
}

/// Shoot `(p0, q0)` over the unit horizon with the default integrator.
pub fn shoot<K: VelocityKernel>(kernel: K, p0: &Var, q0: &Var) -> Result<PhaseState> {
    Shooter::new(kernel, RalstonIntegrator::default()).shoot(p0, q0, DEFAULT_HORIZON)
}

/// Flow `x0` along the geodesic of `(p0, q0)` over the unit horizon with the default integrator.
pub fn flow<K: VelocityKernel>(kernel: K, x0: &Var, p0: &Var, q0: &Var) -> Result<Var> {
    Shooter::new(kernel, RalstonIntegrator::default()).flow(x0, p0, q0, DEFAULT_HORIZON)
}
