//! Hamiltonian equations of motion for landmark geodesics.
//!
//! The kinetic energy `H(p, q) = 0.5 * sum_i <p_i, K(q, q, p)_i>` is
//! differentiated by a [`GradientOracle`]; the canonical equations
//! `(dp/dt, dq/dt) = (-dH/dq, dH/dp)` come out as Vars that stay attached to
//! the graph, so the shooting loss can later be differentiated through them.

use crate::autodiff::{GradientOracle, ReverseMode, Var};
use crate::error::{ensure_shape, LddmmError, Result};
use crate::kernel::VelocityKernel;

/// Hamiltonian built from a velocity kernel and a higher-order gradient oracle.
#[derive(Debug, Clone)]
pub struct HamiltonianSystem<K, O = ReverseMode> {
    kernel: K,
    oracle: O,
}

impl<K: VelocityKernel> HamiltonianSystem<K> {
    pub fn new(kernel: K) -> Self {
        Self {
            kernel,
            oracle: ReverseMode,
        }
    }
}

impl<K: VelocityKernel, O: GradientOracle> HamiltonianSystem<K, O> {
    /// # Errors
    /// `UnsupportedOracle` if `oracle` cannot differentiate its own gradients.
    pub fn with_oracle(kernel: K, oracle: O) -> Result<Self> {
        if !oracle.supports_higher_order() {
            return Err(LddmmError::UnsupportedOracle);
        }
        Ok(Self { kernel, oracle })
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Kinetic energy `0.5 * <p, K(q, q) p>` as a 1x1 Var.
    pub fn energy(&self, p: &Var, q: &Var) -> Result<Var> {
        ensure_shape("hamiltonian", q.shape(), p.shape())?;
        let velocity = self.kernel.convolve(q, q, p)?;
        Ok(p.mul(&velocity).sum().scale(0.5))
    }

    /// `(dp/dt, dq/dt) = (-dH/dq, dH/dp)`.
    ///
    /// Untracked inputs are promoted to leaves; tracked inputs are used as is,
    /// which keeps the result differentiable with respect to whatever produced them.
    pub fn vector_field(&self, p: &Var, q: &Var) -> Result<(Var, Var)> {
        let p = p.tracked();
        let q = q.tracked();
        let h = self.energy(&p, &q)?;
        let mut grads = self.oracle.gradient(&h, &[&p, &q], true)?;
        let dh_dq = grads.pop().ok_or(LddmmError::UnsupportedOracle)?;
        let dh_dp = grads.pop().ok_or(LddmmError::UnsupportedOracle)?;
        Ok((dh_dq.neg(), dh_dp))
    }
}
