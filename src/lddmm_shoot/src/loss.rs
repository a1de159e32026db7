//! LDDMM objective: deformation energy plus data attachment after shooting.

use nalgebra::DMatrix;

use crate::autodiff::{GradientOracle, ReverseMode, Var};
use crate::error::{ensure_shape, LddmmError, Result};
use crate::kernel::VelocityKernel;
use crate::shooting::Shooter;
use crate::varifold::DataAttachment;

/// Loss split into its parts, each a differentiable 1x1 Var.
#[derive(Debug, Clone)]
pub struct LossTerms {
    /// `gamma * energy + data`
    pub total: Var,
    /// `H(p0, q0)`
    pub energy: Var,
    /// Attachment of the shot vertices.
    pub data: Var,
}

/// `L(p0) = gamma * H(p0, q0) + A(Shoot(p0, q0).q)` for fixed source vertices `q0`.
#[derive(Debug, Clone)]
pub struct LddmmLoss<K, A, O = ReverseMode> {
    shooter: Shooter<K, O>,
    attachment: A,
    source: Var,
    gamma: f64,
    horizon: f64,
}

impl<K, A, O> LddmmLoss<K, A, O>
where
    K: VelocityKernel,
    A: DataAttachment,
    O: GradientOracle,
{
    /// # Errors
    /// `InvalidParameter` if `gamma` is negative or either `gamma` or `horizon` is not finite.
    pub fn new(
        shooter: Shooter<K, O>,
        attachment: A,
        source: DMatrix<f64>,
        gamma: f64,
        horizon: f64,
    ) -> Result<Self> {
        if !(gamma.is_finite() && gamma >= 0.0) {
            return Err(LddmmError::InvalidParameter {
                name: "gamma",
                value: gamma,
                reason: "must be finite and >= 0",
            });
        }
        if !horizon.is_finite() {
            return Err(LddmmError::InvalidParameter {
                name: "horizon",
                value: horizon,
                reason: "must be finite",
            });
        }
        Ok(Self {
            shooter,
            attachment,
            source: Var::constant(source),
            gamma,
            horizon,
        })
    }

    pub fn shooter(&self) -> &Shooter<K, O> {
        &self.shooter
    }

    pub fn attachment(&self) -> &A {
        &self.attachment
    }

    pub fn source(&self) -> &DMatrix<f64> {
        self.source.value()
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    pub fn horizon(&self) -> f64 {
        self.horizon
    }

    /// Shoot from the source with `momentum` and evaluate every term.
    pub fn evaluate(&self, momentum: &Var) -> Result<LossTerms> {
        ensure_shape("lddmm loss", self.source.shape(), momentum.shape())?;
        let energy = self.shooter.system().energy(momentum, &self.source)?;
        let shot = self.shooter.shoot(momentum, &self.source, self.horizon)?;
        let data = self.attachment.evaluate(&shot.q)?;
        let total = energy.scale(self.gamma).add(&data);
        Ok(LossTerms {
            total,
            energy,
            data,
        })
    }

    /// Loss value and its gradient with respect to the momentum.
    ///
    /// The gradient runs back through the whole unrolled integration, including
    /// the Hamiltonian gradients computed at every sub-step.
    pub fn value_and_gradient(&self, momentum: &DMatrix<f64>) -> Result<(f64, DMatrix<f64>)> {
        let p = Var::leaf(momentum.clone());
        let terms = self.evaluate(&p)?;
        let value = terms.total.item();
        if !value.is_finite() {
            return Err(LddmmError::NonFinite("loss"));
        }

        let mut grads = self
            .shooter
            .system()
            .oracle()
            .gradient(&terms.total, &[&p], false)?;
        let grad = grads.pop().ok_or(LddmmError::UnsupportedOracle)?;
        if !grad.is_finite() {
            return Err(LddmmError::NonFinite("loss gradient"));
        }
        Ok((value, grad.value().clone()))
    }

    /// Vertices reached by shooting the source with `momentum`.
    pub fn deform(&self, momentum: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let shot = self
            .shooter
            .shoot(&Var::constant(momentum.clone()), &self.source, self.horizon)?;
        Ok(shot.q.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::RalstonIntegrator;
    use crate::kernel::{GaussianKernel, GaussianLinearKernel};
    use crate::test_utils::make_patch_pair;
    use crate::varifold::VarifoldAttachment;
    use approx::assert_relative_eq;

    fn patch_loss(gamma: f64) -> LddmmLoss<GaussianKernel, VarifoldAttachment> {
        let (source, target) = make_patch_pair();
        let attachment =
            VarifoldAttachment::new(GaussianLinearKernel::new(1.0).unwrap(), &source, &target)
                .unwrap();
        let shooter = Shooter::new(
            GaussianKernel::new(1.0).unwrap(),
            RalstonIntegrator::new(3).unwrap(),
        );
        LddmmLoss::new(shooter, attachment, source.vertices().clone(), gamma, 1.0).unwrap()
    }

    #[test]
    fn test_invalid_gamma() {
        let (source, _) = make_patch_pair();
        let shooter = Shooter::new(GaussianKernel::new(1.0).unwrap(), RalstonIntegrator::default());
        let attachment = |v: &Var| -> Result<Var> { Ok(v.sum()) };
        let result = LddmmLoss::new(shooter, attachment, source.vertices().clone(), -1.0, 1.0);
        assert!(matches!(
            result,
            Err(LddmmError::InvalidParameter { name: "gamma", .. })
        ));
    }

    #[test]
    fn test_zero_momentum_loss_is_source_distance() {
        let loss = patch_loss(0.5);
        let zero = DMatrix::zeros(4, 3);
        let terms = loss.evaluate(&Var::constant(zero.clone())).unwrap();
        let expected = loss.attachment().distance(loss.source()).unwrap();

        assert_relative_eq!(terms.energy.item(), 0.0);
        assert_relative_eq!(terms.total.item(), expected, epsilon = 1e-14);
        assert_eq!(loss.deform(&zero).unwrap(), *loss.source());
    }

    #[test]
    fn test_terms_combine_with_gamma() {
        let loss = patch_loss(0.25);
        let p = Var::constant(DMatrix::from_fn(4, 3, |i, k| 0.1 * (i as f64) - 0.05 * (k as f64)));
        let terms = loss.evaluate(&p).unwrap();
        assert!(terms.energy.item() > 0.0);
        assert_relative_eq!(
            terms.total.item(),
            0.25 * terms.energy.item() + terms.data.item(),
            epsilon = 1e-14
        );
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let loss = patch_loss(0.3);
        let p0 = DMatrix::from_fn(4, 3, |i, k| 0.05 * ((i + 2 * k) as f64).sin());
        let (_, grad) = loss.value_and_gradient(&p0).unwrap();

        let h = 1e-6;
        for k in 0..p0.len() {
            let mut plus = p0.clone();
            let mut minus = p0.clone();
            plus[k] += h;
            minus[k] -= h;
            let f = |p: &DMatrix<f64>| {
                loss.evaluate(&Var::constant(p.clone()))
                    .unwrap()
                    .total
                    .item()
            };
            let fd = (f(&plus) - f(&minus)) / (2.0 * h);
            assert_relative_eq!(grad[k], fd, epsilon = 1e-7, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_momentum_shape_checked() {
        let loss = patch_loss(0.0);
        assert!(matches!(
            loss.value_and_gradient(&DMatrix::zeros(3, 3)),
            Err(LddmmError::ShapeMismatch { .. })
        ));
    }
}
