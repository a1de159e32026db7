//! Kernel evaluation between point sets.
//!
//! All kernels are dense: the `N x M` kernel matrix is materialized as a
//! [`Var`] so that it can be differentiated (twice) like any other expression.

mod gaussian;

pub use gaussian::{GaussianKernel, GaussianLinearKernel};

use serde::{Deserialize, Serialize};

use crate::autodiff::Var;
use crate::error::{LddmmError, Result};

/// Kernel that turns momenta carried by control points into a velocity field.
pub trait VelocityKernel {
    /// Velocity at the rows of `x` generated by momenta `b` at control points `y`.
    fn convolve(&self, x: &Var, y: &Var, b: &Var) -> Result<Var>;
}

impl VelocityKernel for GaussianKernel {
    fn convolve(&self, x: &Var, y: &Var, b: &Var) -> Result<Var> {
        self.apply(x, y, b)
    }
}

impl<K: VelocityKernel + ?Sized> VelocityKernel for &K {
    fn convolve(&self, x: &Var, y: &Var, b: &Var) -> Result<Var> {
        (**self).convolve(x, y, b)
    }
}

/// Kernel family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelFamily {
    Gaussian,
    GaussianLinear,
}

/// Serializable kernel description: family plus bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub family: KernelFamily,
    pub sigma: f64,
}

impl KernelSpec {
    pub fn gaussian(sigma: f64) -> Self {
        Self {
            family: KernelFamily::Gaussian,
            sigma,
        }
    }

    pub fn gaussian_linear(sigma: f64) -> Self {
        Self {
            family: KernelFamily::GaussianLinear,
            sigma,
        }
    }

    /// Build the Gaussian kernel. The family must be [`KernelFamily::Gaussian`].
    pub fn build_gaussian(&self) -> Result<GaussianKernel> {
        self.expect_family(KernelFamily::Gaussian)?;
        GaussianKernel::new(self.sigma)
    }

    /// Build the Gaussian x squared-cosine kernel.
    ///
    /// The family must be [`KernelFamily::GaussianLinear`].
    pub fn build_gaussian_linear(&self) -> Result<GaussianLinearKernel> {
        self.expect_family(KernelFamily::GaussianLinear)?;
        GaussianLinearKernel::new(self.sigma)
    }

    fn expect_family(&self, family: KernelFamily) -> Result<()> {
        if self.family == family {
            Ok(())
        } else {
            Err(LddmmError::WrongKernelFamily {
                expected: family,
                found: self.family,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    #[test]
    fn test_kernel_spec_serde() {
        let spec = KernelSpec::gaussian_linear(2.5);
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"family":"gaussian_linear","sigma":2.5}"#);

        let back: KernelSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_kernel_spec_build() {
        assert_eq!(KernelSpec::gaussian(3.0).build_gaussian().unwrap().sigma(), 3.0);
        assert!(KernelSpec::gaussian(3.0).build_gaussian_linear().is_err());
        assert!(KernelSpec::gaussian(-1.0).build_gaussian().is_err());
    }

    #[test]
    fn test_convolve_through_reference() {
        let k = GaussianKernel::new(1.0).unwrap();
        let x = Var::constant(DMatrix::zeros(2, 3));
        let b = Var::constant(DMatrix::from_element(2, 3, 1.0));
        let by_ref: &dyn VelocityKernel = &k;
        let r = by_ref.convolve(&x, &x, &b).unwrap();
        assert_eq!(r.value(), &DMatrix::from_element(2, 3, 2.0));
    }
}
