//! Gaussian and Gaussian x squared-cosine kernels.

use crate::autodiff::Var;
use crate::error::{ensure_dim, ensure_positive, Result};

/// `K(x, y) = exp(-|x - y|^2 / sigma^2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianKernel {
    sigma: f64,
}

impl GaussianKernel {
    /// # Errors
    /// `InvalidParameter` unless `sigma` is finite and positive.
    pub fn new(sigma: f64) -> Result<Self> {
        ensure_positive("sigma", sigma)?;
        Ok(Self { sigma })
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Dense `N x M` kernel matrix between the rows of `x` and `y`.
    pub fn matrix(&self, x: &Var, y: &Var) -> Result<Var> {
        ensure_dim("gaussian kernel", "point dimension", x.ncols(), y.ncols())?;
        Ok(gaussian_matrix(x, y, self.sigma))
    }

    /// `r_i = sum_j K(x_i, y_j) b_j` for `x: N x D`, `y: M x D`, `b: M x E`.
    pub fn apply(&self, x: &Var, y: &Var, b: &Var) -> Result<Var> {
        ensure_dim("gaussian kernel", "point dimension", x.ncols(), y.ncols())?;
        ensure_dim("gaussian kernel", "rows of y and b", y.nrows(), b.nrows())?;
        Ok(gaussian_matrix(x, y, self.sigma).matmul(b))
    }
}

/// `K(x, y, u, v) = exp(-|x - y|^2 / sigma^2) <u, v>^2`.
///
/// The squared cosine makes the kernel blind to the sign of `u` and `v`, which
/// is what makes the varifold distance orientation-free.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianLinearKernel {
    sigma: f64,
}

impl GaussianLinearKernel {
    /// # Errors
    /// `InvalidParameter` unless `sigma` is finite and positive.
    pub fn new(sigma: f64) -> Result<Self> {
        ensure_positive("sigma", sigma)?;
        Ok(Self { sigma })
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// `r_i = sum_j exp(-|x_i - y_j|^2 / sigma^2) <u_i, v_j>^2 b_j`.
    pub fn apply(&self, x: &Var, y: &Var, u: &Var, v: &Var, b: &Var) -> Result<Var> {
        const CONTEXT: &str = "gaussian linear kernel";
        ensure_dim(CONTEXT, "point dimension", x.ncols(), y.ncols())?;
        ensure_dim(CONTEXT, "rows of x and u", x.nrows(), u.nrows())?;
        ensure_dim(CONTEXT, "rows of y and v", y.nrows(), v.nrows())?;
        ensure_dim(CONTEXT, "direction dimension", u.ncols(), v.ncols())?;
        ensure_dim(CONTEXT, "rows of y and b", y.nrows(), b.nrows())?;

        let cosine = u.matmul(&v.transpose());
        let weights = gaussian_matrix(x, y, self.sigma).mul(&cosine.mul(&cosine));
        Ok(weights.matmul(b))
    }
}

fn gaussian_matrix(x: &Var, y: &Var, sigma: f64) -> Var {
    x.sq_dist(y).scale(-1.0 / (sigma * sigma)).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LddmmError;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random(rng: &mut StdRng, rows: usize, cols: usize) -> Var {
        Var::constant(DMatrix::from_fn(rows, cols, |_, _| rng.gen_range(-1.0..1.0)))
    }

    #[test]
    fn test_invalid_sigma() {
        assert!(matches!(
            GaussianKernel::new(0.0),
            Err(LddmmError::InvalidParameter { name: "sigma", .. })
        ));
        assert!(GaussianKernel::new(-2.0).is_err());
        assert!(GaussianLinearKernel::new(f64::NAN).is_err());
    }

    #[test]
    fn test_gaussian_single_pair() {
        let k = GaussianKernel::new(2.0).unwrap();
        let x = Var::constant(DMatrix::from_row_slice(1, 2, &[0.0, 0.0]));
        let y = Var::constant(DMatrix::from_row_slice(1, 2, &[1.0, 1.0]));
        let b = Var::constant(DMatrix::from_row_slice(1, 1, &[3.0]));
        let r = k.apply(&x, &y, &b).unwrap();
        assert_relative_eq!(r.item(), 3.0 * (-0.5f64).exp(), epsilon = 1e-14);
    }

    #[test]
    fn test_gaussian_permutation_symmetry() {
        let mut rng = StdRng::seed_from_u64(42);
        let k = GaussianKernel::new(0.7).unwrap();
        let x = random(&mut rng, 5, 3);
        let y = random(&mut rng, 6, 3);
        let b = random(&mut rng, 6, 2);

        let perm = [3usize, 0, 5, 1, 4, 2];
        let permute = |v: &Var| {
            Var::constant(DMatrix::from_fn(v.nrows(), v.ncols(), |i, j| {
                v.value()[(perm[i], j)]
            }))
        };

        let r = k.apply(&x, &y, &b).unwrap();
        let r_perm = k.apply(&x, &permute(&y), &permute(&b)).unwrap();
        for (a, b) in r.value().iter().zip(r_perm.value().iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_linear_kernel_permutation_symmetry() {
        let mut rng = StdRng::seed_from_u64(43);
        let k = GaussianLinearKernel::new(1.3).unwrap();
        let x = random(&mut rng, 4, 3);
        let y = random(&mut rng, 5, 3);
        let u = random(&mut rng, 4, 3);
        let v = random(&mut rng, 5, 3);
        let b = random(&mut rng, 5, 1);

        let perm = [4usize, 2, 0, 3, 1];
        let permute = |m: &Var| {
            Var::constant(DMatrix::from_fn(m.nrows(), m.ncols(), |i, j| {
                m.value()[(perm[i], j)]
            }))
        };

        let r = k.apply(&x, &y, &u, &v, &b).unwrap();
        let r_perm = k
            .apply(&x, &permute(&y), &u, &permute(&v), &permute(&b))
            .unwrap();
        for (a, b) in r.value().iter().zip(r_perm.value().iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_linear_kernel_sign_invariance() {
        let mut rng = StdRng::seed_from_u64(44);
        let k = GaussianLinearKernel::new(0.9).unwrap();
        let x = random(&mut rng, 3, 3);
        let u = random(&mut rng, 3, 3);
        let b = random(&mut rng, 3, 1);

        let r = k.apply(&x, &x, &u, &u, &b).unwrap();
        let r_flip = k.apply(&x, &x, &u, &u.neg(), &b).unwrap();
        for (a, b) in r.value().iter().zip(r_flip.value().iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-14);
        }
    }

    #[test]
    fn test_tiny_sigma_large_coordinates() {
        // |x|^2 + |y|^2 - 2 x.y would lose every digit here.
        let k = GaussianKernel::new(1e-3).unwrap();
        let x = Var::constant(DMatrix::from_row_slice(
            2,
            3,
            &[1.0e4, -2.0e4, 3.0e4, 1.0e4 + 1.0, -2.0e4, 3.0e4],
        ));
        let b = Var::constant(DMatrix::from_row_slice(2, 1, &[1.5, -0.5]));
        let r = k.apply(&x, &x, &b).unwrap();
        assert!(r.is_finite());
        assert_eq!(r.value()[0], 1.5);
        assert_eq!(r.value()[1], -0.5);
    }

    #[test]
    fn test_shape_errors() {
        let k = GaussianKernel::new(1.0).unwrap();
        let x = Var::zeros(3, 3);
        let y = Var::zeros(4, 2);
        let b = Var::zeros(4, 1);
        assert!(matches!(
            k.apply(&x, &y, &b),
            Err(LddmmError::ShapeMismatch { .. })
        ));

        let y = Var::zeros(4, 3);
        let b = Var::zeros(5, 1);
        assert!(k.apply(&x, &y, &b).is_err());

        let kl = GaussianLinearKernel::new(1.0).unwrap();
        let u = Var::zeros(3, 3);
        let v = Var::zeros(3, 3);
        let b = Var::zeros(4, 1);
        assert!(kl.apply(&x, &y, &u, &v, &b).is_err());
    }
}
