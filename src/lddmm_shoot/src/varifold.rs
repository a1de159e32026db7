//! Varifold data attachment between triangle meshes.
//!
//! Each face is represented by a Dirac at its center carrying its area and
//! unoriented unit normal. The squared RKHS distance between the source and
//! target measures,
//!
//! ```text
//! |S - T|^2 = <T, T> + <S, S> - 2 <S, T>
//! <A, B>    = sum_ij a_i b_j exp(-|c_i - c_j|^2 / sigma^2) <n_i, n_j>^2
//! ```
//!
//! is differentiable in the source vertices and vanishes when the meshes agree.

use nalgebra::DMatrix;
use tracing::debug;

use crate::autodiff::Var;
use crate::error::{ensure_dim, LddmmError, Result};
use crate::kernel::GaussianLinearKernel;
use crate::mesh::{FaceGeometry, FaceIndex, TriangleMesh};

/// Shape dissimilarity of deformed source vertices against a fixed target.
pub trait DataAttachment {
    /// Dissimilarity as a 1x1 Var, differentiable in `vertices`.
    fn evaluate(&self, vertices: &Var) -> Result<Var>;
}

impl<F> DataAttachment for F
where
    F: Fn(&Var) -> Result<Var>,
{
    fn evaluate(&self, vertices: &Var) -> Result<Var> {
        self(vertices)
    }
}

/// Varifold distance to a target mesh for vertices with the source connectivity.
#[derive(Debug, Clone)]
pub struct VarifoldAttachment {
    kernel: GaussianLinearKernel,
    source_faces: FaceIndex,
    target: FaceGeometry,
    target_self_product: f64,
}

impl VarifoldAttachment {
    /// Precompute the target geometry and `<T, T>`.
    ///
    /// # Errors
    /// `DegenerateFace` if a target face has zero area.
    pub fn new(
        kernel: GaussianLinearKernel,
        source: &TriangleMesh,
        target: &TriangleMesh,
    ) -> Result<Self> {
        let target_geometry = target.geometry()?;
        let target_self_product = self_product(&kernel, &target_geometry)?.item();
        debug!(
            sigma = kernel.sigma(),
            source_faces = source.num_faces(),
            target_faces = target.num_faces(),
            target_self_product,
            "Varifold attachment ready"
        );

        Ok(Self {
            kernel,
            source_faces: source.face_index(),
            target: target_geometry,
            target_self_product,
        })
    }

    pub fn kernel(&self) -> &GaussianLinearKernel {
        &self.kernel
    }

    pub fn target_self_product(&self) -> f64 {
        self.target_self_product
    }

    /// Plain value of the distance for fixed vertex positions.
    pub fn distance(&self, vertices: &DMatrix<f64>) -> Result<f64> {
        Ok(self.evaluate(&Var::constant(vertices.clone()))?.item())
    }
}

impl DataAttachment for VarifoldAttachment {
    fn evaluate(&self, vertices: &Var) -> Result<Var> {
        ensure_dim(
            "varifold",
            "source vertex count",
            self.source_faces.num_vertices(),
            vertices.nrows(),
        )?;
        let source = self.source_faces.geometry(vertices)?;

        let source_term = self_product(&self.kernel, &source)?;
        let cross_term = source
            .areas
            .mul(&self.kernel.apply(
                &source.centers,
                &self.target.centers,
                &source.unit_normals,
                &self.target.unit_normals,
                &self.target.areas,
            )?)
            .sum();

        let loss = source_term
            .axpy(-2.0, &cross_term)
            .add(&Var::scalar(self.target_self_product));
        if !loss.is_finite() {
            return Err(LddmmError::NonFinite("varifold loss"));
        }
        Ok(loss)
    }
}

fn self_product(kernel: &GaussianLinearKernel, g: &FaceGeometry) -> Result<Var> {
    let weighted = kernel.apply(
        &g.centers,
        &g.centers,
        &g.unit_normals,
        &g.unit_normals,
        &g.areas,
    )?;
    Ok(g.areas.mul(&weighted).sum())
}
