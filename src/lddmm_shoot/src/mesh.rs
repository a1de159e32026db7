//! Triangle meshes and differentiable per-face geometry.

use std::rc::Rc;

use nalgebra::DMatrix;

use crate::autodiff::Var;
use crate::error::{ensure_dim, ensure_shape, LddmmError, Result};

/// Validated triangle mesh: `N x 3` vertices and faces indexing into them.
#[derive(Debug, Clone, PartialEq)]
pub struct TriangleMesh {
    vertices: DMatrix<f64>,
    faces: Vec<[usize; 3]>,
}

impl TriangleMesh {
    /// # Errors
    /// - `ShapeMismatch` if the vertices are not 3-D
    /// - `EmptyMesh` without vertices or faces
    /// - `FaceIndexOutOfRange` for a face referencing a missing vertex
    /// - `NonFinite` for NaN or infinite coordinates
    pub fn new(vertices: DMatrix<f64>, faces: Vec<[usize; 3]>) -> Result<Self> {
        ensure_dim("triangle mesh", "vertex dimension", 3, vertices.ncols())?;
        if vertices.nrows() == 0 {
            return Err(LddmmError::EmptyMesh("vertices"));
        }
        if faces.is_empty() {
            return Err(LddmmError::EmptyMesh("faces"));
        }
        validate_faces(&faces, vertices.nrows())?;
        if vertices.iter().any(|v| !v.is_finite()) {
            return Err(LddmmError::NonFinite("mesh vertices"));
        }
        Ok(Self { vertices, faces })
    }

    /// Build from vertex and face rows.
    pub fn from_rows(vertices: &[[f64; 3]], faces: &[[usize; 3]]) -> Result<Self> {
        let matrix = DMatrix::from_fn(vertices.len(), 3, |i, k| vertices[i][k]);
        Self::new(matrix, faces.to_vec())
    }

    pub fn vertices(&self) -> &DMatrix<f64> {
        &self.vertices
    }

    pub fn faces(&self) -> &[[usize; 3]] {
        &self.faces
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.nrows()
    }

    pub fn num_faces(&self) -> usize {
        self.faces.len()
    }

    /// Same connectivity with new vertex positions.
    pub fn with_vertices(&self, vertices: DMatrix<f64>) -> Result<Self> {
        ensure_shape("triangle mesh", self.vertices.shape(), vertices.shape())?;
        Self::new(vertices, self.faces.clone())
    }

    /// Same surface with every face orientation reversed.
    pub fn flipped(&self) -> Self {
        Self {
            vertices: self.vertices.clone(),
            faces: self.faces.iter().map(|&[a, b, c]| [a, c, b]).collect(),
        }
    }

    pub fn face_index(&self) -> FaceIndex {
        FaceIndex::from_validated(&self.faces, self.num_vertices())
    }

    /// Geometry of the mesh as it stands, as constants.
    pub fn geometry(&self) -> Result<FaceGeometry> {
        self.face_index()
            .geometry(&Var::constant(self.vertices.clone()))
    }
}

fn validate_faces(faces: &[[usize; 3]], num_vertices: usize) -> Result<()> {
    for (face, indices) in faces.iter().enumerate() {
        if let Some(&index) = indices.iter().find(|&&i| i >= num_vertices) {
            return Err(LddmmError::FaceIndexOutOfRange {
                face,
                index,
                num_vertices,
            });
        }
    }
    Ok(())
}

/// Face corners as gather indices.
#[derive(Debug, Clone)]
pub struct FaceIndex {
    corners: [Rc<[usize]>; 3],
    num_vertices: usize,
}

impl FaceIndex {
    /// # Errors
    /// `FaceIndexOutOfRange` for a face referencing a vertex `>= num_vertices`.
    pub fn new(faces: &[[usize; 3]], num_vertices: usize) -> Result<Self> {
        if faces.is_empty() {
            return Err(LddmmError::EmptyMesh("faces"));
        }
        validate_faces(faces, num_vertices)?;
        Ok(Self::from_validated(faces, num_vertices))
    }

    fn from_validated(faces: &[[usize; 3]], num_vertices: usize) -> Self {
        let corner = |k: usize| -> Rc<[usize]> { faces.iter().map(|f| f[k]).collect() };
        Self {
            corners: [corner(0), corner(1), corner(2)],
            num_vertices,
        }
    }

    pub fn num_faces(&self) -> usize {
        self.corners[0].len()
    }

    pub fn num_vertices(&self) -> usize {
        self.num_vertices
    }

    /// Centers, areas and unit normals of the faces spanned by `vertices`.
    ///
    /// # Errors
    /// - `ShapeMismatch` unless `vertices` is `num_vertices x 3`
    /// - `DegenerateFace` for a face whose area is zero or not finite
    pub fn geometry(&self, vertices: &Var) -> Result<FaceGeometry> {
        ensure_shape("face geometry", (self.num_vertices, 3), vertices.shape())?;

        let [i0, i1, i2] = &self.corners;
        let v0 = vertices.gather_rows(i0);
        let v1 = vertices.gather_rows(i1);
        let v2 = vertices.gather_rows(i2);

        let centers = v0.add(&v1).add(&v2).scale(1.0 / 3.0);
        let normals = v1.sub(&v0).cross(&v2.sub(&v0)).scale(0.5);
        let areas = normals.mul(&normals).row_sum().sqrt();

        if let Some((face, &area)) = areas
            .value()
            .iter()
            .enumerate()
            .find(|(_, a)| !(a.is_finite() && **a > 0.0))
        {
            return Err(LddmmError::DegenerateFace { face, area });
        }

        let unit_normals = normals.div(&areas.expand_cols(3));
        Ok(FaceGeometry {
            centers,
            areas,
            unit_normals,
        })
    }
}

/// Per-face geometry of a triangle mesh.
#[derive(Debug, Clone)]
pub struct FaceGeometry {
    /// `M x 3` vertex averages.
    pub centers: Var,
    /// `M x 1` triangle areas.
    pub areas: Var,
    /// `M x 3` unit normals.
    pub unit_normals: Var,
}
