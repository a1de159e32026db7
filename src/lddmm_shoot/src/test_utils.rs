//! Synthetic meshes with known geometry for tests and demos.

use nalgebra::{DMatrix, RowVector3};

use crate::mesh::TriangleMesh;

/// Regular tetrahedron inscribed in the unit sphere, centered at the origin.
///
/// Vertices are `(1,1,1)`, `(1,-1,-1)`, `(-1,1,-1)`, `(-1,-1,1)` divided by
/// `sqrt(3)`; all four faces are oriented outward.
pub fn make_tetrahedron() -> TriangleMesh {
    let s = 1.0 / 3f64.sqrt();
    let vertices = [[s, s, s], [s, -s, -s], [-s, s, -s], [-s, -s, s]];
    let faces = [[0, 1, 2], [0, 3, 1], [0, 2, 3], [1, 3, 2]];
    match TriangleMesh::from_rows(&vertices, &faces) {
        Ok(mesh) => mesh,
        Err(e) => unreachable!("tetrahedron is a valid mesh: {e}"),
    }
}

/// Mesh with every vertex multiplied by `factor` (scaling about the origin).
pub fn scaled(mesh: &TriangleMesh, factor: f64) -> TriangleMesh {
    rebuild(mesh, mesh.vertices() * factor)
}

/// Mesh with every vertex shifted by `offset`.
pub fn translated(mesh: &TriangleMesh, offset: [f64; 3]) -> TriangleMesh {
    let shift = RowVector3::from(offset);
    let mut vertices = mesh.vertices().clone();
    for mut row in vertices.row_iter_mut() {
        row += shift;
    }
    rebuild(mesh, vertices)
}

/// Two small 4-vertex / 2-triangle patches: a unit square in the `z = 0`
/// plane and a skewed, lifted copy of it.
pub fn make_patch_pair() -> (TriangleMesh, TriangleMesh) {
    let faces = [[0, 1, 2], [0, 2, 3]];
    let source = [
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [1.0, 1.0, 0.0],
        [0.0, 1.0, 0.0],
    ];
    let target = [
        [0.1, 0.05, 0.2],
        [1.2, -0.1, 0.1],
        [1.1, 1.0, 0.3],
        [-0.1, 0.9, 0.0],
    ];
    match (
        TriangleMesh::from_rows(&source, &faces),
        TriangleMesh::from_rows(&target, &faces),
    ) {
        (Ok(s), Ok(t)) => (s, t),
        _ => unreachable!("patches are valid meshes"),
    }
}

fn rebuild(mesh: &TriangleMesh, vertices: DMatrix<f64>) -> TriangleMesh {
    match mesh.with_vertices(vertices) {
        Ok(mesh) => mesh,
        Err(e) => unreachable!("transformed mesh keeps its connectivity: {e}"),
    }
}
