//! Mesh pair loading
//!
//! A mesh pair document looks like
//! `{ "source": { "vertices": [[x, y, z], ...], "faces": [[i, j, k], ...] }, "target": { ... } }`.

use std::path::Path;

use anyhow::{Context, Result};
use lddmm_shoot::test_utils::{make_tetrahedron, scaled};
use lddmm_shoot::TriangleMesh;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Serialized triangle mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshData {
    pub vertices: Vec<[f64; 3]>,
    pub faces: Vec<[usize; 3]>,
}

impl MeshData {
    pub fn from_mesh(mesh: &TriangleMesh) -> Self {
        Self {
            vertices: rows(mesh.vertices()),
            faces: mesh.faces().to_vec(),
        }
    }

    /// Validated mesh
    pub fn to_mesh(&self) -> Result<TriangleMesh> {
        Ok(TriangleMesh::from_rows(&self.vertices, &self.faces)?)
    }
}

/// Source and target surfaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshPairData {
    pub source: MeshData,
    pub target: MeshData,
}

/// Loaded, validated mesh pair
#[derive(Debug, Clone)]
pub struct MeshPair {
    pub source: TriangleMesh,
    pub target: TriangleMesh,
}

impl MeshPair {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read mesh pair {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("invalid mesh pair {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let data: MeshPairData = serde_json::from_str(text)?;
        Ok(Self {
            source: data.source.to_mesh().context("source mesh")?,
            target: data.target.to_mesh().context("target mesh")?,
        })
    }

    /// Regular tetrahedron matched onto its 1.2 scaling
    pub fn demo() -> Self {
        let source = make_tetrahedron();
        let target = scaled(&source, 1.2);
        Self { source, target }
    }

    pub fn to_data(&self) -> MeshPairData {
        MeshPairData {
            source: MeshData::from_mesh(&self.source),
            target: MeshData::from_mesh(&self.target),
        }
    }
}

/// Rows of an N x 3 matrix as arrays
pub fn rows(matrix: &DMatrix<f64>) -> Vec<[f64; 3]> {
    matrix
        .row_iter()
        .map(|r| [r[0], r[1], r[2]])
        .collect()
}
