//! Match report written after a registration

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};
use lddmm_shoot::{ConvergenceStatus, IterationDebug, MatchResult};
use serde::Serialize;

use crate::mesh_io::{rows, MeshPair};
use crate::params::MatcherParams;

/// Everything needed to plot the source, the deformed source and the target
#[derive(Debug, Clone, Serialize)]
pub struct MatchReport {
    pub params: MatcherParams,
    pub status: ConvergenceStatus,
    pub iterations: usize,
    pub evaluations: usize,
    pub initial_data: f64,
    pub final_data: f64,
    pub final_loss: f64,
    pub energy: f64,
    pub source_vertices: Vec<[f64; 3]>,
    pub source_faces: Vec<[usize; 3]>,
    pub deformed_vertices: Vec<[f64; 3]>,
    pub momentum: Vec<[f64; 3]>,
    pub target_vertices: Vec<[f64; 3]>,
    pub target_faces: Vec<[usize; 3]>,
    pub history: Vec<IterationDebug>,
}

impl MatchReport {
    pub fn new(params: &MatcherParams, pair: &MeshPair, result: &MatchResult) -> Self {
        Self {
            params: params.clone(),
            status: result.status,
            iterations: result.iterations,
            evaluations: result.evaluations,
            initial_data: result.initial_data,
            final_data: result.final_data,
            final_loss: result.final_loss,
            energy: result.energy,
            source_vertices: rows(pair.source.vertices()),
            source_faces: pair.source.faces().to_vec(),
            deformed_vertices: rows(&result.deformed),
            momentum: rows(&result.momentum),
            target_vertices: rows(pair.target.vertices()),
            target_faces: pair.target.faces().to_vec(),
            history: result.history.clone(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create report {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("failed to write report {}", path.display()))?;
        Ok(())
    }

    /// Short human-readable summary
    pub fn summary(&self) -> String {
        let reduction = if self.initial_data > 0.0 {
            100.0 * (1.0 - self.final_data / self.initial_data)
        } else {
            0.0
        };
        format!(
            "status={:?} iterations={} evaluations={} data {:.6e} -> {:.6e} ({:.1}% reduction) energy={:.6e} loss={:.6e}",
            self.status,
            self.iterations,
            self.evaluations,
            self.initial_data,
            self.final_data,
            reduction,
            self.energy,
            self.final_loss,
        )
    }
}
