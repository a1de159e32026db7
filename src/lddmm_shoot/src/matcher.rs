//! High-level surface matching API.
//!
//! # Example
//!
//! ```ignore
//! use lddmm_shoot::SurfaceMatcher;
//!
//! // Gaussian velocity and varifold kernels of bandwidth 20
//! let mut matcher = SurfaceMatcher::new(20.0)?;
//!
//! matcher.set_target(target_mesh)?;
//! let result = matcher.register(&source_mesh)?;
//!
//! println!("data {} -> {}", result.initial_data, result.final_data);
//! let moved = matcher.transport(&result.momentum, source_mesh.vertices(), &landmarks)?;
//! ```

use anyhow::{bail, Context, Result};
use nalgebra::DMatrix;
use rayon::prelude::*;
use tracing::debug;

use crate::autodiff::Var;
use crate::error::{ensure_shape, LddmmError};
use crate::integrator::RalstonIntegrator;
use crate::kernel::{GaussianKernel, GaussianLinearKernel};
use crate::loss::LddmmLoss;
use crate::mesh::TriangleMesh;
use crate::optimization::{
    LddmmConfig, LddmmOptimizer, MatchDebug, MatchResult, OptimizationConfig,
};
use crate::shooting::Shooter;
use crate::timing::Timer;
use crate::varifold::VarifoldAttachment;

/// Builder for [`SurfaceMatcher`] configuration.
#[derive(Debug, Clone, Default)]
pub struct SurfaceMatcherBuilder {
    config: LddmmConfig,
}

impl SurfaceMatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bandwidth of the velocity kernel.
    pub fn velocity_sigma(mut self, sigma: f64) -> Self {
        self.config.velocity_sigma = sigma;
        self
    }

    /// Set the bandwidth of the varifold kernel.
    pub fn varifold_sigma(mut self, sigma: f64) -> Self {
        self.config.varifold_sigma = sigma;
        self
    }

    /// Set the deformation energy weight.
    pub fn gamma(mut self, gamma: f64) -> Self {
        self.config.gamma = gamma;
        self
    }

    /// Set the number of integration steps.
    pub fn time_steps(mut self, steps: usize) -> Self {
        self.config.time_steps = steps;
        self
    }

    /// Set the integration horizon.
    pub fn horizon(mut self, horizon: f64) -> Self {
        self.config.horizon = horizon;
        self
    }

    /// Set the number of outer optimizer steps.
    pub fn outer_iterations(mut self, iterations: usize) -> Self {
        self.config.outer_iterations = iterations;
        self
    }

    pub fn max_inner_iterations(mut self, iterations: usize) -> Self {
        self.config.max_inner_iterations = iterations;
        self
    }

    /// Enable or disable the strong Wolfe line search.
    pub fn use_line_search(mut self, use_line_search: bool) -> Self {
        self.config.use_line_search = use_line_search;
        self
    }

    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.config.learning_rate = learning_rate;
        self
    }

    pub fn relative_tolerance(mut self, tolerance: f64) -> Self {
        self.config.relative_tolerance = tolerance;
        self
    }

    pub fn build(self) -> Result<SurfaceMatcher> {
        SurfaceMatcher::with_config(self.config)
    }
}

/// LDDMM surface matcher.
///
/// Holds the kernels and the target surface; each call to
/// [`register`](Self::register) builds a fresh loss for the given source and
/// optimizes the initial momentum from scratch.
#[derive(Debug, Clone)]
pub struct SurfaceMatcher {
    config: LddmmConfig,
    velocity_kernel: GaussianKernel,
    varifold_kernel: GaussianLinearKernel,
    integrator: RalstonIntegrator,
    optimizer: LddmmOptimizer,
    target: Option<TriangleMesh>,
}

impl SurfaceMatcher {
    /// Matcher with default settings and both kernel bandwidths set to `sigma`.
    pub fn new(sigma: f64) -> Result<Self> {
        Self::with_config(LddmmConfig::with_sigma(sigma))
    }

    pub fn with_config(config: LddmmConfig) -> Result<Self> {
        let velocity_kernel =
            GaussianKernel::new(config.velocity_sigma).context("invalid velocity kernel")?;
        let varifold_kernel = GaussianLinearKernel::new(config.varifold_sigma)
            .context("invalid varifold kernel")?;
        let integrator = RalstonIntegrator::new(config.time_steps)?;
        if !(config.gamma.is_finite() && config.gamma >= 0.0) {
            bail!("gamma must be finite and >= 0, got {}", config.gamma);
        }
        if !config.horizon.is_finite() {
            bail!("horizon must be finite, got {}", config.horizon);
        }
        if config.use_line_search && config.max_inner_iterations == 0 {
            bail!("max_inner_iterations must be positive");
        }

        let optimizer = LddmmOptimizer::new(OptimizationConfig::from(&config));
        Ok(Self {
            config,
            velocity_kernel,
            varifold_kernel,
            integrator,
            optimizer,
            target: None,
        })
    }

    pub fn builder() -> SurfaceMatcherBuilder {
        SurfaceMatcherBuilder::new()
    }

    pub fn config(&self) -> &LddmmConfig {
        &self.config
    }

    pub fn has_target(&self) -> bool {
        self.target.is_some()
    }

    pub fn target(&self) -> Option<&TriangleMesh> {
        self.target.as_ref()
    }

    /// Set the surface that sources are matched onto.
    ///
    /// Fails if any target face is degenerate, since varifold normals are
    /// undefined there.
    pub fn set_target(&mut self, mesh: TriangleMesh) -> Result<()> {
        mesh.geometry().context("target mesh has degenerate faces")?;
        debug!(
            vertices = mesh.num_vertices(),
            faces = mesh.num_faces(),
            "Target surface set"
        );
        self.target = Some(mesh);
        Ok(())
    }

    /// Match `source` onto the target starting from zero momentum.
    pub fn register(&self, source: &TriangleMesh) -> Result<MatchResult> {
        let momentum = DMatrix::zeros(source.num_vertices(), 3);
        self.register_from(source, momentum)
    }

    /// Match `source` onto the target starting from `initial_momentum`.
    pub fn register_from(
        &self,
        source: &TriangleMesh,
        initial_momentum: DMatrix<f64>,
    ) -> Result<MatchResult> {
        let loss = self.build_loss(source)?;
        Ok(self.optimizer.optimize(&loss, initial_momentum)?)
    }

    /// Same as [`register`](Self::register), also returning a serializable
    /// record of every outer step.
    pub fn register_with_debug(&self, source: &TriangleMesh) -> Result<(MatchResult, MatchDebug)> {
        let target = self.target.as_ref().ok_or(LddmmError::NoTarget)?;
        let setup = Timer::new("setup");
        let loss = self.build_loss(source)?;
        let setup_ms = setup.elapsed_ms();

        let momentum = DMatrix::zeros(source.num_vertices(), 3);
        let (result, mut timing) = self.optimizer.optimize_timed(&loss, momentum)?;
        timing.setup_ms = setup_ms;

        let debug = MatchDebug {
            num_source_vertices: source.num_vertices(),
            num_source_faces: source.num_faces(),
            num_target_faces: target.num_faces(),
            initial_data: result.initial_data,
            final_data: result.final_data,
            final_loss: result.final_loss,
            iterations: result.history.clone(),
            convergence_status: format!("{:?}", result.status),
            total_evaluations: result.evaluations,
            timing: cfg!(feature = "profiling").then_some(timing),
        };
        Ok((result, debug))
    }

    /// Register several sources against the target in parallel.
    ///
    /// Each registration builds its own differentiation graph on its worker
    /// thread; results come back in input order.
    pub fn register_batch(&self, sources: &[TriangleMesh]) -> Vec<Result<MatchResult>> {
        sources
            .par_iter()
            .map(|source| self.register(source))
            .collect()
    }

    /// Varifold distance between `mesh` and the target.
    pub fn distance(&self, mesh: &TriangleMesh) -> Result<f64> {
        let attachment = self.attachment(mesh)?;
        Ok(attachment.distance(mesh.vertices())?)
    }

    /// Final vertex positions when shooting `vertices` with `momentum`.
    pub fn shoot(&self, momentum: &DMatrix<f64>, vertices: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let state = self.shooter().shoot(
            &Var::constant(momentum.clone()),
            &Var::constant(vertices.clone()),
            self.config.horizon,
        )?;
        Ok(state.q.value().clone())
    }

    /// Vertex positions at every integration time, initial state included.
    pub fn shoot_trajectory(
        &self,
        momentum: &DMatrix<f64>,
        vertices: &DMatrix<f64>,
    ) -> Result<Vec<DMatrix<f64>>> {
        let states = self.shooter().shoot_trajectory(
            &Var::constant(momentum.clone()),
            &Var::constant(vertices.clone()),
            self.config.horizon,
        )?;
        Ok(states.into_iter().map(|s| s.q.value().clone()).collect())
    }

    /// Carry arbitrary `points` along the deformation generated by
    /// `(momentum, vertices)`.
    pub fn transport(
        &self,
        momentum: &DMatrix<f64>,
        vertices: &DMatrix<f64>,
        points: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>> {
        ensure_shape("transported points", (points.nrows(), 3), points.shape())?;
        let moved = self.shooter().flow(
            &Var::constant(points.clone()),
            &Var::constant(momentum.clone()),
            &Var::constant(vertices.clone()),
            self.config.horizon,
        )?;
        Ok(moved.value().clone())
    }

    /// Kinetic energy `H(momentum, vertices)` of a deformation.
    pub fn energy(&self, momentum: &DMatrix<f64>, vertices: &DMatrix<f64>) -> Result<f64> {
        let h = self.shooter().system().energy(
            &Var::constant(momentum.clone()),
            &Var::constant(vertices.clone()),
        )?;
        Ok(h.item())
    }

    fn shooter(&self) -> Shooter<GaussianKernel> {
        Shooter::new(self.velocity_kernel, self.integrator)
    }

    fn attachment(&self, source: &TriangleMesh) -> Result<VarifoldAttachment> {
        let target = self.target.as_ref().ok_or(LddmmError::NoTarget)?;
        Ok(VarifoldAttachment::new(self.varifold_kernel, source, target)?)
    }

    fn build_loss(
        &self,
        source: &TriangleMesh,
    ) -> Result<LddmmLoss<GaussianKernel, VarifoldAttachment>> {
        let attachment = self.attachment(source)?;
        let loss = LddmmLoss::new(
            self.shooter(),
            attachment,
            source.vertices().clone(),
            self.config.gamma,
            self.config.horizon,
        )?;
        Ok(loss)
    }
}
