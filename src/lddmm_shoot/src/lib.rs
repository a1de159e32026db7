//! Differentiable geodesic shooting and varifold surface matching.
//!
//! This library deforms a triangulated source surface onto a target surface
//! with the Large Deformation Diffeomorphic Metric Mapping (LDDMM) framework.
//!
//! # Architecture
//!
//! The computation is split into layers:
//! - Kernels: Gaussian velocity kernel and Gaussian x squared-cosine varifold kernel
//! - Hamiltonian system: equations of motion obtained by differentiating the
//!   kinetic energy with a nested-gradient oracle
//! - Integration: Ralston fixed-step integrator for geodesic shooting and flow
//! - Varifold attachment: orientation-robust distance between meshes
//! - Optimization: L-BFGS with More-Thuente line search over the initial momentum
//!
//! # Usage
//!
//! ```ignore
//! use lddmm_shoot::{SurfaceMatcher, TriangleMesh};
//!
//! let mut matcher = SurfaceMatcher::builder()
//!     .velocity_sigma(20.0)
//!     .varifold_sigma(20.0)
//!     .gamma(0.0)
//!     .build()?;
//!
//! matcher.set_target(target)?;
//! let result = matcher.register(&source)?;
//! println!("status: {:?}, data: {}", result.status, result.final_data);
//! ```

pub mod autodiff;
pub mod error;
pub mod hamiltonian;
pub mod integrator;
pub mod kernel;
pub mod loss;
pub mod matcher;
pub mod mesh;
pub mod optimization;
pub mod shooting;
pub mod test_utils;
pub mod timing;
pub mod varifold;

pub use autodiff::{GradientOracle, ReverseMode, Var};
pub use error::{LddmmError, Result};
pub use hamiltonian::HamiltonianSystem;
pub use integrator::{FlowState, OdeState, PhaseState, RalstonIntegrator, DEFAULT_TIME_STEPS};
pub use kernel::{GaussianKernel, GaussianLinearKernel, KernelFamily, KernelSpec, VelocityKernel};
pub use loss::{LddmmLoss, LossTerms};
pub use mesh::{FaceGeometry, FaceIndex, TriangleMesh};
pub use optimization::{
    ConvergenceStatus, IterationDebug, Lbfgs, LbfgsConfig, LddmmConfig, LddmmOptimizer,
    LineSearchKind, MatchDebug, MatchResult, OptimizationConfig,
};
pub use shooting::{flow, shoot, Shooter, DEFAULT_HORIZON};
pub use varifold::{DataAttachment, VarifoldAttachment};

// High-level API (recommended for most users)
pub use matcher::{SurfaceMatcher, SurfaceMatcherBuilder};
