//! Quasi-Newton optimization of the initial momentum.
//!
//! This module implements the outer loop of LDDMM matching:
//! 1. Shoot the source with the current momentum and evaluate the loss
//! 2. Back-propagate through the unrolled integration to get ∇L(p0)
//! 3. Take an L-BFGS step with a strong Wolfe line search
//! 4. Record progress and check convergence

pub mod debug;
pub mod lbfgs;
pub mod line_search;
pub mod more_thuente;
pub mod solver;
pub mod types;

pub use debug::{IterationDebug, IterationTimingDebug, MatchDebug};
pub use lbfgs::{Lbfgs, LbfgsConfig, LineSearchKind, StepOutcome, StepReport};
pub use line_search::{backtracking_line_search, LineSearchConfig, LineSearchResult};
pub use more_thuente::{more_thuente_search, MoreThuenteConfig, MoreThuenteResult};
pub use solver::{LddmmOptimizer, OptimizationConfig};
pub use types::{ConvergenceStatus, LddmmConfig, MatchResult};
