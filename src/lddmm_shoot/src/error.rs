//! Error types for the shooting engine.

use thiserror::Error;

use crate::kernel::KernelFamily;

/// Errors raised by kernel evaluation, integration, varifold and optimization code.
///
/// None of these are transient: every variant means the caller's inputs (or the
/// configured parameters) are invalid, so nothing in the crate retries.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LddmmError {
    /// Array dimensions are inconsistent with each other.
    #[error("shape mismatch in {context}: expected {expected}, found {found}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        found: String,
    },

    /// A face references a vertex that does not exist.
    #[error("face {face} references vertex {index} but there are only {num_vertices} vertices")]
    FaceIndexOutOfRange {
        face: usize,
        index: usize,
        num_vertices: usize,
    },

    /// A face has zero (or non-finite) area, so its unit normal is undefined.
    #[error("face {face} is degenerate (area = {area})")]
    DegenerateFace { face: usize, area: f64 },

    /// A NaN or infinity was produced or supplied.
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),

    /// A configuration parameter is out of its valid range.
    #[error("invalid parameter {name} = {value}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    /// Gradients can only be taken of 1x1 outputs.
    #[error("gradient output must be a 1x1 scalar, got {rows}x{cols}")]
    NonScalarOutput { rows: usize, cols: usize },

    /// The gradient oracle cannot differentiate through its own results.
    #[error("gradient oracle does not support higher-order differentiation")]
    UnsupportedOracle,

    /// The mesh has no vertices or no faces.
    #[error("mesh has no {0}")]
    EmptyMesh(&'static str),

    /// A kernel was built from a spec of another family.
    #[error("kernel spec is {found:?}, expected {expected:?}")]
    WrongKernelFamily {
        expected: KernelFamily,
        found: KernelFamily,
    },

    /// Registration was requested before a target surface was set.
    #[error("no target surface set, call set_target() first")]
    NoTarget,
}

/// Result alias used throughout the crate.
pub type Result<T, E = LddmmError> = std::result::Result<T, E>;

/// Fail with [`LddmmError::ShapeMismatch`] unless `found == expected`.
pub(crate) fn ensure_shape(
    context: &'static str,
    expected: (usize, usize),
    found: (usize, usize),
) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(LddmmError::ShapeMismatch {
            context,
            expected: format!("{}x{}", expected.0, expected.1),
            found: format!("{}x{}", found.0, found.1),
        })
    }
}

/// Fail with [`LddmmError::ShapeMismatch`] unless two dimensions agree.
pub(crate) fn ensure_dim(
    context: &'static str,
    what: &'static str,
    expected: usize,
    found: usize,
) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(LddmmError::ShapeMismatch {
            context,
            expected: format!("{what} = {expected}"),
            found: format!("{what} = {found}"),
        })
    }
}

/// Fail with [`LddmmError::InvalidParameter`] unless `value` is finite and strictly positive.
pub(crate) fn ensure_positive(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(LddmmError::InvalidParameter {
            name,
            value,
            reason: "must be finite and > 0",
        })
    }
}
