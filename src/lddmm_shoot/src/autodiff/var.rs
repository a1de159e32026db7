//! Graph-recording dense matrices.
//!
//! A [`Var`] is an immutable node holding a `DMatrix<f64>` value together with
//! the operation and parent nodes that produced it. Every operation allocates a
//! new node, so the complete computation history stays reachable from its
//! outputs for as long as they are alive. Gradients are computed by
//! [`super::ReverseMode`], whose backward rules are written with these same
//! operations and can therefore be differentiated again.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use nalgebra::DMatrix;
use rayon::prelude::*;

/// Row-pair count above which pairwise squared distances are evaluated with rayon.
const PARALLEL_PAIR_THRESHOLD: usize = 16_384;

/// Creation sequence. A node can only depend on nodes with a smaller id.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Differentiable dense matrix.
#[derive(Clone)]
pub struct Var(pub(crate) Rc<Node>);

pub(crate) struct Node {
    pub(crate) id: u64,
    pub(crate) value: DMatrix<f64>,
    pub(crate) op: Op,
    pub(crate) requires_grad: bool,
}

/// Operation that produced a node.
///
/// Shapes needed by a backward rule (broadcast targets, scatter row counts)
/// are read back from the node's own value.
pub(crate) enum Op {
    Input,
    Add(Var, Var),
    Sub(Var, Var),
    Mul(Var, Var),
    Div(Var, Var),
    Scale(Var, f64),
    Neg(Var),
    Exp(Var),
    Sqrt(Var),
    MatMul(Var, Var),
    Transpose(Var),
    SumAll(Var),
    Broadcast(Var),
    RowSum(Var),
    ExpandCols(Var),
    GatherRows(Var, Rc<[usize]>),
    ScatterRows(Var, Rc<[usize]>),
    Cross(Var, Var),
    SqDist(Var, Var),
}

impl Op {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Op::Input => "input",
            Op::Add(..) => "add",
            Op::Sub(..) => "sub",
            Op::Mul(..) => "mul",
            Op::Div(..) => "div",
            Op::Scale(..) => "scale",
            Op::Neg(..) => "neg",
            Op::Exp(..) => "exp",
            Op::Sqrt(..) => "sqrt",
            Op::MatMul(..) => "matmul",
            Op::Transpose(..) => "transpose",
            Op::SumAll(..) => "sum",
            Op::Broadcast(..) => "broadcast",
            Op::RowSum(..) => "row_sum",
            Op::ExpandCols(..) => "expand_cols",
            Op::GatherRows(..) => "gather_rows",
            Op::ScatterRows(..) => "scatter_rows",
            Op::Cross(..) => "cross",
            Op::SqDist(..) => "sq_dist",
        }
    }

    pub(crate) fn parents(&self) -> Vec<&Var> {
        match self {
            Op::Input => Vec::new(),
            Op::Add(a, b)
            | Op::Sub(a, b)
            | Op::Mul(a, b)
            | Op::Div(a, b)
            | Op::MatMul(a, b)
            | Op::Cross(a, b)
            | Op::SqDist(a, b) => vec![a, b],
            Op::Scale(a, _)
            | Op::Neg(a)
            | Op::Exp(a)
            | Op::Sqrt(a)
            | Op::Transpose(a)
            | Op::SumAll(a)
            | Op::Broadcast(a)
            | Op::RowSum(a)
            | Op::ExpandCols(a)
            | Op::GatherRows(a, _)
            | Op::ScatterRows(a, _) => vec![a],
        }
    }

    fn take_parents(&mut self) -> Vec<Var> {
        match std::mem::replace(self, Op::Input) {
            Op::Input => Vec::new(),
            Op::Add(a, b)
            | Op::Sub(a, b)
            | Op::Mul(a, b)
            | Op::Div(a, b)
            | Op::MatMul(a, b)
            | Op::Cross(a, b)
            | Op::SqDist(a, b) => vec![a, b],
            Op::Scale(a, _)
            | Op::Neg(a)
            | Op::Exp(a)
            | Op::Sqrt(a)
            | Op::Transpose(a)
            | Op::SumAll(a)
            | Op::Broadcast(a)
            | Op::RowSum(a)
            | Op::ExpandCols(a)
            | Op::GatherRows(a, _)
            | Op::ScatterRows(a, _) => vec![a],
        }
    }
}

// Unrolled integrations produce parent chains thousands of nodes deep; release
// them with an explicit stack instead of recursive drops.
impl Drop for Node {
    fn drop(&mut self) {
        let mut stack = self.op.take_parents();
        while let Some(var) = stack.pop() {
            if let Ok(mut node) = Rc::try_unwrap(var.0) {
                stack.extend(node.op.take_parents());
            }
        }
    }
}

impl Var {
    fn from_parts(value: DMatrix<f64>, op: Op, requires_grad: bool) -> Self {
        Var(Rc::new(Node {
            id: next_id(),
            value,
            op,
            requires_grad,
        }))
    }

    /// Record `op` unless none of its parents is tracked, in which case the
    /// result is a plain constant and the parents are released.
    fn record(value: DMatrix<f64>, op: Op) -> Self {
        let requires_grad = op.parents().iter().any(|p| p.requires_grad());
        if requires_grad {
            Self::from_parts(value, op, true)
        } else {
            Self::from_parts(value, Op::Input, false)
        }
    }

    /// Input that gradients can be taken with respect to.
    pub fn leaf(value: DMatrix<f64>) -> Self {
        Self::from_parts(value, Op::Input, true)
    }

    /// Input that is never differentiated.
    pub fn constant(value: DMatrix<f64>) -> Self {
        Self::from_parts(value, Op::Input, false)
    }

    /// 1x1 constant.
    pub fn scalar(value: f64) -> Self {
        Self::constant(DMatrix::from_element(1, 1, value))
    }

    /// Constant of zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::constant(DMatrix::zeros(rows, cols))
    }

    pub fn value(&self) -> &DMatrix<f64> {
        &self.0.value
    }

    pub fn shape(&self) -> (usize, usize) {
        self.0.value.shape()
    }

    pub fn nrows(&self) -> usize {
        self.0.value.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.0.value.ncols()
    }

    /// Value of a 1x1 Var.
    ///
    /// # Panics
    /// Panics if the Var is not 1x1.
    pub fn item(&self) -> f64 {
        assert_eq!(self.shape(), (1, 1), "item() requires a 1x1 Var");
        self.0.value[(0, 0)]
    }

    /// Whether gradients flow into this node.
    pub fn requires_grad(&self) -> bool {
        self.0.requires_grad
    }

    /// Creation sequence number.
    pub(crate) fn id(&self) -> u64 {
        self.0.id
    }

    pub(crate) fn op(&self) -> &Op {
        &self.0.op
    }

    /// Constant copy of the value, cut from the graph.
    pub fn detach(&self) -> Self {
        Self::constant(self.value().clone())
    }

    /// `self` if it is tracked, otherwise a fresh leaf with the same value.
    pub fn tracked(&self) -> Self {
        if self.requires_grad() {
            self.clone()
        } else {
            Self::leaf(self.value().clone())
        }
    }

    /// Whether every entry is finite.
    pub fn is_finite(&self) -> bool {
        self.value().iter().all(|v| v.is_finite())
    }

    // ---------------------------------------------------------------------
    // Elementwise
    // ---------------------------------------------------------------------

    pub fn add(&self, other: &Var) -> Var {
        assert_eq!(self.shape(), other.shape(), "add: shape mismatch");
        Var::record(
            self.value() + other.value(),
            Op::Add(self.clone(), other.clone()),
        )
    }

    pub fn sub(&self, other: &Var) -> Var {
        assert_eq!(self.shape(), other.shape(), "sub: shape mismatch");
        Var::record(
            self.value() - other.value(),
            Op::Sub(self.clone(), other.clone()),
        )
    }

    /// Elementwise product.
    pub fn mul(&self, other: &Var) -> Var {
        assert_eq!(self.shape(), other.shape(), "mul: shape mismatch");
        Var::record(
            self.value().component_mul(other.value()),
            Op::Mul(self.clone(), other.clone()),
        )
    }

    /// Elementwise quotient.
    pub fn div(&self, other: &Var) -> Var {
        assert_eq!(self.shape(), other.shape(), "div: shape mismatch");
        Var::record(
            self.value().component_div(other.value()),
            Op::Div(self.clone(), other.clone()),
        )
    }

    pub fn scale(&self, factor: f64) -> Var {
        Var::record(self.value() * factor, Op::Scale(self.clone(), factor))
    }

    pub fn neg(&self) -> Var {
        Var::record(-self.value(), Op::Neg(self.clone()))
    }

    pub fn exp(&self) -> Var {
        Var::record(self.value().map(f64::exp), Op::Exp(self.clone()))
    }

    pub fn sqrt(&self) -> Var {
        Var::record(self.value().map(f64::sqrt), Op::Sqrt(self.clone()))
    }

    /// `self + factor * other`.
    pub fn axpy(&self, factor: f64, other: &Var) -> Var {
        self.add(&other.scale(factor))
    }

    // ---------------------------------------------------------------------
    // Linear algebra and reductions
    // ---------------------------------------------------------------------

    pub fn matmul(&self, other: &Var) -> Var {
        assert_eq!(self.ncols(), other.nrows(), "matmul: inner dimension mismatch");
        Var::record(
            self.value() * other.value(),
            Op::MatMul(self.clone(), other.clone()),
        )
    }

    pub fn transpose(&self) -> Var {
        Var::record(self.value().transpose(), Op::Transpose(self.clone()))
    }

    /// Sum of all entries as a 1x1 Var.
    pub fn sum(&self) -> Var {
        Var::record(
            DMatrix::from_element(1, 1, self.value().sum()),
            Op::SumAll(self.clone()),
        )
    }

    /// Fill a `rows x cols` matrix with the value of a 1x1 Var.
    pub fn broadcast(&self, rows: usize, cols: usize) -> Var {
        let v = self.item();
        Var::record(
            DMatrix::from_element(rows, cols, v),
            Op::Broadcast(self.clone()),
        )
    }

    /// Per-row sums, `n x d -> n x 1`.
    pub fn row_sum(&self) -> Var {
        let value = self.value();
        let sums = DMatrix::from_fn(value.nrows(), 1, |i, _| value.row(i).sum());
        Var::record(sums, Op::RowSum(self.clone()))
    }

    /// Repeat a column vector, `n x 1 -> n x cols`.
    pub fn expand_cols(&self, cols: usize) -> Var {
        assert_eq!(self.ncols(), 1, "expand_cols: expected a column vector");
        let value = self.value();
        let expanded = DMatrix::from_fn(value.nrows(), cols, |i, _| value[(i, 0)]);
        Var::record(expanded, Op::ExpandCols(self.clone()))
    }

    /// Select rows by index (rows may repeat).
    ///
    /// # Panics
    /// Panics if an index is out of range; mesh indices are validated before use.
    pub fn gather_rows(&self, indices: &Rc<[usize]>) -> Var {
        let value = self.value();
        let gathered = DMatrix::from_fn(indices.len(), value.ncols(), |r, c| {
            value[(indices[r], c)]
        });
        Var::record(gathered, Op::GatherRows(self.clone(), Rc::clone(indices)))
    }

    /// Add row `r` into row `indices[r]` of a `rows x d` zero matrix.
    pub fn scatter_rows(&self, indices: &Rc<[usize]>, rows: usize) -> Var {
        assert_eq!(self.nrows(), indices.len(), "scatter_rows: index count mismatch");
        let value = self.value();
        let mut scattered = DMatrix::zeros(rows, value.ncols());
        for (r, &target) in indices.iter().enumerate() {
            for c in 0..value.ncols() {
                scattered[(target, c)] += value[(r, c)];
            }
        }
        Var::record(scattered, Op::ScatterRows(self.clone(), Rc::clone(indices)))
    }

    // ---------------------------------------------------------------------
    // Geometry
    // ---------------------------------------------------------------------

    /// Row-wise cross product of two `n x 3` matrices.
    pub fn cross(&self, other: &Var) -> Var {
        assert_eq!(self.ncols(), 3, "cross: expected 3 columns");
        assert_eq!(self.shape(), other.shape(), "cross: shape mismatch");
        let (a, b) = (self.value(), other.value());
        let mut out = DMatrix::zeros(a.nrows(), 3);
        for i in 0..a.nrows() {
            out[(i, 0)] = a[(i, 1)] * b[(i, 2)] - a[(i, 2)] * b[(i, 1)];
            out[(i, 1)] = a[(i, 2)] * b[(i, 0)] - a[(i, 0)] * b[(i, 2)];
            out[(i, 2)] = a[(i, 0)] * b[(i, 1)] - a[(i, 1)] * b[(i, 0)];
        }
        Var::record(out, Op::Cross(self.clone(), other.clone()))
    }

    /// Pairwise squared distances `D_ij = |x_i - y_j|^2`, `n x d, m x d -> n x m`.
    ///
    /// Coordinates are differenced before squaring so that nearby points far
    /// from the origin keep their precision.
    pub fn sq_dist(&self, other: &Var) -> Var {
        assert_eq!(self.ncols(), other.ncols(), "sq_dist: dimension mismatch");
        Var::record(
            pairwise_sq_dist(self.value(), other.value()),
            Op::SqDist(self.clone(), other.clone()),
        )
    }
}

fn pairwise_sq_dist(x: &DMatrix<f64>, y: &DMatrix<f64>) -> DMatrix<f64> {
    let (n, m, d) = (x.nrows(), y.nrows(), x.ncols());
    let entry = |i: usize, j: usize| -> f64 {
        (0..d)
            .map(|k| {
                let diff = x[(i, k)] - y[(j, k)];
                diff * diff
            })
            .sum()
    };

    if n * m < PARALLEL_PAIR_THRESHOLD {
        return DMatrix::from_fn(n, m, entry);
    }

    // Column-major output: one task per column j, each entry computed independently.
    let columns: Vec<Vec<f64>> = (0..m)
        .into_par_iter()
        .map(|j| (0..n).map(|i| entry(i, j)).collect())
        .collect();
    DMatrix::from_iterator(n, m, columns.into_iter().flatten())
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (rows, cols) = self.shape();
        f.debug_struct("Var")
            .field("op", &self.op().name())
            .field("shape", &format!("{rows}x{cols}"))
            .field("requires_grad", &self.requires_grad())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn mat(rows: usize, cols: usize, data: &[f64]) -> DMatrix<f64> {
        DMatrix::from_row_slice(rows, cols, data)
    }

    #[test]
    fn test_constant_ops_do_not_record() {
        let a = Var::constant(mat(1, 2, &[1.0, 2.0]));
        let b = Var::constant(mat(1, 2, &[3.0, 4.0]));
        let c = a.add(&b);
        assert!(!c.requires_grad());
        assert!(c.op().parents().is_empty());
        assert_eq!(c.value(), &mat(1, 2, &[4.0, 6.0]));
    }

    #[test]
    fn test_leaf_ops_record() {
        let a = Var::leaf(mat(1, 2, &[1.0, 2.0]));
        let b = Var::constant(mat(1, 2, &[3.0, 4.0]));
        let c = a.mul(&b);
        assert!(c.requires_grad());
        assert_eq!(c.op().name(), "mul");
        assert_eq!(c.value(), &mat(1, 2, &[3.0, 8.0]));
    }

    #[test]
    fn test_ids_increase() {
        let a = Var::leaf(mat(1, 1, &[1.0]));
        let b = a.exp();
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_row_sum_and_expand() {
        let a = Var::constant(mat(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        let s = a.row_sum();
        assert_eq!(s.value(), &mat(2, 1, &[6.0, 15.0]));

        let e = s.expand_cols(2);
        assert_eq!(e.value(), &mat(2, 2, &[6.0, 6.0, 15.0, 15.0]));
    }

    #[test]
    fn test_gather_scatter() {
        let a = Var::constant(mat(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        let idx: Rc<[usize]> = Rc::from(vec![2, 0, 2]);
        let g = a.gather_rows(&idx);
        assert_eq!(g.value(), &mat(3, 2, &[5.0, 6.0, 1.0, 2.0, 5.0, 6.0]));

        let s = g.scatter_rows(&idx, 3);
        assert_eq!(s.value(), &mat(3, 2, &[1.0, 2.0, 0.0, 0.0, 10.0, 12.0]));
    }

    #[test]
    fn test_cross() {
        let a = Var::constant(mat(2, 3, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]));
        let b = Var::constant(mat(2, 3, &[0.0, 1.0, 0.0, 0.0, 0.0, 1.0]));
        let c = a.cross(&b);
        assert_eq!(c.value(), &mat(2, 3, &[0.0, 0.0, 1.0, 1.0, 0.0, 0.0]));
    }

    #[test]
    fn test_sq_dist() {
        let x = Var::constant(mat(2, 2, &[0.0, 0.0, 1.0, 1.0]));
        let y = Var::constant(mat(3, 2, &[0.0, 0.0, 3.0, 4.0, 1.0, 0.0]));
        let d = x.sq_dist(&y);
        assert_eq!(d.shape(), (2, 3));
        assert_relative_eq!(d.value()[(0, 1)], 25.0);
        assert_relative_eq!(d.value()[(1, 0)], 2.0);
        assert_relative_eq!(d.value()[(1, 2)], 1.0);
    }

    #[test]
    fn test_sq_dist_parallel_matches_sequential() {
        let n = 200;
        let x = DMatrix::from_fn(n, 3, |i, k| (i * 3 + k) as f64 * 0.01);
        let y = DMatrix::from_fn(n, 3, |i, k| (i * 7 + k) as f64 * -0.02);
        let fast = pairwise_sq_dist(&x, &y);
        let slow = DMatrix::from_fn(n, n, |i, j| (x.row(i) - y.row(j)).norm_squared());
        for (a, b) in fast.iter().zip(slow.iter()) {
            assert_relative_eq!(*a, *b, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_deep_chain_drop() {
        let mut v = Var::leaf(mat(1, 1, &[0.0]));
        for _ in 0..200_000 {
            v = v.scale(1.0);
        }
        drop(v);
    }
}
