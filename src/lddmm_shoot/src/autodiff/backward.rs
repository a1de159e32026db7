//! Backward rules.
//!
//! Each rule maps the adjoint of a node to the adjoint contributions of its
//! parents and is written with [`Var`] operations only. With `create_graph`
//! set, the contributions are recorded like any forward computation, which is
//! what allows gradients of gradients.

use super::var::{Op, Var};

/// Adjoint contributions `(parent, d output / d parent)` for every parent selected by `wants`.
pub(crate) fn backward<W>(node: &Var, grad: &Var, wants: W, create_graph: bool) -> Vec<(Var, Var)>
where
    W: Fn(&Var) -> bool,
{
    // Without create_graph every operand is cut from the graph, so the rules
    // below only produce constants.
    let keep = |v: &Var| {
        if create_graph {
            v.clone()
        } else {
            v.detach()
        }
    };
    let g = keep(grad);

    let mut out = Vec::with_capacity(2);
    let mut push = |parent: &Var, contribution: &dyn Fn() -> Var| {
        if wants(parent) {
            out.push((parent.clone(), contribution()));
        }
    };

    match node.op() {
        Op::Input => {}
        Op::Add(a, b) => {
            push(a, &|| g.clone());
            push(b, &|| g.clone());
        }
        Op::Sub(a, b) => {
            push(a, &|| g.clone());
            push(b, &|| g.neg());
        }
        Op::Mul(a, b) => {
            push(a, &|| g.mul(&keep(b)));
            push(b, &|| g.mul(&keep(a)));
        }
        Op::Div(a, b) => {
            // d(a/b)/db = -(a/b)/b
            push(a, &|| g.div(&keep(b)));
            push(b, &|| g.div(&keep(b)).mul(&keep(node)).neg());
        }
        Op::Scale(a, factor) => push(a, &|| g.scale(*factor)),
        Op::Neg(a) => push(a, &|| g.neg()),
        Op::Exp(a) => push(a, &|| g.mul(&keep(node))),
        Op::Sqrt(a) => push(a, &|| g.scale(0.5).div(&keep(node))),
        Op::MatMul(a, b) => {
            push(a, &|| g.matmul(&keep(b).transpose()));
            push(b, &|| keep(a).transpose().matmul(&g));
        }
        Op::Transpose(a) => push(a, &|| g.transpose()),
        Op::SumAll(a) => push(a, &|| g.broadcast(a.nrows(), a.ncols())),
        Op::Broadcast(a) => push(a, &|| g.sum()),
        Op::RowSum(a) => push(a, &|| g.expand_cols(a.ncols())),
        Op::ExpandCols(a) => push(a, &|| g.row_sum()),
        Op::GatherRows(a, indices) => push(a, &|| g.scatter_rows(indices, a.nrows())),
        Op::ScatterRows(a, indices) => push(a, &|| g.gather_rows(indices)),
        Op::Cross(a, b) => {
            // <g, da x b> = <da, b x g>,  <g, a x db> = <db, g x a>
            push(a, &|| keep(b).cross(&g));
            push(b, &|| g.cross(&keep(a)));
        }
        Op::SqDist(x, y) => {
            // dD_ij/dx_i = 2 (x_i - y_j),  dD_ij/dy_j = -2 (x_i - y_j)
            let dim = x.ncols();
            push(x, &|| {
                keep(x)
                    .mul(&g.row_sum().expand_cols(dim))
                    .sub(&g.matmul(&keep(y)))
                    .scale(2.0)
            });
            push(y, &|| {
                let gt = g.transpose();
                keep(y)
                    .mul(&gt.row_sum().expand_cols(dim))
                    .sub(&gt.matmul(&keep(x)))
                    .scale(2.0)
            });
        }
    }

    out
}
