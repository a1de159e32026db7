//! Gradient oracles.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use super::backward::backward;
use super::var::Var;
use crate::error::{LddmmError, Result};

/// Computes gradients of a scalar [`Var`] with respect to other Vars.
pub trait GradientOracle {
    /// Whether gradients returned with `create_graph = true` can themselves be differentiated.
    fn supports_higher_order(&self) -> bool;

    /// Gradient of the 1x1 `output` with respect to each Var in `wrt`.
    ///
    /// Each returned Var has the shape of its `wrt` counterpart. A `wrt` Var the
    /// output does not depend on (constants included) gets zeros.
    fn gradient(&self, output: &Var, wrt: &[&Var], create_graph: bool) -> Result<Vec<Var>>;
}

/// Reverse accumulation over the graph retained by [`Var`].
///
/// Only nodes lying on a path from some `wrt` node to the output are visited,
/// and nodes created before the earliest `wrt` node are never entered. When one
/// `wrt` node is an ancestor of another, the ancestor receives the total
/// derivative.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseMode;

impl GradientOracle for ReverseMode {
    fn supports_higher_order(&self) -> bool {
        true
    }

    fn gradient(&self, output: &Var, wrt: &[&Var], create_graph: bool) -> Result<Vec<Var>> {
        let (rows, cols) = output.shape();
        if (rows, cols) != (1, 1) {
            return Err(LddmmError::NonScalarOutput { rows, cols });
        }
        let Some(min_id) = wrt.iter().map(|w| w.id()).min() else {
            return Ok(Vec::new());
        };
        let targets: HashSet<u64> = wrt.iter().map(|w| w.id()).collect();

        let order = topological_order(output, min_id);

        let mut relevant = HashSet::new();
        for node in &order {
            if targets.contains(&node.id())
                || node
                    .op()
                    .parents()
                    .iter()
                    .any(|p| relevant.contains(&p.id()))
            {
                relevant.insert(node.id());
            }
        }

        let mut adjoints: HashMap<u64, Var> = HashMap::new();
        if relevant.contains(&output.id()) {
            adjoints.insert(output.id(), Var::scalar(1.0));
        }

        for node in order.iter().rev() {
            if !relevant.contains(&node.id()) {
                continue;
            }
            let grad = if targets.contains(&node.id()) {
                adjoints.get(&node.id()).cloned()
            } else {
                adjoints.remove(&node.id())
            };
            let Some(grad) = grad else {
                continue;
            };

            let contributions = backward(
                node,
                &grad,
                |parent| relevant.contains(&parent.id()),
                create_graph,
            );
            for (parent, contribution) in contributions {
                match adjoints.entry(parent.id()) {
                    Entry::Occupied(mut slot) => {
                        let total = slot.get().add(&contribution);
                        slot.insert(total);
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(contribution);
                    }
                }
            }
        }

        Ok(wrt
            .iter()
            .map(|w| match adjoints.get(&w.id()) {
                Some(g) if create_graph => g.clone(),
                Some(g) => g.detach(),
                None => Var::zeros(w.nrows(), w.ncols()),
            })
            .collect())
    }
}

/// Tracked nodes reachable from `output` with id `>= min_id`, parents before children.
fn topological_order(output: &Var, min_id: u64) -> Vec<Var> {
    let enters = |v: &Var| v.requires_grad() && v.id() >= min_id;

    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(output.clone(), false)];

    while let Some((var, expanded)) = stack.pop() {
        if expanded {
            order.push(var);
            continue;
        }
        if !enters(&var) || !visited.insert(var.id()) {
            continue;
        }
        let parents: Vec<Var> = var
            .op()
            .parents()
            .into_iter()
            .filter(|p| enters(*p) && !visited.contains(&p.id()))
            .cloned()
            .collect();
        stack.push((var, true));
        stack.extend(parents.into_iter().map(|p| (p, false)));
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random(rng: &mut StdRng, rows: usize, cols: usize) -> DMatrix<f64> {
        DMatrix::from_fn(rows, cols, |_, _| rng.gen_range(-1.0..1.0))
    }

    fn grad1(output: &Var, wrt: &Var, create_graph: bool) -> Var {
        ReverseMode
            .gradient(output, &[wrt], create_graph)
            .unwrap()
            .remove(0)
    }

    /// Compare the reverse-mode gradient of `f` at `x0` with central differences.
    fn check_gradient<F>(f: F, x0: &DMatrix<f64>, tol: f64)
    where
        F: Fn(&Var) -> Var,
    {
        let x = Var::leaf(x0.clone());
        let analytic = grad1(&f(&x), &x, false);

        let h = 1e-6;
        for k in 0..x0.len() {
            let mut plus = x0.clone();
            let mut minus = x0.clone();
            plus[k] += h;
            minus[k] -= h;
            let fd = (f(&Var::constant(plus)).item() - f(&Var::constant(minus)).item()) / (2.0 * h);
            assert_relative_eq!(analytic.value()[k], fd, epsilon = tol, max_relative = tol);
        }
    }

    /// Check the gradient of `w . grad f(x)` against central differences, which
    /// exercises the backward rules of every backward rule used by `f`.
    fn check_second_order<F>(f: F, x0: &DMatrix<f64>, seed: u64)
    where
        F: Fn(&Var) -> Var + Copy,
    {
        let mut rng = StdRng::seed_from_u64(seed);
        let w = Var::constant(random(&mut rng, x0.nrows(), x0.ncols()));
        let directional = |x: &Var| {
            let x = x.tracked();
            grad1(&f(&x), &x, true).mul(&w).sum()
        };

        let x = Var::leaf(x0.clone());
        let analytic = grad1(&directional(&x), &x, false);

        let h = 1e-5;
        for k in 0..x0.len() {
            let mut plus = x0.clone();
            let mut minus = x0.clone();
            plus[k] += h;
            minus[k] -= h;
            let fd = (directional(&Var::leaf(plus)).item() - directional(&Var::leaf(minus)).item())
                / (2.0 * h);
            assert_relative_eq!(analytic.value()[k], fd, epsilon = 1e-5, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_quadratic_gradient() {
        let x = Var::leaf(DMatrix::from_row_slice(1, 3, &[1.0, -2.0, 0.5]));
        let f = x.mul(&x).sum();
        let g = grad1(&f, &x, false);
        assert_eq!(g.value(), &DMatrix::from_row_slice(1, 3, &[2.0, -4.0, 1.0]));
        assert!(!g.requires_grad());
    }

    #[test]
    fn test_second_derivative_of_cube() {
        let x = Var::leaf(DMatrix::from_row_slice(2, 1, &[1.5, -0.5]));
        let f = x.mul(&x).mul(&x).sum();

        let g = grad1(&f, &x, true);
        assert!(g.requires_grad());
        assert_relative_eq!(g.value()[0], 3.0 * 1.5 * 1.5, epsilon = 1e-12);
        assert_relative_eq!(g.value()[1], 3.0 * 0.25, epsilon = 1e-12);

        let h = grad1(&g.sum(), &x, false);
        assert_relative_eq!(h.value()[0], 6.0 * 1.5, epsilon = 1e-12);
        assert_relative_eq!(h.value()[1], 6.0 * -0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_detached_inner_gradient_breaks_outer_gradient() {
        // f(x) = x^3, outer(x) = sum(f'(x) * x) = 3 x^3, outer'(x) = 9 x^2
        let x0 = DMatrix::from_row_slice(1, 1, &[2.0]);

        let x = Var::leaf(x0.clone());
        let inner = grad1(&x.mul(&x).mul(&x).sum(), &x, true);
        let nested = grad1(&inner.mul(&x).sum(), &x, false);
        assert_relative_eq!(nested.item(), 36.0, epsilon = 1e-12);

        let x = Var::leaf(x0);
        let inner = grad1(&x.mul(&x).mul(&x).sum(), &x, false);
        let detached = grad1(&inner.mul(&x).sum(), &x, false);
        assert_relative_eq!(detached.item(), 12.0, epsilon = 1e-12);
        assert!((detached.item() - nested.item()).abs() > 1.0);
    }

    #[test]
    fn test_non_scalar_output_rejected() {
        let x = Var::leaf(DMatrix::zeros(2, 2));
        let err = ReverseMode.gradient(&x.exp(), &[&x], false).unwrap_err();
        assert_eq!(err, LddmmError::NonScalarOutput { rows: 2, cols: 2 });
    }

    #[test]
    fn test_unrelated_wrt_gets_zeros() {
        let x = Var::leaf(DMatrix::from_element(2, 1, 1.0));
        let y = Var::leaf(DMatrix::from_element(3, 2, 1.0));
        let c = Var::constant(DMatrix::from_element(2, 1, 1.0));
        let f = x.exp().add(&c).sum();

        let grads = ReverseMode.gradient(&f, &[&x, &y, &c], false).unwrap();
        assert_relative_eq!(grads[0].value()[0], 1f64.exp(), epsilon = 1e-12);
        assert_eq!(grads[1].value(), &DMatrix::zeros(3, 2));
        assert_eq!(grads[2].value(), &DMatrix::zeros(2, 1));
    }

    #[test]
    fn test_total_derivative_through_intermediate_wrt() {
        // y = 2x, f = sum(y * y): df/dy = 2y = 4x, df/dx = 8x
        let x = Var::leaf(DMatrix::from_row_slice(1, 2, &[1.0, 3.0]));
        let y = x.scale(2.0);
        let f = y.mul(&y).sum();

        let grads = ReverseMode.gradient(&f, &[&x, &y], false).unwrap();
        assert_eq!(grads[0].value(), &DMatrix::from_row_slice(1, 2, &[8.0, 24.0]));
        assert_eq!(grads[1].value(), &DMatrix::from_row_slice(1, 2, &[4.0, 12.0]));
    }

    #[test]
    fn test_shared_subexpression_accumulates() {
        let x = Var::leaf(DMatrix::from_row_slice(1, 1, &[0.3]));
        let e = x.exp();
        let f = e.add(&e).mul(&e).sum(); // 2 e^{2x}
        let g = grad1(&f, &x, false);
        assert_relative_eq!(g.item(), 4.0 * (0.6f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_primitive_gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(7);
        let w3 = random(&mut rng, 4, 3);
        let w_nm = random(&mut rng, 4, 5);
        let y = random(&mut rng, 5, 3);
        let b = random(&mut rng, 3, 2);
        let x0 = random(&mut rng, 4, 3);
        let positive = x0.map(|v| v.abs() + 0.5);

        let weight = |w: &DMatrix<f64>| Var::constant(w.clone());

        check_gradient(|x| x.sq_dist(&weight(&y)).mul(&weight(&w_nm)).sum(), &x0, 1e-6);
        check_gradient(|x| weight(&y).sq_dist(x).transpose().mul(&weight(&w_nm)).sum(), &x0, 1e-6);
        check_gradient(|x| x.cross(&weight(&w3)).mul(&weight(&w3)).sum(), &x0, 1e-6);
        check_gradient(|x| weight(&w3).cross(x).mul(&x.exp()).sum(), &x0, 1e-6);
        check_gradient(|x| x.matmul(&weight(&b)).mul(&x.matmul(&weight(&b))).sum(), &x0, 1e-6);
        check_gradient(|x| weight(&w3).div(x).sum(), &positive, 1e-5);
        check_gradient(|x| x.sqrt().mul(&weight(&w3)).sum(), &positive, 1e-6);
        check_gradient(
            |x| x.row_sum().expand_cols(3).mul(&weight(&w3)).neg().sum(),
            &x0,
            1e-6,
        );
        check_gradient(
            |x| x.sum().broadcast(4, 3).mul(&weight(&w3)).mul(x).sum(),
            &x0,
            1e-6,
        );

        let idx: std::rc::Rc<[usize]> = std::rc::Rc::from(vec![3, 1, 1, 0, 2]);
        let w53 = random(&mut rng, 5, 3);
        check_gradient(
            |x| x.gather_rows(&idx).mul(&weight(&w53)).exp().sum(),
            &x0,
            1e-6,
        );
        check_gradient(
            |x| {
                x.gather_rows(&idx)
                    .scatter_rows(&idx, 4)
                    .mul(&weight(&w3))
                    .mul(x)
                    .sum()
            },
            &x0,
            1e-6,
        );
    }

    #[test]
    fn test_second_order_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(11);
        let x0 = random(&mut rng, 4, 3);

        check_second_order(
            |x: &Var| {
                let y = Var::constant(DMatrix::from_fn(3, 3, |i, j| (i + 2 * j) as f64 * 0.1));
                x.sq_dist(&y).scale(-1.0).exp().sum()
            },
            &x0,
            1,
        );
        check_second_order(|x: &Var| x.sq_dist(x).scale(-0.5).exp().sum(), &x0, 2);
        check_second_order(
            |x: &Var| {
                let n = x.cross(&x.exp());
                n.mul(&n).row_sum().sqrt().sum()
            },
            &x0,
            3,
        );
        check_second_order(
            |x: &Var| {
                let k = x.matmul(&x.transpose());
                k.mul(&k).matmul(x).mul(x).sum()
            },
            &x0,
            4,
        );
    }
}
