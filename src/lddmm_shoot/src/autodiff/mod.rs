//! Reverse-mode automatic differentiation with nested gradients.
//!
//! [`Var`] records dense matrix operations into a reference-counted graph and
//! [`ReverseMode`] walks that graph backwards. Passing `create_graph = true`
//! records the backward pass itself, so a gradient can appear inside another
//! differentiated expression. Geodesic shooting depends on this: the vector
//! field is a gradient of the Hamiltonian, and the loss gradient flows back
//! through every vector-field evaluation of the integration.

mod backward;
mod oracle;
mod var;

pub use oracle::{GradientOracle, ReverseMode};
pub use var::Var;
