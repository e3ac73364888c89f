//! Tape-based autograd engine
//!
//! Provides automatic differentiation using a computational graph with gradient tape.
//! Tensors are n-dimensional (`ndarray::ArrayD<f32>`); layer kernels follow the
//! channels-last (NHWC) convention.

mod backward;
mod layers;
mod ops;
mod tensor;


pub use backward::BackwardOp;
pub use layers::*;
pub use ops::*;
pub use tensor::{GradCell, Tensor};

use ndarray::ArrayD;

/// Perform backward pass on a tensor
///
/// Each call starts from cleared gradients on every tensor reachable from
/// `tensor`, so the same graph can be differentiated repeatedly with different
/// seeds (the graph is retained between calls).
pub fn backward(tensor: &Tensor, grad_output: Option<ArrayD<f32>>) {
    let order = backward::topological_order(tensor);
    for t in &order {
        t.zero_grad();
    }

    let seed = grad_output.unwrap_or_else(|| ArrayD::ones(tensor.data().raw_dim()));
    tensor.set_grad(seed);

    for t in order.iter().rev() {
        if let Some(op) = t.backward_op() {
            op.backward();
        }
    }
}
