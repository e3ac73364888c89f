//! Backward operation trait and tape ordering

use super::Tensor;
use std::collections::HashSet;

/// Trait for backward pass operations
///
/// An operation only propagates one step: it reads the gradient of its result
/// and accumulates into its direct inputs. Traversal order is owned by
/// [`backward`](super::backward).
pub trait BackwardOp {
    /// Tensors this operation propagates gradients into
    fn inputs(&self) -> Vec<Tensor>;

    /// Perform backward pass
    fn backward(&self);
}

/// Tensors reachable from `root`, ordered so that every tensor appears after
/// all of its inputs (post-order DFS, iterative).
pub(crate) fn topological_order(root: &Tensor) -> Vec<Tensor> {
    let mut order = Vec::new();
    let mut visited: HashSet<usize> = HashSet::new();
    // (tensor, inputs already expanded)
    let mut stack: Vec<(Tensor, bool)> = vec![(root.clone(), false)];

    while let Some((tensor, expanded)) = stack.pop() {
        if expanded {
            order.push(tensor);
            continue;
        }
        if !visited.insert(tensor.node_key()) {
            continue;
        }
        let inputs = tensor
            .backward_op()
            .map(|op| op.inputs())
            .unwrap_or_default();
        stack.push((tensor, true));
        for input in inputs {
            if !visited.contains(&input.node_key()) {
                stack.push((input, false));
            }
        }
    }

    order
}
