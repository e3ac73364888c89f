//! Autograd operations with backward passes

use super::{BackwardOp, GradCell, Tensor};
use crate::error::{Error, Result};
use ndarray::{concatenate, ArrayD, ArrayView, Axis, IxDyn, Slice};
use std::rc::Rc;

fn check_same_shape(a: &Tensor, b: &Tensor) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(Error::ShapeMismatch {
            expected: a.shape().to_vec(),
            got: b.shape().to_vec(),
        });
    }
    Ok(())
}

/// Add two tensors of identical shape
pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    check_same_shape(a, b)?;
    let data = a.data() + b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(AddBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    Ok(result)
}

struct AddBackward {
    a: Tensor,
    b: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for AddBackward {
    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone(), self.b.clone()]
    }

    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad.clone());
            }
            if self.b.requires_grad() {
                self.b.accumulate_grad(grad.clone());
            }
        }
    }
}

/// Multiply two tensors of identical shape element-wise
pub fn mul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    check_same_shape(a, b)?;
    let data = a.data() * b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(MulBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    Ok(result)
}

struct MulBackward {
    a: Tensor,
    b: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for MulBackward {
    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone(), self.b.clone()]
    }

    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂out * b
                self.a.accumulate_grad(grad * self.b.data());
            }
            if self.b.requires_grad() {
                // ∂L/∂b = ∂L/∂out * a
                self.b.accumulate_grad(grad * self.a.data());
            }
        }
    }
}

/// Scale tensor by a scalar
pub fn scale(a: &Tensor, factor: f32) -> Tensor {
    let data = a.data() * factor;
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(ScaleBackward {
            a: a.clone(),
            factor,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct ScaleBackward {
    a: Tensor,
    factor: f32,
    result_grad: GradCell,
}

impl BackwardOp for ScaleBackward {
    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone()]
    }

    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad * self.factor);
            }
        }
    }
}

/// ReLU activation
pub fn relu(a: &Tensor) -> Tensor {
    relu_clipped(a, None)
}

/// ReLU activation with an optional upper bound (`max_value = 6.0` gives ReLU6)
pub fn relu_clipped(a: &Tensor, max_value: Option<f32>) -> Tensor {
    let upper = max_value.unwrap_or(f32::INFINITY);
    let data = a.data().mapv(|x| x.max(0.0).min(upper));
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(ReluBackward {
            a: a.clone(),
            upper,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct ReluBackward {
    a: Tensor,
    upper: f32,
    result_grad: GradCell,
}

impl BackwardOp for ReluBackward {
    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone()]
    }

    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂out * (0 < a < upper)
                let upper = self.upper;
                let mask = self
                    .a
                    .data()
                    .mapv(|x| if x > 0.0 && x < upper { 1.0 } else { 0.0 });
                self.a.accumulate_grad(grad * &mask);
            }
        }
    }
}

/// Softmax over the last axis
pub fn softmax(a: &Tensor) -> Tensor {
    let last = Axis(a.ndim().saturating_sub(1));
    let mut data = a.data().clone();
    for mut lane in data.lanes_mut(last) {
        let max_val = lane.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        lane.mapv_inplace(|x| (x - max_val).exp());
        let sum_exp = lane.sum();
        lane.mapv_inplace(|x| x / sum_exp);
    }

    let requires_grad = a.requires_grad();
    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let output_clone = result.detach();
        let backward_op = Rc::new(SoftmaxBackward {
            a: a.clone(),
            output: output_clone,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct SoftmaxBackward {
    a: Tensor,
    output: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for SoftmaxBackward {
    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone()]
    }

    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂x = y ⊙ (∂L/∂y - (y · ∂L/∂y)) per lane
                let last = Axis(self.a.ndim().saturating_sub(1));
                let y = self.output.data();
                let dot = (y * grad_output).sum_axis(last).insert_axis(last);
                let grad_a = y * &(grad_output - &dot);
                self.a.accumulate_grad(grad_a);
            }
        }
    }
}

/// Sum all elements into a length-1 tensor
pub fn sum(a: &Tensor) -> Tensor {
    let data = ArrayD::from_elem(IxDyn(&[1]), a.data().sum());
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(SumBackward {
            a: a.clone(),
            divisor: 1.0,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

/// Mean of all elements as a length-1 tensor
pub fn mean(a: &Tensor) -> Tensor {
    let n = a.len().max(1) as f32;
    let data = ArrayD::from_elem(IxDyn(&[1]), a.data().sum() / n);
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(SumBackward {
            a: a.clone(),
            divisor: n,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct SumBackward {
    a: Tensor,
    divisor: f32,
    result_grad: GradCell,
}

impl BackwardOp for SumBackward {
    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone()]
    }

    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂sum / divisor (broadcast)
                let grad_val = grad.iter().next().copied().unwrap_or(0.0) / self.divisor;
                self.a
                    .accumulate_grad(ArrayD::from_elem(self.a.data().raw_dim(), grad_val));
            }
        }
    }
}

/// Sum over one axis, removing it
pub fn sum_axis(a: &Tensor, axis: usize) -> Result<Tensor> {
    if axis >= a.ndim() {
        return Err(Error::InvalidParameter(format!(
            "axis {axis} out of range for tensor of rank {}",
            a.ndim()
        )));
    }
    let data = a.data().sum_axis(Axis(axis));
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(SumAxisBackward {
            a: a.clone(),
            axis,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    Ok(result)
}

struct SumAxisBackward {
    a: Tensor,
    axis: usize,
    result_grad: GradCell,
}

impl BackwardOp for SumAxisBackward {
    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone()]
    }

    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                let expanded = grad.view().insert_axis(Axis(self.axis));
                if let Some(broadcast) = expanded.broadcast(self.a.data().raw_dim()) {
                    self.a.accumulate_grad(broadcast.to_owned());
                }
            }
        }
    }
}

/// Resolve a target shape with at most one `-1` wildcard against `len` elements
pub fn resolve_shape(target: &[isize], len: usize) -> Result<Vec<usize>> {
    let wildcards = target.iter().filter(|&&d| d == -1).count();
    if wildcards > 1 || target.iter().any(|&d| d < -1) {
        return Err(Error::InvalidParameter(format!(
            "invalid reshape target {target:?}"
        )));
    }
    let known: usize = target
        .iter()
        .filter(|&&d| d >= 0)
        .map(|&d| d as usize)
        .product();
    let shape: Vec<usize> = target
        .iter()
        .map(|&d| {
            if d == -1 {
                if known == 0 {
                    0
                } else {
                    len / known
                }
            } else {
                d as usize
            }
        })
        .collect();
    if shape.iter().product::<usize>() != len {
        return Err(Error::ShapeMismatch {
            expected: shape,
            got: vec![len],
        });
    }
    Ok(shape)
}

/// Reshape (row-major) to `shape`; one dimension may be `-1`
pub fn reshape(a: &Tensor, shape: &[isize]) -> Result<Tensor> {
    let target = resolve_shape(shape, a.len())?;
    let data = a
        .data()
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order(IxDyn(&target))?;
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(ReshapeBackward {
            a: a.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    Ok(result)
}

struct ReshapeBackward {
    a: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for ReshapeBackward {
    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone()]
    }

    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                let reshaped = grad
                    .as_standard_layout()
                    .into_owned()
                    .into_shape_with_order(self.a.data().raw_dim());
                if let Ok(reshaped) = reshaped {
                    self.a.accumulate_grad(reshaped);
                }
            }
        }
    }
}

/// Concatenate tensors along `axis`
pub fn concat(tensors: &[Tensor], axis: usize) -> Result<Tensor> {
    let first = tensors
        .first()
        .ok_or_else(|| Error::InvalidParameter("cannot concatenate zero tensors".into()))?;
    if axis >= first.ndim() {
        return Err(Error::InvalidParameter(format!(
            "axis {axis} out of range for tensor of rank {}",
            first.ndim()
        )));
    }
    let views: Vec<ArrayView<f32, IxDyn>> = tensors.iter().map(|t| t.data().view()).collect();
    let data = concatenate(Axis(axis), &views)?;
    let requires_grad = tensors.iter().any(Tensor::requires_grad);

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(ConcatBackward {
            inputs: tensors.to_vec(),
            axis,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    Ok(result)
}

struct ConcatBackward {
    inputs: Vec<Tensor>,
    axis: usize,
    result_grad: GradCell,
}

impl BackwardOp for ConcatBackward {
    fn inputs(&self) -> Vec<Tensor> {
        self.inputs.clone()
    }

    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            let mut offset = 0isize;
            for input in &self.inputs {
                let width = input.shape()[self.axis] as isize;
                if input.requires_grad() {
                    let part = grad.slice_axis(Axis(self.axis), Slice::from(offset..offset + width));
                    input.accumulate_grad(part.to_owned());
                }
                offset += width;
            }
        }
    }
}

/// Take `start..end` along `axis`
pub fn slice_axis(a: &Tensor, axis: usize, start: usize, end: usize) -> Result<Tensor> {
    if axis >= a.ndim() || start > end || end > a.shape()[axis] {
        return Err(Error::InvalidParameter(format!(
            "slice {start}..{end} on axis {axis} out of range for shape {:?}",
            a.shape()
        )));
    }
    let data = a
        .data()
        .slice_axis(Axis(axis), Slice::from(start..end))
        .to_owned();
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(SliceBackward {
            a: a.clone(),
            axis,
            start,
            end,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    Ok(result)
}

struct SliceBackward {
    a: Tensor,
    axis: usize,
    start: usize,
    end: usize,
    result_grad: GradCell,
}

impl BackwardOp for SliceBackward {
    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone()]
    }

    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                let mut grad_a = ArrayD::zeros(self.a.data().raw_dim());
                grad_a
                    .slice_axis_mut(Axis(self.axis), Slice::from(self.start..self.end))
                    .assign(grad);
                self.a.accumulate_grad(grad_a);
            }
        }
    }
}

/// Split the last axis into `num_splits` equal parts
pub fn split_last(a: &Tensor, num_splits: usize) -> Result<Vec<Tensor>> {
    let axis = a.ndim().saturating_sub(1);
    let width = a.shape().get(axis).copied().unwrap_or(0);
    if num_splits == 0 || width % num_splits != 0 {
        return Err(Error::InvalidParameter(format!(
            "cannot split axis of size {width} into {num_splits} equal parts"
        )));
    }
    let part = width / num_splits;
    (0..num_splits)
        .map(|i| slice_axis(a, axis, i * part, (i + 1) * part))
        .collect()
}
