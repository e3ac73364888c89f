//! Layer kernels with backward passes (channels-last)
//!
//! Kernel layouts:
//! - dense: `(in, units)`
//! - conv2d: `(kh, kw, in, filters)`
//! - depthwise conv2d: `(kh, kw, in, depth_multiplier)`, output channel `c * m + j`
//! - conv2d transpose: `(kh, kw, filters, in)`

use super::{BackwardOp, GradCell, Tensor};
use crate::error::{Error, Result};
use ndarray::{ArrayD, ArrayView2, Axis, Ix2, IxDyn};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::rc::Rc;
use tracing::warn;

/// Spatial padding policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// No padding; windows must fit inside the input
    #[default]
    Valid,
    /// Zero padding so that `out = ceil(in / stride)`
    Same,
}

impl Padding {
    /// Output length and leading pad of a forward convolution
    pub fn conv_output(self, input: usize, kernel: usize, stride: usize) -> (usize, usize) {
        match self {
            Padding::Valid if input >= kernel => ((input - kernel) / stride + 1, 0),
            Padding::Valid => (0, 0),
            Padding::Same => {
                let out = input.div_ceil(stride);
                if out == 0 {
                    return (0, 0);
                }
                let total = ((out - 1) * stride + kernel).saturating_sub(input);
                (out, total / 2)
            }
        }
    }

    /// Output length and leading crop of a transposed convolution
    pub fn conv_transpose_output(self, input: usize, kernel: usize, stride: usize) -> (usize, usize) {
        if input == 0 {
            return (0, 0);
        }
        let full = (input - 1) * stride + kernel;
        match self {
            Padding::Valid => (full, 0),
            Padding::Same => {
                let out = input * stride;
                (out, full.saturating_sub(out) / 2)
            }
        }
    }
}

fn standard(a: &ArrayD<f32>) -> Cow<'_, [f32]> {
    match a.as_slice() {
        Some(slice) => Cow::Borrowed(slice),
        None => Cow::Owned(a.iter().copied().collect()),
    }
}

/// Collapse all leading axes: `(..., c)` → `(rows, c)`
/// A failed step leaves the layer's inputs without this step's gradient
fn report_step(layer: &str, step: Result<()>) {
    if let Err(e) = step {
        warn!(layer, error = %e, "gradient step failed; input gradients are incomplete");
    }
}

fn as_rows(a: &ArrayD<f32>) -> Result<ndarray::Array2<f32>> {
    let cols = a.shape().last().copied().unwrap_or(1);
    let rows = if cols == 0 { 0 } else { a.len() / cols };
    Ok(a
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((rows, cols))?)
}

/// Sum every axis except the last one
fn sum_to_channels(a: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    Ok(as_rows(a)?.sum_axis(Axis(0)).into_dyn())
}

fn check_vector(t: &Tensor, len: usize) -> Result<()> {
    if t.shape() != [len] {
        return Err(Error::ShapeMismatch {
            expected: vec![len],
            got: t.shape().to_vec(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Dense
// ---------------------------------------------------------------------------

/// Fully-connected layer over the last axis: `y = x @ kernel + bias`
pub fn dense(x: &Tensor, kernel: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let k2 = kernel.data().view().into_dimensionality::<Ix2>()?;
    let (in_features, units) = k2.dim();
    let x_in = x.shape().last().copied().unwrap_or(0);
    if x_in != in_features {
        return Err(Error::ShapeMismatch {
            expected: vec![in_features],
            got: vec![x_in],
        });
    }
    if let Some(b) = bias {
        check_vector(b, units)?;
    }

    let x2 = as_rows(x.data())?;
    let mut y2 = x2.dot(&k2);
    if let Some(b) = bias {
        let b1 = b.data().view().into_dimensionality::<ndarray::Ix1>()?;
        y2 += &b1;
    }

    let mut out_shape = x.shape().to_vec();
    if let Some(last) = out_shape.last_mut() {
        *last = units;
    }
    let data = y2.into_shape_with_order(IxDyn(&out_shape))?;

    let requires_grad =
        x.requires_grad() || kernel.requires_grad() || bias.is_some_and(Tensor::requires_grad);
    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(DenseBackward {
            x: x.clone(),
            kernel: kernel.clone(),
            bias: bias.cloned(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    Ok(result)
}

struct DenseBackward {
    x: Tensor,
    kernel: Tensor,
    bias: Option<Tensor>,
    result_grad: GradCell,
}

impl DenseBackward {
    fn propagate(&self, grad_output: &ArrayD<f32>) -> Result<()> {
        let g2 = as_rows(grad_output)?;
        let k2: ArrayView2<f32> = self.kernel.data().view().into_dimensionality::<Ix2>()?;

        if self.x.requires_grad() {
            // ∂L/∂x = ∂L/∂y @ kernelᵀ
            let grad_x = g2
                .dot(&k2.t())
                .into_shape_with_order(self.x.data().raw_dim())?;
            self.x.accumulate_grad(grad_x);
        }
        if self.kernel.requires_grad() {
            // ∂L/∂kernel = xᵀ @ ∂L/∂y
            let x2 = as_rows(self.x.data())?;
            self.kernel.accumulate_grad(x2.t().dot(&g2).into_dyn());
        }
        if let Some(bias) = self.bias.as_ref().filter(|b| b.requires_grad()) {
            bias.accumulate_grad(g2.sum_axis(Axis(0)).into_dyn());
        }
        Ok(())
    }
}

impl BackwardOp for DenseBackward {
    fn inputs(&self) -> Vec<Tensor> {
        let mut inputs = vec![self.x.clone(), self.kernel.clone()];
        inputs.extend(self.bias.clone());
        inputs
    }

    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            report_step("dense", self.propagate(grad_output));
        }
    }
}

// ---------------------------------------------------------------------------
// Convolutions
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConvKind {
    Standard,
    Depthwise { multiplier: usize },
    Transpose,
}

#[derive(Clone, Copy, Debug)]
struct ConvGeometry {
    batch: usize,
    in_h: usize,
    in_w: usize,
    in_c: usize,
    out_h: usize,
    out_w: usize,
    out_c: usize,
    kh: usize,
    kw: usize,
    sh: usize,
    sw: usize,
    pad_h: usize,
    pad_w: usize,
}

impl ConvGeometry {
    fn new(
        kind: ConvKind,
        x: &[usize],
        kernel: &[usize],
        strides: [usize; 2],
        padding: Padding,
    ) -> Result<Self> {
        if x.len() != 4 || kernel.len() != 4 {
            return Err(Error::InvalidParameter(format!(
                "convolution expects rank-4 input and kernel, got {x:?} and {kernel:?}"
            )));
        }
        if strides.contains(&0) {
            return Err(Error::InvalidParameter("strides must be positive".into()));
        }
        let (batch, in_h, in_w, in_c) = (x[0], x[1], x[2], x[3]);
        let (kh, kw) = (kernel[0], kernel[1]);
        let (kernel_in, out_c) = match kind {
            ConvKind::Standard => (kernel[2], kernel[3]),
            ConvKind::Depthwise { multiplier } => (kernel[2], kernel[2] * multiplier),
            ConvKind::Transpose => (kernel[3], kernel[2]),
        };
        if kernel_in != in_c {
            return Err(Error::ShapeMismatch {
                expected: vec![in_c],
                got: vec![kernel_in],
            });
        }

        let ((out_h, pad_h), (out_w, pad_w)) = match kind {
            ConvKind::Transpose => (
                padding.conv_transpose_output(in_h, kh, strides[0]),
                padding.conv_transpose_output(in_w, kw, strides[1]),
            ),
            _ => (
                padding.conv_output(in_h, kh, strides[0]),
                padding.conv_output(in_w, kw, strides[1]),
            ),
        };
        if out_h == 0 || out_w == 0 {
            return Err(Error::InvalidParameter(format!(
                "kernel {kh}x{kw} does not fit input {in_h}x{in_w} with {padding:?} padding"
            )));
        }

        Ok(Self {
            batch,
            in_h,
            in_w,
            in_c,
            out_h,
            out_w,
            out_c,
            kh,
            kw,
            sh: strides[0],
            sw: strides[1],
            pad_h,
            pad_w,
        })
    }

    fn output_shape(&self) -> [usize; 4] {
        [self.batch, self.out_h, self.out_w, self.out_c]
    }

    /// Visit every (input pixel, output pixel, kernel tap) triple
    fn for_each_tap(&self, transpose: bool, mut visit: impl FnMut(usize, usize, usize)) {
        let (in_h, in_w) = (self.in_h as isize, self.in_w as isize);
        let (out_h, out_w) = (self.out_h as isize, self.out_w as isize);
        for b in 0..self.batch {
            if transpose {
                for iy in 0..self.in_h {
                    for ix in 0..self.in_w {
                        let xp = (b * self.in_h + iy) * self.in_w + ix;
                        for ky in 0..self.kh {
                            let oy = (iy * self.sh + ky) as isize - self.pad_h as isize;
                            if oy < 0 || oy >= out_h {
                                continue;
                            }
                            for kx in 0..self.kw {
                                let ox = (ix * self.sw + kx) as isize - self.pad_w as isize;
                                if ox < 0 || ox >= out_w {
                                    continue;
                                }
                                let op = (b * self.out_h + oy as usize) * self.out_w + ox as usize;
                                visit(xp, op, ky * self.kw + kx);
                            }
                        }
                    }
                }
            } else {
                for oy in 0..self.out_h {
                    for ox in 0..self.out_w {
                        let op = (b * self.out_h + oy) * self.out_w + ox;
                        for ky in 0..self.kh {
                            let iy = (oy * self.sh + ky) as isize - self.pad_h as isize;
                            if iy < 0 || iy >= in_h {
                                continue;
                            }
                            for kx in 0..self.kw {
                                let ix = (ox * self.sw + kx) as isize - self.pad_w as isize;
                                if ix < 0 || ix >= in_w {
                                    continue;
                                }
                                let xp = (b * self.in_h + iy as usize) * self.in_w + ix as usize;
                                visit(xp, op, ky * self.kw + kx);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn conv_forward(kind: ConvKind, g: &ConvGeometry, xs: &[f32], ks: &[f32]) -> Vec<f32> {
    let (cin, cout) = (g.in_c, g.out_c);
    let mut out = vec![0.0f32; g.batch * g.out_h * g.out_w * cout];

    g.for_each_tap(kind == ConvKind::Transpose, |xp, op, tap| {
        let x = &xs[xp * cin..(xp + 1) * cin];
        let o = &mut out[op * cout..(op + 1) * cout];
        match kind {
            ConvKind::Standard => {
                for (ci, &xv) in x.iter().enumerate() {
                    let row = &ks[(tap * cin + ci) * cout..(tap * cin + ci + 1) * cout];
                    for (acc, &kv) in o.iter_mut().zip(row) {
                        *acc += xv * kv;
                    }
                }
            }
            ConvKind::Depthwise { multiplier } => {
                for (c, &xv) in x.iter().enumerate() {
                    for j in 0..multiplier {
                        let idx = c * multiplier + j;
                        o[idx] += xv * ks[tap * cout + idx];
                    }
                }
            }
            ConvKind::Transpose => {
                for (f, acc) in o.iter_mut().enumerate() {
                    let row = &ks[(tap * cout + f) * cin..(tap * cout + f + 1) * cin];
                    *acc += x.iter().zip(row).map(|(xv, kv)| xv * kv).sum::<f32>();
                }
            }
        }
    });

    out
}

/// Returns (∂L/∂x, ∂L/∂kernel) as flat row-major buffers
fn conv_backward(
    kind: ConvKind,
    g: &ConvGeometry,
    xs: &[f32],
    ks: &[f32],
    gs: &[f32],
) -> (Vec<f32>, Vec<f32>) {
    let (cin, cout) = (g.in_c, g.out_c);
    let mut grad_x = vec![0.0f32; xs.len()];
    let mut grad_k = vec![0.0f32; ks.len()];

    g.for_each_tap(kind == ConvKind::Transpose, |xp, op, tap| {
        let go = &gs[op * cout..(op + 1) * cout];
        match kind {
            ConvKind::Standard => {
                for ci in 0..cin {
                    let xv = xs[xp * cin + ci];
                    let base = (tap * cin + ci) * cout;
                    let mut gx = 0.0;
                    for (co, &gv) in go.iter().enumerate() {
                        gx += gv * ks[base + co];
                        grad_k[base + co] += xv * gv;
                    }
                    grad_x[xp * cin + ci] += gx;
                }
            }
            ConvKind::Depthwise { multiplier } => {
                for c in 0..cin {
                    let xv = xs[xp * cin + c];
                    for j in 0..multiplier {
                        let idx = c * multiplier + j;
                        grad_x[xp * cin + c] += go[idx] * ks[tap * cout + idx];
                        grad_k[tap * cout + idx] += xv * go[idx];
                    }
                }
            }
            ConvKind::Transpose => {
                for (f, &gv) in go.iter().enumerate() {
                    let base = (tap * cout + f) * cin;
                    for ci in 0..cin {
                        grad_x[xp * cin + ci] += gv * ks[base + ci];
                        grad_k[base + ci] += xs[xp * cin + ci] * gv;
                    }
                }
            }
        }
    });

    (grad_x, grad_k)
}

fn conv_generic(
    kind: ConvKind,
    x: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    strides: [usize; 2],
    padding: Padding,
) -> Result<Tensor> {
    let geometry = ConvGeometry::new(kind, x.shape(), kernel.shape(), strides, padding)?;
    if let Some(b) = bias {
        check_vector(b, geometry.out_c)?;
    }

    let mut out = conv_forward(kind, &geometry, &standard(x.data()), &standard(kernel.data()));
    if let Some(b) = bias {
        let bs = standard(b.data());
        for (i, v) in out.iter_mut().enumerate() {
            *v += bs[i % geometry.out_c];
        }
    }
    let data = ArrayD::from_shape_vec(IxDyn(&geometry.output_shape()), out)?;

    let requires_grad =
        x.requires_grad() || kernel.requires_grad() || bias.is_some_and(Tensor::requires_grad);
    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(ConvBackward {
            kind,
            geometry,
            x: x.clone(),
            kernel: kernel.clone(),
            bias: bias.cloned(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    Ok(result)
}

struct ConvBackward {
    kind: ConvKind,
    geometry: ConvGeometry,
    x: Tensor,
    kernel: Tensor,
    bias: Option<Tensor>,
    result_grad: GradCell,
}

impl ConvBackward {
    fn propagate(&self, grad_output: &ArrayD<f32>) -> Result<()> {
        let gs = standard(grad_output);
        if self.x.requires_grad() || self.kernel.requires_grad() {
            let (grad_x, grad_k) = conv_backward(
                self.kind,
                &self.geometry,
                &standard(self.x.data()),
                &standard(self.kernel.data()),
                &gs,
            );
            if self.x.requires_grad() {
                self.x
                    .accumulate_grad(ArrayD::from_shape_vec(self.x.data().raw_dim(), grad_x)?);
            }
            if self.kernel.requires_grad() {
                self.kernel
                    .accumulate_grad(ArrayD::from_shape_vec(self.kernel.data().raw_dim(), grad_k)?);
            }
        }
        if let Some(bias) = self.bias.as_ref().filter(|b| b.requires_grad()) {
            bias.accumulate_grad(sum_to_channels(grad_output)?);
        }
        Ok(())
    }
}

impl BackwardOp for ConvBackward {
    fn inputs(&self) -> Vec<Tensor> {
        let mut inputs = vec![self.x.clone(), self.kernel.clone()];
        inputs.extend(self.bias.clone());
        inputs
    }

    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            report_step("convolution", self.propagate(grad_output));
        }
    }
}

/// 2-D convolution, NHWC input, `(kh, kw, in, filters)` kernel
pub fn conv2d(
    x: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    strides: [usize; 2],
    padding: Padding,
) -> Result<Tensor> {
    conv_generic(ConvKind::Standard, x, kernel, bias, strides, padding)
}

/// Depthwise 2-D convolution, `(kh, kw, in, depth_multiplier)` kernel
pub fn depthwise_conv2d(
    x: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    strides: [usize; 2],
    padding: Padding,
) -> Result<Tensor> {
    let multiplier = kernel.shape().get(3).copied().unwrap_or(0);
    if multiplier == 0 {
        return Err(Error::InvalidParameter(
            "depthwise kernel needs a positive depth multiplier".into(),
        ));
    }
    conv_generic(ConvKind::Depthwise { multiplier }, x, kernel, bias, strides, padding)
}

/// Transposed 2-D convolution, `(kh, kw, filters, in)` kernel
pub fn conv2d_transpose(
    x: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    strides: [usize; 2],
    padding: Padding,
) -> Result<Tensor> {
    conv_generic(ConvKind::Transpose, x, kernel, bias, strides, padding)
}

// ---------------------------------------------------------------------------
// Batch normalization (inference statistics)
// ---------------------------------------------------------------------------

/// Batch normalization over the last axis using frozen moving statistics
///
/// y = gamma * (x - moving_mean) / sqrt(moving_variance + epsilon) + beta
pub fn batch_norm(
    x: &Tensor,
    gamma: &Tensor,
    beta: &Tensor,
    moving_mean: &ArrayD<f32>,
    moving_variance: &ArrayD<f32>,
    epsilon: f32,
) -> Result<Tensor> {
    let channels = x.shape().last().copied().unwrap_or(0);
    check_vector(gamma, channels)?;
    check_vector(beta, channels)?;
    for stat in [moving_mean, moving_variance] {
        if stat.shape() != [channels] {
            return Err(Error::ShapeMismatch {
                expected: vec![channels],
                got: stat.shape().to_vec(),
            });
        }
    }

    let inv_std = moving_variance.mapv(|v| 1.0 / (v + epsilon).sqrt());
    let normalized = &(x.data() - moving_mean) * &inv_std;
    let data = &(&normalized * gamma.data()) + beta.data();

    let requires_grad = x.requires_grad() || gamma.requires_grad() || beta.requires_grad();
    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(BatchNormBackward {
            x: x.clone(),
            gamma: gamma.clone(),
            beta: beta.clone(),
            normalized,
            inv_std,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    Ok(result)
}

struct BatchNormBackward {
    x: Tensor,
    gamma: Tensor,
    beta: Tensor,
    normalized: ArrayD<f32>,
    inv_std: ArrayD<f32>,
    result_grad: GradCell,
}

impl BatchNormBackward {
    fn propagate(&self, grad_output: &ArrayD<f32>) -> Result<()> {
        if self.beta.requires_grad() {
            self.beta.accumulate_grad(sum_to_channels(grad_output)?);
        }
        if self.gamma.requires_grad() {
            let weighted = grad_output * &self.normalized;
            self.gamma.accumulate_grad(sum_to_channels(&weighted)?);
        }
        if self.x.requires_grad() {
            // Statistics are frozen, so the map is affine per channel.
            let per_channel = self.gamma.data() * &self.inv_std;
            self.x.accumulate_grad(grad_output * &per_channel);
        }
        Ok(())
    }
}

impl BackwardOp for BatchNormBackward {
    fn inputs(&self) -> Vec<Tensor> {
        vec![self.x.clone(), self.gamma.clone(), self.beta.clone()]
    }

    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            report_step("batch_norm", self.propagate(grad_output));
        }
    }
}
