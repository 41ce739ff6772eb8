//!
//! Forward operations
//!
//! Each operation validates operand shapes, computes its output eagerly, and
//! appends a node carrying the [`Op`] its backward rule dispatches on. Shape
//! errors surface here, never during backward.
//!

use serde::{Deserialize, Serialize};

use crate::accel::KernelRequest;
use crate::array::{Array, Shape};
use crate::error::{Error, Result};
use crate::kernels::{self, Conv2dGeometry, Pool2dGeometry};
use crate::op::{InferenceKernel, Op};
use crate::tape::{Dispatched, Tape, Var};

/// Anything that can stand in as an operation input; raw arrays become leaves
/// of the current frame
pub trait Operand {
  fn into_var(self, tape: &mut Tape) -> Result<Var>;
}

impl Operand for Var {
  fn into_var(self, _tape: &mut Tape) -> Result<Var> {
    Ok(self)
  }
}

impl Operand for &Var {
  fn into_var(self, _tape: &mut Tape) -> Result<Var> {
    Ok(*self)
  }
}

impl Operand for Array {
  fn into_var(self, tape: &mut Tape) -> Result<Var> {
    Ok(tape.leaf(self))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Conv2dOptions {
  pub stride: usize,
  pub padding: usize,
}

impl Default for Conv2dOptions {
  fn default() -> Self {
    Self {
      stride: 1,
      padding: 0,
    }
  }
}

impl Tape {
  fn operand(&mut self, x: impl Operand) -> Result<usize> {
    let var = x.into_var(self)?;
    self.resolve(var)
  }

  fn elementwise(
    &mut self,
    op: &'static str,
    a: usize,
    b: usize,
    f: impl Fn(f64, f64) -> f64,
  ) -> Result<(Array, bool)> {
    let (x, y) = (&self.nodes[a].value, &self.nodes[b].value);
    if x.shape() == y.shape() {
      Ok((x.zip_map(y, f), false))
    } else if y.shape().is_bias_of(x.shape()) {
      Ok((x.broadcast_map(y, f), true))
    } else {
      Err(Error::Shape {
        op,
        lhs: x.shape().clone(),
        rhs: y.shape().clone(),
      })
    }
  }

  /// `a + b`, where `b` may be a bias of shape `a.shape[1..]`
  pub fn add(&mut self, a: impl Operand, b: impl Operand) -> Result<Var> {
    let (a, b) = (self.operand(a)?, self.operand(b)?);
    let (value, broadcast) = self.elementwise("add", a, b, |x, y| x + y)?;
    self.record(value, Op::Add { broadcast }, &[a, b])
  }

  /// `a - b`, with the same bias broadcast as [`Tape::add`]
  pub fn sub(&mut self, a: impl Operand, b: impl Operand) -> Result<Var> {
    let (a, b) = (self.operand(a)?, self.operand(b)?);
    let (value, broadcast) = self.elementwise("sub", a, b, |x, y| x - y)?;
    self.record(value, Op::Sub { broadcast }, &[a, b])
  }

  /// Elementwise product of equally shaped operands
  pub fn mul(&mut self, a: impl Operand, b: impl Operand) -> Result<Var> {
    let (a, b) = (self.operand(a)?, self.operand(b)?);
    let (x, y) = (&self.nodes[a].value, &self.nodes[b].value);
    if x.shape() != y.shape() {
      return Err(Error::Shape {
        op: "mul",
        lhs: x.shape().clone(),
        rhs: y.shape().clone(),
      });
    }
    let value = x.zip_map(y, |x, y| x * y);
    self.record(value, Op::Mul, &[a, b])
  }

  /// Matrix product `[m, k] · [k, n] -> [m, n]`
  pub fn dot(&mut self, a: impl Operand, b: impl Operand) -> Result<Var> {
    let (a, b) = (self.operand(a)?, self.operand(b)?);
    let (x, y) = (&self.nodes[a].value, &self.nodes[b].value);
    let (&[m, k], &[k2, n]) = (x.dims(), y.dims()) else {
      return Err(Error::Shape {
        op: "dot",
        lhs: x.shape().clone(),
        rhs: y.shape().clone(),
      });
    };
    if k != k2 {
      return Err(Error::Shape {
        op: "dot",
        lhs: x.shape().clone(),
        rhs: y.shape().clone(),
      });
    }
    let out = match self.run_kernel(
      KernelRequest::MatMul { m, k, n },
      |accel| accel.matmul(x.data(), y.data(), m, k, n),
      || kernels::matmul(x.data(), y.data(), m, k, n),
    ) {
      Dispatched::Accelerated(out) | Dispatched::Local(out) => out,
    };
    self.record(Array::from_parts(Shape::new(&[m, n]), out), Op::Dot, &[a, b])
  }

  pub fn relu(&mut self, a: impl Operand) -> Result<Var> {
    let a = self.operand(a)?;
    let value = self.nodes[a].value.map(|x| x.max(0.0));
    self.record(value, Op::Relu, &[a])
  }

  pub fn sigmoid(&mut self, a: impl Operand) -> Result<Var> {
    let a = self.operand(a)?;
    let value = self.nodes[a].value.map(|x| 1.0 / (1.0 + (-x).exp()));
    self.record(value, Op::Sigmoid, &[a])
  }

  /// Row-wise softmax over the last axis
  ///
  /// The recorded backward passes the gradient straight through, which is
  /// only the right answer when the output feeds [`Tape::cross_entropy`].
  pub fn softmax(&mut self, a: impl Operand) -> Result<Var> {
    let a = self.operand(a)?;
    let x = &self.nodes[a].value;
    let row_len = x.dims().last().copied().unwrap_or(1);
    let value = Array::from_parts(x.shape().clone(), kernels::softmax_rows(x.data(), row_len));
    self.record(value, Op::Softmax, &[a])
  }

  pub fn sum(&mut self, a: impl Operand) -> Result<Var> {
    let a = self.operand(a)?;
    let value = Array::scalar(self.nodes[a].value.sum());
    self.record(value, Op::Sum, &[a])
  }

  pub fn mean(&mut self, a: impl Operand) -> Result<Var> {
    let a = self.operand(a)?;
    let x = &self.nodes[a].value;
    let value = Array::scalar(x.sum() / x.numel() as f64);
    self.record(value, Op::Mean, &[a])
  }

  pub fn reshape(&mut self, a: impl Operand, shape: impl Into<Shape>) -> Result<Var> {
    let a = self.operand(a)?;
    let shape = shape.into();
    let x = &self.nodes[a].value;
    if shape.rank() == 0 || shape.dims().contains(&0) || shape.numel() != x.numel() {
      return Err(Error::InvalidShape {
        op: "reshape",
        reason: format!("cannot view {} as {}", x.shape(), shape),
      });
    }
    let value = x.clone().with_shape(shape);
    self.record(value, Op::Reshape, &[a])
  }

  /// Keep the leading axis, collapse the rest: `[b, ..] -> [b, prod(..)]`
  pub fn flatten(&mut self, a: impl Operand) -> Result<Var> {
    let a = self.operand(a)?;
    let dims = self.nodes[a].value.dims();
    let Some((&batch, rest)) = dims.split_first().filter(|(_, rest)| !rest.is_empty()) else {
      return Err(Error::InvalidShape {
        op: "flatten",
        reason: format!("expected at least 2 axes, got {}", self.nodes[a].value.shape()),
      });
    };
    let features = rest.iter().product::<usize>();
    self.reshape(self.handle(a), [batch, features])
  }

  fn conv2d_geometry(&self, input: usize, weight: usize, bias: usize, options: Conv2dOptions) -> Result<Conv2dGeometry> {
    Conv2dGeometry::infer(
      self.nodes[input].value.shape(),
      self.nodes[weight].value.shape(),
      self.nodes[bias].value.shape(),
      options.stride,
      options.padding,
    )
  }

  /// 2-D cross-correlation of `input [b, c, h, w]` with `weight [o, c, kh, kw]`
  /// plus `bias [o]`
  pub fn conv2d(
    &mut self,
    input: impl Operand,
    weight: impl Operand,
    bias: impl Operand,
    options: Conv2dOptions,
  ) -> Result<Var> {
    let (i, w, b) = (self.operand(input)?, self.operand(weight)?, self.operand(bias)?);
    let geo = self.conv2d_geometry(i, w, b, options)?;
    let (x, k, c) = (&self.nodes[i].value, &self.nodes[w].value, &self.nodes[b].value);
    let out = match self.run_kernel(
      KernelRequest::Conv2d(geo),
      |accel| accel.conv2d(x.data(), k.data(), c.data(), &geo),
      || kernels::conv2d_forward(x.data(), k.data(), c.data(), &geo),
    ) {
      Dispatched::Accelerated(out) | Dispatched::Local(out) => out,
    };
    self.record(Array::from_parts(geo.output_shape(), out), Op::Conv2d(geo), &[i, w, b])
  }

  /// Max pooling over `[b, c, h, w]`; `stride` defaults to `kernel`
  pub fn max_pool2d(&mut self, input: impl Operand, kernel: usize, stride: Option<usize>) -> Result<Var> {
    let i = self.operand(input)?;
    let x = &self.nodes[i].value;
    let geometry = Pool2dGeometry::infer(x.shape(), kernel, stride.unwrap_or(kernel))?;
    let (out, argmax) = match self.run_kernel(
      KernelRequest::MaxPool2d(geometry),
      |accel| accel.max_pool2d(x.data(), &geometry),
      || kernels::max_pool2d_forward(x.data(), &geometry),
    ) {
      Dispatched::Accelerated(out) => (out, None),
      Dispatched::Local((out, argmax)) => (out, Some(argmax)),
    };
    let value = Array::from_parts(geometry.output_shape(), out);
    self.record(value, Op::MaxPool2d { geometry, argmax }, &[i])
  }

  /// Mean negative log-likelihood of `pred [batch, classes]` (probabilities)
  /// at the target class of each row
  ///
  /// The backward rule writes `(pred - one_hot) / batch` into `pred`, the
  /// fused softmax plus cross-entropy gradient with respect to the logits.
  pub fn cross_entropy(&mut self, pred: impl Operand, targets: &[usize]) -> Result<Var> {
    let p = self.operand(pred)?;
    let x = &self.nodes[p].value;
    let &[batch, classes] = x.dims() else {
      return Err(Error::InvalidShape {
        op: "cross_entropy",
        reason: format!("expected [batch, classes], got {}", x.shape()),
      });
    };
    if targets.len() != batch {
      return Err(Error::Shape {
        op: "cross_entropy",
        lhs: x.shape().clone(),
        rhs: Shape::new(&[targets.len()]),
      });
    }
    if let Some(&target) = targets.iter().find(|&&t| t >= classes) {
      return Err(Error::TargetOutOfRange {
        op: "cross_entropy",
        target,
        classes,
      });
    }
    let nll: f64 = targets
      .iter()
      .enumerate()
      .map(|(row, &t)| -x.data()[row * classes + t].ln())
      .sum();
    let value = Array::scalar(nll / batch as f64);
    self.record(
      value,
      Op::CrossEntropy {
        targets: targets.to_vec(),
      },
      &[p],
    )
  }

  /// Convolution through the accelerator only; the node refuses backward
  pub fn conv2d_inference(
    &mut self,
    input: impl Operand,
    weight: impl Operand,
    bias: impl Operand,
    options: Conv2dOptions,
  ) -> Result<Var> {
    let (i, w, b) = (self.operand(input)?, self.operand(weight)?, self.operand(bias)?);
    let geo = self.conv2d_geometry(i, w, b, options)?;
    let (x, k, c) = (&self.nodes[i].value, &self.nodes[w].value, &self.nodes[b].value);
    let out = self.run_accelerated_only(KernelRequest::Conv2d(geo), |accel| {
      accel.conv2d(x.data(), k.data(), c.data(), &geo)
    })?;
    self.record(
      Array::from_parts(geo.output_shape(), out),
      Op::Inference(InferenceKernel::Conv2d),
      &[i, w, b],
    )
  }

  /// Max pooling through the accelerator only; the node refuses backward
  pub fn max_pool2d_inference(&mut self, input: impl Operand, kernel: usize, stride: Option<usize>) -> Result<Var> {
    let i = self.operand(input)?;
    let x = &self.nodes[i].value;
    let geometry = Pool2dGeometry::infer(x.shape(), kernel, stride.unwrap_or(kernel))?;
    let out = self.run_accelerated_only(KernelRequest::MaxPool2d(geometry), |accel| {
      accel.max_pool2d(x.data(), &geometry)
    })?;
    self.record(
      Array::from_parts(geometry.output_shape(), out),
      Op::Inference(InferenceKernel::MaxPool2d),
      &[i],
    )
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_relative_eq;

  use super::*;
  use crate::accel::Kernel;

  fn array(shape: impl Into<Shape>, data: &[f64]) -> Array {
    Array::from_vec(shape, data.to_vec()).unwrap()
  }

  #[test]
  fn add_broadcasts_bias_over_batch() {
    let mut tape = Tape::new();
    let x = tape.leaf(Array::ones([3, 2]));
    let b = tape.leaf(array([2], &[10.0, 20.0]));
    let y = tape.add(x, b).unwrap();
    assert_eq!(tape.value(y).unwrap().data(), &[11.0, 21.0, 11.0, 21.0, 11.0, 21.0]);
    assert_eq!(tape.op(y).unwrap(), &Op::Add { broadcast: true });

    let loss = tape.sum(y).unwrap();
    tape.backward(loss).unwrap();
    assert_eq!(tape.grad(b).unwrap().data(), &[3.0, 3.0]);
    assert_eq!(tape.grad(x).unwrap().data(), &[1.0; 6]);
  }

  #[test]
  fn sub_negates_right_gradient() {
    let mut tape = Tape::new();
    let x = tape.leaf(Array::ones([2, 2]));
    let b = tape.leaf(array([2], &[1.0, 2.0]));
    let y = tape.sub(x, b).unwrap();
    assert_eq!(tape.value(y).unwrap().data(), &[0.0, -1.0, 0.0, -1.0]);
    let loss = tape.sum(y).unwrap();
    tape.backward(loss).unwrap();
    assert_eq!(tape.grad(b).unwrap().data(), &[-2.0, -2.0]);
  }

  #[test]
  fn mismatched_shapes_fail_at_forward() {
    let mut tape = Tape::new();
    let a = tape.leaf(Array::ones([2, 3]));
    let b = tape.leaf(Array::ones([3, 2]));
    assert!(matches!(tape.add(a, b), Err(Error::Shape { op: "add", .. })));
    assert!(matches!(tape.mul(a, b), Err(Error::Shape { op: "mul", .. })));
    assert!(matches!(tape.dot(a, a), Err(Error::Shape { op: "dot", .. })));
    // bias on the wrong axis
    let bias = tape.leaf(Array::ones([2]));
    assert!(tape.add(a, bias).is_err());
  }

  #[test]
  fn raw_arrays_become_leaves() {
    let mut tape = Tape::new();
    let y = tape.mul(Array::full([2], 3.0), Array::full([2], 4.0)).unwrap();
    assert_eq!(tape.len(), 3);
    assert_eq!(tape.value(y).unwrap().data(), &[12.0, 12.0]);
    let operands = tape.operands(y).unwrap();
    assert_eq!(tape.op(operands[0]).unwrap(), &Op::Leaf);
  }

  #[test]
  fn relu_has_zero_gradient_at_zero() {
    let mut tape = Tape::new();
    let x = tape.leaf(array([3], &[-1.0, 0.0, 2.0]));
    let y = tape.relu(x).unwrap();
    assert_eq!(tape.value(y).unwrap().data(), &[0.0, 0.0, 2.0]);
    let loss = tape.sum(y).unwrap();
    tape.backward(loss).unwrap();
    assert_eq!(tape.grad(x).unwrap().data(), &[0.0, 0.0, 1.0]);
  }

  #[test]
  fn sigmoid_gradient_uses_output() {
    let mut tape = Tape::new();
    let x = tape.leaf(Array::scalar(0.0));
    let y = tape.sigmoid(x).unwrap();
    tape.backward(y).unwrap();
    assert_relative_eq!(tape.value(y).unwrap().data()[0], 0.5);
    assert_relative_eq!(tape.grad(x).unwrap().data()[0], 0.25);
  }

  #[test]
  fn mean_spreads_gradient() {
    let mut tape = Tape::new();
    let x = tape.leaf(array([2, 2], &[1.0, 2.0, 3.0, 4.0]));
    let m = tape.mean(x).unwrap();
    assert_eq!(tape.value(m).unwrap().item(), Some(2.5));
    tape.backward(m).unwrap();
    assert_eq!(tape.grad(x).unwrap().data(), &[0.25; 4]);
  }

  #[test]
  fn softmax_cross_entropy_fused_gradient() {
    let mut tape = Tape::new();
    let logits = tape.leaf(array([2, 3], &[1.0, 2.0, 3.0, 1.0, 1.0, 1.0]));
    let probs = tape.softmax(logits).unwrap();
    let p = tape.value(probs).unwrap().data().to_vec();
    assert_relative_eq!(p[0], 0.090_030_573_170_380_46, epsilon = 1e-12);
    assert_relative_eq!(p[1], 0.244_728_471_054_797_64, epsilon = 1e-12);
    assert_relative_eq!(p[2], 0.665_240_955_774_821_9, epsilon = 1e-12);
    assert_relative_eq!(p[4], 1.0 / 3.0, epsilon = 1e-12);

    let loss = tape.cross_entropy(probs, &[2, 0]).unwrap();
    let expected_loss = (-(0.665_240_955_774_821_9f64).ln() + 3f64.ln()) / 2.0;
    assert_relative_eq!(tape.value(loss).unwrap().data()[0], expected_loss, epsilon = 1e-12);

    tape.backward(loss).unwrap();
    let expected = [
      0.045_015_286_585_190_23,
      0.122_364_235_527_398_82,
      -0.167_379_522_112_589_05,
      -1.0 / 3.0,
      1.0 / 6.0,
      1.0 / 6.0,
    ];
    for (g, e) in tape.grad(logits).unwrap().data().iter().zip(expected) {
      assert_relative_eq!(*g, e, epsilon = 1e-9);
    }
  }

  #[test]
  fn cross_entropy_validates_targets() {
    let mut tape = Tape::new();
    let p = tape.leaf(Array::full([2, 3], 1.0 / 3.0));
    assert!(matches!(
      tape.cross_entropy(p, &[0]),
      Err(Error::Shape {
        op: "cross_entropy",
        ..
      })
    ));
    assert_eq!(
      tape.cross_entropy(p, &[0, 3]).unwrap_err(),
      Error::TargetOutOfRange {
        op: "cross_entropy",
        target: 3,
        classes: 3
      }
    );
  }

  #[test]
  fn flatten_keeps_batch_axis() {
    let mut tape = Tape::new();
    let x = tape.leaf(Array::ones([2, 3, 2, 2]));
    let y = tape.flatten(x).unwrap();
    assert_eq!(tape.value(y).unwrap().dims(), &[2, 12]);
    assert_eq!(tape.op(y).unwrap(), &Op::Reshape);
    assert!(tape.flatten(Array::ones([4])).is_err());
    assert!(matches!(
      tape.reshape(x, [5, 5]),
      Err(Error::InvalidShape { op: "reshape", .. })
    ));
  }

  #[test]
  fn max_pool_defaults_stride_to_kernel() {
    let mut tape = Tape::new();
    let data: Vec<f64> = (0..16).map(f64::from).collect();
    let x = tape.leaf(Array::from_vec([1, 1, 4, 4], data).unwrap());
    let y = tape.max_pool2d(x, 2, None).unwrap();
    assert_eq!(tape.value(y).unwrap().data(), &[5.0, 7.0, 13.0, 15.0]);
    let loss = tape.sum(y).unwrap();
    tape.backward(loss).unwrap();
    let grad = tape.grad(x).unwrap();
    assert_eq!(grad.sum(), 4.0);
    assert_eq!(grad.get(&[0, 0, 1, 1]), Some(1.0));
    assert_eq!(grad.get(&[0, 0, 0, 0]), Some(0.0));
  }

  #[test]
  fn inference_ops_need_an_accelerator() {
    let mut tape = Tape::new();
    let x = tape.leaf(Array::ones([1, 1, 4, 4]));
    let w = tape.leaf(Array::ones([1, 1, 2, 2]));
    let b = tape.leaf(Array::zeros([1]));
    assert!(matches!(
      tape.conv2d_inference(x, w, b, Conv2dOptions::default()),
      Err(Error::UnsupportedPath {
        kernel: Kernel::Conv2d,
        ..
      })
    ));
    assert!(matches!(
      tape.max_pool2d_inference(x, 2, None),
      Err(Error::UnsupportedPath {
        kernel: Kernel::MaxPool2d,
        ..
      })
    ));
  }
}
