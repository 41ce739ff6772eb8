//!
//! # auto-core
//!
//! Reverse-mode automatic differentiation over dense `f64` arrays.
//!
//! A [`Tape`] owns every node. Operations are methods on the tape that compute
//! their output eagerly and append a node tagged with an [`Op`]; handles
//! ([`Var`]) are small copyable indices. [`Tape::backward`] walks the subgraph
//! of a scalar root in reverse topological order and accumulates gradients into
//! every node it reaches.
//!
//! ```
//! use lib_auto_core::{Array, Tape};
//!
//! let mut tape = Tape::new();
//! let w = tape.leaf(Array::scalar(3.0));
//! let loss = tape.scope(|t| -> lib_auto_core::Result<f64> {
//!   let y = t.mul(w, w)?;
//!   t.backward(y)?;
//!   Ok(t.value(y)?.data()[0])
//! })?;
//! assert_eq!(loss, 9.0);
//! assert_eq!(tape.grad(w)?.data(), &[6.0]);
//! # Ok::<(), lib_auto_core::Error>(())
//! ```
//!
//! Forward kernels for matmul, conv2d and max-pooling may be delegated to an
//! [`Accelerator`]; gradient rules always run locally.
//!

mod accel;
mod array;
mod backward;
mod config;
mod error;
pub mod gradcheck;
pub mod kernels;
mod op;
mod ops;
mod tape;
mod telemetry;

pub use accel::{AccelError, Accelerator, Kernel, KernelRequest};
#[cfg(feature = "ndarray")]
pub use accel::NdarrayAccelerator;
pub use array::{Array, Shape};
pub use config::{FiniteCheck, TapeConfig};
pub use error::{Error, Result, Stage};
pub use kernels::{Conv2dGeometry, Pool2dGeometry};
pub use op::{InferenceKernel, Op};
pub use ops::{Conv2dOptions, Operand};
pub use tape::{Tape, Var};
pub use telemetry::{ExecutionPath, KernelCounters, NoTelemetry, TelemetrySink, Visit};

#[cfg(test)]
mod tests {
  use std::rc::Rc;

  use super::*;

  /// Claims matmul support and then always fails
  struct Broken;

  impl Accelerator for Broken {
    fn name(&self) -> &str {
      "broken"
    }

    fn supports(&self, request: &KernelRequest) -> bool {
      request.kernel() == Kernel::MatMul
    }

    fn matmul(&self, _: &[f64], _: &[f64], _: usize, _: usize, _: usize) -> Result<Vec<f64>, AccelError> {
      Err(AccelError::Failed("device lost".to_string()))
    }

    fn conv2d(&self, _: &[f64], _: &[f64], _: &[f64], _: &Conv2dGeometry) -> Result<Vec<f64>, AccelError> {
      Err(AccelError::Failed("unreachable".to_string()))
    }

    fn max_pool2d(&self, _: &[f64], _: &Pool2dGeometry) -> Result<Vec<f64>, AccelError> {
      Err(AccelError::Failed("unreachable".to_string()))
    }
  }

  /// Returns one value too few
  struct Short;

  impl Accelerator for Short {
    fn name(&self) -> &str {
      "short"
    }

    fn supports(&self, _: &KernelRequest) -> bool {
      true
    }

    fn matmul(&self, _: &[f64], _: &[f64], m: usize, _: usize, n: usize) -> Result<Vec<f64>, AccelError> {
      Ok(vec![0.0; m * n - 1])
    }

    fn conv2d(&self, _: &[f64], _: &[f64], _: &[f64], geo: &Conv2dGeometry) -> Result<Vec<f64>, AccelError> {
      Ok(vec![0.0; geo.output_len() - 1])
    }

    fn max_pool2d(&self, _: &[f64], geo: &Pool2dGeometry) -> Result<Vec<f64>, AccelError> {
      Ok(vec![0.0; geo.output_len() - 1])
    }
  }

  fn matrix(shape: [usize; 2], data: &[f64]) -> Array {
    Array::from_vec(shape, data.to_vec()).unwrap()
  }

  #[test]
  fn failing_accelerator_falls_back() {
    let counters = Rc::new(KernelCounters::new());
    let mut tape = Tape::new().with_accelerator(Broken).with_telemetry(counters.clone());
    let a = tape.leaf(matrix([2, 2], &[1.0, 2.0, 3.0, 4.0]));
    let b = tape.leaf(matrix([2, 2], &[5.0, 6.0, 7.0, 8.0]));
    let c = tape.dot(a, b).unwrap();
    assert_eq!(tape.value(c).unwrap().data(), &[19.0, 22.0, 43.0, 50.0]);
    assert_eq!(counters.count(Kernel::MatMul, ExecutionPath::Fallback), 1);
    assert_eq!(counters.count(Kernel::MatMul, ExecutionPath::Accelerated), 0);

    // conv is not claimed, so it runs locally without a fallback event
    let x = tape.leaf(Array::ones([1, 1, 3, 3]));
    let w = tape.leaf(Array::ones([1, 1, 2, 2]));
    let bias = tape.leaf(Array::zeros([1]));
    tape.conv2d(x, w, bias, Conv2dOptions::default()).unwrap();
    assert_eq!(counters.count(Kernel::Conv2d, ExecutionPath::Local), 1);
    assert_eq!(counters.count(Kernel::Conv2d, ExecutionPath::Fallback), 0);
  }

  #[test]
  fn wrong_length_output_is_rejected() {
    let counters = Rc::new(KernelCounters::new());
    let mut tape = Tape::new().with_accelerator(Short).with_telemetry(counters.clone());
    let a = tape.leaf(Array::ones([2, 3]));
    let b = tape.leaf(Array::ones([3, 2]));
    let c = tape.dot(a, b).unwrap();
    assert_eq!(tape.value(c).unwrap().data(), &[3.0; 4]);
    assert_eq!(counters.count(Kernel::MatMul, ExecutionPath::Fallback), 1);

    let x = tape.leaf(Array::ones([1, 1, 4, 4]));
    assert!(matches!(
      tape.max_pool2d_inference(x, 2, None),
      Err(Error::UnsupportedPath {
        kernel: Kernel::MaxPool2d,
        ..
      })
    ));
  }

  #[test]
  fn counters_see_every_visit() {
    let counters = Rc::new(KernelCounters::new());
    let mut tape = Tape::new().with_telemetry(counters.clone());
    let x = tape.leaf(Array::ones([2, 2]));
    let w = tape.leaf(Array::ones([2, 2]));
    let loss = tape
      .scope(|t| {
        let y = t.dot(x, w)?;
        let loss = t.sum(y)?;
        t.backward(loss)?;
        t.value(loss).map(|v| v.data()[0])
      })
      .unwrap();
    assert_eq!(loss, 8.0);
    assert_eq!(counters.count(Kernel::MatMul, ExecutionPath::Local), 1);
    assert_eq!(counters.visits(), 4);
    assert_eq!(tape.grad(w).unwrap().data(), &[2.0; 4]);
  }

  #[cfg(feature = "ndarray")]
  #[test]
  fn ndarray_accelerator_matches_local_gradients() {
    let counters = Rc::new(KernelCounters::new());
    let mut accelerated = Tape::new()
      .with_accelerator(NdarrayAccelerator::new())
      .with_telemetry(counters.clone());
    let mut local = Tape::new();

    let data: Vec<f64> = (0..32).map(|i| ((i * 5) % 7) as f64 - 3.0).collect();
    let kernel: Vec<f64> = (0..8).map(|i| (i % 3) as f64 - 1.0).collect();
    let mut grads = Vec::new();
    for tape in [&mut accelerated, &mut local] {
      let x = tape.leaf(Array::from_vec([2, 1, 4, 4], data.clone()).unwrap());
      let w = tape.leaf(Array::from_vec([2, 1, 2, 2], kernel.clone()).unwrap());
      let b = tape.leaf(Array::from_vec([2], vec![0.5, -0.5]).unwrap());
      let y = tape.conv2d(x, w, b, Conv2dOptions::default()).unwrap();
      let p = tape.max_pool2d(y, 3, None).unwrap();
      let loss = tape.sum(p).unwrap();
      tape.backward(loss).unwrap();
      grads.push((tape.grad(x).unwrap().clone(), tape.grad(w).unwrap().clone()));
    }
    assert_eq!(grads[0], grads[1]);
    assert_eq!(counters.count(Kernel::Conv2d, ExecutionPath::Accelerated), 1);
    // a 3x3 window at stride 3 tiles the input, so the probe accepts it
    assert_eq!(counters.count(Kernel::MaxPool2d, ExecutionPath::Accelerated), 1);
  }
}
