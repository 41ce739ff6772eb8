//!
//! Optional accelerated execution of forward kernels
//!
//! An [`Accelerator`] receives flattened row-major buffers plus geometry and
//! returns a flattened result of the documented output length. The tape asks
//! [`Accelerator::supports`] once per operation; a `false` answer, an error, or
//! a buffer of the wrong length all lead to the local kernel instead...
//!

use std::fmt;

use thiserror::Error;

use crate::kernels::{Conv2dGeometry, Pool2dGeometry};

#[cfg(feature = "ndarray")]
mod ndarray_backend;

#[cfg(feature = "ndarray")]
pub use ndarray_backend::NdarrayAccelerator;

/// Kernels an accelerator may substitute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
  MatMul,
  Conv2d,
  MaxPool2d,
}

impl fmt::Display for Kernel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Kernel::MatMul => f.write_str("matmul"),
      Kernel::Conv2d => f.write_str("conv2d"),
      Kernel::MaxPool2d => f.write_str("max_pool2d"),
    }
  }
}

/// The probe payload: which kernel, at which geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelRequest {
  MatMul { m: usize, k: usize, n: usize },
  Conv2d(Conv2dGeometry),
  MaxPool2d(Pool2dGeometry),
}

impl KernelRequest {
  pub fn kernel(&self) -> Kernel {
    match self {
      KernelRequest::MatMul { .. } => Kernel::MatMul,
      KernelRequest::Conv2d(_) => Kernel::Conv2d,
      KernelRequest::MaxPool2d(_) => Kernel::MaxPool2d,
    }
  }

  /// Number of values a correct result buffer holds
  pub fn output_len(&self) -> usize {
    match self {
      KernelRequest::MatMul { m, n, .. } => m * n,
      KernelRequest::Conv2d(geo) => geo.output_len(),
      KernelRequest::MaxPool2d(geo) => geo.output_len(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AccelError {
  #[error("{0}")]
  Failed(String),

  #[error("expected {expected} output values, got {got}")]
  OutputLength { expected: usize, got: usize },
}

/// Alternate execution strategy for forward kernels
///
/// Implementations must be pure: same inputs, same output, no retained state
/// that changes results.
pub trait Accelerator {
  fn name(&self) -> &str;

  /// Capability probe, consulted before every delegation
  fn supports(&self, request: &KernelRequest) -> bool;

  fn matmul(&self, a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Result<Vec<f64>, AccelError>;

  fn conv2d(
    &self,
    input: &[f64],
    weight: &[f64],
    bias: &[f64],
    geometry: &Conv2dGeometry,
  ) -> Result<Vec<f64>, AccelError>;

  fn max_pool2d(&self, input: &[f64], geometry: &Pool2dGeometry) -> Result<Vec<f64>, AccelError>;
}

/// Reject result buffers that do not hold exactly `expected` values
pub(crate) fn checked_len(output: Vec<f64>, expected: usize) -> Result<Vec<f64>, AccelError> {
  if output.len() == expected {
    Ok(output)
  } else {
    Err(AccelError::OutputLength {
      expected,
      got: output.len(),
    })
  }
}
