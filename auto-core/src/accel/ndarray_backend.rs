use ndarray::{s, Array2, ArrayView2, ArrayView4, Axis};

use super::{AccelError, Accelerator, KernelRequest};
use crate::kernels::{Conv2dGeometry, Pool2dGeometry};

/// Accelerator backed by `ndarray`'s blocked matrix product
///
/// Convolution is lowered to one im2col product per batch element; pooling is
/// only offered for non-overlapping windows (stride equal to the kernel).
#[derive(Debug, Clone, Copy, Default)]
pub struct NdarrayAccelerator;

impl NdarrayAccelerator {
  pub fn new() -> Self {
    Self
  }
}

fn shape_error(err: ndarray::ShapeError) -> AccelError {
  AccelError::Failed(err.to_string())
}

impl Accelerator for NdarrayAccelerator {
  fn name(&self) -> &str {
    "ndarray"
  }

  fn supports(&self, request: &KernelRequest) -> bool {
    match request {
      KernelRequest::MatMul { .. } | KernelRequest::Conv2d(_) => true,
      KernelRequest::MaxPool2d(geo) => geo.stride == geo.kernel_h && geo.stride == geo.kernel_w,
    }
  }

  fn matmul(&self, a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Result<Vec<f64>, AccelError> {
    let a = ArrayView2::from_shape((m, k), a).map_err(shape_error)?;
    let b = ArrayView2::from_shape((k, n), b).map_err(shape_error)?;
    Ok(a.dot(&b).iter().copied().collect())
  }

  fn conv2d(
    &self,
    input: &[f64],
    weight: &[f64],
    bias: &[f64],
    geo: &Conv2dGeometry,
  ) -> Result<Vec<f64>, AccelError> {
    let input = ArrayView4::from_shape((geo.batch, geo.in_channels, geo.height, geo.width), input)
      .map_err(shape_error)?;
    let patch = geo.in_channels * geo.kernel_h * geo.kernel_w;
    let weight = ArrayView2::from_shape((geo.out_channels, patch), weight).map_err(shape_error)?;
    let (out_h, out_w) = (geo.out_h(), geo.out_w());

    let mut output = Vec::with_capacity(geo.output_len());
    for sample in input.axis_iter(Axis(0)) {
      let mut cols = Array2::<f64>::zeros((patch, out_h * out_w));
      for c in 0..geo.in_channels {
        for ki in 0..geo.kernel_h {
          for kj in 0..geo.kernel_w {
            let row = (c * geo.kernel_h + ki) * geo.kernel_w + kj;
            for i in 0..out_h {
              for j in 0..out_w {
                let y = (i * geo.stride + ki).checked_sub(geo.padding);
                let x = (j * geo.stride + kj).checked_sub(geo.padding);
                if let (Some(y), Some(x)) = (y, x) {
                  if y < geo.height && x < geo.width {
                    cols[[row, i * out_w + j]] = sample[[c, y, x]];
                  }
                }
              }
            }
          }
        }
      }
      let mut product = weight.dot(&cols);
      for (mut row, &b) in product.axis_iter_mut(Axis(0)).zip(bias) {
        row += b;
      }
      output.extend(product.iter().copied());
    }
    Ok(output)
  }

  fn max_pool2d(&self, input: &[f64], geo: &Pool2dGeometry) -> Result<Vec<f64>, AccelError> {
    let input = ArrayView4::from_shape((geo.batch, geo.channels, geo.height, geo.width), input)
      .map_err(shape_error)?;
    let (out_h, out_w) = (geo.out_h(), geo.out_w());
    let mut output = Vec::with_capacity(geo.output_len());
    for b in 0..geo.batch {
      for c in 0..geo.channels {
        for i in 0..out_h {
          for j in 0..out_w {
            let (y0, x0) = (i * geo.stride, j * geo.stride);
            let window = input.slice(s![b, c, y0..y0 + geo.kernel_h, x0..x0 + geo.kernel_w]);
            output.push(window.iter().copied().fold(f64::NEG_INFINITY, f64::max));
          }
        }
      }
    }
    Ok(output)
  }
}
