//!
//! Local reference kernels
//!
//! Every numeric routine the graph needs has a local implementation here; an
//! accelerator may substitute the forward half of some of them, but the
//! backward rules always run from this module...
//!

use nalgebra::DMatrix;

use crate::array::Shape;
use crate::error::{Error, Result};

/// Full description of a 2-D convolution, `input [b, c, h, w]` against
/// `weight [o, c, kh, kw]` with zero padding on every border
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Conv2dGeometry {
  pub batch: usize,
  pub in_channels: usize,
  pub out_channels: usize,
  pub height: usize,
  pub width: usize,
  pub kernel_h: usize,
  pub kernel_w: usize,
  pub stride: usize,
  pub padding: usize,
}

impl Conv2dGeometry {
  /// Validate operand shapes and derive the geometry
  pub fn infer(
    input: &Shape,
    weight: &Shape,
    bias: &Shape,
    stride: usize,
    padding: usize,
  ) -> Result<Self> {
    let (&[batch, in_channels, height, width], &[out_channels, weight_in, kernel_h, kernel_w]) =
      (input.dims(), weight.dims())
    else {
      return Err(Error::Shape {
        op: "conv2d",
        lhs: input.clone(),
        rhs: weight.clone(),
      });
    };
    if weight_in != in_channels {
      return Err(Error::Shape {
        op: "conv2d",
        lhs: input.clone(),
        rhs: weight.clone(),
      });
    }
    if bias.dims() != [out_channels] {
      return Err(Error::Shape {
        op: "conv2d",
        lhs: weight.clone(),
        rhs: bias.clone(),
      });
    }
    if stride == 0 {
      return Err(Error::InvalidShape {
        op: "conv2d",
        reason: "stride must be positive".into(),
      });
    }
    if kernel_h > height + 2 * padding || kernel_w > width + 2 * padding {
      return Err(Error::InvalidShape {
        op: "conv2d",
        reason: format!("kernel {kernel_h}x{kernel_w} exceeds padded input {input}"),
      });
    }
    Ok(Self {
      batch,
      in_channels,
      out_channels,
      height,
      width,
      kernel_h,
      kernel_w,
      stride,
      padding,
    })
  }

  pub fn out_h(&self) -> usize {
    (self.height + 2 * self.padding - self.kernel_h) / self.stride + 1
  }

  pub fn out_w(&self) -> usize {
    (self.width + 2 * self.padding - self.kernel_w) / self.stride + 1
  }

  pub fn output_shape(&self) -> Shape {
    Shape::from([self.batch, self.out_channels, self.out_h(), self.out_w()])
  }

  pub fn output_len(&self) -> usize {
    self.batch * self.out_channels * self.out_h() * self.out_w()
  }

  /// Map an output position plus kernel offset to a flat input index, `None`
  /// when it lands in the zero padding
  #[inline]
  fn input_index(&self, b: usize, c: usize, i: usize, j: usize, ki: usize, kj: usize) -> Option<usize> {
    let y = (i * self.stride + ki).checked_sub(self.padding)?;
    let x = (j * self.stride + kj).checked_sub(self.padding)?;
    if y >= self.height || x >= self.width {
      return None;
    }
    Some(((b * self.in_channels + c) * self.height + y) * self.width + x)
  }

  #[inline]
  fn weight_index(&self, o: usize, c: usize, ki: usize, kj: usize) -> usize {
    ((o * self.in_channels + c) * self.kernel_h + ki) * self.kernel_w + kj
  }
}

/// Max-pool window description over `input [b, c, h, w]`, windows do not pad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pool2dGeometry {
  pub batch: usize,
  pub channels: usize,
  pub height: usize,
  pub width: usize,
  pub kernel_h: usize,
  pub kernel_w: usize,
  pub stride: usize,
}

impl Pool2dGeometry {
  pub fn infer(input: &Shape, kernel: usize, stride: usize) -> Result<Self> {
    let &[batch, channels, height, width] = input.dims() else {
      return Err(Error::InvalidShape {
        op: "max_pool2d",
        reason: format!("expected a [batch, channels, height, width] input, got {input}"),
      });
    };
    if kernel == 0 || stride == 0 {
      return Err(Error::InvalidShape {
        op: "max_pool2d",
        reason: "kernel and stride must be positive".into(),
      });
    }
    if kernel > height || kernel > width {
      return Err(Error::InvalidShape {
        op: "max_pool2d",
        reason: format!("kernel {kernel} exceeds input {input}"),
      });
    }
    Ok(Self {
      batch,
      channels,
      height,
      width,
      kernel_h: kernel,
      kernel_w: kernel,
      stride,
    })
  }

  pub fn out_h(&self) -> usize {
    (self.height - self.kernel_h) / self.stride + 1
  }

  pub fn out_w(&self) -> usize {
    (self.width - self.kernel_w) / self.stride + 1
  }

  pub fn output_shape(&self) -> Shape {
    Shape::from([self.batch, self.channels, self.out_h(), self.out_w()])
  }

  pub fn output_len(&self) -> usize {
    self.batch * self.channels * self.out_h() * self.out_w()
  }
}

#[inline]
fn matrix(data: &[f64], rows: usize, cols: usize) -> DMatrix<f64> {
  DMatrix::from_row_slice(rows, cols, data)
}

/// nalgebra stores column-major, the transpose's column order is our row order
#[inline]
fn row_major(m: &DMatrix<f64>) -> Vec<f64> {
  m.transpose().iter().copied().collect()
}

/// `[m, k] · [k, n] -> [m, n]`
pub fn matmul(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
  let product = matrix(a, m, k) * matrix(b, k, n);
  row_major(&product)
}

/// Pullbacks of `a · b` given the upstream gradient `g [m, n]`:
/// `(g · bᵗ, aᵗ · g)`
pub fn matmul_grads(
  a: &[f64],
  b: &[f64],
  g: &[f64],
  m: usize,
  k: usize,
  n: usize,
) -> (Vec<f64>, Vec<f64>) {
  let (a, b, g) = (matrix(a, m, k), matrix(b, k, n), matrix(g, m, n));
  let grad_a = &g * b.transpose();
  let grad_b = a.transpose() * &g;
  (row_major(&grad_a), row_major(&grad_b))
}

pub fn conv2d_forward(input: &[f64], weight: &[f64], bias: &[f64], geo: &Conv2dGeometry) -> Vec<f64> {
  let (out_h, out_w) = (geo.out_h(), geo.out_w());
  let mut output = Vec::with_capacity(geo.output_len());
  for b in 0..geo.batch {
    for o in 0..geo.out_channels {
      for i in 0..out_h {
        for j in 0..out_w {
          let mut acc = bias[o];
          for c in 0..geo.in_channels {
            for ki in 0..geo.kernel_h {
              for kj in 0..geo.kernel_w {
                if let Some(idx) = geo.input_index(b, c, i, j, ki, kj) {
                  acc += input[idx] * weight[geo.weight_index(o, c, ki, kj)];
                }
              }
            }
          }
          output.push(acc);
        }
      }
    }
  }
  output
}

/// Gradients of a convolution with respect to `(input, weight, bias)`
pub struct Conv2dGrads {
  pub input: Vec<f64>,
  pub weight: Vec<f64>,
  pub bias: Vec<f64>,
}

pub fn conv2d_backward(
  input: &[f64],
  weight: &[f64],
  grad_out: &[f64],
  geo: &Conv2dGeometry,
) -> Conv2dGrads {
  let mut grads = Conv2dGrads {
    input: vec![0.0; input.len()],
    weight: vec![0.0; weight.len()],
    bias: vec![0.0; geo.out_channels],
  };
  let (out_h, out_w) = (geo.out_h(), geo.out_w());
  let mut out_idx = 0;
  for b in 0..geo.batch {
    for o in 0..geo.out_channels {
      for i in 0..out_h {
        for j in 0..out_w {
          let g = grad_out[out_idx];
          out_idx += 1;
          grads.bias[o] += g;
          for c in 0..geo.in_channels {
            for ki in 0..geo.kernel_h {
              for kj in 0..geo.kernel_w {
                if let Some(idx) = geo.input_index(b, c, i, j, ki, kj) {
                  let w_idx = geo.weight_index(o, c, ki, kj);
                  grads.weight[w_idx] += input[idx] * g;
                  grads.input[idx] += weight[w_idx] * g;
                }
              }
            }
          }
        }
      }
    }
  }
  grads
}

/// Returns pooled values and, per output element, the flat input index that
/// produced it; ties go to the first element in row-major window order
pub fn max_pool2d_forward(input: &[f64], geo: &Pool2dGeometry) -> (Vec<f64>, Vec<usize>) {
  let (out_h, out_w) = (geo.out_h(), geo.out_w());
  let mut output = Vec::with_capacity(geo.output_len());
  let mut argmax = Vec::with_capacity(geo.output_len());
  for plane in 0..geo.batch * geo.channels {
    let base = plane * geo.height * geo.width;
    for i in 0..out_h {
      for j in 0..out_w {
        let (y0, x0) = (i * geo.stride, j * geo.stride);
        let mut best_idx = base + y0 * geo.width + x0;
        for ki in 0..geo.kernel_h {
          for kj in 0..geo.kernel_w {
            let idx = base + (y0 + ki) * geo.width + x0 + kj;
            if input[idx] > input[best_idx] {
              best_idx = idx;
            }
          }
        }
        output.push(input[best_idx]);
        argmax.push(best_idx);
      }
    }
  }
  (output, argmax)
}

pub fn max_pool2d_backward(grad_out: &[f64], argmax: &[usize], input_len: usize) -> Vec<f64> {
  let mut grad_in = vec![0.0; input_len];
  for (&g, &idx) in grad_out.iter().zip(argmax) {
    grad_in[idx] += g;
  }
  grad_in
}

/// Row-wise softmax over contiguous rows of `row_len`, max-subtracted
pub fn softmax_rows(data: &[f64], row_len: usize) -> Vec<f64> {
  let mut out = Vec::with_capacity(data.len());
  for row in data.chunks(row_len) {
    let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let start = out.len();
    out.extend(row.iter().map(|&x| (x - max).exp()));
    let total: f64 = out[start..].iter().sum();
    out[start..].iter_mut().for_each(|x| *x /= total);
  }
  out
}
