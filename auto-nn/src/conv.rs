use rand::Rng;
use rand_distr::Uniform;

use lib_auto_core::{Array, Conv2dOptions, Error, Result, Tape, Var};

use crate::module::Module;

/// 2-D convolution over `[b, c, h, w]` with a square kernel
#[derive(Debug, Clone, Copy)]
pub struct Conv2d {
  weight: Var,
  bias: Var,
  options: Conv2dOptions,
}

impl Conv2d {
  /// He-style uniform init in `±sqrt(2 / (in · k · k))`, zero bias
  pub fn new<R: Rng + ?Sized>(
    tape: &mut Tape,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    options: Conv2dOptions,
    rng: &mut R,
  ) -> Self {
    let fan_in = (in_channels * kernel_size * kernel_size).max(1) as f64;
    let bound = (2.0 / fan_in).sqrt();
    let weight = Array::random(
      [out_channels, in_channels, kernel_size, kernel_size],
      &Uniform::new_inclusive(-bound, bound),
      rng,
    );
    let bias = Array::zeros([out_channels]);
    Self::build(tape, weight, bias, options)
  }

  pub fn from_parts(tape: &mut Tape, weight: Array, bias: Array, options: Conv2dOptions) -> Result<Self> {
    let &[out_channels, _, _, _] = weight.dims() else {
      return Err(Error::InvalidShape {
        op: "conv2d",
        reason: format!("weight must be [out, in, kh, kw], got {}", weight.shape()),
      });
    };
    if bias.dims() != [out_channels] {
      return Err(Error::Shape {
        op: "conv2d",
        lhs: weight.shape().clone(),
        rhs: bias.shape().clone(),
      });
    }
    Ok(Self::build(tape, weight, bias, options))
  }

  fn build(tape: &mut Tape, weight: Array, bias: Array, options: Conv2dOptions) -> Self {
    let weight = tape.labeled_leaf(weight, "conv2d.weight");
    let bias = tape.labeled_leaf(bias, "conv2d.bias");
    Self {
      weight,
      bias,
      options,
    }
  }

  pub fn weight(&self) -> Var {
    self.weight
  }

  pub fn bias(&self) -> Var {
    self.bias
  }

  pub fn options(&self) -> Conv2dOptions {
    self.options
  }
}

impl Module for Conv2d {
  fn forward(&self, tape: &mut Tape, input: Var) -> Result<Var> {
    tape.conv2d(input, self.weight, self.bias, self.options)
  }

  fn forward_inference(&self, tape: &mut Tape, input: Var) -> Result<Var> {
    tape.conv2d_inference(input, self.weight, self.bias, self.options)
  }

  fn parameters(&self) -> Vec<Var> {
    vec![self.weight, self.bias]
  }
}

#[cfg(test)]
mod tests {
  use rand::rngs::StdRng;
  use rand::SeedableRng;

  use super::*;

  #[test]
  fn init_within_bound() {
    let mut tape = Tape::new();
    let mut rng = StdRng::seed_from_u64(3);
    let conv = Conv2d::new(&mut tape, 2, 4, 3, Conv2dOptions::default(), &mut rng);
    let bound = (2.0f64 / 18.0).sqrt();
    let w = tape.value(conv.weight()).unwrap();
    assert_eq!(w.dims(), &[4, 2, 3, 3]);
    assert!(w.data().iter().all(|x| x.abs() <= bound));
    assert_eq!(tape.tag(conv.weight()).unwrap(), "leaf:conv2d.weight");
    assert_eq!(tape.tag(conv.bias()).unwrap(), "leaf:conv2d.bias");
    assert_eq!(conv.parameters().len(), 2);
  }

  #[test]
  fn padded_forward_keeps_spatial_size() {
    let mut tape = Tape::new();
    let mut rng = StdRng::seed_from_u64(3);
    let options = Conv2dOptions {
      stride: 1,
      padding: 1,
    };
    let conv = Conv2d::new(&mut tape, 1, 2, 3, options, &mut rng);
    tape.scope(|t| {
      let x = t.leaf(Array::ones([2, 1, 5, 5]));
      let y = conv.forward(t, x).unwrap();
      assert_eq!(t.value(y).unwrap().dims(), &[2, 2, 5, 5]);
    });
  }

  #[test]
  fn inference_forward_without_accelerator_is_unsupported() {
    let mut tape = Tape::new();
    let conv = Conv2d::from_parts(
      &mut tape,
      Array::ones([1, 1, 2, 2]),
      Array::zeros([1]),
      Conv2dOptions::default(),
    )
    .unwrap();
    tape.scope(|t| {
      let x = t.leaf(Array::ones([1, 1, 3, 3]));
      assert!(matches!(
        conv.forward_inference(t, x),
        Err(Error::UnsupportedPath { .. })
      ));
    });
  }
}
