use rand::Rng;
use rand_distr::StandardNormal;

use lib_auto_core::{Array, Error, Result, Shape, Tape, Var};

use crate::module::Module;

/// Fully connected layer, `x · W + b`
///
/// `W` is `[in, out]` and `b` is `[out]`, broadcast over the batch.
#[derive(Debug, Clone, Copy)]
pub struct Linear {
  weight: Var,
  bias: Var,
  in_features: usize,
  out_features: usize,
}

impl Linear {
  /// Weights drawn from `N(0, 1) · 0.01`, zero bias
  pub fn new<R: Rng + ?Sized>(tape: &mut Tape, in_features: usize, out_features: usize, rng: &mut R) -> Self {
    let weight = Array::random([in_features, out_features], &StandardNormal, rng).map(|x| x * 0.01);
    let bias = Array::zeros([out_features]);
    Self::build(tape, weight, bias, in_features, out_features)
  }

  /// Layer with explicit initial values
  pub fn from_parts(tape: &mut Tape, weight: Array, bias: Array) -> Result<Self> {
    let &[in_features, out_features] = weight.dims() else {
      return Err(Error::InvalidShape {
        op: "linear",
        reason: format!("weight must be [in, out], got {}", weight.shape()),
      });
    };
    if bias.dims() != [out_features] {
      return Err(Error::Shape {
        op: "linear",
        lhs: weight.shape().clone(),
        rhs: bias.shape().clone(),
      });
    }
    Ok(Self::build(tape, weight, bias, in_features, out_features))
  }

  fn build(tape: &mut Tape, weight: Array, bias: Array, in_features: usize, out_features: usize) -> Self {
    let weight = tape.labeled_leaf(weight, "linear.weight");
    let bias = tape.labeled_leaf(bias, "linear.bias");
    Self {
      weight,
      bias,
      in_features,
      out_features,
    }
  }

  pub fn weight(&self) -> Var {
    self.weight
  }

  pub fn bias(&self) -> Var {
    self.bias
  }

  pub fn in_features(&self) -> usize {
    self.in_features
  }

  pub fn out_features(&self) -> usize {
    self.out_features
  }

  pub fn weight_shape(&self) -> Shape {
    Shape::new(&[self.in_features, self.out_features])
  }
}

impl Module for Linear {
  fn forward(&self, tape: &mut Tape, input: Var) -> Result<Var> {
    let z = tape.dot(input, self.weight)?;
    tape.add(z, self.bias)
  }

  fn parameters(&self) -> Vec<Var> {
    vec![self.weight, self.bias]
  }
}
