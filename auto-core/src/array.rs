//!
//! Dense row-major `f64` storage backing every node's values and gradient
//!

use std::fmt;

use rand::Rng;
use rand_distr::Distribution;
use smallvec::SmallVec;

use crate::error::{Error, Result};

/// Ordered dimensions of an array; most tensors here are rank 4 or less
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(SmallVec<[usize; 4]>);

impl Shape {
  pub fn new(dims: &[usize]) -> Self {
    Self(SmallVec::from_slice(dims))
  }

  /// The shape reductions and losses produce, a single element
  pub fn scalar() -> Self {
    Self::new(&[1])
  }

  #[inline]
  pub fn dims(&self) -> &[usize] {
    &self.0
  }

  #[inline]
  pub fn rank(&self) -> usize {
    self.0.len()
  }

  #[inline]
  pub fn numel(&self) -> usize {
    self.0.iter().product()
  }

  /// True when `self` is a bias for `other`, i.e. `other` with its leading
  /// (batch) axis dropped...
  pub fn is_bias_of(&self, other: &Shape) -> bool {
    self.rank() + 1 == other.rank() && self.0[..] == other.0[1..]
  }
}

impl From<&[usize]> for Shape {
  fn from(dims: &[usize]) -> Self {
    Self::new(dims)
  }
}

impl From<Vec<usize>> for Shape {
  fn from(dims: Vec<usize>) -> Self {
    Self(SmallVec::from_vec(dims))
  }
}

impl<const N: usize> From<[usize; N]> for Shape {
  fn from(dims: [usize; N]) -> Self {
    Self::new(&dims)
  }
}

impl fmt::Debug for Shape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list().entries(self.0.iter()).finish()
  }
}

impl fmt::Display for Shape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

/// A dense, row-major array of `f64`
#[derive(Clone, PartialEq)]
pub struct Array {
  shape: Shape,
  data: Vec<f64>,
}

impl Array {
  /// Build an array from row-major data; every dimension must be positive and
  /// the data length must match the shape...
  pub fn from_vec(shape: impl Into<Shape>, data: Vec<f64>) -> Result<Self> {
    let shape = shape.into();
    if shape.rank() == 0 || shape.dims().contains(&0) {
      return Err(Error::InvalidShape {
        op: "array",
        reason: format!("dimensions must be positive, got {shape}"),
      });
    }
    if shape.numel() != data.len() {
      return Err(Error::InvalidShape {
        op: "array",
        reason: format!("shape {shape} needs {} values, got {}", shape.numel(), data.len()),
      });
    }
    Ok(Self { shape, data })
  }

  pub fn full(shape: impl Into<Shape>, value: f64) -> Self {
    let shape = shape.into();
    let data = vec![value; shape.numel()];
    Self { shape, data }
  }

  pub fn zeros(shape: impl Into<Shape>) -> Self {
    Self::full(shape, 0.0)
  }

  pub fn ones(shape: impl Into<Shape>) -> Self {
    Self::full(shape, 1.0)
  }

  pub fn scalar(value: f64) -> Self {
    Self::full(Shape::scalar(), value)
  }

  /// Sample every element independently from `dist`
  pub fn random<D, R>(shape: impl Into<Shape>, dist: &D, rng: &mut R) -> Self
  where
    D: Distribution<f64>,
    R: Rng + ?Sized,
  {
    let shape = shape.into();
    let data = (0..shape.numel()).map(|_| dist.sample(rng)).collect();
    Self { shape, data }
  }

  #[inline]
  pub fn shape(&self) -> &Shape {
    &self.shape
  }

  #[inline]
  pub fn dims(&self) -> &[usize] {
    self.shape.dims()
  }

  #[inline]
  pub fn numel(&self) -> usize {
    self.data.len()
  }

  #[inline]
  pub fn data(&self) -> &[f64] {
    &self.data
  }

  #[inline]
  pub fn data_mut(&mut self) -> &mut [f64] {
    &mut self.data
  }

  pub fn into_vec(self) -> Vec<f64> {
    self.data
  }

  /// The single value of a one-element array
  pub fn item(&self) -> Option<f64> {
    match self.data.as_slice() {
      [value] => Some(*value),
      _ => None,
    }
  }

  /// Row-major element lookup
  pub fn get(&self, index: &[usize]) -> Option<f64> {
    if index.len() != self.shape.rank() {
      return None;
    }
    let mut flat = 0;
    for (&i, &dim) in index.iter().zip(self.dims()) {
      if i >= dim {
        return None;
      }
      flat = flat * dim + i;
    }
    self.data.get(flat).copied()
  }

  pub fn sum(&self) -> f64 {
    self.data.iter().sum()
  }

  pub fn is_finite(&self) -> bool {
    self.data.iter().all(|x| x.is_finite())
  }

  pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
    Self {
      shape: self.shape.clone(),
      data: self.data.iter().map(|&x| f(x)).collect(),
    }
  }

  pub fn fill(&mut self, value: f64) {
    self.data.iter_mut().for_each(|x| *x = value);
  }

  /// Elementwise combination of two arrays holding the same number of values;
  /// the result takes the shape of `self`
  pub(crate) fn zip_map(&self, other: &Array, f: impl Fn(f64, f64) -> f64) -> Self {
    debug_assert_eq!(self.numel(), other.numel());
    Self {
      shape: self.shape.clone(),
      data: self
        .data
        .iter()
        .zip(&other.data)
        .map(|(&a, &b)| f(a, b))
        .collect(),
    }
  }

  /// Elementwise combination where `bias` repeats along the leading axis of
  /// `self`
  pub(crate) fn broadcast_map(&self, bias: &Array, f: impl Fn(f64, f64) -> f64) -> Self {
    let period = bias.numel();
    Self {
      shape: self.shape.clone(),
      data: self
        .data
        .iter()
        .enumerate()
        .map(|(i, &a)| f(a, bias.data[i % period]))
        .collect(),
    }
  }

  /// Collapse the leading axis by summation, `[n, rest..] -> [rest..]`
  pub(crate) fn sum_leading_axis(&self) -> Self {
    let shape = Shape::new(&self.dims()[1..]);
    let period = shape.numel();
    let mut data = vec![0.0; period];
    for row in self.data.chunks(period) {
      for (acc, &x) in data.iter_mut().zip(row) {
        *acc += x;
      }
    }
    Self { shape, data }
  }

  /// In-place accumulation; gradients are only ever added to, never replaced
  pub(crate) fn accumulate(&mut self, other: &Array) {
    debug_assert_eq!(self.shape, other.shape);
    for (acc, &x) in self.data.iter_mut().zip(&other.data) {
      *acc += x;
    }
  }

  pub(crate) fn with_shape(self, shape: Shape) -> Self {
    debug_assert_eq!(shape.numel(), self.data.len());
    Self {
      shape,
      data: self.data,
    }
  }

  pub(crate) fn from_parts(shape: Shape, data: Vec<f64>) -> Self {
    debug_assert_eq!(shape.numel(), data.len());
    Self { shape, data }
  }
}

impl fmt::Debug for Array {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Array")
      .field("shape", &self.shape)
      .field("data", &self.data)
      .finish()
  }
}
