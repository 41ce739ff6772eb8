use std::fmt;

use lib_auto_core::{Result, Tape, Var};

/// A differentiable building block
///
/// Parameters are nodes created in the tape's root frame when the module is
/// built; `forward` is expected to run inside a [`Tape::scope`] so every
/// intermediate node is dropped after the step.
pub trait Module {
  fn forward(&self, tape: &mut Tape, input: Var) -> Result<Var>;

  /// Forward pass through accelerator-only kernels where the module has them;
  /// the resulting graph cannot be back-propagated
  fn forward_inference(&self, tape: &mut Tape, input: Var) -> Result<Var> {
    self.forward(tape, input)
  }

  /// Trainable parameters in a stable order
  fn parameters(&self) -> Vec<Var> {
    Vec::new()
  }
}

/// Modules applied one after another
#[derive(Default)]
pub struct Sequential {
  layers: Vec<Box<dyn Module>>,
}

impl Sequential {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, layer: impl Module + 'static) -> Self {
    self.push(layer);
    self
  }

  pub fn push(&mut self, layer: impl Module + 'static) {
    self.layers.push(Box::new(layer));
  }

  pub fn len(&self) -> usize {
    self.layers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.layers.is_empty()
  }
}

impl Module for Sequential {
  fn forward(&self, tape: &mut Tape, input: Var) -> Result<Var> {
    self
      .layers
      .iter()
      .try_fold(input, |x, layer| layer.forward(tape, x))
  }

  fn forward_inference(&self, tape: &mut Tape, input: Var) -> Result<Var> {
    self
      .layers
      .iter()
      .try_fold(input, |x, layer| layer.forward_inference(tape, x))
  }

  fn parameters(&self) -> Vec<Var> {
    self.layers.iter().flat_map(|layer| layer.parameters()).collect()
  }
}

impl fmt::Debug for Sequential {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Sequential")
      .field("layers", &self.layers.len())
      .finish()
  }
}
