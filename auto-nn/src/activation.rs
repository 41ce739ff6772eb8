//!
//! Parameter-free layers
//!

use lib_auto_core::{Result, Tape, Var};

use crate::module::Module;

#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

impl Module for Relu {
  fn forward(&self, tape: &mut Tape, input: Var) -> Result<Var> {
    tape.relu(input)
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sigmoid;

impl Module for Sigmoid {
  fn forward(&self, tape: &mut Tape, input: Var) -> Result<Var> {
    tape.sigmoid(input)
  }
}

/// Row-wise softmax; only differentiable when followed by a cross-entropy loss
#[derive(Debug, Clone, Copy, Default)]
pub struct Softmax;

impl Module for Softmax {
  fn forward(&self, tape: &mut Tape, input: Var) -> Result<Var> {
    tape.softmax(input)
  }
}

/// `[b, ..] -> [b, prod(..)]`
#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

impl Module for Flatten {
  fn forward(&self, tape: &mut Tape, input: Var) -> Result<Var> {
    tape.flatten(input)
  }
}
