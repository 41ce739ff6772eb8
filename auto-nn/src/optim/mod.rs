//!
//! Parameter update rules
//!
//! An optimizer owns the parameter handles it updates plus any per-parameter
//! state. Updates happen in place through [`Tape::update`], so the handles
//! stay valid across steps.
//!

mod adam;
mod sgd;

pub use adam::{Adam, AdamConfig};
pub use sgd::{Sgd, SgdConfig};

use lib_auto_core::{Result, Tape, Var};

pub trait Optimizer {
  /// Apply one update from the gradients currently on the tape
  fn step(&mut self, tape: &mut Tape) -> Result<()>;

  /// Reset the gradient of every managed parameter to zero
  fn zero_grad(&self, tape: &mut Tape) -> Result<()> {
    tape.zero_grad(self.parameters())
  }

  fn parameters(&self) -> &[Var];

  fn learning_rate(&self) -> f64;

  fn set_learning_rate(&mut self, lr: f64);
}
