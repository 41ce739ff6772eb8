//!
//! Loss helpers composed from core operations
//!

use lib_auto_core::{Operand, Result, Tape, Var};

/// `sum((pred - target)²)`
pub fn sum_squared_error(tape: &mut Tape, pred: Var, target: impl Operand) -> Result<Var> {
  let diff = tape.sub(pred, target)?;
  let sq = tape.mul(diff, diff)?;
  tape.sum(sq)
}

/// `mean((pred - target)²)`
pub fn mse(tape: &mut Tape, pred: Var, target: impl Operand) -> Result<Var> {
  let diff = tape.sub(pred, target)?;
  let sq = tape.mul(diff, diff)?;
  tape.mean(sq)
}

/// Softmax over raw logits followed by cross-entropy against class indices
pub fn softmax_cross_entropy(tape: &mut Tape, logits: Var, targets: &[usize]) -> Result<Var> {
  let probs = tape.softmax(logits)?;
  tape.cross_entropy(probs, targets)
}
