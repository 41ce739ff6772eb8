use std::fmt;

use thiserror::Error;

use crate::accel::Kernel;
use crate::array::Shape;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which half of a training step produced a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Forward,
  Backward,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Stage::Forward => f.write_str("forward"),
      Stage::Backward => f.write_str("backward"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
  /// Operand shapes outside an operation's contract
  #[error("{op}: incompatible shapes {lhs} and {rhs}")]
  Shape {
    op: &'static str,
    lhs: Shape,
    rhs: Shape,
  },

  #[error("{op}: {reason}")]
  InvalidShape { op: &'static str, reason: String },

  #[error("{op}: target class {target} is out of range for {classes} classes")]
  TargetOutOfRange {
    op: &'static str,
    target: usize,
    classes: usize,
  },

  #[error("backward root must hold a single element, got shape {shape}")]
  NonScalarRoot { shape: Shape },

  #[error("tensor handle belongs to a scope that has already been closed")]
  StaleVar,

  /// An accelerator-only kernel was requested but cannot run
  #[error("no accelerated {kernel} routine available: {reason}")]
  UnsupportedPath { kernel: Kernel, reason: String },

  #[error("cannot back-propagate through inference-only node `{op}`")]
  InferenceOnly { op: &'static str },

  #[error("non-finite values produced by `{op}` during {stage}")]
  NonFinite { op: &'static str, stage: Stage },
}
