//!
//! # auto-tensor
//!
//! Reverse-mode automatic differentiation over dense `f64` arrays, with a small
//! neural-network library on top.
//!
//! The core API lives at the crate root: build expressions on a [`Tape`] inside
//! [`Tape::scope`], call [`Tape::backward`] on a scalar, read gradients back
//! with [`Tape::grad`]. Layers, losses, optimizers and checkpoints are under
//! [`nn`] when the `nn` feature is enabled.
//!

pub use lib_auto_core::*;

#[cfg(feature = "nn")]
pub use lib_auto_nn as nn;
