//!
//! # auto-nn
//!
//! Layers, losses, optimizers and checkpoints on top of `lib_auto_core`.
//!
//! Modules create their parameters as leaves of the tape's root frame; a
//! training step runs the forward pass, the loss and the backward pass inside a
//! [`lib_auto_core::Tape::scope`], then the optimizer updates the parameters in
//! place.
//!

mod activation;
pub mod checkpoint;
mod conv;
mod error;
mod linear;
pub mod loss;
mod module;
pub mod optim;
mod pool;

pub use activation::{Flatten, Relu, Sigmoid, Softmax};
pub use checkpoint::{Checkpoint, SavedParameter};
pub use conv::Conv2d;
pub use error::{Error, Result};
pub use linear::Linear;
pub use module::{Module, Sequential};
pub use optim::{Adam, AdamConfig, Optimizer, Sgd, SgdConfig};
pub use pool::MaxPool2d;
