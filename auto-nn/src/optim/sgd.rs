use serde::{Deserialize, Serialize};
use tracing::trace;

use lib_auto_core::{Result, Tape, Var};

use super::Optimizer;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
  pub lr: f64,
  /// Zero disables the velocity buffer entirely
  pub momentum: f64,
}

impl Default for SgdConfig {
  fn default() -> Self {
    Self {
      lr: 0.01,
      momentum: 0.0,
    }
  }
}

/// Stochastic gradient descent, `v = μv + g; p -= lr · v`
#[derive(Debug, Clone)]
pub struct Sgd {
  params: Vec<Var>,
  config: SgdConfig,
  velocity: Vec<Vec<f64>>,
}

impl Sgd {
  pub fn new(params: Vec<Var>, config: SgdConfig) -> Self {
    Self {
      params,
      config,
      velocity: Vec::new(),
    }
  }

  pub fn config(&self) -> &SgdConfig {
    &self.config
  }
}

impl Optimizer for Sgd {
  fn step(&mut self, tape: &mut Tape) -> Result<()> {
    let SgdConfig { lr, momentum } = self.config;
    if momentum == 0.0 {
      for &param in &self.params {
        tape.update(param, |values, grad| {
          for (x, g) in values.iter_mut().zip(grad) {
            *x -= lr * g;
          }
        })?;
      }
    } else {
      if self.velocity.len() != self.params.len() {
        self.velocity = self
          .params
          .iter()
          .map(|&p| tape.value(p).map(|v| vec![0.0; v.numel()]))
          .collect::<Result<_>>()?;
      }
      for (&param, velocity) in self.params.iter().zip(&mut self.velocity) {
        tape.update(param, |values, grad| {
          for ((x, g), v) in values.iter_mut().zip(grad).zip(velocity.iter_mut()) {
            *v = momentum * *v + g;
            *x -= lr * *v;
          }
        })?;
      }
    }
    trace!(params = self.params.len(), lr, momentum, "sgd step");
    Ok(())
  }

  fn parameters(&self) -> &[Var] {
    &self.params
  }

  fn learning_rate(&self) -> f64 {
    self.config.lr
  }

  fn set_learning_rate(&mut self, lr: f64) {
    self.config.lr = lr;
  }
}
