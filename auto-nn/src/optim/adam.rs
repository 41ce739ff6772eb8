use serde::{Deserialize, Serialize};
use tracing::trace;

use lib_auto_core::{Result, Tape, Var};

use super::Optimizer;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
  pub lr: f64,
  pub beta1: f64,
  pub beta2: f64,
  pub epsilon: f64,
}

impl Default for AdamConfig {
  fn default() -> Self {
    Self {
      lr: 1e-3,
      beta1: 0.9,
      beta2: 0.999,
      epsilon: 1e-8,
    }
  }
}

/// Adam with bias-corrected first and second moment estimates
#[derive(Debug, Clone)]
pub struct Adam {
  params: Vec<Var>,
  config: AdamConfig,
  m: Vec<Vec<f64>>,
  v: Vec<Vec<f64>>,
  t: i32,
}

impl Adam {
  pub fn new(params: Vec<Var>, config: AdamConfig) -> Self {
    Self {
      params,
      config,
      m: Vec::new(),
      v: Vec::new(),
      t: 0,
    }
  }

  pub fn config(&self) -> &AdamConfig {
    &self.config
  }

  /// Number of steps taken so far
  pub fn steps(&self) -> i32 {
    self.t
  }
}

impl Optimizer for Adam {
  fn step(&mut self, tape: &mut Tape) -> Result<()> {
    if self.m.len() != self.params.len() {
      let zeros = self
        .params
        .iter()
        .map(|&p| tape.value(p).map(|v| vec![0.0; v.numel()]))
        .collect::<Result<Vec<_>>>()?;
      self.m = zeros.clone();
      self.v = zeros;
    }

    self.t += 1;
    let AdamConfig {
      lr,
      beta1,
      beta2,
      epsilon,
    } = self.config;
    let correction1 = 1.0 - beta1.powi(self.t);
    let correction2 = 1.0 - beta2.powi(self.t);

    for ((&param, m), v) in self.params.iter().zip(&mut self.m).zip(&mut self.v) {
      tape.update(param, |values, grad| {
        for (((x, &g), m), v) in values.iter_mut().zip(grad).zip(m.iter_mut()).zip(v.iter_mut()) {
          *m = beta1 * *m + (1.0 - beta1) * g;
          *v = beta2 * *v + (1.0 - beta2) * g * g;
          let m_hat = *m / correction1;
          let v_hat = *v / correction2;
          *x -= lr * m_hat / (v_hat.sqrt() + epsilon);
        }
      })?;
    }
    trace!(step = self.t, params = self.params.len(), "adam step");
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

#[cfg(test)]
mod tests {
  use approx::assert_relative_eq;
  use lib_auto_core::Array;

  use super::*;

  #[test]
  fn first_step_moves_by_lr() {
    // bias correction makes the first step ±lr whatever the gradient scale
    let mut tape = Tape::new();
    let w = tape.leaf(Array::from_vec([2], vec![1.0, -1.0]).unwrap());
    let mut adam = Adam::new(vec![w], AdamConfig::default());
    tape.grad_mut(w).unwrap().copy_from_slice(&[250.0, -0.003]);
    adam.step(&mut tape).unwrap();
    let values = tape.value(w).unwrap().data();
    assert_relative_eq!(values[0], 1.0 - 1e-3, epsilon = 1e-9);
    assert_relative_eq!(values[1], -1.0 + 1e-3, epsilon = 1e-7);
    assert_eq!(adam.steps(), 1);
  }

  #[test]
  fn second_step_uses_both_moments() {
    let mut tape = Tape::new();
    let w = tape.leaf(Array::scalar(0.0));
    let config = AdamConfig {
      lr: 0.1,
      ..AdamConfig::default()
    };
    let mut adam = Adam::new(vec![w], config);

    tape.grad_mut(w).unwrap()[0] = 1.0;
    adam.step(&mut tape).unwrap();
    adam.zero_grad(&mut tape).unwrap();
    tape.grad_mut(w).unwrap()[0] = 3.0;
    adam.step(&mut tape).unwrap();

    let m = 0.9 * 0.1 + 0.1 * 3.0;
    let v = 0.999 * 0.001 + 0.001 * 9.0;
    let m_hat = m / (1.0 - 0.9f64.powi(2));
    let v_hat = v / (1.0 - 0.999f64.powi(2));
    let first = -0.1 / (1.0 + 1e-8);
    let expected = first - 0.1 * m_hat / (v_hat.sqrt() + 1e-8);
    assert_relative_eq!(tape.value(w).unwrap().data()[0], expected, epsilon = 1e-12);
  }
}
