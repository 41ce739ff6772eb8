//!
//! Finite-difference verification of backward rules
//!
//! [`check_gradient`] rebuilds the same expression on fresh tapes, once for the
//! analytic pass and twice per input element for the central difference
//! `(f(x + h) - f(x - h)) / 2h`.
//!

use serde::{Deserialize, Serialize};

use crate::array::Array;
use crate::error::{Error, Result};
use crate::tape::{Tape, Var};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradCheckConfig {
  /// Finite-difference step
  pub epsilon: f64,
  pub rtol: f64,
  pub atol: f64,
}

impl Default for GradCheckConfig {
  fn default() -> Self {
    Self {
      epsilon: 1e-6,
      rtol: 1e-4,
      atol: 1e-4,
    }
  }
}

/// Where the analytic and numeric gradients disagree the most
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mismatch {
  pub input: usize,
  pub element: usize,
  pub analytic: f64,
  pub numeric: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradCheckReport {
  pub max_abs_error: f64,
  pub max_rel_error: f64,
  /// Elements compared across all inputs
  pub checked: usize,
  pub failures: usize,
  pub worst: Option<Mismatch>,
}

impl GradCheckReport {
  pub fn passed(&self) -> bool {
    self.failures == 0
  }
}

fn evaluate<F>(inputs: &[Array], build: &F) -> Result<(Tape, Vec<Var>, Var)>
where
  F: Fn(&mut Tape, &[Var]) -> Result<Var>,
{
  let mut tape = Tape::new();
  let vars: Vec<Var> = inputs.iter().cloned().map(|x| tape.leaf(x)).collect();
  let output = build(&mut tape, &vars)?;
  let shape = tape.value(output)?.shape().clone();
  if shape.numel() != 1 {
    return Err(Error::NonScalarRoot { shape });
  }
  Ok((tape, vars, output))
}

fn scalar_at<F>(inputs: &[Array], build: &F) -> Result<f64>
where
  F: Fn(&mut Tape, &[Var]) -> Result<Var>,
{
  let (tape, _, output) = evaluate(inputs, build)?;
  Ok(tape.value(output)?.data()[0])
}

/// Compare the backward pass of `build` against central differences at
/// `inputs`; `build` must reduce to a single element
pub fn check_gradient<F>(inputs: &[Array], build: F, config: &GradCheckConfig) -> Result<GradCheckReport>
where
  F: Fn(&mut Tape, &[Var]) -> Result<Var>,
{
  let (mut tape, vars, output) = evaluate(inputs, &build)?;
  tape.backward(output)?;
  let analytic: Vec<Vec<f64>> = vars
    .iter()
    .map(|&var| tape.grad(var).map(|g| g.data().to_vec()))
    .collect::<Result<_>>()?;

  let mut report = GradCheckReport {
    max_abs_error: 0.0,
    max_rel_error: 0.0,
    checked: 0,
    failures: 0,
    worst: None,
  };
  let mut probe = inputs.to_vec();
  for (input, grads) in analytic.iter().enumerate() {
    for (element, &analytic) in grads.iter().enumerate() {
      let original = probe[input].data()[element];

      probe[input].data_mut()[element] = original + config.epsilon;
      let plus = scalar_at(&probe, &build)?;
      probe[input].data_mut()[element] = original - config.epsilon;
      let minus = scalar_at(&probe, &build)?;
      probe[input].data_mut()[element] = original;

      let numeric = (plus - minus) / (2.0 * config.epsilon);
      let abs_error = (analytic - numeric).abs();
      let rel_error = abs_error / numeric.abs().max(analytic.abs()).max(f64::EPSILON);

      report.checked += 1;
      if abs_error > config.atol + config.rtol * numeric.abs() {
        report.failures += 1;
      }
      if abs_error > report.max_abs_error || report.worst.is_none() {
        report.worst = Some(Mismatch {
          input,
          element,
          analytic,
          numeric,
        });
      }
      report.max_abs_error = report.max_abs_error.max(abs_error);
      report.max_rel_error = report.max_rel_error.max(rel_error);
    }
  }
  Ok(report)
}
