use serde::{Deserialize, Serialize};

/// Diagnostic for NaN/Inf showing up in values or gradients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiniteCheck {
  #[default]
  Off,
  /// Log a warning naming the operation
  Warn,
  /// Fail the operation with `Error::NonFinite`
  Deny,
}

/// Tape-wide settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapeConfig {
  pub finite_check: FiniteCheck,
}

impl TapeConfig {
  pub fn with_finite_check(mut self, check: FiniteCheck) -> Self {
    self.finite_check = check;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn deserializes_with_defaults() {
    let config: TapeConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config, TapeConfig::default());

    let config: TapeConfig = serde_json::from_str(r#"{"finite_check": "deny"}"#).unwrap();
    assert_eq!(config.finite_check, FiniteCheck::Deny);
  }
}
