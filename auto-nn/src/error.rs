use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Core(#[from] lib_auto_core::Error),

  #[error("checkpoint holds {actual} parameters, model has {expected}")]
  PersistenceMismatch { expected: usize, actual: usize },

  #[error("parameter {index}: checkpoint shape {actual:?} does not match model shape {expected:?}")]
  ParameterShape {
    index: usize,
    expected: Vec<usize>,
    actual: Vec<usize>,
  },

  #[error("parameter {index}: {reason}")]
  Corrupt { index: usize, reason: String },

  #[error("checkpoint io: {0}")]
  Io(#[from] std::io::Error),

  #[error("checkpoint format: {0}")]
  Json(#[from] serde_json::Error),
}
