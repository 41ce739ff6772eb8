//!
//! JSON persistence of parameter values
//!
//! A checkpoint is the ordered list of parameter shapes and values. Restoring
//! validates the whole checkpoint against the live parameters before writing a
//! single value, so a mismatch leaves the model untouched.
//!

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use lib_auto_core::{Array, Tape, Var};

use crate::error::{Error, Result};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedParameter {
  pub shape: Vec<usize>,
  pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
  pub version: u32,
  pub parameters: Vec<SavedParameter>,
}

impl Checkpoint {
  /// Snapshot the current values of `params`, in order
  pub fn capture(tape: &Tape, params: &[Var]) -> Result<Self> {
    let parameters = params
      .iter()
      .map(|&param| -> Result<SavedParameter> {
        let value = tape.value(param)?;
        Ok(SavedParameter {
          shape: value.dims().to_vec(),
          values: value.data().to_vec(),
        })
      })
      .collect::<Result<Vec<_>>>()?;
    Ok(Self {
      version: FORMAT_VERSION,
      parameters,
    })
  }

  /// Write the saved values back into `params`
  pub fn restore(&self, tape: &mut Tape, params: &[Var]) -> Result<()> {
    if self.parameters.len() != params.len() {
      return Err(Error::PersistenceMismatch {
        expected: params.len(),
        actual: self.parameters.len(),
      });
    }

    let mut staged = Vec::with_capacity(params.len());
    for (index, (saved, &param)) in self.parameters.iter().zip(params).enumerate() {
      let live = tape.value(param)?;
      if saved.shape != live.dims() {
        return Err(Error::ParameterShape {
          index,
          expected: live.dims().to_vec(),
          actual: saved.shape.clone(),
        });
      }
      let array = Array::from_vec(saved.shape.clone(), saved.values.clone())
        .map_err(|err| Error::Corrupt {
          index,
          reason: err.to_string(),
        })?;
      staged.push(array);
    }

    for (&param, array) in params.iter().zip(staged) {
      tape.set_value(param, array)?;
    }
    debug!(parameters = params.len(), "restored checkpoint");
    Ok(())
  }

  pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    serde_json::to_writer(&mut writer, self)?;
    writer.flush()?;
    debug!(path = %path.as_ref().display(), "saved checkpoint");
    Ok(())
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let checkpoint: Self = serde_json::from_reader(reader)?;
    if checkpoint.version != FORMAT_VERSION {
      return Err(Error::Corrupt {
        index: 0,
        reason: format!("unsupported checkpoint version {}", checkpoint.version),
      });
    }
    Ok(checkpoint)
  }
}
