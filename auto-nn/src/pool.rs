use lib_auto_core::{Result, Tape, Var};

use crate::module::Module;

/// Max pooling over `[b, c, h, w]`; the stride defaults to the kernel size
#[derive(Debug, Clone, Copy)]
pub struct MaxPool2d {
  kernel_size: usize,
  stride: Option<usize>,
}

impl MaxPool2d {
  pub fn new(kernel_size: usize) -> Self {
    Self {
      kernel_size,
      stride: None,
    }
  }

  pub fn with_stride(mut self, stride: usize) -> Self {
    self.stride = Some(stride);
    self
  }

  pub fn kernel_size(&self) -> usize {
    self.kernel_size
  }

  pub fn stride(&self) -> usize {
    self.stride.unwrap_or(self.kernel_size)
  }
}

impl Module for MaxPool2d {
  fn forward(&self, tape: &mut Tape, input: Var) -> Result<Var> {
    tape.max_pool2d(input, self.kernel_size, self.stride)
  }

  fn forward_inference(&self, tape: &mut Tape, input: Var) -> Result<Var> {
    tape.max_pool2d_inference(input, self.kernel_size, self.stride)
  }
}

#[cfg(test)]
mod tests {
  use lib_auto_core::{Array, NdarrayAccelerator};

  use super::*;

  #[test]
  fn inference_path_matches_training_path() {
    let mut tape = Tape::new().with_accelerator(NdarrayAccelerator::new());
    let pool = MaxPool2d::new(2);
    assert_eq!(pool.stride(), 2);
    tape.scope(|t| {
      let data: Vec<f64> = (0..32).map(|i| ((i * 3) % 8) as f64).collect();
      let x = t.leaf(Array::from_vec([1, 2, 4, 4], data).unwrap());
      let train = pool.forward(t, x).unwrap();
      let infer = pool.forward_inference(t, x).unwrap();
      assert_eq!(t.value(train).unwrap(), t.value(infer).unwrap());
    });
  }

  #[test]
  fn overlapping_windows_have_no_inference_path() {
    let mut tape = Tape::new().with_accelerator(NdarrayAccelerator::new());
    let pool = MaxPool2d::new(2).with_stride(1);
    tape.scope(|t| {
      let x = t.leaf(Array::ones([1, 1, 3, 3]));
      assert!(pool.forward(t, x).is_ok());
      assert!(pool.forward_inference(t, x).is_err());
    });
  }
}
