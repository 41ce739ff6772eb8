use crate::kernels::{Conv2dGeometry, Pool2dGeometry};

/// Operation identifier recorded on every node; the backward engine dispatches
/// on it to pick the local gradient rule
///
/// Operand order is fixed per variant, e.g. `Conv2d` is always
/// `[input, weight, bias]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
  /// Created directly from values, pushes nothing backward
  Leaf,
  /// `broadcast` is set when the right operand is a bias repeated along the
  /// leading axis
  Add {
    broadcast: bool,
  },
  Sub {
    broadcast: bool,
  },
  Mul,
  Dot,
  Relu,
  Sigmoid,
  /// Pass-through backward, only correct when followed by `CrossEntropy`
  Softmax,
  Sum,
  Mean,
  Reshape,
  Conv2d(Conv2dGeometry),
  /// `argmax` is absent when the forward values came from an accelerator
  MaxPool2d {
    geometry: Pool2dGeometry,
    argmax: Option<Vec<usize>>,
  },
  CrossEntropy {
    targets: Vec<usize>,
  },
  /// Accelerator-only forward with no gradient rule
  Inference(InferenceKernel),
}

/// Kernels that have an accelerator-only, non-differentiable variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InferenceKernel {
  Conv2d,
  MaxPool2d,
}

impl Op {
  pub fn name(&self) -> &'static str {
    match self {
      Op::Leaf => "leaf",
      Op::Add { .. } => "add",
      Op::Sub { .. } => "sub",
      Op::Mul => "mul",
      Op::Dot => "dot",
      Op::Relu => "relu",
      Op::Sigmoid => "sigmoid",
      Op::Softmax => "softmax",
      Op::Sum => "sum",
      Op::Mean => "mean",
      Op::Reshape => "reshape",
      Op::Conv2d(_) => "conv2d",
      Op::MaxPool2d { .. } => "max_pool2d",
      Op::CrossEntropy { .. } => "cross_entropy",
      Op::Inference(InferenceKernel::Conv2d) => "conv2d_inference",
      Op::Inference(InferenceKernel::MaxPool2d) => "max_pool2d_inference",
    }
  }

  pub fn is_inference_only(&self) -> bool {
    matches!(self, Op::Inference(_))
  }
}
