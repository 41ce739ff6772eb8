//!
//! The tape: an arena of nodes grouped into frames
//!
//! Parameters live in the root frame. Each training step runs inside
//! [`Tape::scope`], which pushes a frame and truncates the arena back to the
//! frame's start when the closure returns, so the per-step graph is rebuilt
//! every forward pass while parameters and their gradients persist...
//!

use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::accel::{checked_len, AccelError, Accelerator, KernelRequest};
use crate::array::Array;
use crate::config::{FiniteCheck, TapeConfig};
use crate::error::{Error, Result, Stage};
use crate::op::Op;
use crate::telemetry::{ExecutionPath, NoTelemetry, TelemetrySink};

/// Handle to a node on a [`Tape`]
///
/// Handles are plain indices stamped with the generation of the frame that
/// created them; once that frame is closed the handle resolves to
/// [`Error::StaleVar`] instead of whatever node reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var {
  pub(crate) index: usize,
  pub(crate) generation: u32,
}

impl Var {
  /// Position in the arena; operands always sit below their consumers
  pub fn index(&self) -> usize {
    self.index
  }
}

pub(crate) struct Node {
  pub(crate) value: Array,
  pub(crate) grad: Array,
  pub(crate) op: Op,
  pub(crate) operands: SmallVec<[usize; 3]>,
  pub(crate) generation: u32,
  label: Option<String>,
}

struct Frame {
  start: usize,
  generation: u32,
}

/// Result of a kernel dispatch, either accelerator output or whatever the
/// local kernel returns
pub(crate) enum Dispatched<T> {
  Accelerated(Vec<f64>),
  Local(T),
}

pub struct Tape {
  pub(crate) nodes: Vec<Node>,
  frames: Vec<Frame>,
  next_generation: u32,
  config: TapeConfig,
  accelerator: Option<Box<dyn Accelerator>>,
  pub(crate) telemetry: Rc<dyn TelemetrySink>,
}

impl Tape {
  pub fn new() -> Self {
    Self::with_config(TapeConfig::default())
  }

  pub fn with_config(config: TapeConfig) -> Self {
    Self {
      nodes: Vec::with_capacity(256),
      frames: vec![Frame {
        start: 0,
        generation: 0,
      }],
      next_generation: 1,
      config,
      accelerator: None,
      telemetry: Rc::new(NoTelemetry),
    }
  }

  pub fn with_accelerator(mut self, accelerator: impl Accelerator + 'static) -> Self {
    self.accelerator = Some(Box::new(accelerator));
    self
  }

  pub fn with_telemetry(mut self, telemetry: Rc<dyn TelemetrySink>) -> Self {
    self.telemetry = telemetry;
    self
  }

  pub fn config(&self) -> &TapeConfig {
    &self.config
  }

  pub fn accelerator(&self) -> Option<&dyn Accelerator> {
    self.accelerator.as_deref()
  }

  /// Record a value with no history in the current frame
  pub fn leaf(&mut self, value: Array) -> Var {
    self.alloc(value, Op::Leaf, SmallVec::new())
  }

  /// [`Tape::leaf`] with a diagnostic label attached
  pub fn labeled_leaf(&mut self, value: Array, label: impl Into<String>) -> Var {
    let var = self.leaf(value);
    self.nodes[var.index].label = Some(label.into());
    var
  }

  /// Run `f` in a fresh frame; every node created inside is dropped on return
  pub fn scope<R>(&mut self, f: impl FnOnce(&mut Tape) -> R) -> R {
    let frame = Frame {
      start: self.nodes.len(),
      generation: self.next_generation,
    };
    self.next_generation = self.next_generation.wrapping_add(1);
    self.frames.push(frame);

    let result = f(self);

    if let Some(frame) = self.frames.pop() {
      debug!(
        dropped = self.nodes.len() - frame.start,
        depth = self.frames.len(),
        "closing tape scope"
      );
      self.nodes.truncate(frame.start);
    }
    result
  }

  pub fn value(&self, var: Var) -> Result<&Array> {
    Ok(&self.node(var)?.value)
  }

  pub fn grad(&self, var: Var) -> Result<&Array> {
    Ok(&self.node(var)?.grad)
  }

  pub fn values_mut(&mut self, var: Var) -> Result<&mut [f64]> {
    let index = self.resolve(var)?;
    Ok(self.nodes[index].value.data_mut())
  }

  pub fn grad_mut(&mut self, var: Var) -> Result<&mut [f64]> {
    let index = self.resolve(var)?;
    Ok(self.nodes[index].grad.data_mut())
  }

  /// Overwrite a node's values; the shape may not change
  pub fn set_value(&mut self, var: Var, value: Array) -> Result<()> {
    let index = self.resolve(var)?;
    let node = &mut self.nodes[index];
    if node.value.shape() != value.shape() {
      return Err(Error::Shape {
        op: "set_value",
        lhs: node.value.shape().clone(),
        rhs: value.shape().clone(),
      });
    }
    node.value = value;
    Ok(())
  }

  /// In-place update of a node's values with read access to its gradient
  pub fn update<F>(&mut self, var: Var, f: F) -> Result<()>
  where
    F: FnOnce(&mut [f64], &[f64]),
  {
    let index = self.resolve(var)?;
    let Node { value, grad, .. } = &mut self.nodes[index];
    f(value.data_mut(), grad.data());
    Ok(())
  }

  pub fn zero_grad(&mut self, vars: &[Var]) -> Result<()> {
    for &var in vars {
      let index = self.resolve(var)?;
      self.nodes[index].grad.fill(0.0);
    }
    Ok(())
  }

  pub fn op(&self, var: Var) -> Result<&Op> {
    Ok(&self.node(var)?.op)
  }

  pub fn operands(&self, var: Var) -> Result<Vec<Var>> {
    let node = self.node(var)?;
    Ok(node.operands.iter().map(|&index| self.handle(index)).collect())
  }

  pub fn set_label(&mut self, var: Var, label: impl Into<String>) -> Result<()> {
    let index = self.resolve(var)?;
    self.nodes[index].label = Some(label.into());
    Ok(())
  }

  pub fn label(&self, var: Var) -> Result<Option<&str>> {
    Ok(self.node(var)?.label.as_deref())
  }

  /// Diagnostic tag, the op name followed by the user label if any
  pub fn tag(&self, var: Var) -> Result<String> {
    let node = self.node(var)?;
    Ok(match &node.label {
      Some(label) => format!("{}:{}", node.op.name(), label),
      None => node.op.name().to_string(),
    })
  }

  /// Number of live nodes across all frames
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Number of open frames, the root frame included
  pub fn depth(&self) -> usize {
    self.frames.len()
  }

  pub(crate) fn resolve(&self, var: Var) -> Result<usize> {
    match self.nodes.get(var.index) {
      Some(node) if node.generation == var.generation => Ok(var.index),
      _ => Err(Error::StaleVar),
    }
  }

  fn node(&self, var: Var) -> Result<&Node> {
    let index = self.resolve(var)?;
    Ok(&self.nodes[index])
  }

  pub(crate) fn handle(&self, index: usize) -> Var {
    Var {
      index,
      generation: self.nodes[index].generation,
    }
  }

  fn alloc(&mut self, value: Array, op: Op, operands: SmallVec<[usize; 3]>) -> Var {
    let generation = self.frames.last().map_or(0, |frame| frame.generation);
    let index = self.nodes.len();
    self.nodes.push(Node {
      grad: Array::zeros(value.shape().clone()),
      value,
      op,
      operands,
      generation,
      label: None,
    });
    Var { index, generation }
  }

  /// Append the output of an operation, applying the configured finite check
  pub(crate) fn record(&mut self, value: Array, op: Op, operands: &[usize]) -> Result<Var> {
    self.check_finite(&value, op.name(), Stage::Forward)?;
    Ok(self.alloc(value, op, SmallVec::from_slice(operands)))
  }

  pub(crate) fn check_finite(&self, values: &Array, op: &'static str, stage: Stage) -> Result<()> {
    if values.is_finite() {
      return Ok(());
    }
    match self.config.finite_check {
      FiniteCheck::Off => Ok(()),
      FiniteCheck::Warn => {
        warn!(op, %stage, "non-finite values");
        Ok(())
      }
      FiniteCheck::Deny => Err(Error::NonFinite { op, stage }),
    }
  }

  /// Run a forward kernel, delegating to the accelerator when it claims the
  /// request and falling back to `local` when it errors
  pub(crate) fn run_kernel<T, A, L>(&self, request: KernelRequest, accelerated: A, local: L) -> Dispatched<T>
  where
    A: FnOnce(&dyn Accelerator) -> Result<Vec<f64>, AccelError>,
    L: FnOnce() -> T,
  {
    let kernel = request.kernel();
    if let Some(accelerator) = self.accelerator.as_deref() {
      if accelerator.supports(&request) {
        match accelerated(accelerator).and_then(|out| checked_len(out, request.output_len())) {
          Ok(out) => {
            debug!(%kernel, accelerator = accelerator.name(), "accelerated kernel");
            self.telemetry.kernel(kernel, ExecutionPath::Accelerated);
            return Dispatched::Accelerated(out);
          }
          Err(err) => {
            warn!(
              %kernel,
              accelerator = accelerator.name(),
              error = %err,
              "accelerated kernel failed, running local kernel"
            );
            self.telemetry.kernel(kernel, ExecutionPath::Fallback);
            return Dispatched::Local(local());
          }
        }
      }
    }
    self.telemetry.kernel(kernel, ExecutionPath::Local);
    Dispatched::Local(local())
  }

  /// Run a forward kernel that has no local implementation
  pub(crate) fn run_accelerated_only<A>(&self, request: KernelRequest, accelerated: A) -> Result<Vec<f64>>
  where
    A: FnOnce(&dyn Accelerator) -> Result<Vec<f64>, AccelError>,
  {
    let kernel = request.kernel();
    let accelerator = self.accelerator.as_deref().ok_or_else(|| Error::UnsupportedPath {
      kernel,
      reason: "no accelerator attached".to_string(),
    })?;
    if !accelerator.supports(&request) {
      return Err(Error::UnsupportedPath {
        kernel,
        reason: format!("{} does not support this geometry", accelerator.name()),
      });
    }
    let out = accelerated(accelerator)
      .and_then(|out| checked_len(out, request.output_len()))
      .map_err(|err| Error::UnsupportedPath {
        kernel,
        reason: format!("{} failed: {err}", accelerator.name()),
      })?;
    self.telemetry.kernel(kernel, ExecutionPath::Accelerated);
    Ok(out)
  }
}

impl Default for Tape {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for Tape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Tape")
      .field("nodes", &self.nodes.len())
      .field("depth", &self.frames.len())
      .field("accelerator", &self.accelerator.as_ref().map(|a| a.name().to_string()))
      .finish()
  }
}
