//!
//! Explicit instrumentation hooks
//!
//! A tape reports to the sink it was given; there is no process-wide state.
//! Sinks take `&self` so a caller can keep an `Rc` to the same sink and read it
//! back after a training step.
//!

use std::cell::{Cell, RefCell};

use rustc_hash::FxHashMap;

use crate::accel::Kernel;
use crate::array::Array;
use crate::tape::Var;

/// Where a kernel invocation actually ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionPath {
  Local,
  Accelerated,
  /// The accelerator was asked and failed, the local kernel ran instead
  Fallback,
}

/// A node about to apply its local gradient rule; `gradient` is final at this
/// point
#[derive(Debug)]
pub struct Visit<'a> {
  pub var: Var,
  pub op: &'static str,
  pub gradient: &'a Array,
}

pub trait TelemetrySink {
  fn kernel(&self, _kernel: Kernel, _path: ExecutionPath) {}

  fn visit(&self, _visit: &Visit<'_>) {}
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTelemetry;

impl TelemetrySink for NoTelemetry {}

/// Counts kernel dispatches per path and backward visits
#[derive(Debug, Default)]
pub struct KernelCounters {
  dispatches: RefCell<FxHashMap<(Kernel, ExecutionPath), usize>>,
  visits: Cell<usize>,
}

impl KernelCounters {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn count(&self, kernel: Kernel, path: ExecutionPath) -> usize {
    self
      .dispatches
      .borrow()
      .get(&(kernel, path))
      .copied()
      .unwrap_or(0)
  }

  pub fn visits(&self) -> usize {
    self.visits.get()
  }

  pub fn reset(&self) {
    self.dispatches.borrow_mut().clear();
    self.visits.set(0);
  }
}

impl TelemetrySink for KernelCounters {
  fn kernel(&self, kernel: Kernel, path: ExecutionPath) {
    *self.dispatches.borrow_mut().entry((kernel, path)).or_insert(0) += 1;
  }

  fn visit(&self, _visit: &Visit<'_>) {
    self.visits.set(self.visits.get() + 1);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn counters_track_paths_separately() {
    let counters = KernelCounters::new();
    counters.kernel(Kernel::MatMul, ExecutionPath::Local);
    counters.kernel(Kernel::MatMul, ExecutionPath::Local);
    counters.kernel(Kernel::MatMul, ExecutionPath::Accelerated);
    assert_eq!(counters.count(Kernel::MatMul, ExecutionPath::Local), 2);
    assert_eq!(counters.count(Kernel::MatMul, ExecutionPath::Accelerated), 1);
    assert_eq!(counters.count(Kernel::Conv2d, ExecutionPath::Local), 0);

    counters.reset();
    assert_eq!(counters.count(Kernel::MatMul, ExecutionPath::Local), 0);
  }
}
