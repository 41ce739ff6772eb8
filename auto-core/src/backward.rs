//!
//! Reverse-mode traversal
//!
//! The engine sorts the subgraph reachable from the root (iterative depth-first
//! postorder, first operand first), seeds the root with 1, and applies each
//! node's local rule exactly once in reverse order. A node is only visited once
//! every consumer has pushed its contribution, so the gradient a node reads is
//! final.
//!

use bit_set::BitSet;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::array::Array;
use crate::config::FiniteCheck;
use crate::error::{Error, Result, Stage};
use crate::kernels;
use crate::op::Op;
use crate::tape::{Tape, Var};
use crate::telemetry::Visit;

type Contributions = SmallVec<[(usize, Array); 3]>;

impl Tape {
  /// Nodes reachable from `root` in depth-first postorder; the root comes last
  pub fn topological_order(&self, root: Var) -> Result<Vec<Var>> {
    let root = self.resolve(root)?;
    Ok(
      self
        .postorder(root)
        .into_iter()
        .map(|index| self.handle(index))
        .collect(),
    )
  }

  fn postorder(&self, root: usize) -> Vec<usize> {
    let mut stack = Vec::with_capacity(64);
    let mut result = Vec::with_capacity(root + 1);
    let mut visited = BitSet::with_capacity(root + 1);

    stack.push((root, false));

    while let Some((index, children_processed)) = stack.pop() {
      if children_processed {
        result.push(index);
      } else if visited.insert(index) {
        // marker to emit the node after its operands
        stack.push((index, true));
        // reversed so the first operand is explored first
        for &operand in self.nodes[index].operands.iter().rev() {
          if !visited.contains(operand) {
            stack.push((operand, false));
          }
        }
      }
    }

    result
  }

  /// Accumulate `d root / d node` into the gradient of every node reachable
  /// from `root`
  ///
  /// Gradients are added to, never cleared; parameters must be zeroed between
  /// steps. Fails without touching any gradient when the root is not a single
  /// element or when the graph contains an inference-only node. Under
  /// [`FiniteCheck::Deny`] a non-finite contribution restores every gradient
  /// in the subgraph to its value before the call.
  pub fn backward(&mut self, root: Var) -> Result<()> {
    let root = self.resolve(root)?;
    let shape = self.nodes[root].value.shape();
    if shape.numel() != 1 {
      return Err(Error::NonScalarRoot { shape: shape.clone() });
    }

    let order = self.postorder(root);
    if let Some(node) = order
      .iter()
      .map(|&index| &self.nodes[index])
      .find(|node| node.op.is_inference_only())
    {
      return Err(Error::InferenceOnly { op: node.op.name() });
    }

    let snapshot: Option<Vec<Array>> = (self.config().finite_check == FiniteCheck::Deny)
      .then(|| order.iter().map(|&index| self.nodes[index].grad.clone()).collect());

    let result = self.propagate(root, &order);
    if let (Err(err), Some(saved)) = (&result, snapshot) {
      debug!(%err, nodes = order.len(), "backward failed, restoring gradients");
      for (&index, grad) in order.iter().zip(saved) {
        self.nodes[index].grad = grad;
      }
    }
    result
  }

  fn propagate(&mut self, root: usize, order: &[usize]) -> Result<()> {
    self.nodes[root].grad.fill(1.0);

    for &index in order.iter().rev() {
      // read phase
      let node = &self.nodes[index];
      trace!(index, op = node.op.name(), "backward visit");
      self.telemetry.visit(&Visit {
        var: self.handle(index),
        op: node.op.name(),
        gradient: &node.grad,
      });

      // compute phase
      let contributions = self.pullback(index)?;
      for (_, grad) in &contributions {
        self.check_finite(grad, node.op.name(), Stage::Backward)?;
      }

      // write phase
      for (operand, grad) in contributions {
        self.nodes[operand].grad.accumulate(&grad);
      }
    }

    debug!(nodes = order.len(), "backward pass complete");
    Ok(())
  }

  /// Local gradient rule of one node, as `(operand, contribution)` pairs
  fn pullback(&self, index: usize) -> Result<Contributions> {
    let node = &self.nodes[index];
    let g = &node.grad;
    let operand = |slot: usize| &self.nodes[node.operands[slot]].value;
    let target = |slot: usize| node.operands[slot];

    let mut out = Contributions::new();
    match &node.op {
      Op::Leaf => {}
      Op::Add { broadcast } | Op::Sub { broadcast } => {
        let negate = matches!(node.op, Op::Sub { .. });
        let grad_b = if *broadcast { g.sum_leading_axis() } else { g.clone() };
        out.push((target(0), g.clone()));
        out.push((target(1), if negate { grad_b.map(|x| -x) } else { grad_b }));
      }
      Op::Mul => {
        let (a, b) = (operand(0), operand(1));
        out.push((target(0), g.zip_map(b, |g, b| g * b)));
        out.push((target(1), g.zip_map(a, |g, a| g * a)));
      }
      Op::Dot => {
        let (a, b) = (operand(0), operand(1));
        let (&[m, k], &[_, n]) = (a.dims(), b.dims()) else {
          return Err(Error::Shape {
            op: "dot",
            lhs: a.shape().clone(),
            rhs: b.shape().clone(),
          });
        };
        let (grad_a, grad_b) = kernels::matmul_grads(a.data(), b.data(), g.data(), m, k, n);
        out.push((target(0), Array::from_parts(a.shape().clone(), grad_a)));
        out.push((target(1), Array::from_parts(b.shape().clone(), grad_b)));
      }
      Op::Relu => {
        let a = operand(0);
        out.push((target(0), a.zip_map(g, |x, g| if x > 0.0 { g } else { 0.0 })));
      }
      Op::Sigmoid => {
        let s = &node.value;
        out.push((target(0), s.zip_map(g, |s, g| s * (1.0 - s) * g)));
      }
      Op::Softmax => {
        out.push((target(0), g.clone()));
      }
      Op::Sum | Op::Mean => {
        let a = operand(0);
        let upstream = g.data()[0];
        let scale = match node.op {
          Op::Mean => 1.0 / a.numel() as f64,
          _ => 1.0,
        };
        out.push((target(0), Array::full(a.shape().clone(), upstream * scale)));
      }
      Op::Reshape => {
        let a = operand(0);
        out.push((target(0), g.clone().with_shape(a.shape().clone())));
      }
      Op::Conv2d(geo) => {
        let (input, weight, bias) = (operand(0), operand(1), operand(2));
        let grads = kernels::conv2d_backward(input.data(), weight.data(), g.data(), geo);
        out.push((target(0), Array::from_parts(input.shape().clone(), grads.input)));
        out.push((target(1), Array::from_parts(weight.shape().clone(), grads.weight)));
        out.push((target(2), Array::from_parts(bias.shape().clone(), grads.bias)));
      }
      Op::MaxPool2d { geometry, argmax } => {
        let input = operand(0);
        let grad = match argmax {
          Some(argmax) => kernels::max_pool2d_backward(g.data(), argmax, input.numel()),
          None => {
            let (_, argmax) = kernels::max_pool2d_forward(input.data(), geometry);
            kernels::max_pool2d_backward(g.data(), &argmax, input.numel())
          }
        };
        out.push((target(0), Array::from_parts(input.shape().clone(), grad)));
      }
      Op::CrossEntropy { targets } => {
        let pred = operand(0);
        let classes = pred.dims()[1];
        let scale = g.data()[0] / targets.len() as f64;
        let mut grad = pred.clone();
        for (row, &t) in targets.iter().enumerate() {
          grad.data_mut()[row * classes + t] -= 1.0;
        }
        out.push((target(0), grad.map(|x| x * scale)));
      }
      Op::Inference(_) => return Err(Error::InferenceOnly { op: node.op.name() }),
    }
    Ok(out)
  }
}
