use std::error::Error;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lib_auto::nn::{Adam, AdamConfig, Conv2d, Flatten, Linear, MaxPool2d, Module, Optimizer, Relu, Sequential};
use lib_auto::{Array, Conv2dOptions, ExecutionPath, Kernel, KernelCounters, NdarrayAccelerator, Tape};

const SIDE: usize = 8;

/// Four classes of synthetic 8x8 images: vertical bar, horizontal bar, main
/// diagonal, anti-diagonal; the bar position varies per sample
fn dataset() -> lib_auto::Result<(Array, Vec<usize>)> {
  let mut data = Vec::new();
  let mut labels = Vec::new();
  for class in 0..4 {
    for offset in 1..SIDE - 1 {
      let mut image = vec![0.0; SIDE * SIDE];
      for i in 0..SIDE {
        let (r, c) = match class {
          0 => (i, offset),
          1 => (offset, i),
          2 => (i, (i + offset) % SIDE),
          _ => (i, (SIDE - 1 - i + offset) % SIDE),
        };
        image[r * SIDE + c] = 1.0;
      }
      data.extend(image);
      labels.push(class);
    }
  }
  let images = Array::from_vec([labels.len(), 1, SIDE, SIDE], data)?;
  Ok((images, labels))
}

fn accuracy(probs: &Array, labels: &[usize]) -> f64 {
  let classes = probs.dims()[1];
  let correct = probs
    .data()
    .chunks(classes)
    .zip(labels)
    .filter(|(row, label)| {
      row
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        == Some(**label)
    })
    .count();
  correct as f64 / labels.len() as f64
}

fn main() -> Result<(), Box<dyn Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let (images, labels) = dataset()?;
  let counters = Rc::new(KernelCounters::new());
  let mut tape = Tape::new()
    .with_accelerator(NdarrayAccelerator::new())
    .with_telemetry(counters.clone());

  let mut rng = StdRng::seed_from_u64(42);
  let model = Sequential::new()
    .with(Conv2d::new(
      &mut tape,
      1,
      6,
      3,
      Conv2dOptions {
        stride: 1,
        padding: 1,
      },
      &mut rng,
    ))
    .with(Relu)
    .with(MaxPool2d::new(2))
    .with(Flatten)
    .with(Linear::new(&mut tape, 6 * 4 * 4, 4, &mut rng));
  let mut adam = Adam::new(
    model.parameters(),
    AdamConfig {
      lr: 0.01,
      ..AdamConfig::default()
    },
  );

  for epoch in 0..100 {
    adam.zero_grad(&mut tape)?;
    let (loss, acc) = tape.scope(|t| -> lib_auto::Result<(f64, f64)> {
      let x = t.leaf(images.clone());
      let logits = model.forward(t, x)?;
      let probs = t.softmax(logits)?;
      let loss = t.cross_entropy(probs, &labels)?;
      t.backward(loss)?;
      Ok((t.value(loss)?.data()[0], accuracy(t.value(probs)?, &labels)))
    })?;
    adam.step(&mut tape)?;
    if epoch % 10 == 0 {
      info!(epoch, loss, accuracy = acc, "training");
    }
  }

  // accelerator-only pass, no graph history needed
  let acc = tape.scope(|t| -> lib_auto::Result<f64> {
    let x = t.leaf(images.clone());
    let logits = model.forward_inference(t, x)?;
    let probs = t.softmax(logits)?;
    Ok(accuracy(t.value(probs)?, &labels))
  })?;
  info!(accuracy = acc, "inference");

  for kernel in [Kernel::MatMul, Kernel::Conv2d, Kernel::MaxPool2d] {
    info!(
      %kernel,
      local = counters.count(kernel, ExecutionPath::Local),
      accelerated = counters.count(kernel, ExecutionPath::Accelerated),
      fallback = counters.count(kernel, ExecutionPath::Fallback),
      "dispatch"
    );
  }
  info!(visits = counters.visits(), "backward visits");
  Ok(())
}
