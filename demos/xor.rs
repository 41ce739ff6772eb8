use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, Write};

use tracing::info;
use tracing_subscriber::EnvFilter;

use lib_auto::nn::{loss, Checkpoint, Linear, Module, Optimizer, Sequential, Sgd, SgdConfig, Sigmoid};
use lib_auto::{Array, Tape};

/// Feedforward network for an XOR gate
///
/// Architecture:
/// - 2 inputs
/// - 1 hidden layer with 2 sigmoid neurons
/// - 1 sigmoid output neuron
fn xor_net(tape: &mut Tape) -> lib_auto::Result<Sequential> {
  let hidden = Linear::from_parts(
    tape,
    Array::from_vec([2, 2], vec![0.8, -0.7, 0.6, -0.9])?,
    Array::from_vec([2], vec![-0.2, 0.3])?,
  )?;
  let output = Linear::from_parts(
    tape,
    Array::from_vec([2, 1], vec![0.5, 0.4])?,
    Array::from_vec([1], vec![0.1])?,
  )?;
  Ok(
    Sequential::new()
      .with(hidden)
      .with(Sigmoid)
      .with(output)
      .with(Sigmoid),
  )
}

fn main() -> Result<(), Box<dyn Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let x = Array::from_vec([4, 2], vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0])?;
  let y = Array::from_vec([4, 1], vec![0.0, 1.0, 1.0, 0.0])?;

  let mut tape = Tape::new();
  let model = xor_net(&mut tape)?;
  let mut sgd = Sgd::new(model.parameters(), SgdConfig { lr: 1.0, momentum: 0.0 });

  let mut log = BufWriter::new(File::create("training_loss.csv")?);
  writeln!(log, "epoch,mse")?;

  for epoch in 0..1000 {
    sgd.zero_grad(&mut tape)?;
    let loss = tape.scope(|t| -> lib_auto::Result<f64> {
      let input = t.leaf(x.clone());
      let pred = model.forward(t, input)?;
      let loss = loss::sum_squared_error(t, pred, y.clone())?;
      t.backward(loss)?;
      Ok(t.value(loss)?.data()[0])
    })?;
    sgd.step(&mut tape)?;

    let mse = loss / 4.0;
    writeln!(log, "{epoch},{mse}")?;
    if epoch % 100 == 0 {
      info!(epoch, mse, "training");
    }
  }
  log.flush()?;

  let preds = tape.scope(|t| -> lib_auto::Result<Vec<f64>> {
    let input = t.leaf(x.clone());
    let pred = model.forward(t, input)?;
    Ok(t.value(pred)?.data().to_vec())
  })?;
  println!("testing network predictions:");
  for (i, p) in preds.iter().enumerate() {
    println!(
      "input: ({}, {}), output: {:.6}, expected: {}",
      x.data()[2 * i],
      x.data()[2 * i + 1],
      p,
      y.data()[i]
    );
  }

  Checkpoint::capture(&tape, &model.parameters())?.save("xor_checkpoint.json")?;
  info!("saved parameters to xor_checkpoint.json");
  Ok(())
}
