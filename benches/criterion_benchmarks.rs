use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::StandardNormal;

use lib_auto::nn::{loss, Linear, Module, Optimizer, Relu, Sequential, Sgd, SgdConfig};
use lib_auto::{Array, Conv2dOptions, NdarrayAccelerator, Tape};

fn random(shape: &[usize], seed: u64) -> Array {
  let mut rng = StdRng::seed_from_u64(seed);
  Array::random(shape, &StandardNormal, &mut rng)
}

// =============================================================================
// CORE BENCHMARKS
// =============================================================================

fn elementwise_chain(c: &mut Criterion) {
  let mut group = c.benchmark_group("core/elementwise_chain");

  for chain_len in [10, 100, 1000] {
    group.throughput(Throughput::Elements(chain_len as u64));
    group.bench_with_input(
      BenchmarkId::from_parameter(chain_len),
      &chain_len,
      |b, &len| {
        let mut tape = Tape::new();
        let init = random(&[16, 16], 1);
        b.iter(|| {
          tape.scope(|t| {
            let x = t.leaf(black_box(init.clone()));
            let mut y = x;
            for _ in 0..len {
              let s = t.sigmoid(y).unwrap();
              y = t.mul(s, x).unwrap();
            }
            let loss = t.sum(y).unwrap();
            t.backward(loss).unwrap();
            black_box(t.grad(x).unwrap().sum())
          })
        });
      },
    );
  }
  group.finish();
}

fn dot_local_vs_ndarray(c: &mut Criterion) {
  let mut group = c.benchmark_group("core/dot");

  for size in [16, 64, 256] {
    let a = random(&[size, size], 2);
    let w = random(&[size, size], 3);
    group.throughput(Throughput::Elements((size * size * size) as u64));

    group.bench_with_input(BenchmarkId::new("local", size), &size, |b, _| {
      let mut tape = Tape::new();
      b.iter(|| {
        tape.scope(|t| {
          let y = t.dot(black_box(a.clone()), black_box(w.clone())).unwrap();
          black_box(t.value(y).unwrap().sum())
        })
      });
    });

    group.bench_with_input(BenchmarkId::new("ndarray", size), &size, |b, _| {
      let mut tape = Tape::new().with_accelerator(NdarrayAccelerator::new());
      b.iter(|| {
        tape.scope(|t| {
          let y = t.dot(black_box(a.clone()), black_box(w.clone())).unwrap();
          black_box(t.value(y).unwrap().sum())
        })
      });
    });
  }
  group.finish();
}

fn conv_local_vs_ndarray(c: &mut Criterion) {
  let mut group = c.benchmark_group("core/conv2d");
  group.sample_size(20);

  let input = random(&[8, 3, 28, 28], 4);
  let weight = random(&[8, 3, 3, 3], 5);
  let bias = Array::zeros([8]);
  let options = Conv2dOptions {
    stride: 1,
    padding: 1,
  };

  for (name, accelerated) in [("local", false), ("ndarray", true)] {
    group.bench_function(name, |b| {
      let mut tape = Tape::new();
      if accelerated {
        tape = tape.with_accelerator(NdarrayAccelerator::new());
      }
      b.iter(|| {
        tape.scope(|t| {
          let y = t
            .conv2d(input.clone(), weight.clone(), bias.clone(), options)
            .unwrap();
          black_box(t.value(y).unwrap().sum())
        })
      });
    });
  }
  group.finish();
}

// =============================================================================
// INTERNAL BENCHMARKS
// =============================================================================

fn bench_topological_sort(c: &mut Criterion) {
  let mut group = c.benchmark_group("internals/topo_sort");

  for graph_size in [50, 500, 5000] {
    group.bench_with_input(
      BenchmarkId::from_parameter(graph_size),
      &graph_size,
      |b, &size| {
        let mut tape = Tape::new();
        tape.scope(|t| {
          let x = t.leaf(Array::scalar(1.0));
          let mut result = x;
          for _ in 0..size {
            result = t.add(result, x).unwrap();
          }
          b.iter(|| black_box(t.topological_order(result).unwrap().len()));
        });
      },
    );
  }
  group.finish();
}

fn bench_gradient_accumulation(c: &mut Criterion) {
  let mut group = c.benchmark_group("internals/grad_accumulation");

  // many paths converge on the same node
  group.bench_function("diamond_16x16", |b| {
    let mut tape = Tape::new();
    let init = Array::ones([16, 16]);
    b.iter(|| {
      tape.scope(|t| {
        let x = t.leaf(black_box(init.clone()));
        let mut acc = t.mul(x, x).unwrap();
        for _ in 0..8 {
          let branch = t.sigmoid(x).unwrap();
          acc = t.add(acc, branch).unwrap();
        }
        let loss = t.sum(acc).unwrap();
        t.backward(loss).unwrap();
        black_box(t.grad(x).unwrap().sum())
      })
    });
  });
  group.finish();
}

// =============================================================================
// TRAINING BENCHMARKS
// =============================================================================

fn throughput_mlp(c: &mut Criterion) {
  let mut group = c.benchmark_group("throughput/mlp_step");
  group.sample_size(20);

  for batch in [16, 128] {
    group.throughput(Throughput::Elements(batch as u64));
    group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
      let mut tape = Tape::new().with_accelerator(NdarrayAccelerator::new());
      let mut rng = StdRng::seed_from_u64(6);
      let model = Sequential::new()
        .with(Linear::new(&mut tape, 64, 128, &mut rng))
        .with(Relu)
        .with(Linear::new(&mut tape, 128, 10, &mut rng));
      let mut sgd = Sgd::new(model.parameters(), SgdConfig::default());
      let x = random(&[batch, 64], 7);
      let targets: Vec<usize> = (0..batch).map(|i| i % 10).collect();

      b.iter(|| {
        sgd.zero_grad(&mut tape).unwrap();
        tape.scope(|t| {
          let input = t.leaf(x.clone());
          let logits = model.forward(t, input).unwrap();
          let loss = loss::softmax_cross_entropy(t, logits, &targets).unwrap();
          t.backward(loss).unwrap();
        });
        sgd.step(&mut tape).unwrap();
      });
    });
  }
  group.finish();
}

criterion_group!(
  name = benches;
  config = Criterion::default().measurement_time(Duration::from_secs(10));
  targets =
    elementwise_chain,
    dot_local_vs_ndarray,
    conv_local_vs_ndarray,
    bench_topological_sort,
    bench_gradient_accumulation,
    throughput_mlp,
);

criterion_main!(benches);
