//! Benchmarks for gated reconstruction on the reference model.
//!
//! Measures a fused forward pass, a forward plus backward pass through the
//! edge and vertex engines, and a complete pruning step, for a few model
//! depths.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ruvector_circuit::reference::LinearTransformer;
use ruvector_circuit::{
    Batch, ExecutionMode, FrozenModel, Granularity, ModalStore, ModelDims, PassContext, Pruner,
    PruningConfig, ReconstructionEngine, Reconstructor, SampledMask, SaturationPolicy,
    StaticDataset,
};

const VOCAB: usize = 64;
const BATCH: usize = 8;
const SEQ: usize = 12;
const SAMPLES: usize = 4;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn model(layers: usize) -> LinearTransformer {
    LinearTransformer::random(ModelDims::new(layers, 4, 32, 8), VOCAB, 64, 17)
}

fn random_batch(seed: u64) -> Batch {
    let mut rng = StdRng::seed_from_u64(seed);
    let tokens = Array2::from_shape_simple_fn((BATCH, SEQ), || rng.gen_range(0..VOCAB));
    let positions = (0..BATCH).map(|_| rng.gen_range(SEQ / 2..SEQ)).collect();
    Batch::new(tokens, positions).expect("valid batch")
}

// ---------------------------------------------------------------------------
// Engine passes
// ---------------------------------------------------------------------------

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconstruction_forward");
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(3));
    group.throughput(Throughput::Elements((BATCH * SAMPLES) as u64));

    let batch = random_batch(1);
    for layers in [2, 4] {
        let model = model(layers);
        let dims = model.dims();
        let modal = ModalStore::estimate(&model, std::slice::from_ref(&batch)).expect("modal");
        let ctx = PassContext::new(ExecutionMode::Fused, SAMPLES, SEQ, &batch.last_token_positions)
            .expect("ctx");

        for granularity in [Granularity::Edge, Granularity::Vertex] {
            let mask = SampledMask::filled(&dims, granularity, BATCH * SAMPLES, 0.5);
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", granularity).to_lowercase(), layers),
                &layers,
                |b, _| {
                    b.iter(|| {
                        let mut engine = Reconstructor::new(
                            granularity,
                            dims,
                            model.output_projection(),
                            &modal,
                            &mask,
                            SaturationPolicy::default(),
                        )
                        .expect("engine");
                        engine.begin_pass(&ctx).expect("begin");
                        let (logits, _) = model
                            .forward(&batch.tokens, &ctx, &mut engine)
                            .expect("forward");
                        engine.end_pass().expect("end");
                        logits
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_forward_backward(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconstruction_forward_backward");
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(3));

    let batch = random_batch(2);
    for layers in [2, 4] {
        let model = model(layers);
        let dims = model.dims();
        let modal = ModalStore::estimate(&model, std::slice::from_ref(&batch)).expect("modal");
        let ctx = PassContext::new(ExecutionMode::Fused, SAMPLES, SEQ, &batch.last_token_positions)
            .expect("ctx");
        let grad_logits = Array2::from_elem((ctx.rows(), VOCAB), 1e-2f32);

        for granularity in [Granularity::Edge, Granularity::Vertex] {
            let mask = SampledMask::filled(&dims, granularity, BATCH * SAMPLES, 0.5);
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", granularity).to_lowercase(), layers),
                &layers,
                |b, _| {
                    b.iter(|| {
                        let mut engine = Reconstructor::new(
                            granularity,
                            dims,
                            model.output_projection(),
                            &modal,
                            &mask,
                            SaturationPolicy::default(),
                        )
                        .expect("engine");
                        engine.begin_pass(&ctx).expect("begin");
                        let (_, tape) = model
                            .forward(&batch.tokens, &ctx, &mut engine)
                            .expect("forward");
                        engine.end_pass().expect("end");
                        model
                            .backward(&tape, &grad_logits, &ctx, &mut engine)
                            .expect("backward");
                        engine.take_gradients()
                    });
                },
            );
        }
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Training step
// ---------------------------------------------------------------------------

fn bench_pruning_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("pruning_step");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));

    let model = model(2);
    for granularity in [Granularity::Edge, Granularity::Vertex] {
        let mut data = StaticDataset::new(vec![random_batch(3), random_batch(4)]).expect("dataset");
        let mut config = PruningConfig::default();
        config.granularity = granularity;
        config.batch_size = BATCH;
        config.sample_count = SAMPLES;
        config.sampler.seed = Some(42);
        let mut pruner = Pruner::for_task(&model, config, &mut data, 2).expect("pruner");

        group.bench_function(format!("{:?}", granularity).to_lowercase(), |b| {
            b.iter(|| pruner.step(&mut data).expect("step"));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_forward, bench_forward_backward, bench_pruning_step);
criterion_main!(benches);
