//! Example: discover a circuit in a small random transformer.
//!
//! Trains edge gates against a fixed set of prompts, discretizes them,
//! prunes dangling edges and writes the run outputs.
//!
//! ```text
//! RUST_LOG=ruvector_circuit=debug cargo run --example toy_discovery -- [output-dir]
//! ```

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use ruvector_circuit::reference::LinearTransformer;
use ruvector_circuit::{Batch, ModelDims, Pruner, PruningConfig, StaticDataset, TaskDataset};

const VOCAB: usize = 20;
const SEQ: usize = 8;

fn prompts(rng: &mut StdRng, n: usize) -> ruvector_circuit::Result<Batch> {
    let tokens = Array2::from_shape_simple_fn((n, SEQ), || rng.gen_range(0..VOCAB));
    let positions = (0..n).map(|_| rng.gen_range(3..SEQ)).collect();
    Batch::new(tokens, positions)
}

fn main() -> ruvector_circuit::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("=== Toy Circuit Discovery ===\n");

    let dims = ModelDims::new(3, 4, 16, 4);
    let model = LinearTransformer::random(dims, VOCAB, 32, 2024);
    let mut rng = StdRng::seed_from_u64(7);
    let batches = (0..4).map(|_| prompts(&mut rng, 8)).collect::<Result<Vec<_>, _>>()?;
    let mut data = StaticDataset::new(batches)?;

    let mut config = PruningConfig::default();
    config.batch_size = 8;
    config.sample_count = 4;
    config.regularization_coefficient = 5e-3;
    config.sampler.seed = Some(1);
    config.temperature.warmup_steps = 100;
    config.early_stop.min_steps = 250;

    let mut pruner = Pruner::for_task(&model, config, &mut data, 4)?;
    let steps = pruner.train(&mut data, 400)?;

    println!(
        "Model: {} layers x {} heads, d_model = {}",
        dims.n_layers, dims.n_heads, dims.d_model
    );
    println!("Steps: {} (early stop: {})", steps, pruner.should_stop());
    let log = pruner.log();
    if let (Some(kl), Some(complexity)) = (log.last("kl_loss"), log.last("complexity_loss")) {
        println!("Final KL: {:.5}, expected open gates: {:.1}", kl, complexity);
    }

    let pruned = pruner.circuit()?.prune_dangling()?;
    println!(
        "Edges: {} discretized, {} after pruning dangling edges",
        pruned.edge_count, pruned.clipped_edge_count
    );
    let dropped: Vec<String> = pruned
        .node_kept
        .iter()
        .filter(|&(_, &kept)| !kept)
        .map(|(node, _)| node.to_string())
        .collect();
    let dropped = if dropped.is_empty() { "none".to_string() } else { dropped.join(", ") };
    println!("Nodes outside the circuit: {}", dropped);

    let held_out = data.next_batch()?;
    let kl = pruner.evaluate(&pruned.circuit, &held_out)?;
    println!("Circuit KL on one batch: {:.5}", kl.mean().unwrap_or(0.0));

    let edges = pruned.circuit.edges()?;
    println!("\nFirst edges:");
    for edge in edges.iter().take(10) {
        println!("  {}", edge);
    }

    if let Some(dir) = std::env::args().nth(1) {
        pruner.save_outputs(&dir)?;
        println!("\nOutputs written to {}", dir);
    }
    Ok(())
}
