//! Integration tests for the training loops.
//!
//! Covers the KL fidelity term, short pruning runs in both execution
//! strategies, checkpoint persistence through the pruner, modal fitting and
//! the early-termination signal.

mod helpers;

use std::collections::BTreeMap;

use ndarray::{concatenate, Array2, Axis};

use ruvector_circuit::loss::kl_divergence;
use ruvector_circuit::{
    Batch, Checkpoint, Circuit, CircuitError, EarlyStopConfig, EarlyTermination, ExecutionMode,
    ExecutionStrategy, FrozenModel, Granularity, ModalFitter, ModalStore, PassContext, Pruner,
    PruningConfig, StaticDataset, TaskDataset, TrainingLog,
};

use helpers::{max_abs_diff, normal, toy_batch, toy_model};

fn dataset() -> StaticDataset {
    StaticDataset::new(vec![toy_batch()]).unwrap()
}

/// One example more than `config` asks for.
fn three_examples() -> Batch {
    let tokens = ndarray::array![[1, 2, 3, 4, 5], [6, 7, 8, 0, 1], [2, 4, 6, 8, 1]];
    Batch::new(tokens, vec![4, 3, 2]).unwrap()
}

fn config(seed: u64) -> PruningConfig {
    let mut config = PruningConfig::default();
    config.batch_size = 2;
    config.sample_count = 3;
    config.sampler.seed = Some(seed);
    config
}

// ---------------------------------------------------------------------------
// KL fidelity
// ---------------------------------------------------------------------------

#[test]
fn test_kl_is_zero_for_identical_logits() {
    let clean: Array2<f32> = normal((2, 9), 5);
    let ctx = PassContext::new(ExecutionMode::Fused, 3, 5, &[4, 3]).unwrap();
    // Sample-major replicas of the clean rows.
    let gated = concatenate(Axis(0), &[clean.view(), clean.view(), clean.view()]).unwrap();

    let (kl, grad) = kl_divergence(&clean, &gated, &ctx).unwrap();
    assert_eq!(kl.len(), 6);
    assert!(kl.iter().all(|&v| v.abs() < 1e-6), "{:?}", kl);
    assert!(grad.iter().all(|&g| g.abs() < 1e-6));
}

#[test]
fn test_kl_is_positive_and_rows_follow_their_example() {
    let clean: Array2<f32> = normal((2, 9), 5);
    let ctx = PassContext::new(ExecutionMode::Fused, 2, 5, &[4, 3]).unwrap();
    let mut gated = concatenate(Axis(0), &[clean.view(), clean.view()]).unwrap();
    // Perturb the second replica of example 1 only.
    gated[[3, 0]] += 2.0;

    let (kl, grad) = kl_divergence(&clean, &gated, &ctx).unwrap();
    assert!(kl[3] > 1e-4);
    for row in [0, 1, 2] {
        assert!(kl[row].abs() < 1e-6, "row {} = {}", row, kl[row]);
    }
    // Gradient rows are softmax differences and sum to zero.
    assert!(grad.row(3).sum().abs() < 1e-5);
    assert!(grad[[3, 0]] > 0.0);
}

#[test]
fn test_kl_rejects_mismatched_clean_rows() {
    let ctx = PassContext::new(ExecutionMode::Fused, 1, 5, &[4, 3]).unwrap();
    let clean: Array2<f32> = normal((3, 9), 1);
    let gated: Array2<f32> = normal((2, 9), 2);
    assert!(kl_divergence(&clean, &gated, &ctx).is_err());
}

// ---------------------------------------------------------------------------
// Pruning runs
// ---------------------------------------------------------------------------

#[test]
fn test_short_pruning_run() {
    let model = toy_model(21);
    let mut data = dataset();
    let mut pruner = Pruner::for_task(&model, config(4), &mut data, 1).unwrap();

    let steps = pruner.train(&mut data, 8).unwrap();
    assert_eq!(steps, 8);
    assert!(!pruner.should_stop());
    assert_eq!(pruner.log().t(), 8);

    let kl = pruner.log().series("kl_loss").unwrap();
    assert_eq!(kl.len(), 8);
    assert!(kl.iter().all(|v| v.is_finite() && *v >= -1e-6));
    let complexity = pruner.log().series("complexity_loss").unwrap();
    assert!(complexity.iter().all(|v| v.is_finite() && *v > 0.0));
    // No node term without a node coefficient.
    assert!(pruner.log().series("node_loss").is_none());

    let circuit = pruner.circuit().unwrap();
    let batch = data.next_batch().unwrap();
    let kl = pruner.evaluate(&circuit, &batch).unwrap();
    assert_eq!(kl.len(), batch.len());
    assert!(kl.iter().all(|v| v.is_finite()));
}

#[test]
fn test_vertex_pruning_with_sequential_execution() {
    let model = toy_model(22);
    let mut data = dataset();
    let mut config = config(6);
    config.granularity = Granularity::Vertex;
    config.execution = ExecutionStrategy::Sequential;
    let mut pruner = Pruner::for_task(&model, config, &mut data, 1).unwrap();

    let report = pruner.step(&mut data).unwrap();
    assert_eq!(report.terms.kl.len(), 6);
    assert!(report.terms.total.is_finite());
    assert_eq!(report.nan_resets, 0);
    assert_eq!(pruner.circuit().unwrap().granularity(), Granularity::Vertex);
}

#[test]
fn test_node_loss_logged_when_enabled() {
    let model = toy_model(23);
    let mut data = dataset();
    let mut config = config(7);
    config.node_regularization_coefficient = 0.5;
    let mut pruner = Pruner::for_task(&model, config, &mut data, 1).unwrap();

    let report = pruner.step(&mut data).unwrap();
    let node = report.terms.node.unwrap();
    assert!(node > 0.0 && node.is_finite());
    assert_eq!(pruner.log().last("node_loss"), Some(node));
}

#[test]
fn test_fused_and_sequential_agree_on_first_step() {
    let model = toy_model(24);
    let run = |execution| {
        let mut data = dataset();
        let mut config = config(11);
        config.execution = execution;
        let mut pruner = Pruner::for_task(&model, config, &mut data, 1).unwrap();
        pruner.step(&mut data).unwrap().terms
    };
    let fused = run(ExecutionStrategy::Fused);
    let sequential = run(ExecutionStrategy::Sequential);
    assert!(max_abs_diff(fused.kl.iter(), sequential.kl.iter()) < 1e-4);
    assert!((fused.complexity - sequential.complexity).abs() < 1e-6);
}

#[test]
fn test_invalid_config_rejected_before_training() {
    let model = toy_model(25);
    let mut data = dataset();
    let mut config = config(1);
    config.sample_count = 0;
    let err = Pruner::for_task(&model, config, &mut data, 1).unwrap_err();
    assert!(err.to_string().contains("sample_count"));
}

#[test]
fn test_batch_size_mismatch_rejected() {
    let model = toy_model(27);
    let mut data = StaticDataset::new(vec![toy_batch(), three_examples()]).unwrap();
    let mut pruner = Pruner::for_task(&model, config(3), &mut data, 1).unwrap();
    let err = pruner.step(&mut data).unwrap_err();
    assert!(matches!(err, CircuitError::Config(_)), "{}", err);
    assert_eq!(pruner.log().t(), 0);

    // The matching batch comes round again and trains.
    assert!(pruner.step(&mut data).is_ok());

    let mut wrong = StaticDataset::new(vec![three_examples()]).unwrap();
    assert!(Pruner::for_task(&model, config(3), &mut wrong, 1).is_err());
}

#[test]
fn test_modal_fitter_checks_batch_size() {
    let model = toy_model(28);
    let modal = ModalStore::estimate(&model, &[toy_batch()]).unwrap();
    let empty = Circuit::empty(model.dims(), Granularity::Edge);
    let mut fitter = ModalFitter::new(&model, empty, modal, &config(0)).unwrap();
    let mut data = StaticDataset::new(vec![three_examples()]).unwrap();
    assert!(matches!(fitter.step(&mut data), Err(CircuitError::Config(_))));
    assert_eq!(fitter.log().t(), 0);
}

#[test]
fn test_modal_for_wrong_model_rejected() {
    let model = toy_model(26);
    let other = ruvector_circuit::ModelDims::new(3, 2, 6, 3);
    assert!(Pruner::new(&model, config(1), ModalStore::zeros(other)).is_err());
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn test_outputs_round_trip_through_resume() {
    let model = toy_model(31);
    let mut data = dataset();
    let mut trained = Pruner::for_task(&model, config(2), &mut data, 1).unwrap();
    trained.train(&mut data, 3).unwrap();

    let dir = tempfile::tempdir().unwrap();
    trained.save_outputs(dir.path()).unwrap();

    let saved = Circuit::load(dir.path().join("circuit.json")).unwrap();
    assert_eq!(saved, trained.circuit().unwrap());
    let log = TrainingLog::load(dir.path().join("log.json")).unwrap();
    assert_eq!(&log, trained.log());
    let checkpoint = Checkpoint::load(dir.path().join("checkpoint.json")).unwrap();
    assert_eq!(checkpoint, trained.checkpoint());

    let mut fresh = Pruner::new(&model, config(9), ModalStore::zeros(model.dims())).unwrap();
    assert!(!fresh.resume(dir.path().join("missing.json")).unwrap());
    assert_ne!(fresh.checkpoint(), trained.checkpoint());
    assert!(fresh.resume(dir.path().join("checkpoint.json")).unwrap());
    assert_eq!(fresh.checkpoint(), trained.checkpoint());
    assert_eq!(fresh.modal(), trained.modal());
    assert_eq!(fresh.circuit().unwrap(), trained.circuit().unwrap());
}

#[test]
fn test_checkpoint_for_other_model_rejected() {
    let model = toy_model(32);
    let mut data = dataset();
    let pruner = Pruner::for_task(&model, config(2), &mut data, 1).unwrap();
    let checkpoint = pruner.checkpoint();

    let bigger = ruvector_circuit::reference::LinearTransformer::random(
        ruvector_circuit::ModelDims::new(3, 2, 6, 3),
        helpers::VOCAB,
        8,
        1,
    );
    let mut other = Pruner::new(&bigger, config(2), ModalStore::zeros(bigger.dims())).unwrap();
    assert!(other.restore(&checkpoint).is_err());
}

// ---------------------------------------------------------------------------
// Modal fitting
// ---------------------------------------------------------------------------

#[test]
fn test_modal_fitting_lowers_kl_of_empty_circuit() {
    let model = toy_model(41);
    let mut data = dataset();
    let modal = ModalStore::estimate(&model, &[data.next_batch().unwrap()]).unwrap();
    let empty = Circuit::empty(model.dims(), Granularity::Edge);

    let mut config = config(0);
    config.modal_learning_rate = 1e-2;
    let mut fitter = ModalFitter::new(&model, empty, modal.clone(), &config).unwrap();
    let first = fitter.step(&mut data).unwrap();
    let last = fitter.fit(&mut data, 30).unwrap();

    assert!(first > 0.0);
    assert!(last < first, "kl went from {} to {}", first, last);
    assert_eq!(fitter.log().t(), 31);
    assert_ne!(fitter.modal(), &modal);
}

// ---------------------------------------------------------------------------
// Early termination
// ---------------------------------------------------------------------------

fn flat_log(steps: usize, temp: f32) -> TrainingLog {
    let mut log = TrainingLog::new(["kl_loss", "complexity_loss", "temp"]);
    for _ in 0..steps {
        let entry: BTreeMap<String, f32> = [
            ("kl_loss".to_string(), 0.5),
            ("complexity_loss".to_string(), 10.0),
            ("temp".to_string(), temp),
        ]
        .into_iter()
        .collect();
        log.add_entry(&entry);
    }
    log
}

#[test]
fn test_early_termination_counts_stalled_steps() {
    let config = EarlyStopConfig {
        min_steps: 0,
        patience: 2,
        ..EarlyStopConfig::default()
    };
    let mut signal = EarlyTermination::new(config);

    // Too short for the historical comparison.
    assert_eq!(signal.update(&flat_log(50, 1e-3)), 0);

    let stalled = flat_log(230, 1e-3);
    assert_eq!(signal.update(&stalled), 1);
    assert_eq!(signal.update(&stalled), 2);
    assert!(signal.should_stop());

    // Hot gates are not settled: the counter falls back by two.
    assert_eq!(signal.update(&flat_log(230, 0.5)), 0);
    assert!(!signal.should_stop());
}
