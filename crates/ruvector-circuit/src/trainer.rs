//! Training loops over a frozen model.
//!
//! [`Pruner`] learns gate parameters (and optionally modal baselines) by
//! minimizing the composed loss, [`ModalFitter`] refits baselines alone
//! against a fixed circuit, and [`AblationSweep`] measures the KL cost of
//! ablating each component on its own.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ndarray::{s, Array1, Array2};
use tracing::{debug, info};

use crate::checkpoint::Checkpoint;
use crate::circuit::{Circuit, ContinuousMask};
use crate::config::{ExecutionStrategy, PruningConfig};
use crate::engine::{EngineGradients, ReconstructionEngine, Reconstructor, SaturationPolicy};
use crate::error::{CircuitError, Result};
use crate::graph::{GateKey, Granularity};
use crate::log::{EarlyTermination, TrainingLog};
use crate::loss::{kl_divergence, LossComposer, LossTerms};
use crate::modal::ModalStore;
use crate::model::{ExecutionMode, FrozenModel, PassContext, Passthrough};
use crate::optim::{Adam, AdamConfig};
use crate::sampler::{
    ConstantMaskSampler, GateParameters, HardConcreteSampler, MaskSampler, SampledMask,
    SingleComponentSampler, TemperatureStats,
};
use crate::schedule::TemperatureSchedule;
use crate::task::{Batch, TaskDataset};

/// Clean and gated logits of one batch, with what the backward pass needs.
struct GatedPass<T> {
    ctx: PassContext,
    clean: Array2<f32>,
    gated: Array2<f32>,
    tape: T,
}

/// Produce clean and gated logits for `batch`, either in one fused pass or
/// in a gated pass followed by an uninstrumented clean pass.
fn run_pass<M: FrozenModel>(
    model: &M,
    engine: &mut Reconstructor<'_>,
    batch: &Batch,
    sample_count: usize,
    strategy: ExecutionStrategy,
) -> Result<GatedPass<M::Tape>> {
    let mode = match strategy {
        ExecutionStrategy::Fused => ExecutionMode::Fused,
        ExecutionStrategy::Sequential => ExecutionMode::Gated,
    };
    let ctx =
        PassContext::new(mode, sample_count, batch.tokens.ncols(), &batch.last_token_positions)?;

    engine.begin_pass(&ctx)?;
    let (logits, tape) = model.forward(&batch.tokens, &ctx, &mut *engine)?;
    engine.end_pass()?;
    if logits.nrows() != ctx.rows() {
        return Err(CircuitError::shape_mismatch(
            "model logits",
            &[ctx.rows(), model.vocab_size()],
            logits.shape(),
        ));
    }

    let offset = ctx.gated_offset();
    let gated = logits.slice(s![offset.., ..]).to_owned();
    let clean = match strategy {
        ExecutionStrategy::Fused => logits.slice(s![..offset, ..]).to_owned(),
        ExecutionStrategy::Sequential => {
            let clean_ctx = ctx.with_mode(ExecutionMode::Clean);
            model.forward(&batch.tokens, &clean_ctx, &mut Passthrough)?.0
        }
    };
    Ok(GatedPass {
        ctx,
        clean,
        gated,
        tape,
    })
}

/// Backpropagate a gradient on the gated logits through the pass and collect
/// the engine's gradients. Clean rows receive no gradient.
fn backward_pass<M: FrozenModel>(
    model: &M,
    engine: &mut Reconstructor<'_>,
    pass: &GatedPass<M::Tape>,
    grad_gated: &Array2<f32>,
) -> Result<EngineGradients> {
    let ctx = &pass.ctx;
    let mut grad_logits = Array2::zeros((ctx.rows(), grad_gated.ncols()));
    grad_logits
        .slice_mut(s![ctx.gated_offset().., ..])
        .assign(grad_gated);
    model.backward(&pass.tape, &grad_logits, ctx, &mut *engine)?;
    Ok(engine.take_gradients())
}

fn check_layout<M: FrozenModel>(model: &M, modal: &ModalStore) -> Result<()> {
    if modal.dims() != &model.dims() {
        return Err(CircuitError::config(format!(
            "modal values for {:?} used with model {:?}",
            modal.dims(),
            model.dims()
        )));
    }
    Ok(())
}

fn check_batch(batch: &Batch, batch_size: usize) -> Result<()> {
    if batch.len() != batch_size {
        return Err(CircuitError::config(format!(
            "batch has {} examples but batch_size is {}",
            batch.len(),
            batch_size
        )));
    }
    Ok(())
}

/// Summary of one optimization step.
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Index of the step (0-based).
    pub step: usize,
    /// Loss terms of the step.
    pub terms: LossTerms,
    /// Temperature diagnostics after the update.
    pub temperature: TemperatureStats,
    /// Early-termination counter after the step.
    pub early_stop_count: usize,
    /// Gate parameter entries reset by `fix_nans`.
    pub nan_resets: usize,
}

/// Learns a sparse circuit by optimizing hard-concrete gates.
#[derive(Debug)]
pub struct Pruner<'m, M: FrozenModel> {
    model: &'m M,
    config: PruningConfig,
    sampler: HardConcreteSampler,
    modal: ModalStore,
    composer: LossComposer,
    schedule: TemperatureSchedule,
    gate_optim: Adam,
    modal_optim: Adam,
    log: TrainingLog,
    early_stop: EarlyTermination,
}

impl<'m, M: FrozenModel> Pruner<'m, M> {
    /// Pruner with fresh gate parameters and the given baselines.
    pub fn new(model: &'m M, config: PruningConfig, modal: ModalStore) -> Result<Self> {
        config.validate()?;
        let dims = model.dims();
        dims.validate()?;
        check_layout(model, &modal)?;

        let params = GateParameters::new(dims, config.granularity, &config.sampler)?;
        let sampler = HardConcreteSampler::new(params, config.sampler.seed);
        let composer = LossComposer::new(
            config.regularization_coefficient,
            config.node_regularization_coefficient,
        )?;

        let mut keys =
            vec!["kl_loss", "complexity_loss", "temp", "temp_cond", "temp_count", "temp_reg"];
        if config.node_regularization_coefficient > 0.0 && config.granularity == Granularity::Edge {
            keys.push("node_loss");
        }

        info!(
            granularity = ?config.granularity,
            gates = sampler.params().len(),
            lambda = config.regularization_coefficient,
            "pruner initialized"
        );
        Ok(Self {
            model,
            schedule: TemperatureSchedule::new(config.temperature.clone()),
            gate_optim: Adam::new(AdamConfig::with_learning_rate(config.learning_rate)),
            modal_optim: Adam::new(AdamConfig::with_learning_rate(config.modal_learning_rate)),
            early_stop: EarlyTermination::new(config.early_stop.clone()),
            log: TrainingLog::new(keys),
            config,
            sampler,
            modal,
            composer,
        })
    }

    /// Pruner whose baselines come from the task, or are estimated from
    /// `estimation_batches` batches of it when the task defines none.
    pub fn for_task<D: TaskDataset>(
        model: &'m M,
        config: PruningConfig,
        dataset: &mut D,
        estimation_batches: usize,
    ) -> Result<Self> {
        let modal = match dataset.initial_modal_values() {
            Some(modal) => modal,
            None => {
                let batches = (0..estimation_batches.max(1))
                    .map(|_| -> Result<Batch> {
                        let batch = dataset.next_batch()?;
                        check_batch(&batch, config.batch_size)?;
                        Ok(batch)
                    })
                    .collect::<Result<Vec<_>>>()?;
                ModalStore::estimate(model, &batches)?
            }
        };
        Self::new(model, config, modal)
    }

    /// Run configuration.
    pub fn config(&self) -> &PruningConfig {
        &self.config
    }

    /// Current gate parameters.
    pub fn params(&self) -> &GateParameters {
        self.sampler.params()
    }

    /// Current baselines.
    pub fn modal(&self) -> &ModalStore {
        &self.modal
    }

    /// Training log.
    pub fn log(&self) -> &TrainingLog {
        &self.log
    }

    /// Whether the early-termination counter has reached its patience.
    pub fn should_stop(&self) -> bool {
        self.early_stop.should_stop()
    }

    /// Gate locations as keep scores.
    pub fn continuous_mask(&self) -> ContinuousMask {
        self.sampler.params().continuous_mask()
    }

    /// Discrete circuit at the configured threshold.
    pub fn circuit(&self) -> Result<Circuit> {
        self.continuous_mask()
            .discretize(self.config.discretization_threshold)
    }

    /// One optimization step on the next batch of `dataset`.
    pub fn step<D: TaskDataset>(&mut self, dataset: &mut D) -> Result<StepReport> {
        let batch = dataset.next_batch()?;
        check_batch(&batch, self.config.batch_size)?;
        let step = self.log.t();
        let temperature_coefficient = self.schedule.step(&self.log);

        let rows = batch.len() * self.config.sample_count;
        let mask = self.sampler.sample(rows)?;

        let (output, grads) = {
            let mut engine = Reconstructor::new(
                self.config.granularity,
                self.model.dims(),
                self.model.output_projection(),
                &self.modal,
                &mask,
                SaturationPolicy::detach(self.config.saturation_tolerance),
            )?;
            let pass = run_pass(
                self.model,
                &mut engine,
                &batch,
                self.config.sample_count,
                self.config.execution,
            )?;
            let output = self.composer.compose(
                &pass.clean,
                &pass.gated,
                &pass.ctx,
                self.sampler.params(),
                temperature_coefficient,
            )?;
            let grads = backward_pass(self.model, &mut engine, &pass, &output.grad_logits)?;
            (output, grads)
        };

        let mut param_grads = self.sampler.backward(&grads.gates)?;
        param_grads.add_assign(&output.param_grads)?;
        for (key, layer) in self.sampler.params_mut().iter_mut() {
            let grad = param_grads.get(*key)?;
            self.gate_optim
                .step(&format!("{}/location", key), &mut layer.location, &grad.location)?;
            self.gate_optim
                .step(&format!("{}/temperature", key), &mut layer.temperature, &grad.temperature)?;
        }
        if self.config.train_modal {
            self.modal_optim
                .step("modal/stream", self.modal.stream_tensor_mut(), &grads.modal.stream)?;
            self.modal_optim
                .step("modal/attn", self.modal.attn_tensor_mut(), &grads.modal.attn)?;
        }
        let nan_resets = self.sampler.params_mut().fix_nans();

        let terms = output.terms;
        let temperature = self.sampler.params().temperature_stats();
        let mut entry: BTreeMap<String, f32> = BTreeMap::new();
        entry.insert("kl_loss".into(), terms.kl_mean());
        entry.insert("complexity_loss".into(), terms.complexity);
        entry.insert("temp".into(), temperature.mean);
        entry.insert("temp_cond".into(), temperature.cond);
        entry.insert("temp_count".into(), temperature.count);
        entry.insert("temp_reg".into(), terms.temperature_coefficient * terms.temperature);
        if let Some(node) = terms.node {
            entry.insert("node_loss".into(), node);
        }
        self.log.add_entry(&entry);
        let early_stop_count = self.early_stop.update(&self.log);

        info!(
            step,
            loss = terms.total,
            kl = terms.kl_mean(),
            complexity = terms.complexity,
            temp = temperature.mean,
            temp_coef = temperature_coefficient,
            "pruning step"
        );
        Ok(StepReport {
            step,
            terms,
            temperature,
            early_stop_count,
            nan_resets,
        })
    }

    /// Step until `max_steps` or early termination. Returns the number of
    /// steps taken.
    pub fn train<D: TaskDataset>(&mut self, dataset: &mut D, max_steps: usize) -> Result<usize> {
        for taken in 0..max_steps {
            self.step(dataset)?;
            if self.early_stop.should_stop() {
                info!(steps = taken + 1, "early termination");
                return Ok(taken + 1);
            }
        }
        Ok(max_steps)
    }

    /// Per-example KL of `circuit` on `batch`, with the current baselines.
    /// Nothing is updated.
    pub fn evaluate(&self, circuit: &Circuit, batch: &Batch) -> Result<Array1<f32>> {
        evaluate_circuit(
            self.model,
            &self.modal,
            circuit,
            batch,
            self.config.execution,
            SaturationPolicy::detach(self.config.saturation_tolerance),
        )
    }

    /// Snapshot of gate parameters and baselines.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::capture(self.sampler.params(), &self.modal)
    }

    /// Overwrite gate parameters and baselines from `checkpoint`.
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        checkpoint.restore(self.sampler.params_mut(), &mut self.modal)
    }

    /// Restore from `path` if it exists. Returns whether anything was loaded.
    pub fn resume(&mut self, path: impl AsRef<Path>) -> Result<bool> {
        Checkpoint::load_or_fresh(path, self.sampler.params_mut(), &mut self.modal)
    }

    /// Write `checkpoint.json`, `circuit.json` and `log.json` into `dir`.
    pub fn save_outputs(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        self.checkpoint().save(dir.join("checkpoint.json"))?;
        self.circuit()?.save(dir.join("circuit.json"))?;
        self.log.save(dir.join("log.json"))?;
        info!(dir = %dir.display(), "training outputs saved");
        Ok(())
    }
}

/// Per-example KL of a fixed circuit on one batch.
pub fn evaluate_circuit<M: FrozenModel>(
    model: &M,
    modal: &ModalStore,
    circuit: &Circuit,
    batch: &Batch,
    strategy: ExecutionStrategy,
    policy: SaturationPolicy,
) -> Result<Array1<f32>> {
    check_layout(model, modal)?;
    let mut sampler = ConstantMaskSampler::from_circuit(circuit.clone());
    let mask = sampler.sample(batch.len())?;
    let mut engine = Reconstructor::new(
        circuit.granularity(),
        model.dims(),
        model.output_projection(),
        modal,
        &mask,
        policy,
    )?;
    let pass = run_pass(model, &mut engine, batch, 1, strategy)?;
    let (kl, _) = kl_divergence(&pass.clean, &pass.gated, &pass.ctx)?;
    Ok(kl)
}

/// Fits baselines to a fixed circuit, leaving gates untouched.
#[derive(Debug)]
pub struct ModalFitter<'m, M: FrozenModel> {
    model: &'m M,
    sampler: ConstantMaskSampler,
    modal: ModalStore,
    optim: Adam,
    batch_size: usize,
    strategy: ExecutionStrategy,
    policy: SaturationPolicy,
    log: TrainingLog,
}

impl<'m, M: FrozenModel> ModalFitter<'m, M> {
    /// Fitter for `circuit` starting from `modal`. Batch size, learning rate,
    /// execution strategy and saturation tolerance come from `config`.
    pub fn new(
        model: &'m M,
        circuit: Circuit,
        modal: ModalStore,
        config: &PruningConfig,
    ) -> Result<Self> {
        config.validate()?;
        check_layout(model, &modal)?;
        if circuit.dims() != &model.dims() {
            return Err(CircuitError::config(format!(
                "circuit for {:?} used with model {:?}",
                circuit.dims(),
                model.dims()
            )));
        }
        Ok(Self {
            model,
            sampler: ConstantMaskSampler::from_circuit(circuit),
            modal,
            optim: Adam::new(AdamConfig::with_learning_rate(config.modal_learning_rate)),
            batch_size: config.batch_size,
            strategy: config.execution,
            policy: SaturationPolicy::detach(config.saturation_tolerance),
            log: TrainingLog::new(["kl_loss"]),
        })
    }

    /// Current baselines.
    pub fn modal(&self) -> &ModalStore {
        &self.modal
    }

    /// Mean KL per step.
    pub fn log(&self) -> &TrainingLog {
        &self.log
    }

    /// One baseline update. Returns the mean KL before the update.
    pub fn step<D: TaskDataset>(&mut self, dataset: &mut D) -> Result<f32> {
        let batch = dataset.next_batch()?;
        check_batch(&batch, self.batch_size)?;
        let mask = self.sampler.sample(batch.len())?;

        let (kl, grads) = {
            let mut engine = Reconstructor::new(
                self.sampler.granularity(),
                self.model.dims(),
                self.model.output_projection(),
                &self.modal,
                &mask,
                self.policy,
            )?;
            let pass = run_pass(self.model, &mut engine, &batch, 1, self.strategy)?;
            let (kl, grad_kl) = kl_divergence(&pass.clean, &pass.gated, &pass.ctx)?;
            let grad_gated = grad_kl / kl.len().max(1) as f32;
            let grads = backward_pass(self.model, &mut engine, &pass, &grad_gated)?;
            (kl.mean().unwrap_or(0.0), grads)
        };
        if !kl.is_finite() {
            return Err(CircuitError::NumericalError(format!("modal fitting KL is {}", kl)));
        }

        self.optim
            .step("modal/stream", self.modal.stream_tensor_mut(), &grads.modal.stream)?;
        self.optim
            .step("modal/attn", self.modal.attn_tensor_mut(), &grads.modal.attn)?;

        let entry: BTreeMap<String, f32> = [("kl_loss".to_string(), kl)].into_iter().collect();
        self.log.add_entry(&entry);
        debug!(step = self.log.t(), kl, "modal fitting step");
        Ok(kl)
    }

    /// Run `steps` updates and return the last mean KL.
    pub fn fit<D: TaskDataset>(&mut self, dataset: &mut D, steps: usize) -> Result<f32> {
        let mut last = f32::NAN;
        for _ in 0..steps {
            last = self.step(dataset)?;
        }
        info!(steps, kl = last, "modal fitting finished");
        Ok(last)
    }

    /// The fitted baselines.
    pub fn into_modal(self) -> ModalStore {
        self.modal
    }
}

/// Running mean and variance (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: usize,
    mean: f32,
    m2: f32,
}

impl RunningStats {
    /// Fold in one observation.
    pub fn push(&mut self, value: f32) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f32;
        self.m2 += delta * (value - self.mean);
    }

    /// Observations so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Sample mean.
    pub fn mean(&self) -> f32 {
        self.mean
    }

    /// Sample variance; zero with fewer than two observations.
    pub fn variance(&self) -> f32 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f32
        }
    }

    /// Sample standard deviation.
    pub fn std_dev(&self) -> f32 {
        self.variance().sqrt()
    }
}

/// Ablation result of one component.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentStats {
    /// Gate tensor of the component.
    pub key: GateKey,
    /// Index within the gate tensor.
    pub index: Vec<usize>,
    /// KL statistics over every ablated row seen.
    pub stats: RunningStats,
}

/// Ablates every component once per example and tracks the resulting KL.
#[derive(Debug)]
pub struct AblationSweep<'m, M: FrozenModel> {
    model: &'m M,
    modal: ModalStore,
    sampler: SingleComponentSampler,
    strategy: ExecutionStrategy,
    policy: SaturationPolicy,
    stats: Vec<RunningStats>,
}

impl<'m, M: FrozenModel> AblationSweep<'m, M> {
    /// Sweep over every gate entry of `granularity`.
    pub fn new(
        model: &'m M,
        modal: ModalStore,
        granularity: Granularity,
        config: &PruningConfig,
    ) -> Result<Self> {
        config.validate()?;
        check_layout(model, &modal)?;
        let sampler = SingleComponentSampler::new(model.dims(), granularity);
        let stats = vec![RunningStats::default(); sampler.n_components()];
        Ok(Self {
            model,
            modal,
            sampler,
            strategy: config.execution,
            policy: SaturationPolicy::detach(config.saturation_tolerance),
            stats,
        })
    }

    /// Ablate each component on every example of `batch`.
    pub fn run_batch(&mut self, batch: &Batch) -> Result<()> {
        let n = self.sampler.n_components();
        let mask: SampledMask = self.sampler.sample(batch.len() * n)?;
        let mut engine = Reconstructor::new(
            self.sampler.granularity(),
            self.model.dims(),
            self.model.output_projection(),
            &self.modal,
            &mask,
            self.policy,
        )?;
        let pass = run_pass(self.model, &mut engine, batch, n, self.strategy)?;
        let (kl, _) = kl_divergence(&pass.clean, &pass.gated, &pass.ctx)?;
        // Gated rows are sample-major: row g ablates component g / batch.
        for (row, &value) in kl.iter().enumerate() {
            self.stats[row / batch.len()].push(value);
        }
        debug!(components = n, examples = batch.len(), "ablation batch done");
        Ok(())
    }

    /// Run `batches` batches drawn from `dataset`.
    pub fn run<D: TaskDataset>(&mut self, dataset: &mut D, batches: usize) -> Result<()> {
        for _ in 0..batches {
            let batch = dataset.next_batch()?;
            self.run_batch(&batch)?;
        }
        info!(components = self.stats.len(), batches, "ablation sweep finished");
        Ok(())
    }

    /// Statistics of every component, in component order.
    pub fn results(&self) -> Vec<ComponentStats> {
        self.stats
            .iter()
            .enumerate()
            .filter_map(|(k, stats)| {
                self.sampler.component(k).map(|(key, index)| ComponentStats {
                    key,
                    index: index.to_vec(),
                    stats: *stats,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ModelDims;
    use crate::reference::LinearTransformer;
    use crate::task::StaticDataset;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn setup() -> (LinearTransformer, StaticDataset) {
        let dims = ModelDims::new(2, 2, 6, 3);
        let model = LinearTransformer::random(dims, 7, 8, 11);
        let batch = Batch::new(array![[1, 2, 3, 4], [4, 5, 6, 0]], vec![3, 2]).unwrap();
        (model, StaticDataset::new(vec![batch]).unwrap())
    }

    fn small_config() -> PruningConfig {
        let mut config = PruningConfig::default();
        config.batch_size = 2;
        config.sample_count = 2;
        config.sampler.seed = Some(3);
        config
    }

    #[test]
    fn test_running_stats() {
        let mut stats = RunningStats::default();
        assert_eq!(stats.variance(), 0.0);
        for x in [1.0, 2.0, 3.0, 4.0] {
            stats.push(x);
        }
        assert_eq!(stats.count(), 4);
        assert_relative_eq!(stats.mean(), 2.5);
        assert_relative_eq!(stats.variance(), 5.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_pruner_step_logs_diagnostics() {
        let (model, mut data) = setup();
        let mut pruner = Pruner::for_task(&model, small_config(), &mut data, 1).unwrap();
        let before = pruner.params().complexity_loss();
        let report = pruner.step(&mut data).unwrap();
        assert_eq!(report.step, 0);
        assert_eq!(report.terms.kl.len(), 4);
        assert!(report.terms.total.is_finite());
        assert_eq!(pruner.log().t(), 1);
        for key in ["kl_loss", "complexity_loss", "temp", "temp_cond", "temp_count", "temp_reg"] {
            assert!(pruner.log().last(key).is_some(), "missing {}", key);
        }
        assert_ne!(pruner.params().complexity_loss(), before);
    }

    #[test]
    fn test_full_circuit_evaluates_to_zero_kl() {
        let (model, mut data) = setup();
        let pruner = Pruner::for_task(&model, small_config(), &mut data, 1).unwrap();
        let batch = data.next_batch().unwrap();
        let full = Circuit::full(model.dims(), Granularity::Edge);
        let kl = pruner.evaluate(&full, &batch).unwrap();
        assert_eq!(kl.len(), 2);
        assert!(kl.iter().all(|&v| v.abs() < 1e-5));
    }

    #[test]
    fn test_ablation_sweep_covers_every_component() {
        let (model, mut data) = setup();
        let modal = ModalStore::estimate(&model, &[data.next_batch().unwrap()]).unwrap();
        let mut sweep =
            AblationSweep::new(&model, modal, Granularity::Vertex, &small_config()).unwrap();
        sweep.run(&mut data, 2).unwrap();
        let results = sweep.results();
        // Two heads per layer plus one MLP per layer.
        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|c| c.stats.count() == 4));
        assert!(results.iter().all(|c| c.stats.mean() >= -1e-6));
    }

    #[test]
    fn test_modal_fitter_leaves_full_circuit_unchanged() {
        let (model, mut data) = setup();
        let modal = ModalStore::estimate(&model, &[data.next_batch().unwrap()]).unwrap();
        let full = Circuit::full(model.dims(), Granularity::Edge);
        let mut fitter = ModalFitter::new(&model, full, modal.clone(), &small_config()).unwrap();
        let kl = fitter.fit(&mut data, 2).unwrap();
        assert!(kl.abs() < 1e-5);
        // Every gate is open and saturated, so no baseline receives gradient.
        assert_eq!(fitter.into_modal(), modal);
    }
}
