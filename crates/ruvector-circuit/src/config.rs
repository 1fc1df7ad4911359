//! Configuration for circuit discovery runs.

use serde::{Deserialize, Serialize};

use crate::error::{CircuitError, Result};
use crate::graph::Granularity;

/// How the clean and gated outputs are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStrategy {
    /// One pass with the clean batch in the first rows.
    Fused,
    /// A gated pass followed by a clean pass.
    Sequential,
}

/// Hard-concrete gate distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Left stretch endpoint (negative).
    pub stretch_left: f32,
    /// Right stretch endpoint (greater than one).
    pub stretch_right: f32,
    /// Initial gate location (logit).
    pub init_location: f32,
    /// Initial gate temperature.
    pub init_temperature: f32,
    /// Temperature written back when `fix_nans` finds a non-finite value.
    pub reset_temperature: f32,
    /// RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            stretch_left: -0.1,
            stretch_right: 1.1,
            init_location: 1.0,
            init_temperature: 2.0 / 3.0,
            reset_temperature: 2.0 / 3.0,
            seed: None,
        }
    }
}

/// Schedule of the temperature regularization coefficient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureScheduleConfig {
    /// Steps during which the coefficient stays at zero.
    pub warmup_steps: usize,
    /// Coefficient right after warmup.
    pub start: f32,
    /// Upper bound of the coefficient.
    pub end: f32,
    /// Multiplier applied each time the schedule advances.
    pub factor: f32,
    /// Complexity decline below which the schedule advances.
    pub stall_threshold: f32,
}

impl Default for TemperatureScheduleConfig {
    fn default() -> Self {
        Self {
            warmup_steps: 500,
            start: 1e-4,
            end: 1e-1,
            factor: 1.5,
            stall_threshold: 5e-3,
        }
    }
}

/// Early-termination signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStopConfig {
    /// Logged steps before the signal can fire.
    pub min_steps: usize,
    /// Required KL decline to count as progress.
    pub kl_decline: f32,
    /// Required complexity decline to count as progress.
    pub decline_pct: f32,
    /// Average temperature below which gates count as settled.
    pub temperature_threshold: f32,
    /// Counter value at which training stops.
    pub patience: usize,
}

impl Default for EarlyStopConfig {
    fn default() -> Self {
        Self {
            min_steps: 500,
            kl_decline: 0.01,
            decline_pct: 0.03,
            temperature_threshold: 1e-2,
            patience: 100,
        }
    }
}

/// Configuration of a pruning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruningConfig {
    /// Edge- or vertex-level gates.
    pub granularity: Granularity,
    /// Sparsity coefficient `λ`.
    pub regularization_coefficient: f32,
    /// Examples per batch.
    pub batch_size: usize,
    /// Gated replicas per example.
    pub sample_count: usize,
    /// Gates whose score exceeds this value are kept.
    pub discretization_threshold: f32,
    /// Node-level regularization coefficient; zero disables the term.
    pub node_regularization_coefficient: f32,
    /// Adam learning rate of the gate parameters.
    pub learning_rate: f32,
    /// Adam learning rate of the modal values.
    pub modal_learning_rate: f32,
    /// Train modal values jointly with the gates.
    pub train_modal: bool,
    /// Fused or sequential clean pass.
    pub execution: ExecutionStrategy,
    /// Gates at or above `1 - saturation_tolerance` detach their modal term.
    pub saturation_tolerance: f32,
    /// Gate distribution.
    pub sampler: SamplerConfig,
    /// Temperature regularization schedule.
    pub temperature: TemperatureScheduleConfig,
    /// Early-termination signal.
    pub early_stop: EarlyStopConfig,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            granularity: Granularity::Edge,
            regularization_coefficient: 1e-3,
            batch_size: 8,
            sample_count: 4,
            discretization_threshold: 0.0,
            node_regularization_coefficient: 0.0,
            learning_rate: 1e-1,
            modal_learning_rate: 1e-3,
            train_modal: true,
            execution: ExecutionStrategy::Fused,
            saturation_tolerance: 1e-3,
            sampler: SamplerConfig::default(),
            temperature: TemperatureScheduleConfig::default(),
            early_stop: EarlyStopConfig::default(),
        }
    }
}

impl PruningConfig {
    /// Report every invalid field before any computation starts.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if !(self.regularization_coefficient >= 0.0) {
            problems.push("regularization_coefficient must be >= 0".to_string());
        }
        if !(self.node_regularization_coefficient >= 0.0) {
            problems.push("node_regularization_coefficient must be >= 0".to_string());
        }
        if self.batch_size == 0 {
            problems.push("batch_size must be > 0".to_string());
        }
        if self.sample_count == 0 {
            problems.push("sample_count must be > 0".to_string());
        }
        if !self.discretization_threshold.is_finite() {
            problems.push("discretization_threshold must be finite".to_string());
        }
        if !(self.learning_rate > 0.0) || !(self.modal_learning_rate > 0.0) {
            problems.push("learning rates must be > 0".to_string());
        }
        if !(self.saturation_tolerance >= 0.0 && self.saturation_tolerance < 1.0) {
            problems.push("saturation_tolerance must lie in [0, 1)".to_string());
        }

        let s = &self.sampler;
        if !(s.stretch_left < 0.0) || !(s.stretch_right > 1.0) {
            problems.push(format!(
                "stretch endpoints must satisfy left < 0 < 1 < right, got ({}, {})",
                s.stretch_left, s.stretch_right
            ));
        }
        if !(s.init_temperature > 0.0) || !(s.reset_temperature > 0.0) {
            problems.push("sampler temperatures must be > 0".to_string());
        }
        if !s.init_location.is_finite() {
            problems.push("init_location must be finite".to_string());
        }

        let t = &self.temperature;
        if !(t.start >= 0.0 && t.end >= t.start) || !(t.factor >= 1.0) {
            problems
                .push("temperature schedule needs 0 <= start <= end and factor >= 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CircuitError::Config(problems.join("; ")))
        }
    }
}
