//! Differentiable circuit discovery for frozen transformers.
//!
//! Every edge (or node) of a transformer's computation graph gets a learnable
//! gate. On each forward pass the input of every consumer is rebuilt as a
//! gated mixture of each producer's real output and a learned baseline
//! ("modal") value. Gates are relaxed with a hard-concrete distribution, so
//! a sparsity penalty on them can be minimized jointly with the KL divergence
//! between the gated and the unedited model. The trained gates are then
//! discretized into a [`Circuit`] and dangling edges are pruned.
//!
//! # Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`graph`] | nodes, edges and gate-group layout |
//! | [`cache`] | per-pass producer activations |
//! | [`sampler`] | hard-concrete, constant and single-component gate samplers |
//! | [`engine`] | edge and vertex reconstruction as [`model::Interceptor`]s |
//! | [`loss`] | KL fidelity plus sparsity, temperature and node penalties |
//! | [`circuit`] | discretization, dangling-edge pruning, persistence |
//! | [`trainer`] | pruning, modal fitting and ablation loops |
//!
//! # Example
//!
//! ```rust
//! use ndarray::array;
//! use ruvector_circuit::reference::LinearTransformer;
//! use ruvector_circuit::{Batch, ModelDims, Pruner, PruningConfig, StaticDataset};
//!
//! let dims = ModelDims::new(2, 2, 8, 4);
//! let model = LinearTransformer::random(dims, 10, 16, 7);
//! let batch = Batch::new(array![[1, 2, 3, 4], [5, 6, 7, 8]], vec![3, 3])?;
//! let mut data = StaticDataset::new(vec![batch])?;
//!
//! let mut config = PruningConfig::default();
//! config.batch_size = 2;
//! config.sampler.seed = Some(0);
//! let mut pruner = Pruner::for_task(&model, config, &mut data, 1)?;
//! pruner.train(&mut data, 5)?;
//!
//! let pruned = pruner.circuit()?.prune_dangling()?;
//! assert!(pruned.clipped_edge_count <= pruned.edge_count);
//! # Ok::<(), ruvector_circuit::CircuitError>(())
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod checkpoint;
pub mod circuit;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod log;
pub mod loss;
pub mod modal;
pub mod model;
pub mod optim;
pub mod reference;
pub mod sampler;
pub mod schedule;
pub mod task;
pub mod tensor;
pub mod trainer;

pub use checkpoint::Checkpoint;
pub use circuit::{Circuit, ContinuousMask, PrunedCircuit};
pub use config::{
    EarlyStopConfig, ExecutionStrategy, PruningConfig, SamplerConfig, TemperatureScheduleConfig,
};
pub use engine::{
    EdgeReconstructor, ReconstructionEngine, Reconstructor, SaturationPolicy, VertexReconstructor,
};
pub use error::{CircuitError, Result};
pub use graph::{Channel, ComputationGraph, Edge, GateGroup, GateKey, Granularity, ModelDims, Node};
pub use log::{EarlyTermination, TrainingLog};
pub use loss::{LossComposer, LossTerms};
pub use modal::ModalStore;
pub use model::{ExecutionMode, FrozenModel, InterceptionPoint, Interceptor, PassContext};
pub use sampler::{GateParameters, HardConcreteSampler, MaskSampler, SampledMask};
pub use task::{Batch, StaticDataset, TaskDataset};
pub use trainer::{AblationSweep, ModalFitter, Pruner, StepReport};
