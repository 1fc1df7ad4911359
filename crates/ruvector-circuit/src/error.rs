//! Error types for circuit discovery.
//!
//! Wiring violations (shape mismatches, cache misuse, illegal edges) are
//! construction bugs and surface as hard errors. Configuration problems are
//! reported before any tensor work starts.

use crate::cache::CacheKey;
use crate::graph::Node;

/// Primary error type for circuit discovery operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    /// A gate, cache entry, or activation did not have the expected shape.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Where the mismatch was detected.
        context: String,
        /// Shape required by the graph contract.
        expected: Vec<usize>,
        /// Shape actually supplied.
        actual: Vec<usize>,
    },

    /// A node was read from the activation cache before it was recorded in
    /// the current pass.
    #[error("activation cache miss: {0} has not been recorded in this pass")]
    CacheMiss(CacheKey),

    /// A node was recorded twice in the same pass.
    #[error("activation cache overwrite: {0} was already recorded in this pass")]
    CacheOverwrite(CacheKey),

    /// The pass ended before every producer was recorded.
    #[error("activation cache incomplete at end of pass, missing: {missing:?}")]
    CacheIncomplete {
        /// Producers that never executed.
        missing: Vec<CacheKey>,
    },

    /// An edge violates the producer-before-consumer ordering.
    #[error("illegal edge {producer} -> {consumer}: {reason}")]
    IllegalEdge {
        /// Producer node.
        producer: Node,
        /// Consumer node.
        consumer: Node,
        /// Human-readable explanation.
        reason: String,
    },

    /// The declared edge set contains a cycle.
    #[error("computation graph contains a cycle through {0}")]
    Cycle(String),

    /// Invalid configuration or a mask layout that does not match the graph.
    #[error("configuration error: {0}")]
    Config(String),

    /// A numerical failure that cannot be sanitized locally.
    #[error("numerical error: {0}")]
    NumericalError(String),

    /// A checkpoint could not be restored.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Error reported by the frozen model implementation.
    #[error("model error: {0}")]
    Model(String),

    /// An ndarray reshape or dimensionality conversion failed.
    #[error("tensor layout error: {0}")]
    Layout(#[from] ndarray::ShapeError),

    /// Filesystem error while persisting state.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error while persisting state.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CircuitError {
    /// Build a shape mismatch error.
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: &[usize],
        actual: &[usize],
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Build a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Convenience result type for circuit discovery operations.
pub type Result<T> = std::result::Result<T, CircuitError>;
