//! Pass-scoped activation cache.
//!
//! Every producer records its output exactly once per forward pass, in
//! execution order; consumers read only producers that already ran. Attention
//! heads of one block are recorded together as a `[rows, seq, heads, d_head]`
//! tensor, so the cache is keyed per block rather than per head.

use std::collections::HashMap;
use std::fmt;

use ndarray::ArrayD;
use tracing::trace;

use crate::error::{CircuitError, Result};
use crate::graph::{ModelDims, Node};

/// Cache slot of a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    /// Token embedding.
    Embedding,
    /// All attention heads of a block.
    Attention {
        /// Block index.
        layer: usize,
    },
    /// MLP output of a block.
    Mlp {
        /// Block index.
        layer: usize,
    },
}

impl CacheKey {
    /// Cache slot holding the output of `node`, if it is a producer.
    pub fn of(node: Node) -> Option<Self> {
        match node {
            Node::Embedding => Some(CacheKey::Embedding),
            Node::Attention { layer, .. } => Some(CacheKey::Attention { layer }),
            Node::Mlp { layer } => Some(CacheKey::Mlp { layer }),
            Node::Final => None,
        }
    }

    /// Residual-stream producer for a stream index (0 = embedding).
    pub fn stream(index: usize) -> Self {
        if index == 0 {
            CacheKey::Embedding
        } else {
            CacheKey::Mlp { layer: index - 1 }
        }
    }

    /// All producer slots of a model in execution order.
    pub fn all(dims: &ModelDims) -> Vec<CacheKey> {
        let mut keys = Vec::with_capacity(2 * dims.n_layers + 1);
        keys.push(CacheKey::Embedding);
        for layer in 0..dims.n_layers {
            keys.push(CacheKey::Attention { layer });
            keys.push(CacheKey::Mlp { layer });
        }
        keys
    }

    fn order(&self) -> usize {
        match *self {
            CacheKey::Embedding => 0,
            CacheKey::Attention { layer } => 2 * layer + 1,
            CacheKey::Mlp { layer } => 2 * layer + 2,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Embedding => write!(f, "embed"),
            CacheKey::Attention { layer } => write!(f, "attn{}", layer),
            CacheKey::Mlp { layer } => write!(f, "mlp{}", layer),
        }
    }
}

/// Producer outputs of the current forward pass.
#[derive(Debug, Default)]
pub struct ActivationCache {
    entries: HashMap<CacheKey, ArrayD<f32>>,
    expected: Vec<CacheKey>,
    last_recorded: Option<usize>,
    active: bool,
}

impl ActivationCache {
    /// Create an empty cache with no active pass.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear storage and open a new pass expecting every producer of `dims`.
    pub fn begin_pass(&mut self, dims: &ModelDims) {
        self.entries.clear();
        self.expected = CacheKey::all(dims);
        self.last_recorded = None;
        self.active = true;
        trace!(producers = self.expected.len(), "activation cache pass started");
    }

    /// Whether a pass is open.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Record a producer's output. Each producer is written at most once per
    /// pass and in execution order.
    pub fn record(&mut self, key: CacheKey, tensor: ArrayD<f32>) -> Result<()> {
        if !self.active {
            return Err(CircuitError::config(format!("record of {} outside an active pass", key)));
        }
        if !self.expected.contains(&key) {
            return Err(CircuitError::config(format!(
                "{} is not a producer of this model",
                key
            )));
        }
        if self.entries.contains_key(&key) {
            return Err(CircuitError::CacheOverwrite(key));
        }
        if let Some(prev) = self.last_recorded {
            if key.order() < prev {
                return Err(CircuitError::config(format!(
                    "{} recorded after a later producer",
                    key
                )));
            }
        }
        trace!(%key, shape = ?tensor.shape(), "activation recorded");
        self.last_recorded = Some(key.order());
        self.entries.insert(key, tensor);
        Ok(())
    }

    /// Read a producer recorded in the current pass.
    pub fn read(&self, key: CacheKey) -> Result<&ArrayD<f32>> {
        self.entries.get(&key).ok_or(CircuitError::CacheMiss(key))
    }

    /// Whether `key` was recorded in the current pass.
    pub fn contains(&self, key: CacheKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Close the pass, verifying that every producer was recorded. The
    /// entries stay readable until the next [`ActivationCache::begin_pass`].
    pub fn finish(&mut self) -> Result<()> {
        self.active = false;
        let missing: Vec<CacheKey> = self
            .expected
            .iter()
            .filter(|k| !self.entries.contains_key(k))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(CircuitError::CacheIncomplete { missing });
        }
        trace!(entries = self.entries.len(), "activation cache pass finished");
        Ok(())
    }

    /// Drop all entries and close any open pass.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_recorded = None;
        self.active = false;
    }

    /// Number of recorded producers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn dims() -> ModelDims {
        ModelDims::new(1, 2, 4, 2)
    }

    fn tensor() -> ArrayD<f32> {
        ArrayD::zeros(IxDyn(&[1, 3, 4]))
    }

    #[test]
    fn test_read_before_record_fails() {
        let mut cache = ActivationCache::new();
        cache.begin_pass(&dims());
        let err = cache.read(CacheKey::Embedding).unwrap_err();
        assert!(matches!(err, CircuitError::CacheMiss(CacheKey::Embedding)));
    }

    #[test]
    fn test_double_record_fails() {
        let mut cache = ActivationCache::new();
        cache.begin_pass(&dims());
        cache.record(CacheKey::Embedding, tensor()).unwrap();
        let err = cache.record(CacheKey::Embedding, tensor()).unwrap_err();
        assert!(matches!(err, CircuitError::CacheOverwrite(_)));
    }

    #[test]
    fn test_record_outside_pass_fails() {
        let mut cache = ActivationCache::new();
        let err = cache.record(CacheKey::Embedding, tensor()).unwrap_err();
        assert!(matches!(err, CircuitError::Config(_)));

        cache.begin_pass(&dims());
        for key in CacheKey::all(&dims()) {
            cache.record(key, tensor()).unwrap();
        }
        cache.finish().unwrap();
        assert!(cache.record(CacheKey::Embedding, tensor()).is_err());
    }

    #[test]
    fn test_out_of_order_record_fails() {
        let mut cache = ActivationCache::new();
        cache.begin_pass(&dims());
        cache.record(CacheKey::Mlp { layer: 0 }, tensor()).unwrap();
        assert!(cache.record(CacheKey::Embedding, tensor()).is_err());
    }

    #[test]
    fn test_finish_reports_missing() {
        let mut cache = ActivationCache::new();
        cache.begin_pass(&dims());
        cache.record(CacheKey::Embedding, tensor()).unwrap();
        match cache.finish() {
            Err(CircuitError::CacheIncomplete { missing }) => {
                assert_eq!(
                    missing,
                    vec![CacheKey::Attention { layer: 0 }, CacheKey::Mlp { layer: 0 }]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_begin_pass_clears_previous() {
        let mut cache = ActivationCache::new();
        cache.begin_pass(&dims());
        for key in CacheKey::all(&dims()) {
            cache.record(key, tensor()).unwrap();
        }
        cache.finish().unwrap();
        assert_eq!(cache.len(), 3);

        cache.begin_pass(&dims());
        assert!(cache.is_empty());
        assert!(cache.read(CacheKey::Embedding).is_err());
    }
}
