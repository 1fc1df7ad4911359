//! Gate samplers.
//!
//! A sampler produces one [`SampledMask`] per forward pass: for every gate
//! tensor of the chosen granularity, a `[rows, ...]` tensor of gate values in
//! `[0, 1]`. The training sampler draws from the hard-concrete relaxation;
//! evaluation and ablation samplers return fixed masks.

mod ablation;
mod hard_concrete;

pub use ablation::{ConstantMaskSampler, SingleComponentSampler};
pub use hard_concrete::{
    GateDraw, GateLayer, GateParameterGradients, GateParameters, HardConcreteSampler,
    TemperatureStats,
};

use std::collections::BTreeMap;

use ndarray::{ArrayD, IxDyn};

use crate::error::{CircuitError, Result};
use crate::graph::{GateKey, Granularity, ModelDims};

/// Source of gate values for one forward pass.
pub trait MaskSampler {
    /// Granularity of the produced masks.
    fn granularity(&self) -> Granularity;

    /// Draw gate values for `rows` gated rows.
    fn sample(&mut self, rows: usize) -> Result<SampledMask>;
}

/// Realized gate values, keyed by gate tensor. Every tensor carries a leading
/// row axis.
#[derive(Debug, Clone)]
pub struct SampledMask {
    rows: usize,
    tensors: BTreeMap<GateKey, ArrayD<f32>>,
}

impl SampledMask {
    /// Empty mask for `rows` rows.
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            tensors: BTreeMap::new(),
        }
    }

    /// Mask with every gate of `granularity` set to `value`.
    pub fn filled(dims: &ModelDims, granularity: Granularity, rows: usize, value: f32) -> Self {
        let tensors = GateKey::all(dims, granularity)
            .into_iter()
            .map(|key| (key, ArrayD::from_elem(IxDyn(&with_rows(rows, &key.shape(dims))), value)))
            .collect();
        Self { rows, tensors }
    }

    /// Number of gated rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Insert a tensor; its leading axis must be the row axis.
    pub fn insert(&mut self, key: GateKey, tensor: ArrayD<f32>) -> Result<()> {
        if tensor.ndim() == 0 || tensor.shape()[0] != self.rows {
            return Err(CircuitError::config(format!(
                "mask tensor {} must lead with {} rows, got shape {:?}",
                key,
                self.rows,
                tensor.shape()
            )));
        }
        self.tensors.insert(key, tensor);
        Ok(())
    }

    /// Gate tensor for `key`.
    pub fn get(&self, key: GateKey) -> Result<&ArrayD<f32>> {
        self.tensors
            .get(&key)
            .ok_or_else(|| CircuitError::config(format!("mask has no tensor for {}", key)))
    }

    /// Mutable gate tensor for `key`.
    pub fn get_mut(&mut self, key: GateKey) -> Result<&mut ArrayD<f32>> {
        self.tensors
            .get_mut(&key)
            .ok_or_else(|| CircuitError::config(format!("mask has no tensor for {}", key)))
    }

    /// Iterate over all tensors.
    pub fn iter(&self) -> impl Iterator<Item = (&GateKey, &ArrayD<f32>)> {
        self.tensors.iter()
    }

    /// Check that exactly the gate tensors of `granularity` are present with
    /// the contracted shapes.
    pub fn validate(&self, dims: &ModelDims, granularity: Granularity) -> Result<()> {
        let keys = GateKey::all(dims, granularity);
        if keys.len() != self.tensors.len() {
            return Err(CircuitError::config(format!(
                "mask holds {} tensors, {:?} layout needs {}",
                self.tensors.len(),
                granularity,
                keys.len()
            )));
        }
        for key in keys {
            let tensor = self.get(key)?;
            let expected = with_rows(self.rows, &key.shape(dims));
            if tensor.shape() != expected.as_slice() {
                return Err(CircuitError::shape_mismatch(
                    key.to_string(),
                    &expected,
                    tensor.shape(),
                ));
            }
        }
        Ok(())
    }
}

/// Gradient of the loss with respect to realized gate values.
#[derive(Debug, Clone)]
pub struct GateGradients {
    tensors: BTreeMap<GateKey, ArrayD<f32>>,
}

impl GateGradients {
    /// Zero gradients shaped like `mask`.
    pub fn zeros_like(mask: &SampledMask) -> Self {
        Self {
            tensors: mask
                .iter()
                .map(|(key, t)| (*key, ArrayD::zeros(t.raw_dim())))
                .collect(),
        }
    }

    /// Gradient tensor for `key`.
    pub fn get(&self, key: GateKey) -> Result<&ArrayD<f32>> {
        self.tensors
            .get(&key)
            .ok_or_else(|| CircuitError::config(format!("no gate gradient for {}", key)))
    }

    /// Mutable gradient tensor for `key`.
    pub fn get_mut(&mut self, key: GateKey) -> Result<&mut ArrayD<f32>> {
        self.tensors
            .get_mut(&key)
            .ok_or_else(|| CircuitError::config(format!("no gate gradient for {}", key)))
    }

    /// Iterate over all tensors.
    pub fn iter(&self) -> impl Iterator<Item = (&GateKey, &ArrayD<f32>)> {
        self.tensors.iter()
    }
}

pub(crate) fn with_rows(rows: usize, shape: &[usize]) -> Vec<usize> {
    let mut full = Vec::with_capacity(shape.len() + 1);
    full.push(rows);
    full.extend_from_slice(shape);
    full
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GateGroup;

    #[test]
    fn test_filled_mask_validates() {
        let dims = ModelDims::new(2, 2, 4, 2);
        let mask = SampledMask::filled(&dims, Granularity::Edge, 3, 1.0);
        assert!(mask.validate(&dims, Granularity::Edge).is_ok());
        assert!(mask.validate(&dims, Granularity::Vertex).is_err());
        let t = mask.get(GateKey::new(GateGroup::AttnAttn, 1)).unwrap();
        assert_eq!(t.shape(), &[3, 3, 2, 1, 2]);
    }

    #[test]
    fn test_insert_rejects_wrong_rows() {
        let mut mask = SampledMask::new(2);
        let key = GateKey::new(GateGroup::MlpNode, 0);
        assert!(mask.insert(key, ArrayD::zeros(IxDyn(&[3, 1]))).is_err());
        assert!(mask.insert(key, ArrayD::zeros(IxDyn(&[2, 1]))).is_ok());
    }

    #[test]
    fn test_validate_detects_shape_mismatch() {
        let dims = ModelDims::new(1, 2, 4, 2);
        let mut mask = SampledMask::filled(&dims, Granularity::Vertex, 1, 0.5);
        let key = GateKey::new(GateGroup::AttnNode, 0);
        *mask.get_mut(key).unwrap() = ArrayD::zeros(IxDyn(&[1, 3]));
        assert!(matches!(
            mask.validate(&dims, Granularity::Vertex),
            Err(CircuitError::ShapeMismatch { .. })
        ));
    }
}
