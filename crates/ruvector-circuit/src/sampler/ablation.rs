//! Fixed-mask samplers for evaluation and ablation sweeps.

use ndarray::{ArrayD, Axis, Dimension, IxDyn};
use tracing::debug;

use super::{with_rows, MaskSampler, SampledMask};
use crate::circuit::Circuit;
use crate::error::{CircuitError, Result};
use crate::graph::{GateKey, Granularity, ModelDims};

/// Returns the same discrete mask, broadcast over rows, on every draw.
#[derive(Debug, Clone)]
pub struct ConstantMaskSampler {
    dims: ModelDims,
    granularity: Granularity,
    circuit: Option<Circuit>,
}

impl ConstantMaskSampler {
    /// Sampler with no mask set; every gate is open until [`set_mask`] is called.
    ///
    /// [`set_mask`]: ConstantMaskSampler::set_mask
    pub fn new(dims: ModelDims, granularity: Granularity) -> Self {
        Self {
            dims,
            granularity,
            circuit: None,
        }
    }

    /// Sampler fixed to `circuit`.
    pub fn from_circuit(circuit: Circuit) -> Self {
        Self {
            dims: *circuit.dims(),
            granularity: circuit.granularity(),
            circuit: Some(circuit),
        }
    }

    /// Replace the fixed mask. A circuit for another model or granularity is
    /// rejected.
    pub fn set_mask(&mut self, circuit: Circuit) -> Result<()> {
        if circuit.dims() != &self.dims || circuit.granularity() != self.granularity {
            return Err(CircuitError::config(format!(
                "circuit layout {:?}/{:?} does not match sampler {:?}/{:?}",
                circuit.dims(),
                circuit.granularity(),
                self.dims,
                self.granularity
            )));
        }
        self.circuit = Some(circuit);
        Ok(())
    }

    /// The fixed mask, if set.
    pub fn mask(&self) -> Option<&Circuit> {
        self.circuit.as_ref()
    }
}

impl MaskSampler for ConstantMaskSampler {
    fn granularity(&self) -> Granularity {
        self.granularity
    }

    fn sample(&mut self, rows: usize) -> Result<SampledMask> {
        let Some(circuit) = &self.circuit else {
            return Ok(SampledMask::filled(&self.dims, self.granularity, rows, 1.0));
        };
        let mut mask = SampledMask::new(rows);
        for key in GateKey::all(&self.dims, self.granularity) {
            let keep = circuit.get(key)?;
            let mut tensor = ArrayD::zeros(IxDyn(&with_rows(rows, keep.shape())));
            for mut row in tensor.axis_iter_mut(Axis(0)) {
                row.zip_mut_with(keep, |g, &k| *g = if k { 1.0 } else { 0.0 });
            }
            mask.insert(key, tensor)?;
        }
        Ok(mask)
    }
}

/// Ablates exactly one component per block of rows.
///
/// Components are all gate entries of the granularity in key order. Row block
/// `k` (rows `k * batch .. (k + 1) * batch`) closes component `k` and leaves
/// every other gate open, so a pass with `n_components` samples ablates each
/// component once per batch example.
#[derive(Debug, Clone)]
pub struct SingleComponentSampler {
    dims: ModelDims,
    granularity: Granularity,
    components: Vec<(GateKey, Vec<usize>)>,
}

impl SingleComponentSampler {
    /// Sampler over every gate entry of `granularity`.
    pub fn new(dims: ModelDims, granularity: Granularity) -> Self {
        let components = GateKey::all(&dims, granularity)
            .into_iter()
            .flat_map(|key| {
                let shape = key.shape(&dims);
                ndarray::indices(IxDyn(&shape))
                    .into_iter()
                    .map(move |idx| (key, idx.slice().to_vec()))
                    .collect::<Vec<_>>()
            })
            .collect();
        Self {
            dims,
            granularity,
            components,
        }
    }

    /// Number of components, which is the sample count a sweep must use.
    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    /// Gate entry closed by sample block `k`.
    pub fn component(&self, k: usize) -> Option<(GateKey, &[usize])> {
        self.components.get(k).map(|(key, idx)| (*key, idx.as_slice()))
    }
}

impl MaskSampler for SingleComponentSampler {
    fn granularity(&self) -> Granularity {
        self.granularity
    }

    fn sample(&mut self, rows: usize) -> Result<SampledMask> {
        let n = self.components.len();
        if n == 0 || rows % n != 0 {
            return Err(CircuitError::config(format!(
                "single-component sampling needs a multiple of {} rows, got {}",
                n, rows
            )));
        }
        let batch = rows / n;
        let mut mask = SampledMask::filled(&self.dims, self.granularity, rows, 1.0);
        for (k, (key, idx)) in self.components.iter().enumerate() {
            let tensor = mask.get_mut(*key)?;
            for r in k * batch..(k + 1) * batch {
                let mut full = Vec::with_capacity(idx.len() + 1);
                full.push(r);
                full.extend_from_slice(idx);
                tensor[IxDyn(&full)] = 0.0;
            }
        }
        debug!(components = n, batch, "single-component mask built");
        Ok(mask)
    }
}
