//! Named tensor bundles for gate parameters and modal baselines.
//!
//! Tensors are stored by name (`gates/<key>/location`,
//! `gates/<key>/temperature`, `modal/stream`, `modal/attn`) so a bundle can
//! be restored into freshly constructed state of the same layout.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CircuitError, Result};
use crate::modal::ModalStore;
use crate::sampler::GateParameters;

const MODAL_STREAM: &str = "modal/stream";
const MODAL_ATTN: &str = "modal/attn";

fn location_name(key: impl std::fmt::Display) -> String {
    format!("gates/{}/location", key)
}

fn temperature_name(key: impl std::fmt::Display) -> String {
    format!("gates/{}/temperature", key)
}

/// Snapshot of trainable state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl Checkpoint {
    /// Copy the current gate parameters and modal values.
    pub fn capture(params: &GateParameters, modal: &ModalStore) -> Self {
        let mut tensors = BTreeMap::new();
        for (key, layer) in params.iter() {
            tensors.insert(location_name(key), layer.location.clone());
            tensors.insert(temperature_name(key), layer.temperature.clone());
        }
        tensors.insert(MODAL_STREAM.to_string(), modal.stream_tensor().clone().into_dyn());
        tensors.insert(MODAL_ATTN.to_string(), modal.attn_tensor().clone().into_dyn());
        Self { tensors }
    }

    /// Tensor stored under `name`.
    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    /// Stored tensor names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    fn tensor(&self, name: &str, expected: &[usize]) -> Result<&ArrayD<f32>> {
        let tensor = self
            .tensors
            .get(name)
            .ok_or_else(|| CircuitError::Checkpoint(format!("missing tensor '{}'", name)))?;
        if tensor.shape() != expected {
            return Err(CircuitError::shape_mismatch(name, expected, tensor.shape()));
        }
        Ok(tensor)
    }

    /// Overwrite `params` and `modal` with the stored tensors. Nothing is
    /// written unless every tensor is present with the expected shape.
    pub fn restore(&self, params: &mut GateParameters, modal: &mut ModalStore) -> Result<()> {
        for (key, layer) in params.iter() {
            self.tensor(&location_name(key), layer.location.shape())?;
            self.tensor(&temperature_name(key), layer.temperature.shape())?;
        }
        let stream = self.tensor(MODAL_STREAM, modal.stream_tensor().shape())?;
        let attn = self.tensor(MODAL_ATTN, modal.attn_tensor().shape())?;

        modal
            .stream_tensor_mut()
            .assign(&stream.view().into_dimensionality::<ndarray::Ix2>()?);
        modal
            .attn_tensor_mut()
            .assign(&attn.view().into_dimensionality::<ndarray::Ix3>()?);
        for (key, layer) in params.iter_mut() {
            layer.location.assign(self.tensor(&location_name(key), layer.location.shape())?);
            layer
                .temperature
                .assign(self.tensor(&temperature_name(key), layer.temperature.shape())?);
        }
        Ok(())
    }

    /// Write the bundle as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    /// Read a bundle written by [`Checkpoint::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    /// Restore from `path` if it exists. Otherwise leave the fresh state in
    /// place and report it. Returns whether a checkpoint was restored.
    pub fn load_or_fresh(
        path: impl AsRef<Path>,
        params: &mut GateParameters,
        modal: &mut ModalStore,
    ) -> Result<bool> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "no checkpoint found, starting from fresh parameters");
            return Ok(false);
        }
        Self::load(path)?.restore(params, modal)?;
        info!(path = %path.display(), "checkpoint restored");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplerConfig;
    use crate::graph::{GateGroup, GateKey, Granularity, ModelDims};

    fn state() -> (GateParameters, ModalStore) {
        let dims = ModelDims::new(2, 2, 3, 2);
        let params =
            GateParameters::new(dims, Granularity::Edge, &SamplerConfig::default()).unwrap();
        (params, ModalStore::zeros(dims))
    }

    #[test]
    fn test_restore_overwrites_by_name() {
        let (mut params, mut modal) = state();
        let key = GateKey::new(GateGroup::AttnAttn, 1);
        params.layer_mut(key).unwrap().location.fill(-3.0);
        modal.stream_tensor_mut().fill(0.25);
        let saved = Checkpoint::capture(&params, &modal);
        assert!(saved.get("gates/attn-attn.1/location").is_some());

        let (mut fresh, mut fresh_modal) = state();
        saved.restore(&mut fresh, &mut fresh_modal).unwrap();
        assert!(fresh.layer(key).unwrap().location.iter().all(|&l| l == -3.0));
        assert!(fresh_modal.stream_tensor().iter().all(|&v| v == 0.25));
    }

    #[test]
    fn test_restore_rejects_other_layout() {
        let (params, modal) = state();
        let saved = Checkpoint::capture(&params, &modal);
        let dims = ModelDims::new(3, 2, 3, 2);
        let mut other =
            GateParameters::new(dims, Granularity::Edge, &SamplerConfig::default()).unwrap();
        let mut other_modal = ModalStore::zeros(dims);
        assert!(saved.restore(&mut other, &mut other_modal).is_err());
        // Nothing was written.
        assert!(other_modal.stream_tensor().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_load_or_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let (mut params, mut modal) = state();
        assert!(!Checkpoint::load_or_fresh(&path, &mut params, &mut modal).unwrap());

        modal.attn_tensor_mut().fill(1.5);
        Checkpoint::capture(&params, &modal).save(&path).unwrap();
        let (mut fresh, mut fresh_modal) = state();
        assert!(Checkpoint::load_or_fresh(&path, &mut fresh, &mut fresh_modal).unwrap());
        assert_eq!(fresh_modal.attn_tensor(), modal.attn_tensor());
    }
}
