//! Hard-concrete (stretched and clamped sigmoid) gates.
//!
//! Each gate entry owns a `(location, temperature)` pair. A draw is
//!
//! ```text
//! s    = sigmoid((ln u - ln(1 - u) + location) / temperature)
//! gate = clamp(s * (right - left) + left, 0, 1)
//! ```
//!
//! with fresh `u ~ U(0, 1)` per row, so gates hit exactly 0 and 1 with
//! positive probability. The expected number of open gates has the closed
//! form `sigmoid(location - relu(temperature) * ln(-left / right))`.

use std::collections::BTreeMap;

use ndarray::{ArrayD, Axis, IxDyn, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{with_rows, GateGradients, MaskSampler, SampledMask};
use crate::circuit::ContinuousMask;
use crate::config::SamplerConfig;
use crate::error::{CircuitError, Result};
use crate::graph::{GateKey, Granularity, ModelDims};

/// Noise is kept away from 0 and 1 so the logistic transform stays finite.
const NOISE_EPS: f32 = 1e-6;

/// Learnable parameters of one gate tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateLayer {
    /// Gate logits.
    pub location: ArrayD<f32>,
    /// Relaxation temperatures.
    pub temperature: ArrayD<f32>,
}

impl GateLayer {
    fn zeros(shape: &[usize]) -> Self {
        Self {
            location: ArrayD::zeros(IxDyn(shape)),
            temperature: ArrayD::zeros(IxDyn(shape)),
        }
    }
}

/// Noise realized by one draw, kept for the backward pass.
#[derive(Debug, Clone)]
pub struct GateDraw {
    noise: BTreeMap<GateKey, ArrayD<f32>>,
}

/// Gradients with respect to gate locations and temperatures.
#[derive(Debug, Clone)]
pub struct GateParameterGradients {
    layers: BTreeMap<GateKey, GateLayer>,
}

impl GateParameterGradients {
    /// Zero gradients for every tensor of `params`.
    pub fn zeros(params: &GateParameters) -> Self {
        Self {
            layers: params
                .layers
                .iter()
                .map(|(key, layer)| (*key, GateLayer::zeros(layer.location.shape())))
                .collect(),
        }
    }

    /// Gradient tensors for `key`.
    pub fn get(&self, key: GateKey) -> Result<&GateLayer> {
        self.layers
            .get(&key)
            .ok_or_else(|| CircuitError::config(format!("no parameter gradient for {}", key)))
    }

    /// Mutable gradient tensors for `key`.
    pub fn get_mut(&mut self, key: GateKey) -> Result<&mut GateLayer> {
        self.layers
            .get_mut(&key)
            .ok_or_else(|| CircuitError::config(format!("no parameter gradient for {}", key)))
    }

    /// Accumulate `other` into `self`.
    pub fn add_assign(&mut self, other: &GateParameterGradients) -> Result<()> {
        for (key, grad) in &other.layers {
            let mine = self.get_mut(*key)?;
            mine.location += &grad.location;
            mine.temperature += &grad.temperature;
        }
        Ok(())
    }

    /// Iterate over all tensors.
    pub fn iter(&self) -> impl Iterator<Item = (&GateKey, &GateLayer)> {
        self.layers.iter()
    }
}

/// Summary of the temperature distribution used for training diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureStats {
    /// Mean of `relu(temperature)`.
    pub mean: f32,
    /// Mean excess above 1 among temperatures above 1, plus one.
    pub cond: f32,
    /// Mean of `2 * sigmoid(relu(temperature)) - 1`.
    pub count: f32,
}

/// Gate parameters of every gate tensor at one granularity.
#[derive(Debug, Clone)]
pub struct GateParameters {
    dims: ModelDims,
    granularity: Granularity,
    left: f32,
    right: f32,
    reset_temperature: f32,
    layers: BTreeMap<GateKey, GateLayer>,
}

impl GateParameters {
    /// Fresh parameters at the configured initial location and temperature.
    pub fn new(dims: ModelDims, granularity: Granularity, config: &SamplerConfig) -> Result<Self> {
        dims.validate()?;
        if !(config.stretch_left < 0.0 && config.stretch_right > 1.0) {
            return Err(CircuitError::config(format!(
                "stretch endpoints ({}, {}) must straddle [0, 1]",
                config.stretch_left, config.stretch_right
            )));
        }
        let layers = GateKey::all(&dims, granularity)
            .into_iter()
            .map(|key| {
                let shape = IxDyn(&key.shape(&dims));
                let layer = GateLayer {
                    location: ArrayD::from_elem(shape.clone(), config.init_location),
                    temperature: ArrayD::from_elem(shape, config.init_temperature),
                };
                (key, layer)
            })
            .collect();
        Ok(Self {
            dims,
            granularity,
            left: config.stretch_left,
            right: config.stretch_right,
            reset_temperature: config.reset_temperature,
            layers,
        })
    }

    /// Model dimensions.
    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }

    /// Edge or vertex gates.
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Stretch endpoints `(left, right)`.
    pub fn stretch(&self) -> (f32, f32) {
        (self.left, self.right)
    }

    /// Parameters of one gate tensor.
    pub fn layer(&self, key: GateKey) -> Result<&GateLayer> {
        self.layers
            .get(&key)
            .ok_or_else(|| CircuitError::config(format!("no gate parameters for {}", key)))
    }

    /// Mutable parameters of one gate tensor.
    pub fn layer_mut(&mut self, key: GateKey) -> Result<&mut GateLayer> {
        self.layers
            .get_mut(&key)
            .ok_or_else(|| CircuitError::config(format!("no gate parameters for {}", key)))
    }

    /// Iterate over all gate tensors.
    pub fn iter(&self) -> impl Iterator<Item = (&GateKey, &GateLayer)> {
        self.layers.iter()
    }

    /// Iterate mutably over all gate tensors.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&GateKey, &mut GateLayer)> {
        self.layers.iter_mut()
    }

    /// Total number of gates.
    pub fn len(&self) -> usize {
        self.layers.values().map(|l| l.location.len()).sum()
    }

    /// Whether there are no gates at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn log_ratio(&self) -> f32 {
        (-self.left / self.right).ln()
    }

    /// Draw one gate value per row for every gate.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        rows: usize,
    ) -> Result<(SampledMask, GateDraw)> {
        let uniform = Uniform::new(NOISE_EPS, 1.0 - NOISE_EPS);
        let mut mask = SampledMask::new(rows);
        let mut noise = BTreeMap::new();
        for (key, layer) in &self.layers {
            let shape = IxDyn(&with_rows(rows, layer.location.shape()));
            let draw = ArrayD::from_shape_simple_fn(shape, || {
                let u: f32 = uniform.sample(rng);
                u.ln() - (1.0 - u).ln()
            });
            let mut gate = draw.clone();
            for mut row in gate.axis_iter_mut(Axis(0)) {
                Zip::from(&mut row)
                    .and(&layer.location)
                    .and(&layer.temperature)
                    .for_each(|g, &loc, &temp| {
                        let s = hard_sigmoid(*g + loc, temp);
                        *g = (s * (self.right - self.left) + self.left).clamp(0.0, 1.0);
                    });
            }
            mask.insert(*key, gate)?;
            noise.insert(*key, draw);
        }
        Ok((mask, GateDraw { noise }))
    }

    /// Per-gate probability of being open.
    pub fn complexity(&self) -> BTreeMap<GateKey, ArrayD<f32>> {
        let k = self.log_ratio();
        self.layers
            .iter()
            .map(|(key, layer)| {
                let c = Zip::from(&layer.location)
                    .and(&layer.temperature)
                    .map_collect(|&loc, &temp| sigmoid(loc - temp.max(0.0) * k));
                (*key, c)
            })
            .collect()
    }

    /// Sum of [`GateParameters::complexity`] over every gate.
    pub fn complexity_loss(&self) -> f32 {
        self.complexity().values().map(|c| c.sum()).sum()
    }

    /// Chain `dloss/dcomplexity` through the closed-form complexity.
    pub fn complexity_backward(
        &self,
        grad_complexity: &BTreeMap<GateKey, ArrayD<f32>>,
    ) -> Result<GateParameterGradients> {
        let k = self.log_ratio();
        let mut grads = GateParameterGradients::zeros(self);
        for (key, layer) in &self.layers {
            let upstream = grad_complexity
                .get(key)
                .ok_or_else(|| {
                    CircuitError::config(format!("no complexity gradient for {}", key))
                })?;
            let out = grads.get_mut(*key)?;
            Zip::from(&mut out.location)
                .and(&mut out.temperature)
                .and(upstream)
                .and(&layer.location)
                .and(&layer.temperature)
                .for_each(|dloc, dtemp, &g, &loc, &temp| {
                    let c = sigmoid(loc - temp.max(0.0) * k);
                    let dc = g * c * (1.0 - c);
                    *dloc = dc;
                    *dtemp = if temp > 0.0 { -dc * k } else { 0.0 };
                });
        }
        Ok(grads)
    }

    /// Chain gradients with respect to sampled gate values through the draw.
    /// Gates clamped at 0 or 1 pass no gradient.
    pub fn backward(
        &self,
        draw: &GateDraw,
        grads: &GateGradients,
    ) -> Result<GateParameterGradients> {
        let span = self.right - self.left;
        let mut out = GateParameterGradients::zeros(self);
        for (key, layer) in &self.layers {
            let noise = draw
                .noise
                .get(key)
                .ok_or_else(|| CircuitError::config(format!("draw has no noise for {}", key)))?;
            let upstream = grads.get(*key)?;
            if upstream.shape() != noise.shape() {
                return Err(CircuitError::shape_mismatch(
                    key.to_string(),
                    noise.shape(),
                    upstream.shape(),
                ));
            }
            let acc = out.get_mut(*key)?;
            for (noise_row, grad_row) in noise.axis_iter(Axis(0)).zip(upstream.axis_iter(Axis(0))) {
                Zip::from(&mut acc.location)
                    .and(&mut acc.temperature)
                    .and(&noise_row)
                    .and(&grad_row)
                    .and(&layer.location)
                    .and(&layer.temperature)
                    .for_each(|dloc, dtemp, &n, &g, &loc, &temp| {
                        let x = (n + loc) / temp;
                        let s = sigmoid(x);
                        let pre = s * span + self.left;
                        if pre <= 0.0 || pre >= 1.0 {
                            return;
                        }
                        let dx = g * span * s * (1.0 - s);
                        *dloc += dx / temp;
                        *dtemp -= dx * x / temp;
                    });
            }
        }
        Ok(out)
    }

    /// Reset non-finite temperatures and locations. Returns how many entries
    /// were reset.
    pub fn fix_nans(&mut self) -> usize {
        let reset_temperature = self.reset_temperature;
        let mut reset = 0;
        for (key, layer) in self.layers.iter_mut() {
            let mut here = 0;
            layer.temperature.mapv_inplace(|t| {
                if t.is_finite() {
                    t
                } else {
                    here += 1;
                    reset_temperature
                }
            });
            layer.location.mapv_inplace(|l| {
                if l.is_finite() {
                    l
                } else {
                    here += 1;
                    0.0
                }
            });
            if here > 0 {
                warn!(gate = %key, reset = here, "non-finite gate parameters reset");
            }
            reset += here;
        }
        reset
    }

    /// Gate locations as keep scores for discretization.
    pub fn continuous_mask(&self) -> ContinuousMask {
        let scores = self
            .layers
            .iter()
            .map(|(key, layer)| (*key, layer.location.clone()))
            .collect();
        ContinuousMask::from_scores(self.dims, self.granularity, scores)
    }

    /// Temperature diagnostics. Non-finite aggregates are coerced to zero.
    pub fn temperature_stats(&self) -> TemperatureStats {
        let n = self.len().max(1) as f32;
        let mut relu_sum = 0.0f32;
        let mut excess = 0.0f32;
        let mut above = 0usize;
        let mut count = 0.0f32;
        for layer in self.layers.values() {
            for &t in layer.temperature.iter() {
                let r = t.max(0.0);
                relu_sum += r;
                count += 2.0 * sigmoid(r) - 1.0;
                if t > 1.0 {
                    excess += t - 1.0;
                    above += 1;
                }
            }
        }
        let cond = excess / above as f32;
        TemperatureStats {
            mean: finite_or_zero(relu_sum / n),
            cond: finite_or_zero(cond) + 1.0,
            count: finite_or_zero(count / n),
        }
    }
}

/// Training sampler: hard-concrete draws from owned gate parameters.
#[derive(Debug)]
pub struct HardConcreteSampler {
    params: GateParameters,
    rng: StdRng,
    last_draw: Option<GateDraw>,
}

impl HardConcreteSampler {
    /// Wrap parameters; `seed` makes draws reproducible.
    pub fn new(params: GateParameters, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            params,
            rng,
            last_draw: None,
        }
    }

    /// Gate parameters.
    pub fn params(&self) -> &GateParameters {
        &self.params
    }

    /// Mutable gate parameters (optimizer steps only).
    pub fn params_mut(&mut self) -> &mut GateParameters {
        &mut self.params
    }

    /// Backward through the most recent draw.
    pub fn backward(&self, grads: &GateGradients) -> Result<GateParameterGradients> {
        let draw = self
            .last_draw
            .as_ref()
            .ok_or_else(|| CircuitError::config("backward called before any draw"))?;
        self.params.backward(draw, grads)
    }
}

impl MaskSampler for HardConcreteSampler {
    fn granularity(&self) -> Granularity {
        self.params.granularity
    }

    fn sample(&mut self, rows: usize) -> Result<SampledMask> {
        let (mask, draw) = self.params.sample(&mut self.rng, rows)?;
        debug!(rows, gates = self.params.len(), "hard-concrete mask drawn");
        self.last_draw = Some(draw);
        Ok(mask)
    }
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// `sigmoid(logit / temperature)`, falling back to a step at zero
/// temperature (`0 / 0` included).
fn hard_sigmoid(logit: f32, temperature: f32) -> f32 {
    let x = logit / temperature;
    if x.is_finite() {
        sigmoid(x)
    } else {
        f32::from(logit > 0.0)
    }
}

fn finite_or_zero(x: f32) -> f32 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}
