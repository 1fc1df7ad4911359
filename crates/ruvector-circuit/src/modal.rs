//! Learned baseline ("modal") activations.
//!
//! Every producer has one constant activation that replaces its output when a
//! gate closes. Residual-stream producers (embedding and MLPs) store a
//! `d_model` vector; attention heads store a `d_head` vector that is projected
//! through the head's output projection when it is read by a consumer.

use ndarray::{s, Array2, Array3, ArrayD, ArrayView1, Axis};
use tracing::debug;

use crate::error::{CircuitError, Result};
use crate::graph::ModelDims;
use crate::model::{ExecutionMode, FrozenModel, InterceptionPoint, Interceptor, PassContext};
use crate::task::Batch;

/// Baseline activation of every producer.
#[derive(Debug, Clone, PartialEq)]
pub struct ModalStore {
    dims: ModelDims,
    /// `[n_layers + 1, d_model]`; row 0 is the embedding, row `l + 1` MLP `l`.
    stream: Array2<f32>,
    /// `[n_layers, n_heads, d_head]`.
    attn: Array3<f32>,
}

impl ModalStore {
    /// All-zero baselines (zero ablation).
    pub fn zeros(dims: ModelDims) -> Self {
        Self {
            dims,
            stream: Array2::zeros((dims.stream_producers(), dims.d_model)),
            attn: Array3::zeros((dims.n_layers, dims.n_heads, dims.d_head)),
        }
    }

    /// Baselines from explicit tensors.
    pub fn new(dims: ModelDims, stream: Array2<f32>, attn: Array3<f32>) -> Result<Self> {
        let expected = [dims.stream_producers(), dims.d_model];
        if stream.shape() != expected {
            return Err(CircuitError::shape_mismatch("modal stream", &expected, stream.shape()));
        }
        let expected = [dims.n_layers, dims.n_heads, dims.d_head];
        if attn.shape() != expected {
            return Err(CircuitError::shape_mismatch("modal attention", &expected, attn.shape()));
        }
        Ok(Self { dims, stream, attn })
    }

    /// Mean clean output of every producer over the given batches, excluding
    /// sequence position 0.
    pub fn estimate<M: FrozenModel>(model: &M, batches: &[Batch]) -> Result<Self> {
        let dims = model.dims();
        let mut collector = MeanCollector::new(dims);
        for batch in batches {
            let ctx = PassContext::new(
                ExecutionMode::Clean,
                1,
                batch.tokens.ncols(),
                &batch.last_token_positions,
            )?;
            model.forward(&batch.tokens, &ctx, &mut collector)?;
        }
        let store = collector.finish()?;
        debug!(batches = batches.len(), "modal values estimated");
        Ok(store)
    }

    /// Model dimensions.
    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }

    /// Baseline of residual-stream producer `index` (0 = embedding).
    pub fn stream(&self, index: usize) -> ArrayView1<'_, f32> {
        self.stream.row(index)
    }

    /// Baseline of attention head `head` in block `layer` (head space).
    pub fn attn(&self, layer: usize, head: usize) -> ArrayView1<'_, f32> {
        self.attn.slice(s![layer, head, ..])
    }

    /// All residual-stream baselines.
    pub fn stream_tensor(&self) -> &Array2<f32> {
        &self.stream
    }

    /// All attention baselines.
    pub fn attn_tensor(&self) -> &Array3<f32> {
        &self.attn
    }

    /// Mutable residual-stream baselines (optimizer steps only).
    pub fn stream_tensor_mut(&mut self) -> &mut Array2<f32> {
        &mut self.stream
    }

    /// Mutable attention baselines (optimizer steps only).
    pub fn attn_tensor_mut(&mut self) -> &mut Array3<f32> {
        &mut self.attn
    }
}

/// Gradient of the loss with respect to every baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct ModalGradients {
    /// `[n_layers + 1, d_model]`.
    pub stream: Array2<f32>,
    /// `[n_layers, n_heads, d_head]`.
    pub attn: Array3<f32>,
}

impl ModalGradients {
    /// Zero gradients for `dims`.
    pub fn zeros(dims: &ModelDims) -> Self {
        Self {
            stream: Array2::zeros((dims.stream_producers(), dims.d_model)),
            attn: Array3::zeros((dims.n_layers, dims.n_heads, dims.d_head)),
        }
    }

    /// Accumulate `other` into `self`.
    pub fn add_assign(&mut self, other: &ModalGradients) {
        self.stream += &other.stream;
        self.attn += &other.attn;
    }
}

/// Running sums of producer outputs over positions >= 1.
struct MeanCollector {
    dims: ModelDims,
    stream: Array2<f32>,
    attn: Array3<f32>,
    stream_count: Vec<usize>,
    attn_count: Vec<usize>,
}

impl MeanCollector {
    fn new(dims: ModelDims) -> Self {
        Self {
            dims,
            stream: Array2::zeros((dims.stream_producers(), dims.d_model)),
            attn: Array3::zeros((dims.n_layers, dims.n_heads, dims.d_head)),
            stream_count: vec![0; dims.stream_producers()],
            attn_count: vec![0; dims.n_layers],
        }
    }

    fn finish(mut self) -> Result<ModalStore> {
        for (j, &n) in self.stream_count.iter().enumerate() {
            if n == 0 {
                return Err(CircuitError::config(
                    "no positions past the first token to estimate baselines from",
                ));
            }
            self.stream.row_mut(j).mapv_inplace(|x| x / n as f32);
        }
        for (l, &n) in self.attn_count.iter().enumerate() {
            if n == 0 {
                return Err(CircuitError::config(
                    "no positions past the first token to estimate baselines from",
                ));
            }
            self.attn.index_axis_mut(Axis(0), l).mapv_inplace(|x| x / n as f32);
        }
        ModalStore::new(self.dims, self.stream, self.attn)
    }
}

impl Interceptor for MeanCollector {
    fn intercept(
        &mut self,
        point: InterceptionPoint,
        activation: ArrayD<f32>,
        _ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        let seq = activation.shape().get(1).copied().unwrap_or(0);
        if seq < 2 {
            return Ok(activation);
        }
        let rows = activation.shape()[0];
        let tail = activation.slice_axis(Axis(1), (1..seq).into());
        let n = rows * (seq - 1);
        match point {
            InterceptionPoint::Embed | InterceptionPoint::MlpOut { .. } => {
                let j = match point {
                    InterceptionPoint::MlpOut { layer } => layer + 1,
                    _ => 0,
                };
                let flat = tail.to_shape((n, self.dims.d_model))?;
                let mut acc = self.stream.row_mut(j);
                acc += &flat.sum_axis(Axis(0));
                self.stream_count[j] += n;
            }
            InterceptionPoint::AttnOut { layer } => {
                let flat = tail.to_shape((n, self.dims.n_heads, self.dims.d_head))?;
                let mut acc = self.attn.index_axis_mut(Axis(0), layer);
                acc += &flat.sum_axis(Axis(0));
                self.attn_count[layer] += n;
            }
            _ => {}
        }
        Ok(activation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::LinearTransformer;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_new_validates_shapes() {
        let dims = ModelDims::new(1, 2, 3, 2);
        assert!(ModalStore::new(dims, Array2::zeros((2, 3)), Array3::zeros((1, 2, 2))).is_ok());
        assert!(ModalStore::new(dims, Array2::zeros((1, 3)), Array3::zeros((1, 2, 2))).is_err());
        assert!(ModalStore::new(dims, Array2::zeros((2, 3)), Array3::zeros((1, 2, 3))).is_err());
    }

    #[test]
    fn test_estimate_matches_manual_mean() {
        let dims = ModelDims::new(1, 2, 4, 2);
        let model = LinearTransformer::random(dims, 5, 6, 3);
        let batch = Batch {
            tokens: array![[0usize, 1, 2], [3, 4, 0]],
            last_token_positions: vec![2, 2],
        };
        let store = ModalStore::estimate(&model, std::slice::from_ref(&batch)).unwrap();

        // Embedding baseline is the mean embedding of tokens at positions 1 and 2.
        let embed = model.embedding();
        let expected = (&embed.row(1) + &embed.row(2) + &embed.row(4) + &embed.row(0)) / 4.0;
        for (a, b) in store.stream(0).iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }
}
