//! Frozen model contract.
//!
//! The pretrained transformer is an external collaborator. It exposes named
//! interception points and calls an [`Interceptor`] at each of them during the
//! forward pass; during the backward pass it calls
//! [`Interceptor::intercept_backward`] at the same points in reverse order so
//! that replacements can contribute their vector-Jacobian product. The model
//! weights never change.

use std::fmt;

use ndarray::{Array, Array2, Array3, Array4, ArrayD, Axis, Dimension};
use serde::{Deserialize, Serialize};

use crate::error::{CircuitError, Result};
use crate::graph::{Channel, ModelDims};

/// Which rows of a pass are gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Unedited forward pass; interceptors must not modify activations.
    Clean,
    /// Every row is a gated sample.
    Gated,
    /// The first `batch_size` rows are clean, the remaining rows gated.
    Fused,
}

/// Named activation sites of the frozen model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InterceptionPoint {
    /// Token embedding, `[rows, seq, d_model]`.
    Embed,
    /// Per-head attention input for one channel, `[rows, seq, heads, d_model]`.
    AttnIn {
        /// Block index.
        layer: usize,
        /// Query, key or value.
        channel: Channel,
    },
    /// Per-head attention result before the output projection,
    /// `[rows, seq, heads, d_head]`.
    AttnOut {
        /// Block index.
        layer: usize,
    },
    /// MLP input, `[rows, seq, d_model]`.
    MlpIn {
        /// Block index.
        layer: usize,
    },
    /// MLP output, `[rows, seq, d_model]`.
    MlpOut {
        /// Block index.
        layer: usize,
    },
    /// Residual stream feeding the readout, `[rows, seq, d_model]`. The model
    /// selects the last token of each row after this point.
    FinalResid,
}

impl InterceptionPoint {
    /// Block index of the point, `None` for `Embed` and `FinalResid`.
    pub fn layer(&self) -> Option<usize> {
        match *self {
            InterceptionPoint::AttnIn { layer, .. }
            | InterceptionPoint::AttnOut { layer }
            | InterceptionPoint::MlpIn { layer }
            | InterceptionPoint::MlpOut { layer } => Some(layer),
            InterceptionPoint::Embed | InterceptionPoint::FinalResid => None,
        }
    }
}

impl fmt::Display for InterceptionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptionPoint::Embed => write!(f, "embed"),
            InterceptionPoint::AttnIn { layer, channel } => {
                write!(f, "blocks.{}.attn.{}_in", layer, channel)
            }
            InterceptionPoint::AttnOut { layer } => write!(f, "blocks.{}.attn.z", layer),
            InterceptionPoint::MlpIn { layer } => write!(f, "blocks.{}.mlp_in", layer),
            InterceptionPoint::MlpOut { layer } => write!(f, "blocks.{}.mlp_out", layer),
            InterceptionPoint::FinalResid => write!(f, "final_resid"),
        }
    }
}

/// Pass-scoped information shared with every interception callback.
///
/// Row layout: in fused mode rows `0..batch_size` are clean and gated rows
/// follow; gated rows are sample-major, so gated row `g` belongs to sample
/// `g / batch_size` and batch example `g % batch_size`.
#[derive(Debug, Clone)]
pub struct PassContext {
    mode: ExecutionMode,
    batch_size: usize,
    sample_count: usize,
    last_token: Array2<f32>,
}

impl PassContext {
    /// Build a context from per-example last-token positions.
    pub fn new(
        mode: ExecutionMode,
        sample_count: usize,
        seq_len: usize,
        last_token_positions: &[usize],
    ) -> Result<Self> {
        let batch_size = last_token_positions.len();
        if batch_size == 0 || seq_len == 0 {
            return Err(CircuitError::config("pass needs at least one example and one position"));
        }
        if mode != ExecutionMode::Clean && sample_count == 0 {
            return Err(CircuitError::config("gated passes need at least one sample"));
        }
        let mut last_token = Array2::zeros((batch_size, seq_len));
        for (b, &pos) in last_token_positions.iter().enumerate() {
            if pos >= seq_len {
                return Err(CircuitError::config(format!(
                    "last token position {} outside sequence of length {}",
                    pos, seq_len
                )));
            }
            last_token[[b, pos]] = 1.0;
        }
        Ok(Self {
            mode,
            batch_size,
            sample_count,
            last_token,
        })
    }

    /// Same batch in a different mode.
    pub fn with_mode(&self, mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..self.clone()
        }
    }

    /// Execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Number of distinct examples.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Gated replicas per example.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Sequence length.
    pub fn seq_len(&self) -> usize {
        self.last_token.ncols()
    }

    /// One-hot last-token mask, `[batch, seq]`.
    pub fn last_token_mask(&self) -> &Array2<f32> {
        &self.last_token
    }

    /// Total rows the model runs.
    pub fn rows(&self) -> usize {
        self.clean_rows() + self.gated_rows()
    }

    /// Index of the first gated row.
    pub fn gated_offset(&self) -> usize {
        match self.mode {
            ExecutionMode::Fused => self.batch_size,
            _ => 0,
        }
    }

    /// Number of gated rows.
    pub fn gated_rows(&self) -> usize {
        match self.mode {
            ExecutionMode::Clean => 0,
            _ => self.batch_size * self.sample_count,
        }
    }

    /// Rows that carry unedited activations.
    pub fn clean_rows(&self) -> usize {
        match self.mode {
            ExecutionMode::Gated => 0,
            ExecutionMode::Clean => self.batch_size,
            ExecutionMode::Fused => self.batch_size,
        }
    }

    /// Batch example a row was replicated from.
    pub fn batch_row(&self, row: usize) -> usize {
        row % self.batch_size
    }

    /// Replicate `[batch, seq]` tokens to the pass row layout.
    pub fn replicate_tokens(&self, tokens: &Array2<usize>) -> Result<Array2<usize>> {
        if tokens.dim() != self.last_token.dim() {
            return Err(CircuitError::shape_mismatch(
                "tokens",
                self.last_token.shape(),
                tokens.shape(),
            ));
        }
        let mut out = Array2::zeros((self.rows(), self.seq_len()));
        for (r, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
            row.assign(&tokens.row(self.batch_row(r)));
        }
        Ok(out)
    }

    /// Select the last token of every row: `[rows, seq, d] -> [rows, d]`.
    pub fn select_last_token(&self, x: &Array3<f32>) -> Result<Array2<f32>> {
        let (rows, seq, d) = x.dim();
        if rows != self.rows() || seq != self.seq_len() {
            return Err(CircuitError::shape_mismatch(
                "final residual",
                &[self.rows(), self.seq_len(), d],
                x.shape(),
            ));
        }
        let mut out = Array2::zeros((rows, d));
        for r in 0..rows {
            let weights = self.last_token.row(self.batch_row(r));
            out.row_mut(r).assign(&weights.dot(&x.index_axis(Axis(0), r)));
        }
        Ok(out)
    }

    /// Transpose of [`PassContext::select_last_token`].
    pub fn scatter_last_token(&self, grad: &Array2<f32>) -> Array3<f32> {
        let (rows, d) = grad.dim();
        let seq = self.seq_len();
        let mut out = Array3::zeros((rows, seq, d));
        for r in 0..rows {
            let weights = self.last_token.row(self.batch_row(r));
            for s in 0..seq {
                if weights[s] != 0.0 {
                    out.index_axis_mut(Axis(0), r)
                        .row_mut(s)
                        .scaled_add(weights[s], &grad.row(r));
                }
            }
        }
        out
    }
}

/// Fixed per-head output projection of every attention block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputProjection {
    /// `W_O`, `[layers, heads, d_head, d_model]`.
    pub weight: Array4<f32>,
    /// `b_O`, `[layers, d_model]`.
    pub bias: Array2<f32>,
}

impl OutputProjection {
    /// Check both tensors against the model dimensions.
    pub fn validate(&self, dims: &ModelDims) -> Result<()> {
        let expected = [dims.n_layers, dims.n_heads, dims.d_head, dims.d_model];
        if self.weight.shape() != expected {
            return Err(CircuitError::shape_mismatch("W_O", &expected, self.weight.shape()));
        }
        let expected = [dims.n_layers, dims.d_model];
        if self.bias.shape() != expected {
            return Err(CircuitError::shape_mismatch("b_O", &expected, self.bias.shape()));
        }
        Ok(())
    }
}

/// Callback invoked at every interception point.
pub trait Interceptor {
    /// Receive the natural activation and return its replacement (same shape).
    fn intercept(
        &mut self,
        point: InterceptionPoint,
        activation: ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<ArrayD<f32>>;

    /// Receive the gradient with respect to the replacement returned at
    /// `point` and return the gradient with respect to the natural activation.
    fn intercept_backward(
        &mut self,
        _point: InterceptionPoint,
        grad: ArrayD<f32>,
        _ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        Ok(grad)
    }
}

/// Interceptor that leaves every activation untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Interceptor for Passthrough {
    fn intercept(
        &mut self,
        _point: InterceptionPoint,
        activation: ArrayD<f32>,
        _ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        Ok(activation)
    }
}

/// A frozen pretrained transformer.
pub trait FrozenModel {
    /// Whatever the model keeps from a forward pass to run its backward pass.
    type Tape;

    /// Layout hyperparameters.
    fn dims(&self) -> ModelDims;

    /// Vocabulary size of the logits.
    fn vocab_size(&self) -> usize;

    /// Attention output projection.
    fn output_projection(&self) -> &OutputProjection;

    /// Run the model on `[batch, seq]` tokens replicated to the row layout of
    /// `ctx`, returning last-token logits `[rows, vocab]`.
    fn forward(
        &self,
        tokens: &Array2<usize>,
        ctx: &PassContext,
        interceptor: &mut dyn Interceptor,
    ) -> Result<(Array2<f32>, Self::Tape)>;

    /// Propagate `grad_logits` back through the pass recorded in `tape`,
    /// invoking the interceptor's backward hooks in reverse order.
    fn backward(
        &self,
        tape: &Self::Tape,
        grad_logits: &Array2<f32>,
        ctx: &PassContext,
        interceptor: &mut dyn Interceptor,
    ) -> Result<()>;
}

/// Convert a dynamic-rank tensor returned by an interceptor to a fixed rank,
/// checking its shape against `expected`.
pub fn fixed<D: Dimension>(
    tensor: ArrayD<f32>,
    point: InterceptionPoint,
    expected: &[usize],
) -> Result<Array<f32, D>> {
    if tensor.shape() != expected {
        return Err(CircuitError::shape_mismatch(point.to_string(), expected, tensor.shape()));
    }
    Ok(tensor.into_dimensionality::<D>()?)
}
