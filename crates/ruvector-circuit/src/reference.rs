//! Small deterministic transformer implementing [`FrozenModel`].
//!
//! Each block has per-head query/key/value projections, a causal
//! "bilinear" attention `z = q ⊙ k + mean_{s ≤ t} v_s`, the usual output
//! projection and a one-hidden-layer `tanh` MLP. It is not meant to be a
//! good language model; it gives tests and benches a model whose residual
//! stream decomposes exactly into embedding, head and MLP contributions and
//! whose backward pass is exact.

use ndarray::{s, Array2, Array3, Array4, Array5, Axis, Ix3, Ix4};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{CircuitError, Result};
use crate::graph::{Channel, ModelDims};
use crate::model::{
    fixed, FrozenModel, InterceptionPoint, Interceptor, OutputProjection, PassContext,
};
use crate::tensor::{heads_matmul, heads_matmul_t, positions_matmul, xavier_normal};

/// Reference transformer with randomly initialized frozen weights.
#[derive(Debug, Clone)]
pub struct LinearTransformer {
    dims: ModelDims,
    embed: Array2<f32>,
    /// `[layers, 3, heads, d_model, d_head]`, channels in q/k/v order.
    qkv: Array5<f32>,
    projection: OutputProjection,
    w_in: Array3<f32>,
    w_out: Array3<f32>,
    unembed: Array2<f32>,
}

/// Intermediate values kept for [`LinearTransformer`]'s backward pass.
#[derive(Debug, Clone)]
pub struct LinearTape {
    layers: Vec<BlockTape>,
}

#[derive(Debug, Clone)]
struct BlockTape {
    q: Array4<f32>,
    k: Array4<f32>,
    hidden: Array3<f32>,
}

impl LinearTransformer {
    /// Xavier-initialized model with `vocab` tokens and MLP width `d_mlp`.
    pub fn random(dims: ModelDims, vocab: usize, d_mlp: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let (n, h, d, dh) = (dims.n_layers, dims.n_heads, dims.d_model, dims.d_head);
        Self {
            dims,
            embed: xavier_normal(&mut rng, (vocab, d), vocab, d),
            qkv: xavier_normal(&mut rng, (n, 3, h, d, dh), d, dh),
            projection: OutputProjection {
                weight: xavier_normal(&mut rng, (n, h, dh, d), dh * h, d),
                bias: xavier_normal(&mut rng, (n, d), d, d).mapv(|b| 0.1 * b),
            },
            w_in: xavier_normal(&mut rng, (n, d, d_mlp), d, d_mlp),
            w_out: xavier_normal(&mut rng, (n, d_mlp, d), d_mlp, d),
            unembed: xavier_normal(&mut rng, (d, vocab), d, vocab),
        }
    }

    /// Token embedding matrix, `[vocab, d_model]`.
    pub fn embedding(&self) -> &Array2<f32> {
        &self.embed
    }

    /// Unembedding matrix, `[d_model, vocab]`.
    pub fn unembedding(&self) -> &Array2<f32> {
        &self.unembed
    }

    fn embed_tokens(&self, tokens: &Array2<usize>) -> Result<Array3<f32>> {
        let (rows, seq) = tokens.dim();
        let mut out = Array3::zeros((rows, seq, self.dims.d_model));
        for ((r, t), &tok) in tokens.indexed_iter() {
            if tok >= self.embed.nrows() {
                return Err(CircuitError::Model(format!(
                    "token {} outside vocabulary of {}",
                    tok,
                    self.embed.nrows()
                )));
            }
            out.slice_mut(s![r, t, ..]).assign(&self.embed.row(tok));
        }
        Ok(out)
    }

    /// Intercepted per-head input of one channel projected to `[rows, seq, H, d_head]`.
    fn attn_input(
        &self,
        layer: usize,
        channel: Channel,
        broadcast: &Array4<f32>,
        ctx: &PassContext,
        interceptor: &mut dyn Interceptor,
    ) -> Result<Array4<f32>> {
        let point = InterceptionPoint::AttnIn { layer, channel };
        let input = interceptor.intercept(point, broadcast.clone().into_dyn(), ctx)?;
        let input = fixed::<Ix4>(input, point, broadcast.shape())?;
        heads_matmul(input.view(), self.qkv.slice(s![layer, channel_slot(channel), .., .., ..]))
    }

    fn broadcast_heads(&self, x: &Array3<f32>) -> Array4<f32> {
        let (rows, seq, d) = x.dim();
        let mut out = Array4::zeros((rows, seq, self.dims.n_heads, d));
        for h in 0..self.dims.n_heads {
            out.index_axis_mut(Axis(2), h).assign(x);
        }
        out
    }
}

fn channel_slot(channel: Channel) -> usize {
    match channel {
        Channel::Query => 0,
        Channel::Key => 1,
        Channel::Value | Channel::Single => 2,
    }
}

/// `out[t] = mean_{s <= t} x[s]` along the sequence axis.
fn causal_mean(x: &Array4<f32>) -> Array4<f32> {
    let mut out = x.clone();
    let seq = x.len_of(Axis(1));
    for t in 1..seq {
        let (prev, mut cur) = out.multi_slice_mut((s![.., t - 1, .., ..], s![.., t, .., ..]));
        cur.zip_mut_with(&prev, |c, &p| *c = (p * t as f32 + *c) / (t + 1) as f32);
    }
    out
}

/// Transpose of [`causal_mean`].
fn causal_mean_backward(grad: &Array4<f32>) -> Array4<f32> {
    let seq = grad.len_of(Axis(1));
    let mut out = Array4::zeros(grad.raw_dim());
    let mut running = Array3::<f32>::zeros(grad.index_axis(Axis(1), 0).raw_dim());
    for t in (0..seq).rev() {
        running.scaled_add(1.0 / (t + 1) as f32, &grad.index_axis(Axis(1), t));
        out.index_axis_mut(Axis(1), t).assign(&running);
    }
    out
}

impl FrozenModel for LinearTransformer {
    type Tape = LinearTape;

    fn dims(&self) -> ModelDims {
        self.dims
    }

    fn vocab_size(&self) -> usize {
        self.embed.nrows()
    }

    fn output_projection(&self) -> &OutputProjection {
        &self.projection
    }

    fn forward(
        &self,
        tokens: &Array2<usize>,
        ctx: &PassContext,
        interceptor: &mut dyn Interceptor,
    ) -> Result<(Array2<f32>, LinearTape)> {
        let rows_tokens = ctx.replicate_tokens(tokens)?;
        let (rows, seq) = rows_tokens.dim();
        let (d, heads, dh) = (self.dims.d_model, self.dims.n_heads, self.dims.d_head);
        let stream_shape = [rows, seq, d];

        let point = InterceptionPoint::Embed;
        let embedded = self.embed_tokens(&rows_tokens)?.into_dyn();
        let embedded = interceptor.intercept(point, embedded, ctx)?;
        let mut resid = fixed::<Ix3>(embedded, point, &stream_shape)?;

        let mut layers = Vec::with_capacity(self.dims.n_layers);
        for layer in 0..self.dims.n_layers {
            let broadcast = self.broadcast_heads(&resid);
            let q = self.attn_input(layer, Channel::Query, &broadcast, ctx, interceptor)?;
            let k = self.attn_input(layer, Channel::Key, &broadcast, ctx, interceptor)?;
            let v = self.attn_input(layer, Channel::Value, &broadcast, ctx, interceptor)?;
            let z = &q * &k + causal_mean(&v);

            let point = InterceptionPoint::AttnOut { layer };
            let z = interceptor.intercept(point, z.into_dyn(), ctx)?;
            let z = fixed::<Ix4>(z, point, &[rows, seq, heads, dh])?;
            let w_o = self.projection.weight.index_axis(Axis(0), layer);
            let per_head = heads_matmul(z.view(), w_o)?;
            resid = resid + per_head.sum_axis(Axis(2)) + self.projection.bias.row(layer);

            let point = InterceptionPoint::MlpIn { layer };
            let mlp_in = interceptor.intercept(point, resid.clone().into_dyn(), ctx)?;
            let mlp_in = fixed::<Ix3>(mlp_in, point, &stream_shape)?;
            let w_in = self.w_in.index_axis(Axis(0), layer);
            let hidden = positions_matmul(mlp_in.view(), w_in)?.mapv(f32::tanh);
            let mlp_out = positions_matmul(hidden.view(), self.w_out.index_axis(Axis(0), layer))?;

            let point = InterceptionPoint::MlpOut { layer };
            let mlp_out = interceptor.intercept(point, mlp_out.into_dyn(), ctx)?;
            let mlp_out = fixed::<Ix3>(mlp_out, point, &stream_shape)?;
            resid = resid + mlp_out;

            layers.push(BlockTape { q, k, hidden });
        }

        let point = InterceptionPoint::FinalResid;
        let final_resid = interceptor.intercept(point, resid.into_dyn(), ctx)?;
        let final_resid = fixed::<Ix3>(final_resid, point, &stream_shape)?;
        let logits = ctx.select_last_token(&final_resid)?.dot(&self.unembed);
        Ok((logits, LinearTape { layers }))
    }

    fn backward(
        &self,
        tape: &LinearTape,
        grad_logits: &Array2<f32>,
        ctx: &PassContext,
        interceptor: &mut dyn Interceptor,
    ) -> Result<()> {
        let rows = ctx.rows();
        let seq = ctx.seq_len();
        let (d, heads, dh) = (self.dims.d_model, self.dims.n_heads, self.dims.d_head);
        if grad_logits.dim() != (rows, self.vocab_size()) {
            return Err(CircuitError::shape_mismatch(
                "logit gradient",
                &[rows, self.vocab_size()],
                grad_logits.shape(),
            ));
        }
        if tape.layers.len() != self.dims.n_layers {
            return Err(CircuitError::Model("tape does not match the model depth".to_string()));
        }
        let stream_shape = [rows, seq, d];

        let grad_final = ctx.scatter_last_token(&grad_logits.dot(&self.unembed.t()));
        let point = InterceptionPoint::FinalResid;
        let mut grad_resid = fixed::<Ix3>(
            interceptor.intercept_backward(point, grad_final.into_dyn(), ctx)?,
            point,
            &stream_shape,
        )?;

        for layer in (0..self.dims.n_layers).rev() {
            let block = &tape.layers[layer];

            let point = InterceptionPoint::MlpOut { layer };
            let grad_out = fixed::<Ix3>(
                interceptor.intercept_backward(point, grad_resid.clone().into_dyn(), ctx)?,
                point,
                &stream_shape,
            )?;
            let grad_hidden =
                positions_matmul(grad_out.view(), self.w_out.index_axis(Axis(0), layer).t())?;
            let grad_pre = grad_hidden * block.hidden.mapv(|h| 1.0 - h * h);
            let grad_in =
                positions_matmul(grad_pre.view(), self.w_in.index_axis(Axis(0), layer).t())?;
            let point = InterceptionPoint::MlpIn { layer };
            let grad_in = interceptor.intercept_backward(point, grad_in.into_dyn(), ctx)?;
            let grad_in = fixed::<Ix3>(grad_in, point, &stream_shape)?;
            grad_resid = grad_resid + grad_in;

            // z feeds the residual through W_O of every head.
            let grad_z = heads_matmul_t(
                self.broadcast_heads(&grad_resid).view(),
                self.projection.weight.index_axis(Axis(0), layer),
            )?;
            let point = InterceptionPoint::AttnOut { layer };
            let grad_z = fixed::<Ix4>(
                interceptor.intercept_backward(point, grad_z.into_dyn(), ctx)?,
                point,
                &[rows, seq, heads, dh],
            )?;
            let grads = [&grad_z * &block.k, &grad_z * &block.q, causal_mean_backward(&grad_z)];

            let mut grad_inputs = Array3::<f32>::zeros((rows, seq, d));
            for channel in Channel::QKV.iter().rev() {
                let slot = channel_slot(*channel);
                let w = self.qkv.slice(s![layer, slot, .., .., ..]);
                let grad_x = heads_matmul_t(grads[slot].view(), w)?;
                let point = InterceptionPoint::AttnIn { layer, channel: *channel };
                let grad_x = fixed::<Ix4>(
                    interceptor.intercept_backward(point, grad_x.into_dyn(), ctx)?,
                    point,
                    &[rows, seq, heads, d],
                )?;
                grad_inputs += &grad_x.sum_axis(Axis(2));
            }
            grad_resid = grad_resid + grad_inputs;
        }

        let point = InterceptionPoint::Embed;
        interceptor.intercept_backward(point, grad_resid.into_dyn(), ctx)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionMode, Passthrough};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, ArrayD};

    /// Records the gradient that reaches the embedding.
    #[derive(Default)]
    struct EmbedRecorder {
        grad: Option<ArrayD<f32>>,
        shift: Option<(usize, usize, usize, f32)>,
    }

    impl Interceptor for EmbedRecorder {
        fn intercept(
            &mut self,
            point: InterceptionPoint,
            mut activation: ArrayD<f32>,
            _ctx: &PassContext,
        ) -> Result<ArrayD<f32>> {
            if let (InterceptionPoint::Embed, Some((r, t, i, eps))) = (point, self.shift) {
                activation[[r, t, i]] += eps;
            }
            Ok(activation)
        }

        fn intercept_backward(
            &mut self,
            point: InterceptionPoint,
            grad: ArrayD<f32>,
            _ctx: &PassContext,
        ) -> Result<ArrayD<f32>> {
            if point == InterceptionPoint::Embed {
                self.grad = Some(grad.clone());
            }
            Ok(grad)
        }
    }

    #[test]
    fn test_causal_mean_adjoint() {
        let x = Array4::from_shape_fn((1, 3, 1, 2), |(_, t, _, i)| (t * 2 + i) as f32);
        let y = Array4::from_shape_fn((1, 3, 1, 2), |(_, t, _, i)| 1.0 + (t + i) as f32 * 0.5);
        let lhs = (&causal_mean(&x) * &y).sum();
        let rhs = (&x * &causal_mean_backward(&y)).sum();
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-5);
        assert_eq!(causal_mean(&x).slice(s![0, 2, 0, ..]), array![2.0f32, 3.0]);
    }

    #[test]
    fn test_unknown_token_is_model_error() {
        let model = LinearTransformer::random(ModelDims::new(1, 1, 2, 2), 3, 2, 0);
        let ctx = PassContext::new(ExecutionMode::Clean, 1, 2, &[1]).unwrap();
        let err = model.forward(&array![[0usize, 5]], &ctx, &mut Passthrough).unwrap_err();
        assert!(matches!(err, CircuitError::Model(_)));
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let dims = ModelDims::new(2, 2, 3, 2);
        let model = LinearTransformer::random(dims, 5, 4, 11);
        let ctx = PassContext::new(ExecutionMode::Clean, 1, 3, &[2]).unwrap();
        let tokens = array![[1usize, 4, 2]];
        let weights = array![[0.3f32, -1.0, 0.5, 2.0, -0.2]];

        let mut recorder = EmbedRecorder::default();
        let (_, tape) = model.forward(&tokens, &ctx, &mut recorder).unwrap();
        model.backward(&tape, &weights, &ctx, &mut recorder).unwrap();
        let grad = recorder.grad.unwrap();

        let eps = 1e-2f32;
        for &(t, i) in &[(0usize, 0usize), (1, 2), (2, 1)] {
            let mut objective = |sign: f32| {
                let mut shifted = EmbedRecorder {
                    shift: Some((0, t, i, sign * eps)),
                    ..EmbedRecorder::default()
                };
                let (logits, _) = model.forward(&tokens, &ctx, &mut shifted).unwrap();
                (&logits * &weights).sum()
            };
            let numeric = (objective(1.0) - objective(-1.0)) / (2.0 * eps);
            assert_abs_diff_eq!(grad[[0, t, i]], numeric, epsilon = 2e-2);
        }
    }

    #[test]
    fn test_fused_rows_repeat_clean_logits() {
        let dims = ModelDims::new(1, 2, 4, 2);
        let model = LinearTransformer::random(dims, 6, 3, 2);
        let ctx = PassContext::new(ExecutionMode::Fused, 2, 2, &[1]).unwrap();
        let (logits, _) = model.forward(&array![[3usize, 1]], &ctx, &mut Passthrough).unwrap();
        assert_eq!(logits.nrows(), 3);
        assert_eq!(logits.row(0), logits.row(2));
    }
}
