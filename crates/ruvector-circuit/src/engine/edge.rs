//! Edge-level reconstruction.
//!
//! Every consumer input of a gated row (positions `1..`) is rebuilt from the
//! activation cache:
//!
//! ```text
//! in(C) = sum_j   g(j -> C)   * stream_j       + (1 - g(j -> C))   * modal_j
//!       + sum_l,h g(lh -> C)  * z_lh W_O[l,h]  + (1 - g(lh -> C))  * modal_lh W_O[l,h]
//!       + sum_l   b_O[l]
//! ```
//!
//! where `j` ranges over the residual-stream producers (embedding, earlier
//! MLPs) and `l, h` over the attention heads that execute before `C`. The
//! output bias of each included attention layer is added once.

use ndarray::{
    s, Array1, Array2, Array3, Array4, ArrayD, ArrayView2, ArrayView3, ArrayView4, Axis, Ix2, Ix3,
    Ix4, Zip,
};
use tracing::trace;

use super::{
    add_to_gated_rows, check_layer, check_rows, gated_rows, zero_reconstructed, EngineGradients,
    ReconstructionEngine, SaturationPolicy,
};
use crate::cache::{ActivationCache, CacheKey};
use crate::error::{CircuitError, Result};
use crate::graph::{Channel, GateGroup, GateKey, Granularity, ModelDims};
use crate::modal::{ModalGradients, ModalStore};
use crate::model::{
    fixed, ExecutionMode, InterceptionPoint, Interceptor, OutputProjection, PassContext,
};
use crate::sampler::{GateGradients, SampledMask};
use crate::tensor::{heads_matmul, heads_matmul_t};

/// Consumer whose input is rebuilt.
#[derive(Debug, Clone, Copy)]
enum Consumer {
    /// One head of an attention block, reading through `channel` (0..3).
    Head { layer: usize, channel: usize, head: usize },
    /// MLP of block `layer`, or the final readout when `layer == n_layers`.
    Stream { layer: usize },
}

/// Edge-level reconstruction engine for one sampled mask.
#[derive(Debug)]
pub struct EdgeReconstructor<'a> {
    dims: ModelDims,
    projection: &'a OutputProjection,
    modal: &'a ModalStore,
    mask: &'a SampledMask,
    policy: SaturationPolicy,
    mode: ExecutionMode,
    cache: ActivationCache,
    /// Modal attention values projected to the residual stream, `[N, H, d_model]`.
    modal_projected: Array3<f32>,
    /// Projected attention outputs of gated rows, `[rows, seq, H, d_model]`.
    projected: Vec<Option<Array4<f32>>>,
    stream_grads: Vec<Option<Array3<f32>>>,
    /// Producer gradients of attention layers, in projected space.
    attn_grads: Vec<Option<Array4<f32>>>,
    gate_grads: GateGradients,
    modal_stream_grad: Array2<f32>,
    modal_projected_grad: Array3<f32>,
}

impl<'a> EdgeReconstructor<'a> {
    /// Engine over `mask`, which must hold every edge-level gate tensor.
    pub fn new(
        dims: ModelDims,
        projection: &'a OutputProjection,
        modal: &'a ModalStore,
        mask: &'a SampledMask,
        policy: SaturationPolicy,
    ) -> Result<Self> {
        dims.validate()?;
        projection.validate(&dims)?;
        if modal.dims() != &dims {
            return Err(CircuitError::config(format!(
                "modal values for {:?} used with model {:?}",
                modal.dims(),
                dims
            )));
        }
        mask.validate(&dims, Granularity::Edge)?;

        let mut modal_projected = Array3::zeros((dims.n_layers, dims.n_heads, dims.d_model));
        for l in 0..dims.n_layers {
            for h in 0..dims.n_heads {
                let w = projection.weight.slice(s![l, h, .., ..]);
                modal_projected
                    .slice_mut(s![l, h, ..])
                    .assign(&modal.attn(l, h).dot(&w));
            }
        }

        Ok(Self {
            dims,
            projection,
            modal,
            mask,
            policy,
            mode: ExecutionMode::Clean,
            cache: ActivationCache::new(),
            modal_projected,
            projected: vec![None; dims.n_layers],
            stream_grads: vec![None; dims.stream_producers()],
            attn_grads: vec![None; dims.n_layers],
            gate_grads: GateGradients::zeros_like(mask),
            modal_stream_grad: Array2::zeros((dims.stream_producers(), dims.d_model)),
            modal_projected_grad: Array3::zeros((dims.n_layers, dims.n_heads, dims.d_model)),
        })
    }

    /// Cache of the current (or last finished) pass.
    pub fn cache(&self) -> &ActivationCache {
        &self.cache
    }

    fn gates(&self, consumer: Consumer) -> Result<(ArrayView2<'a, f32>, ArrayView3<'a, f32>)> {
        let mask: &'a SampledMask = self.mask;
        match consumer {
            Consumer::Head { layer, channel, head } => {
                let stream = mask
                    .get(GateKey::new(GateGroup::MlpAttn, layer))?
                    .slice(s![.., channel, head, ..])
                    .into_dimensionality::<Ix2>()?;
                let attn = mask
                    .get(GateKey::new(GateGroup::AttnAttn, layer))?
                    .slice(s![.., channel, head, .., ..])
                    .into_dimensionality::<Ix3>()?;
                Ok((stream, attn))
            }
            Consumer::Stream { layer } => {
                let stream = mask
                    .get(GateKey::new(GateGroup::MlpMlp, layer))?
                    .view()
                    .into_dimensionality::<Ix2>()?;
                let attn = mask
                    .get(GateKey::new(GateGroup::AttnMlp, layer))?
                    .view()
                    .into_dimensionality::<Ix3>()?;
                Ok((stream, attn))
            }
        }
    }

    fn add_gate_grads(
        &mut self,
        consumer: Consumer,
        stream: &Array2<f32>,
        attn: &Array3<f32>,
    ) -> Result<()> {
        match consumer {
            Consumer::Head { layer, channel, head } => {
                let mut t = self
                    .gate_grads
                    .get_mut(GateKey::new(GateGroup::MlpAttn, layer))?
                    .slice_mut(s![.., channel, head, ..])
                    .into_dimensionality::<Ix2>()?;
                t += stream;
                let mut t = self
                    .gate_grads
                    .get_mut(GateKey::new(GateGroup::AttnAttn, layer))?
                    .slice_mut(s![.., channel, head, .., ..])
                    .into_dimensionality::<Ix3>()?;
                t += attn;
            }
            Consumer::Stream { layer } => {
                let key = GateKey::new(GateGroup::MlpMlp, layer);
                *self.gate_grads.get_mut(key)? += &stream.view().into_dyn();
                let key = GateKey::new(GateGroup::AttnMlp, layer);
                *self.gate_grads.get_mut(key)? += &attn.view().into_dyn();
            }
        }
        Ok(())
    }

    fn stream_value(&self, index: usize) -> Result<ArrayView3<'_, f32>> {
        Ok(self
            .cache
            .read(CacheKey::stream(index))?
            .view()
            .into_dimensionality::<Ix3>()?)
    }

    fn projected_value(&self, layer: usize) -> Result<ArrayView4<'_, f32>> {
        self.projected
            .get(layer)
            .and_then(|p| p.as_ref())
            .map(|p| p.view())
            .ok_or(CircuitError::CacheMiss(CacheKey::Attention { layer }))
    }

    /// Gated mixture for positions `1..` of every gated row, `[rows, seq - 1, d_model]`.
    fn mix(
        &self,
        stream_gates: ArrayView2<'_, f32>,
        attn_gates: ArrayView3<'_, f32>,
        seq: usize,
    ) -> Result<Array3<f32>> {
        let rows = stream_gates.nrows();
        let n_attn = attn_gates.shape()[1];
        let mut out = Array3::zeros((rows, seq - 1, self.dims.d_model));

        for j in 0..stream_gates.ncols() {
            let cached = self.stream_value(j)?;
            let modal = self.modal.stream(j);
            for r in 0..rows {
                let g = stream_gates[[r, j]];
                let mut o = out.index_axis_mut(Axis(0), r);
                o.scaled_add(g, &cached.slice(s![r, 1.., ..]));
                o.scaled_add(1.0 - g, &modal);
            }
        }

        for l in 0..n_attn {
            let projected = self.projected_value(l)?;
            for h in 0..self.dims.n_heads {
                let modal = self.modal_projected.slice(s![l, h, ..]);
                for r in 0..rows {
                    let g = attn_gates[[r, l, h]];
                    let mut o = out.index_axis_mut(Axis(0), r);
                    o.scaled_add(g, &projected.slice(s![r, 1.., h, ..]));
                    o.scaled_add(1.0 - g, &modal);
                }
            }
        }

        let bias: Array1<f32> = self.projection.bias.slice(s![..n_attn, ..]).sum_axis(Axis(0));
        out += &bias;
        Ok(out)
    }

    /// Vector-Jacobian product of [`EdgeReconstructor::mix`]. Producer and
    /// modal gradients are accumulated; gate gradients are returned.
    fn mix_backward(
        &mut self,
        stream_gates: ArrayView2<'_, f32>,
        attn_gates: ArrayView3<'_, f32>,
        grad: ArrayView3<'_, f32>,
    ) -> Result<(Array2<f32>, Array3<f32>)> {
        let (rows, tail, d_model) = grad.dim();
        let seq = tail + 1;
        let n_attn = attn_gates.shape()[1];
        let grad_sum = grad.sum_axis(Axis(1));
        let mut d_stream = Array2::zeros(stream_gates.raw_dim());
        let mut d_attn = Array3::zeros(attn_gates.raw_dim());

        for j in 0..stream_gates.ncols() {
            let cached = self
                .cache
                .read(CacheKey::stream(j))?
                .view()
                .into_dimensionality::<Ix3>()?;
            let modal = self.modal.stream(j);
            let acc =
                self.stream_grads[j].get_or_insert_with(|| Array3::zeros((rows, seq, d_model)));
            for r in 0..rows {
                let g = stream_gates[[r, j]];
                let grad_r = grad.index_axis(Axis(0), r);
                let mut dg = inner(grad_r, cached.slice(s![r, 1.., ..]));
                if self.policy.is_live(g) {
                    dg -= grad_sum.row(r).dot(&modal);
                    self.modal_stream_grad
                        .row_mut(j)
                        .scaled_add(1.0 - g, &grad_sum.row(r));
                }
                d_stream[[r, j]] = dg;
                acc.slice_mut(s![r, 1.., ..]).scaled_add(g, &grad_r);
            }
        }

        for l in 0..n_attn {
            let projected = self
                .projected
                .get(l)
                .and_then(|p| p.as_ref())
                .ok_or(CircuitError::CacheMiss(CacheKey::Attention { layer: l }))?;
            let (_, _, heads, _) = projected.dim();
            let acc = self.attn_grads[l]
                .get_or_insert_with(|| Array4::zeros((rows, seq, heads, d_model)));
            for h in 0..heads {
                let modal = self.modal_projected.slice(s![l, h, ..]);
                for r in 0..rows {
                    let g = attn_gates[[r, l, h]];
                    let grad_r = grad.index_axis(Axis(0), r);
                    let mut dg = inner(grad_r, projected.slice(s![r, 1.., h, ..]));
                    if self.policy.is_live(g) {
                        dg -= grad_sum.row(r).dot(&modal);
                        self.modal_projected_grad
                            .slice_mut(s![l, h, ..])
                            .scaled_add(1.0 - g, &grad_sum.row(r));
                    }
                    d_attn[[r, l, h]] = dg;
                    acc.slice_mut(s![r, 1.., h, ..]).scaled_add(g, &grad_r);
                }
            }
        }

        Ok((d_stream, d_attn))
    }

    fn capture(
        &mut self,
        point: InterceptionPoint,
        activation: &ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<()> {
        let rows = gated_rows(activation, ctx)?;
        match point {
            InterceptionPoint::Embed => {
                self.check_stream_shape(point, &rows, ctx)?;
                self.cache.record(CacheKey::Embedding, rows)
            }
            InterceptionPoint::MlpOut { layer } => {
                self.check_stream_shape(point, &rows, ctx)?;
                self.cache.record(CacheKey::Mlp { layer }, rows)
            }
            InterceptionPoint::AttnOut { layer } => {
                let expected =
                    [ctx.gated_rows(), ctx.seq_len(), self.dims.n_heads, self.dims.d_head];
                if rows.shape() != expected {
                    return Err(CircuitError::shape_mismatch(
                        point.to_string(),
                        &expected,
                        rows.shape(),
                    ));
                }
                let z = rows.view().into_dimensionality::<Ix4>()?;
                let w = self.projection.weight.index_axis(Axis(0), layer);
                let projected = heads_matmul(z, w)?;
                self.cache.record(CacheKey::Attention { layer }, rows)?;
                self.projected[layer] = Some(projected);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn check_stream_shape(
        &self,
        point: InterceptionPoint,
        rows: &ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<()> {
        let expected = [ctx.gated_rows(), ctx.seq_len(), self.dims.d_model];
        if rows.shape() != expected {
            return Err(CircuitError::shape_mismatch(point.to_string(), &expected, rows.shape()));
        }
        Ok(())
    }

    fn reconstruct_stream(
        &mut self,
        point: InterceptionPoint,
        layer: usize,
        activation: ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        let seq = ctx.seq_len();
        let mut x = fixed::<Ix3>(activation, point, &[ctx.rows(), seq, self.dims.d_model])?;
        if seq > 1 {
            let (stream, attn) = self.gates(Consumer::Stream { layer })?;
            let mixed = self.mix(stream, attn, seq)?;
            x.slice_mut(s![ctx.gated_offset().., 1.., ..]).assign(&mixed);
        }
        trace!(%point, "consumer input reconstructed");
        Ok(x.into_dyn())
    }

    fn reconstruct_heads(
        &mut self,
        point: InterceptionPoint,
        layer: usize,
        channel: usize,
        activation: ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        let seq = ctx.seq_len();
        let mut x = fixed::<Ix4>(
            activation,
            point,
            &[ctx.rows(), seq, self.dims.n_heads, self.dims.d_model],
        )?;
        if seq > 1 {
            for head in 0..self.dims.n_heads {
                let (stream, attn) = self.gates(Consumer::Head { layer, channel, head })?;
                let mixed = self.mix(stream, attn, seq)?;
                x.slice_mut(s![ctx.gated_offset().., 1.., head, ..]).assign(&mixed);
            }
        }
        trace!(%point, "consumer input reconstructed");
        Ok(x.into_dyn())
    }

    fn reconstruct_stream_backward(
        &mut self,
        point: InterceptionPoint,
        layer: usize,
        mut grad: ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        let seq = ctx.seq_len();
        if seq > 1 {
            let expected = [ctx.rows(), seq, self.dims.d_model];
            let g = grad
                .view()
                .into_dimensionality::<Ix3>()
                .map_err(|_| {
                    CircuitError::shape_mismatch(point.to_string(), &expected, grad.shape())
                })?
                .slice(s![ctx.gated_offset().., 1.., ..])
                .to_owned();
            let consumer = Consumer::Stream { layer };
            let (stream, attn) = self.gates(consumer)?;
            let (d_stream, d_attn) = self.mix_backward(stream, attn, g.view())?;
            self.add_gate_grads(consumer, &d_stream, &d_attn)?;
            zero_reconstructed(&mut grad, ctx);
        }
        Ok(grad)
    }

    fn reconstruct_heads_backward(
        &mut self,
        point: InterceptionPoint,
        layer: usize,
        channel: usize,
        mut grad: ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        let seq = ctx.seq_len();
        if seq > 1 {
            let full = grad
                .view()
                .into_dimensionality::<Ix4>()
                .map_err(|_| {
                    CircuitError::shape_mismatch(
                        point.to_string(),
                        &[ctx.rows(), seq, self.dims.n_heads, self.dims.d_model],
                        grad.shape(),
                    )
                })?
                .slice(s![ctx.gated_offset().., 1.., .., ..])
                .to_owned();
            for head in 0..self.dims.n_heads {
                let consumer = Consumer::Head { layer, channel, head };
                let (stream, attn) = self.gates(consumer)?;
                let g = full.slice(s![.., .., head, ..]);
                let (d_stream, d_attn) = self.mix_backward(stream, attn, g)?;
                self.add_gate_grads(consumer, &d_stream, &d_attn)?;
            }
            zero_reconstructed(&mut grad, ctx);
        }
        Ok(grad)
    }
}

impl Interceptor for EdgeReconstructor<'_> {
    fn intercept(
        &mut self,
        point: InterceptionPoint,
        activation: ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        if ctx.mode() == ExecutionMode::Clean {
            return Ok(activation);
        }
        check_layer(point, &self.dims)?;
        match point {
            InterceptionPoint::Embed
            | InterceptionPoint::AttnOut { .. }
            | InterceptionPoint::MlpOut { .. } => {
                self.capture(point, &activation, ctx)?;
                Ok(activation)
            }
            InterceptionPoint::AttnIn { layer, channel } => {
                let c = channel_index(channel)?;
                self.reconstruct_heads(point, layer, c, activation, ctx)
            }
            InterceptionPoint::MlpIn { layer } => {
                self.reconstruct_stream(point, layer, activation, ctx)
            }
            InterceptionPoint::FinalResid => {
                self.reconstruct_stream(point, self.dims.n_layers, activation, ctx)
            }
        }
    }

    fn intercept_backward(
        &mut self,
        point: InterceptionPoint,
        mut grad: ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        if ctx.mode() == ExecutionMode::Clean {
            return Ok(grad);
        }
        check_layer(point, &self.dims)?;
        match point {
            InterceptionPoint::Embed => {
                if let Some(extra) = self.stream_grads[0].take() {
                    add_to_gated_rows(&mut grad, &extra.into_dyn(), ctx)?;
                }
                Ok(grad)
            }
            InterceptionPoint::MlpOut { layer } => {
                if let Some(extra) = self.stream_grads[layer + 1].take() {
                    add_to_gated_rows(&mut grad, &extra.into_dyn(), ctx)?;
                }
                Ok(grad)
            }
            InterceptionPoint::AttnOut { layer } => {
                if let Some(extra) = self.attn_grads[layer].take() {
                    let w = self.projection.weight.index_axis(Axis(0), layer);
                    let dz = heads_matmul_t(extra.view(), w)?;
                    add_to_gated_rows(&mut grad, &dz.into_dyn(), ctx)?;
                }
                Ok(grad)
            }
            InterceptionPoint::AttnIn { layer, channel } => {
                let c = channel_index(channel)?;
                self.reconstruct_heads_backward(point, layer, c, grad, ctx)
            }
            InterceptionPoint::MlpIn { layer } => {
                self.reconstruct_stream_backward(point, layer, grad, ctx)
            }
            InterceptionPoint::FinalResid => {
                self.reconstruct_stream_backward(point, self.dims.n_layers, grad, ctx)
            }
        }
    }
}

impl ReconstructionEngine for EdgeReconstructor<'_> {
    fn granularity(&self) -> Granularity {
        Granularity::Edge
    }

    fn begin_pass(&mut self, ctx: &PassContext) -> Result<()> {
        check_rows(self.mask.rows(), ctx)?;
        self.mode = ctx.mode();
        self.projected.iter_mut().for_each(|p| *p = None);
        self.stream_grads.iter_mut().for_each(|p| *p = None);
        self.attn_grads.iter_mut().for_each(|p| *p = None);
        if self.mode == ExecutionMode::Clean {
            self.cache.clear();
        } else {
            self.cache.begin_pass(&self.dims);
        }
        Ok(())
    }

    fn end_pass(&mut self) -> Result<()> {
        if self.mode == ExecutionMode::Clean {
            return Ok(());
        }
        self.cache.finish()
    }

    fn take_gradients(&mut self) -> EngineGradients {
        let mut modal = ModalGradients::zeros(&self.dims);
        modal.stream.assign(&self.modal_stream_grad);
        for l in 0..self.dims.n_layers {
            for h in 0..self.dims.n_heads {
                let w = self.projection.weight.slice(s![l, h, .., ..]);
                let g = self.modal_projected_grad.slice(s![l, h, ..]);
                modal.attn.slice_mut(s![l, h, ..]).assign(&w.dot(&g));
            }
        }
        self.modal_stream_grad.fill(0.0);
        self.modal_projected_grad.fill(0.0);
        let gates = std::mem::replace(&mut self.gate_grads, GateGradients::zeros_like(self.mask));
        EngineGradients { gates, modal }
    }
}

fn channel_index(channel: Channel) -> Result<usize> {
    channel
        .qkv_index()
        .ok_or_else(|| CircuitError::config("attention input point needs a q, k or v channel"))
}

fn inner(a: ArrayView2<'_, f32>, b: ArrayView2<'_, f32>) -> f32 {
    Zip::from(&a).and(&b).fold(0.0, |acc, &x, &y| acc + x * y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::LinearTransformer;
    use crate::model::{FrozenModel, Passthrough};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn setup() -> (LinearTransformer, ModalStore) {
        let dims = ModelDims::new(2, 2, 4, 3);
        let model = LinearTransformer::random(dims, 7, 5, 21);
        let modal = ModalStore::new(
            dims,
            Array2::from_shape_fn((3, 4), |(i, j)| 0.1 * (i + j) as f32),
            Array3::from_shape_fn((2, 2, 3), |(l, h, k)| 0.05 * (l + 2 * h + k) as f32 - 0.1),
        )
        .unwrap();
        (model, modal)
    }

    #[test]
    fn test_all_ones_mask_reproduces_clean_logits() {
        let (model, modal) = setup();
        let tokens = array![[1usize, 2, 3, 4], [5, 6, 0, 1]];
        let ctx = PassContext::new(ExecutionMode::Gated, 2, 4, &[3, 2]).unwrap();
        let mask = SampledMask::filled(&model.dims(), Granularity::Edge, ctx.gated_rows(), 1.0);
        let mut engine = EdgeReconstructor::new(
            model.dims(),
            model.output_projection(),
            &modal,
            &mask,
            SaturationPolicy::default(),
        )
        .unwrap();
        engine.begin_pass(&ctx).unwrap();
        let (gated, _) = model.forward(&tokens, &ctx, &mut engine).unwrap();
        engine.end_pass().unwrap();

        let clean_ctx = ctx.with_mode(ExecutionMode::Clean);
        let (clean, _) = model.forward(&tokens, &clean_ctx, &mut Passthrough).unwrap();
        for r in 0..ctx.gated_rows() {
            for (a, b) in gated.row(r).iter().zip(clean.row(ctx.batch_row(r)).iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_mask_rows_must_match_pass() {
        let (model, modal) = setup();
        let ctx = PassContext::new(ExecutionMode::Gated, 2, 3, &[2]).unwrap();
        let mask = SampledMask::filled(&model.dims(), Granularity::Edge, 5, 1.0);
        let mut engine = EdgeReconstructor::new(
            model.dims(),
            model.output_projection(),
            &modal,
            &mask,
            SaturationPolicy::default(),
        )
        .unwrap();
        assert!(engine.begin_pass(&ctx).is_err());
    }

    #[test]
    fn test_unknown_block_rejected() {
        let (model, modal) = setup();
        let dims = model.dims();
        let ctx = PassContext::new(ExecutionMode::Gated, 1, 3, &[2]).unwrap();
        let mask = SampledMask::filled(&dims, Granularity::Edge, ctx.gated_rows(), 1.0);
        let mut engine = EdgeReconstructor::new(
            dims,
            model.output_projection(),
            &modal,
            &mask,
            SaturationPolicy::default(),
        )
        .unwrap();
        engine.begin_pass(&ctx).unwrap();

        let z = ArrayD::zeros(vec![1, 3, dims.n_heads, dims.d_head]);
        let err = engine
            .intercept(InterceptionPoint::AttnOut { layer: dims.n_layers }, z.clone(), &ctx)
            .unwrap_err();
        assert!(matches!(err, CircuitError::Config(_)));
        let err = engine
            .intercept_backward(InterceptionPoint::AttnOut { layer: dims.n_layers + 3 }, z, &ctx)
            .unwrap_err();
        assert!(matches!(err, CircuitError::Config(_)));
    }

    #[test]
    fn test_vertex_mask_rejected() {
        let (model, modal) = setup();
        let mask = SampledMask::filled(&model.dims(), Granularity::Vertex, 2, 1.0);
        let engine = EdgeReconstructor::new(
            model.dims(),
            model.output_projection(),
            &modal,
            &mask,
            SaturationPolicy::default(),
        );
        assert!(engine.is_err());
    }

    #[test]
    fn test_saturated_gates_send_no_modal_gradient() {
        let (model, modal) = setup();
        let tokens = array![[1usize, 2, 3]];
        let ctx = PassContext::new(ExecutionMode::Gated, 1, 3, &[2]).unwrap();
        let mask = SampledMask::filled(&model.dims(), Granularity::Edge, 1, 1.0);
        let mut engine = EdgeReconstructor::new(
            model.dims(),
            model.output_projection(),
            &modal,
            &mask,
            SaturationPolicy::default(),
        )
        .unwrap();
        engine.begin_pass(&ctx).unwrap();
        let (logits, tape) = model.forward(&tokens, &ctx, &mut engine).unwrap();
        engine.end_pass().unwrap();
        model.backward(&tape, &Array2::ones(logits.raw_dim()), &ctx, &mut engine).unwrap();
        let grads = engine.take_gradients();
        assert!(grads.modal.stream.iter().all(|&g| g == 0.0));
        assert!(grads.modal.attn.iter().all(|&g| g == 0.0));
        // Gates still receive gradient through the cached activations.
        assert!(grads.gates.iter().any(|(_, t)| t.iter().any(|&g| g != 0.0)));
    }
}
