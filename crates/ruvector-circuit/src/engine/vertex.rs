//! Vertex-level reconstruction: one gate per attention head and per MLP,
//! applied to the node's own output.

use ndarray::{
    s, Array1, Array3, Array4, ArrayD, ArrayView1, ArrayView2, ArrayViewMut2, Axis, Ix2, Ix3, Ix4,
    Zip,
};
use tracing::trace;

use super::{check_layer, check_rows, EngineGradients, ReconstructionEngine, SaturationPolicy};
use crate::error::{CircuitError, Result};
use crate::graph::{GateGroup, GateKey, Granularity, ModelDims};
use crate::modal::{ModalGradients, ModalStore};
use crate::model::{fixed, ExecutionMode, InterceptionPoint, Interceptor, PassContext};
use crate::sampler::{GateGradients, SampledMask};

/// Vertex-level reconstruction engine for one sampled mask.
#[derive(Debug)]
pub struct VertexReconstructor<'a> {
    dims: ModelDims,
    modal: &'a ModalStore,
    mask: &'a SampledMask,
    policy: SaturationPolicy,
    /// Natural head outputs of gated rows, `[rows, seq, H, d_head]`.
    saved_attn: Vec<Option<Array4<f32>>>,
    /// Natural MLP outputs of gated rows, `[rows, seq, d_model]`.
    saved_mlp: Vec<Option<Array3<f32>>>,
    gate_grads: GateGradients,
    modal_grads: ModalGradients,
}

impl<'a> VertexReconstructor<'a> {
    /// Engine over `mask`, which must hold every vertex-level gate tensor.
    pub fn new(
        dims: ModelDims,
        modal: &'a ModalStore,
        mask: &'a SampledMask,
        policy: SaturationPolicy,
    ) -> Result<Self> {
        dims.validate()?;
        if modal.dims() != &dims {
            return Err(CircuitError::config(format!(
                "modal values for {:?} used with model {:?}",
                modal.dims(),
                dims
            )));
        }
        mask.validate(&dims, Granularity::Vertex)?;
        Ok(Self {
            dims,
            modal,
            mask,
            policy,
            saved_attn: vec![None; dims.n_layers],
            saved_mlp: vec![None; dims.n_layers],
            gate_grads: GateGradients::zeros_like(mask),
            modal_grads: ModalGradients::zeros(&dims),
        })
    }

    fn node_gates(&self, group: GateGroup, layer: usize) -> Result<ArrayView2<'a, f32>> {
        let mask: &'a SampledMask = self.mask;
        Ok(mask.get(GateKey::new(group, layer))?.view().into_dimensionality::<Ix2>()?)
    }

    fn gate_attn(
        &mut self,
        layer: usize,
        activation: ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        let point = InterceptionPoint::AttnOut { layer };
        let seq = ctx.seq_len();
        let shape = [ctx.rows(), seq, self.dims.n_heads, self.dims.d_head];
        let mut z = fixed::<Ix4>(activation, point, &shape)?;
        let off = ctx.gated_offset();
        let gated = z.slice(s![off..off + ctx.gated_rows(), .., .., ..]).to_owned();
        self.saved_attn[layer] = Some(gated);
        if seq > 1 {
            let gates = self.node_gates(GateGroup::AttnNode, layer)?;
            for r in 0..ctx.gated_rows() {
                for h in 0..self.dims.n_heads {
                    let g = gates[[r, h]];
                    let out = z.slice_mut(s![off + r, 1.., h, ..]);
                    blend(out, g, self.modal.attn(layer, h));
                }
            }
        }
        trace!(%point, "node output gated");
        Ok(z.into_dyn())
    }

    fn gate_mlp(
        &mut self,
        layer: usize,
        activation: ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        let point = InterceptionPoint::MlpOut { layer };
        let seq = ctx.seq_len();
        let mut x = fixed::<Ix3>(activation, point, &[ctx.rows(), seq, self.dims.d_model])?;
        let off = ctx.gated_offset();
        self.saved_mlp[layer] = Some(x.slice(s![off..off + ctx.gated_rows(), .., ..]).to_owned());
        if seq > 1 {
            let gates = self.node_gates(GateGroup::MlpNode, layer)?;
            for r in 0..ctx.gated_rows() {
                let out = x.slice_mut(s![off + r, 1.., ..]);
                blend(out, gates[[r, 0]], self.modal.stream(layer + 1));
            }
        }
        trace!(%point, "node output gated");
        Ok(x.into_dyn())
    }

    fn gate_attn_backward(
        &mut self,
        layer: usize,
        grad: ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        let point = InterceptionPoint::AttnOut { layer };
        let seq = ctx.seq_len();
        let shape = [ctx.rows(), seq, self.dims.n_heads, self.dims.d_head];
        let mut grad = fixed::<Ix4>(grad, point, &shape)?;
        if seq > 1 {
            let gates = self.node_gates(GateGroup::AttnNode, layer)?;
            let saved = self.saved_attn[layer]
                .take()
                .ok_or_else(|| out_of_order(point))?;
            let off = ctx.gated_offset();
            let dgates = self.gate_grads.get_mut(GateKey::new(GateGroup::AttnNode, layer))?;
            for r in 0..ctx.gated_rows() {
                for h in 0..self.dims.n_heads {
                    let g = gates[[r, h]];
                    let live = self.policy.is_live(g);
                    let grad_rh = grad.slice_mut(s![off + r, 1.., h, ..]);
                    let natural = saved.slice(s![r, 1.., h, ..]);
                    let modal = self.modal.attn(layer, h);
                    let (dg, dmodal) = blend_backward(grad_rh, g, live, natural, modal);
                    dgates[[r, h]] += dg;
                    if let Some(dmodal) = dmodal {
                        self.modal_grads.attn.slice_mut(s![layer, h, ..]).scaled_add(1.0, &dmodal);
                    }
                }
            }
        }
        Ok(grad.into_dyn())
    }

    fn gate_mlp_backward(
        &mut self,
        layer: usize,
        grad: ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        let point = InterceptionPoint::MlpOut { layer };
        let seq = ctx.seq_len();
        let mut grad = fixed::<Ix3>(grad, point, &[ctx.rows(), seq, self.dims.d_model])?;
        if seq > 1 {
            let gates = self.node_gates(GateGroup::MlpNode, layer)?;
            let saved = self.saved_mlp[layer]
                .take()
                .ok_or_else(|| out_of_order(point))?;
            let off = ctx.gated_offset();
            let dgates = self.gate_grads.get_mut(GateKey::new(GateGroup::MlpNode, layer))?;
            for r in 0..ctx.gated_rows() {
                let g = gates[[r, 0]];
                let live = self.policy.is_live(g);
                let grad_r = grad.slice_mut(s![off + r, 1.., ..]);
                let natural = saved.slice(s![r, 1.., ..]);
                let modal = self.modal.stream(layer + 1);
                let (dg, dmodal) = blend_backward(grad_r, g, live, natural, modal);
                dgates[[r, 0]] += dg;
                if let Some(dmodal) = dmodal {
                    self.modal_grads.stream.row_mut(layer + 1).scaled_add(1.0, &dmodal);
                }
            }
        }
        Ok(grad.into_dyn())
    }
}

fn out_of_order(point: InterceptionPoint) -> CircuitError {
    CircuitError::config(format!("backward through {} before its forward", point))
}

/// `out = g * out + (1 - g) * modal`, broadcasting `modal` over positions.
fn blend(mut out: ArrayViewMut2<'_, f32>, g: f32, modal: ArrayView1<'_, f32>) {
    out.map_inplace(|x| *x *= g);
    out.scaled_add(1.0 - g, &modal);
}

/// Backward of [`blend`]: rewrites `grad` in place to the gradient with
/// respect to the natural output and returns the gate gradient and, when the
/// modal term is live, the modal gradient.
fn blend_backward(
    mut grad: ArrayViewMut2<'_, f32>,
    g: f32,
    live: bool,
    natural: ArrayView2<'_, f32>,
    modal: ArrayView1<'_, f32>,
) -> (f32, Option<Array1<f32>>) {
    let mut dg = Zip::from(&grad).and(&natural).fold(0.0, |acc, &d, &x| acc + d * x);
    let mut dmodal = None;
    if live {
        let grad_sum = grad.sum_axis(Axis(0));
        dg -= grad_sum.dot(&modal);
        dmodal = Some(grad_sum * (1.0 - g));
    }
    grad.map_inplace(|d| *d *= g);
    (dg, dmodal)
}

impl Interceptor for VertexReconstructor<'_> {
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
            InterceptionPoint::AttnOut { layer } => self.gate_attn(layer, activation, ctx),
            InterceptionPoint::MlpOut { layer } => self.gate_mlp(layer, activation, ctx),
            _ => Ok(activation),
        }
    }

    fn intercept_backward(
        &mut self,
        point: InterceptionPoint,
        grad: ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        if ctx.mode() == ExecutionMode::Clean {
            return Ok(grad);
        }
        check_layer(point, &self.dims)?;
        match point {
            InterceptionPoint::AttnOut { layer } => self.gate_attn_backward(layer, grad, ctx),
            InterceptionPoint::MlpOut { layer } => self.gate_mlp_backward(layer, grad, ctx),
            _ => Ok(grad),
        }
    }
}

impl ReconstructionEngine for VertexReconstructor<'_> {
    fn granularity(&self) -> Granularity {
        Granularity::Vertex
    }

    fn begin_pass(&mut self, ctx: &PassContext) -> Result<()> {
        check_rows(self.mask.rows(), ctx)?;
        self.saved_attn.iter_mut().for_each(|s| *s = None);
        self.saved_mlp.iter_mut().for_each(|s| *s = None);
        Ok(())
    }

    fn end_pass(&mut self) -> Result<()> {
        Ok(())
    }

    fn take_gradients(&mut self) -> EngineGradients {
        let modal = std::mem::replace(&mut self.modal_grads, ModalGradients::zeros(&self.dims));
        let gates = std::mem::replace(&mut self.gate_grads, GateGradients::zeros_like(self.mask));
        EngineGradients { gates, modal }
    }
}
