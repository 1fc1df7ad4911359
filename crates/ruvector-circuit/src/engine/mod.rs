//! Reconstruction engines.
//!
//! An engine is an [`Interceptor`] that rewrites activations of gated rows
//! during a forward pass and, during the backward pass, turns the gradients
//! it receives into gradients for the gate values and the modal baselines.
//! Clean rows (and every row of a [`ExecutionMode::Clean`] pass) are never
//! modified, and sequence position 0 always keeps its natural value.
//!
//! [`ExecutionMode::Clean`]: crate::model::ExecutionMode::Clean

mod edge;
mod vertex;

pub use edge::EdgeReconstructor;
pub use vertex::VertexReconstructor;

use ndarray::{ArrayD, Axis, Slice};
use serde::{Deserialize, Serialize};

use crate::error::{CircuitError, Result};
use crate::graph::{Granularity, ModelDims};
use crate::modal::{ModalGradients, ModalStore};
use crate::model::{InterceptionPoint, Interceptor, OutputProjection, PassContext};
use crate::sampler::{GateGradients, SampledMask};

/// When the modal term of a gated mixture stops receiving gradient.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SaturationPolicy {
    /// Gates at or above `1 - tolerance` treat `(1 - gate) * modal` as a
    /// constant: no gradient reaches the gate through it, and none reaches
    /// the modal value.
    DetachAbove {
        /// Distance from 1 at which the gate counts as saturated.
        tolerance: f32,
    },
    /// The modal term always carries gradient.
    AlwaysLive,
}

impl SaturationPolicy {
    /// Default detach-on-saturation policy.
    pub fn detach(tolerance: f32) -> Self {
        SaturationPolicy::DetachAbove { tolerance }
    }

    /// Whether the modal term of a gate with value `gate` carries gradient.
    pub fn is_live(&self, gate: f32) -> bool {
        match *self {
            SaturationPolicy::DetachAbove { tolerance } => gate < 1.0 - tolerance,
            SaturationPolicy::AlwaysLive => true,
        }
    }
}

impl Default for SaturationPolicy {
    fn default() -> Self {
        SaturationPolicy::detach(1e-3)
    }
}

/// Gradients collected by an engine over one forward/backward pass.
#[derive(Debug, Clone)]
pub struct EngineGradients {
    /// Gradient with respect to every sampled gate value.
    pub gates: GateGradients,
    /// Gradient with respect to every modal baseline.
    pub modal: ModalGradients,
}

/// Interceptor that reconstructs consumer inputs from gates and baselines.
pub trait ReconstructionEngine: Interceptor {
    /// Edge or vertex gates.
    fn granularity(&self) -> Granularity;

    /// Prepare for a forward pass over the rows described by `ctx`.
    fn begin_pass(&mut self, ctx: &PassContext) -> Result<()>;

    /// Validate the end of the forward pass.
    fn end_pass(&mut self) -> Result<()>;

    /// Gradients accumulated since the last [`ReconstructionEngine::begin_pass`].
    fn take_gradients(&mut self) -> EngineGradients;
}

/// Engine of either granularity, chosen at runtime from the configuration.
#[derive(Debug)]
pub enum Reconstructor<'a> {
    /// Edge gates
    Edge(EdgeReconstructor<'a>),
    /// Vertex gates
    Vertex(VertexReconstructor<'a>),
}

impl<'a> Reconstructor<'a> {
    /// Build the engine matching `granularity` over `mask`.
    pub fn new(
        granularity: Granularity,
        dims: ModelDims,
        projection: &'a OutputProjection,
        modal: &'a ModalStore,
        mask: &'a SampledMask,
        policy: SaturationPolicy,
    ) -> Result<Self> {
        Ok(match granularity {
            Granularity::Edge => {
                Reconstructor::Edge(EdgeReconstructor::new(dims, projection, modal, mask, policy)?)
            }
            Granularity::Vertex => {
                Reconstructor::Vertex(VertexReconstructor::new(dims, modal, mask, policy)?)
            }
        })
    }
}

impl Interceptor for Reconstructor<'_> {
    fn intercept(
        &mut self,
        point: InterceptionPoint,
        activation: ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        match self {
            Reconstructor::Edge(engine) => engine.intercept(point, activation, ctx),
            Reconstructor::Vertex(engine) => engine.intercept(point, activation, ctx),
        }
    }

    fn intercept_backward(
        &mut self,
        point: InterceptionPoint,
        grad: ArrayD<f32>,
        ctx: &PassContext,
    ) -> Result<ArrayD<f32>> {
        match self {
            Reconstructor::Edge(engine) => engine.intercept_backward(point, grad, ctx),
            Reconstructor::Vertex(engine) => engine.intercept_backward(point, grad, ctx),
        }
    }
}

impl ReconstructionEngine for Reconstructor<'_> {
    fn granularity(&self) -> Granularity {
        match self {
            Reconstructor::Edge(engine) => engine.granularity(),
            Reconstructor::Vertex(engine) => engine.granularity(),
        }
    }

    fn begin_pass(&mut self, ctx: &PassContext) -> Result<()> {
        match self {
            Reconstructor::Edge(engine) => engine.begin_pass(ctx),
            Reconstructor::Vertex(engine) => engine.begin_pass(ctx),
        }
    }

    fn end_pass(&mut self) -> Result<()> {
        match self {
            Reconstructor::Edge(engine) => engine.end_pass(),
            Reconstructor::Vertex(engine) => engine.end_pass(),
        }
    }

    fn take_gradients(&mut self) -> EngineGradients {
        match self {
            Reconstructor::Edge(engine) => engine.take_gradients(),
            Reconstructor::Vertex(engine) => engine.take_gradients(),
        }
    }
}

/// Owned copy of the gated rows of an activation.
pub(crate) fn gated_rows(activation: &ArrayD<f32>, ctx: &PassContext) -> Result<ArrayD<f32>> {
    let start = ctx.gated_offset();
    let end = start + ctx.gated_rows();
    if activation.ndim() == 0 || activation.shape()[0] != ctx.rows() {
        return Err(CircuitError::config(format!(
            "activation with shape {:?} does not have {} rows",
            activation.shape(),
            ctx.rows()
        )));
    }
    Ok(activation
        .slice_axis(Axis(0), Slice::from(start..end))
        .to_owned())
}

/// Add `extra` into the gated rows of `grad`.
pub(crate) fn add_to_gated_rows(
    grad: &mut ArrayD<f32>,
    extra: &ArrayD<f32>,
    ctx: &PassContext,
) -> Result<()> {
    let start = ctx.gated_offset();
    let end = start + ctx.gated_rows();
    let mut rows = grad.slice_axis_mut(Axis(0), Slice::from(start..end));
    if rows.shape() != extra.shape() {
        return Err(CircuitError::shape_mismatch("producer gradient", rows.shape(), extra.shape()));
    }
    rows += extra;
    Ok(())
}

/// Reject points addressing a block the model does not have.
pub(crate) fn check_layer(point: InterceptionPoint, dims: &ModelDims) -> Result<()> {
    match point.layer() {
        Some(layer) if layer >= dims.n_layers => Err(CircuitError::config(format!(
            "{} addresses block {} of a {}-layer model",
            point, layer, dims.n_layers
        ))),
        _ => Ok(()),
    }
}

/// Check the mask and pass agree on the number of gated rows.
pub(crate) fn check_rows(mask_rows: usize, ctx: &PassContext) -> Result<()> {
    if ctx.gated_rows() != 0 && mask_rows != ctx.gated_rows() {
        return Err(CircuitError::config(format!(
            "mask has {} rows but the pass has {} gated rows",
            mask_rows,
            ctx.gated_rows()
        )));
    }
    Ok(())
}

/// Zero the gated rows past position 0, whose values no longer depend on
/// the natural activation.
pub(crate) fn zero_reconstructed(grad: &mut ArrayD<f32>, ctx: &PassContext) {
    let start = ctx.gated_offset();
    let end = start + ctx.gated_rows();
    if grad.ndim() < 2 {
        return;
    }
    grad.slice_axis_mut(Axis(0), Slice::from(start..end))
        .slice_axis_mut(Axis(1), Slice::from(1..))
        .fill(0.0);
}
