//! Shared fixtures for the ruvector-circuit integration tests.
//!
//! Provides a small reference model, synthetic producer activations with an
//! independently computed residual stream, and helpers that drive an engine
//! through a full pass by hand.

#![allow(dead_code)]

use ndarray::{s, Array2, Array3, Array4, ArrayD, Ix3};
use rand::rngs::StdRng;
use rand::SeedableRng;

use ruvector_circuit::model::OutputProjection;
use ruvector_circuit::reference::LinearTransformer;
use ruvector_circuit::tensor::xavier_normal;
use ruvector_circuit::{
    Batch, Channel, InterceptionPoint, ModalStore, ModelDims, PassContext, ReconstructionEngine,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Two layers, two heads.
pub fn toy_dims() -> ModelDims {
    ModelDims::new(2, 2, 6, 3)
}

pub const VOCAB: usize = 9;

pub fn toy_model(seed: u64) -> LinearTransformer {
    LinearTransformer::random(toy_dims(), VOCAB, 8, seed)
}

pub fn toy_batch() -> Batch {
    Batch::new(ndarray::array![[1, 2, 3, 4, 5], [6, 7, 8, 0, 1]], vec![4, 3]).unwrap()
}

/// Standard-normal tensor of the given shape.
pub fn normal<Sh: ndarray::ShapeBuilder>(shape: Sh, seed: u64) -> ndarray::Array<f32, Sh::Dim> {
    let mut rng = StdRng::seed_from_u64(seed);
    xavier_normal(&mut rng, shape, 1, 1)
}

pub fn random_modal(dims: ModelDims, seed: u64) -> ModalStore {
    ModalStore::new(
        dims,
        normal((dims.stream_producers(), dims.d_model), seed),
        normal((dims.n_layers, dims.n_heads, dims.d_head), seed + 1),
    )
    .unwrap()
}

pub fn random_projection(dims: ModelDims, seed: u64) -> OutputProjection {
    OutputProjection {
        weight: normal((dims.n_layers, dims.n_heads, dims.d_head, dims.d_model), seed),
        bias: normal((dims.n_layers, dims.d_model), seed + 1),
    }
}

// ---------------------------------------------------------------------------
// Synthetic producer outputs
// ---------------------------------------------------------------------------

/// Producer outputs of every node for `rows` rows, independent of any model.
pub struct Synthetic {
    pub dims: ModelDims,
    pub emb: Array3<f32>,
    pub z: Vec<Array4<f32>>,
    pub mlp: Vec<Array3<f32>>,
}

impl Synthetic {
    pub fn random(dims: ModelDims, rows: usize, seq: usize, seed: u64) -> Self {
        let emb = normal((rows, seq, dims.d_model), seed);
        let z = (0..dims.n_layers)
            .map(|l| normal((rows, seq, dims.n_heads, dims.d_head), seed + 10 + l as u64))
            .collect();
        let mlp = (0..dims.n_layers)
            .map(|l| normal((rows, seq, dims.d_model), seed + 20 + l as u64))
            .collect();
        Self { dims, emb, z, mlp }
    }

    /// `Σ_h z[l, h] W_O[l, h] + b_O[l]`, written out element by element.
    pub fn attention_output(&self, projection: &OutputProjection, layer: usize) -> Array3<f32> {
        let (rows, seq, heads, d_head) = self.z[layer].dim();
        let d_model = self.dims.d_model;
        let mut out = Array3::zeros((rows, seq, d_model));
        for r in 0..rows {
            for p in 0..seq {
                for m in 0..d_model {
                    let mut acc = projection.bias[[layer, m]];
                    for h in 0..heads {
                        for k in 0..d_head {
                            acc += self.z[layer][[r, p, h, k]]
                                * projection.weight[[layer, h, k, m]];
                        }
                    }
                    out[[r, p, m]] = acc;
                }
            }
        }
        out
    }

    /// Residual stream seen by the heads of `layer`.
    pub fn head_input(&self, projection: &OutputProjection, layer: usize) -> Array3<f32> {
        let mut x = self.emb.clone();
        for l in 0..layer {
            x += &self.attention_output(projection, l);
            x += &self.mlp[l];
        }
        x
    }

    /// Residual stream seen by the MLP of `layer` (`n_layers` is the readout).
    pub fn stream_input(&self, projection: &OutputProjection, layer: usize) -> Array3<f32> {
        let mut x = self.head_input(projection, layer.min(self.dims.n_layers));
        if layer < self.dims.n_layers {
            x += &self.attention_output(projection, layer);
        }
        x
    }
}

/// Baseline-only input: every modal value, projected where needed, plus the
/// output biases of the attention layers that precede the consumer.
pub fn baseline_input(
    dims: ModelDims,
    modal: &ModalStore,
    projection: &OutputProjection,
    stream_producers: usize,
    attn_layers: usize,
) -> ndarray::Array1<f32> {
    let mut out = ndarray::Array1::zeros(dims.d_model);
    for j in 0..stream_producers {
        out += &modal.stream(j);
    }
    for l in 0..attn_layers {
        for h in 0..dims.n_heads {
            let w = projection.weight.slice(s![l, h, .., ..]);
            out += &modal.attn(l, h).dot(&w);
        }
        out += &projection.bias.row(l);
    }
    out
}

// ---------------------------------------------------------------------------
// Manual pass
// ---------------------------------------------------------------------------

/// Consumer inputs returned by the engine during a manual pass.
pub struct DrivenPass {
    /// `AttnIn` replacement for the query channel, per layer.
    pub head_inputs: Vec<ArrayD<f32>>,
    /// `MlpIn` replacement, per layer.
    pub mlp_inputs: Vec<ArrayD<f32>>,
    /// `FinalResid` replacement.
    pub final_input: Array3<f32>,
}

/// Feed the synthetic producer outputs to `engine` in model order. Consumer
/// inputs are given as `fill`, so every reconstructed position is visible.
pub fn drive<E: ReconstructionEngine>(
    engine: &mut E,
    acts: &Synthetic,
    ctx: &PassContext,
    fill: f32,
) -> ruvector_circuit::Result<DrivenPass> {
    let dims = acts.dims;
    let rows = ctx.rows();
    let seq = ctx.seq_len();
    engine.begin_pass(ctx)?;
    engine.intercept(InterceptionPoint::Embed, acts.emb.clone().into_dyn(), ctx)?;

    let mut head_inputs = Vec::new();
    let mut mlp_inputs = Vec::new();
    for layer in 0..dims.n_layers {
        for channel in Channel::QKV {
            let input = ArrayD::from_elem(vec![rows, seq, dims.n_heads, dims.d_model], fill);
            let out = engine.intercept(InterceptionPoint::AttnIn { layer, channel }, input, ctx)?;
            if channel == Channel::Query {
                head_inputs.push(out);
            }
        }
        let z = acts.z[layer].clone().into_dyn();
        engine.intercept(InterceptionPoint::AttnOut { layer }, z, ctx)?;
        let input = ArrayD::from_elem(vec![rows, seq, dims.d_model], fill);
        mlp_inputs.push(engine.intercept(InterceptionPoint::MlpIn { layer }, input, ctx)?);
        let mlp = acts.mlp[layer].clone().into_dyn();
        engine.intercept(InterceptionPoint::MlpOut { layer }, mlp, ctx)?;
    }

    let input = ArrayD::from_elem(vec![rows, seq, dims.d_model], fill);
    let final_input = engine
        .intercept(InterceptionPoint::FinalResid, input, ctx)?
        .into_dimensionality::<Ix3>()?;
    engine.end_pass()?;
    Ok(DrivenPass {
        head_inputs,
        mlp_inputs,
        final_input,
    })
}

/// Largest absolute difference over positions `1..`.
pub fn max_tail_diff(a: &Array3<f32>, b: &Array3<f32>) -> f32 {
    let a = a.slice(s![.., 1.., ..]);
    let b = b.slice(s![.., 1.., ..]);
    a.iter().zip(b.iter()).fold(0.0f32, |m, (x, y)| m.max((x - y).abs()))
}

/// `Σ w ⊙ x`.
pub fn weighted_sum(w: &Array2<f32>, x: &Array2<f32>) -> f32 {
    (w * x).sum()
}

/// Largest absolute difference between two equally long sequences.
pub fn max_abs_diff<'a, 'b>(
    a: impl IntoIterator<Item = &'a f32>,
    b: impl IntoIterator<Item = &'b f32>,
) -> f32 {
    a.into_iter()
        .zip(b)
        .fold(0.0f32, |m, (x, y)| m.max((x - y).abs()))
}
