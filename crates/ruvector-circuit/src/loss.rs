//! Training objective.
//!
//! ```text
//! loss = mean_r KL(p_clean(b(r)) || q_gated(r))
//!      + λ · Σ complexity
//!      + c_t · Σ temperature²
//!      + μ · Σ_node tanh(2 · (out(node) + in(node)) / (layers · heads))
//! ```
//!
//! where `b(r)` is the batch example of gated row `r`, `c_t` comes from the
//! temperature schedule and the node term is only present for edge gates
//! with a positive coefficient `μ`.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayD, ArrayView1, Axis, Dimension, IxDyn};

use crate::error::{CircuitError, Result};
use crate::graph::{ComputationGraph, EdgeSlot, GateKey, Granularity, ModelDims, Node};
use crate::model::PassContext;
use crate::sampler::{GateParameterGradients, GateParameters};

/// Values of every loss term for one step.
#[derive(Debug, Clone)]
pub struct LossTerms {
    /// Total scalar loss.
    pub total: f32,
    /// KL divergence per gated row.
    pub kl: Array1<f32>,
    /// `Σ complexity`, before scaling by λ.
    pub complexity: f32,
    /// `Σ temperature²`, before scaling by `c_t`.
    pub temperature: f32,
    /// Temperature coefficient used for this step.
    pub temperature_coefficient: f32,
    /// `Σ tanh(...)` node term before scaling, when enabled.
    pub node: Option<f32>,
}

impl LossTerms {
    /// Mean KL over gated rows.
    pub fn kl_mean(&self) -> f32 {
        self.kl.mean().unwrap_or(0.0)
    }
}

/// Loss value with the gradients the trainer needs.
#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Term values.
    pub terms: LossTerms,
    /// Gradient with respect to the gated logits, `[gated_rows, vocab]`.
    pub grad_logits: Array2<f32>,
    /// Gradient of the regularizers with respect to the gate parameters.
    pub param_grads: GateParameterGradients,
}

/// Combines fidelity and regularization terms.
#[derive(Debug, Clone)]
pub struct LossComposer {
    regularization_coefficient: f32,
    node_regularization_coefficient: f32,
}

impl LossComposer {
    /// Composer with sparsity coefficient `λ` and node coefficient `μ`.
    pub fn new(
        regularization_coefficient: f32,
        node_regularization_coefficient: f32,
    ) -> Result<Self> {
        if !(regularization_coefficient >= 0.0) || !(node_regularization_coefficient >= 0.0) {
            return Err(CircuitError::config("loss coefficients must be >= 0"));
        }
        Ok(Self {
            regularization_coefficient,
            node_regularization_coefficient,
        })
    }

    /// Full objective for one step.
    ///
    /// `clean_logits` holds one row per batch example, `gated_logits` one row
    /// per gated row in the layout of `ctx`.
    pub fn compose(
        &self,
        clean_logits: &Array2<f32>,
        gated_logits: &Array2<f32>,
        ctx: &PassContext,
        params: &GateParameters,
        temperature_coefficient: f32,
    ) -> Result<LossOutput> {
        let (kl, grad_kl) = kl_divergence(clean_logits, gated_logits, ctx)?;
        let n = kl.len().max(1) as f32;
        let grad_logits = grad_kl / n;

        let complexity = params.complexity();
        let complexity_sum: f32 = complexity.values().map(|c| c.sum()).sum();
        let mut grad_complexity: BTreeMap<GateKey, ArrayD<f32>> = complexity
            .iter()
            .map(|(key, c)| (*key, ArrayD::from_elem(c.raw_dim(), self.regularization_coefficient)))
            .collect();

        let node = if self.node_regularization_coefficient > 0.0
            && params.granularity() == Granularity::Edge
        {
            let (value, grad) = node_regularization(params.dims(), &complexity)?;
            for (key, g) in grad {
                if let Some(acc) = grad_complexity.get_mut(&key) {
                    acc.scaled_add(self.node_regularization_coefficient, &g);
                }
            }
            Some(value)
        } else {
            None
        };

        let mut param_grads = params.complexity_backward(&grad_complexity)?;
        let mut temperature = 0.0f32;
        for (key, layer) in params.iter() {
            temperature += layer.temperature.iter().map(|t| t * t).sum::<f32>();
            let grad = param_grads.get_mut(*key)?;
            grad.temperature
                .scaled_add(2.0 * temperature_coefficient, &layer.temperature);
        }

        let total = kl.mean().unwrap_or(0.0)
            + self.regularization_coefficient * complexity_sum
            + temperature_coefficient * temperature
            + node.map_or(0.0, |v| self.node_regularization_coefficient * v);
        if !total.is_finite() {
            return Err(CircuitError::NumericalError(format!("loss is {}", total)));
        }

        Ok(LossOutput {
            terms: LossTerms {
                total,
                kl,
                complexity: complexity_sum,
                temperature,
                temperature_coefficient,
                node,
            },
            grad_logits,
            param_grads,
        })
    }
}

fn log_softmax(logits: ArrayView1<'_, f32>) -> Array1<f32> {
    let max = logits.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
    let log_sum = logits.mapv(|x| (x - max).exp()).sum().ln() + max;
    logits.mapv(|x| x - log_sum)
}

/// Per-row `KL(p_clean || q_gated)` and its gradient with respect to the
/// gated logits (`q - p` per row, unscaled).
pub fn kl_divergence(
    clean_logits: &Array2<f32>,
    gated_logits: &Array2<f32>,
    ctx: &PassContext,
) -> Result<(Array1<f32>, Array2<f32>)> {
    let vocab = clean_logits.ncols();
    if clean_logits.nrows() != ctx.batch_size() {
        return Err(CircuitError::shape_mismatch(
            "clean logits",
            &[ctx.batch_size(), vocab],
            clean_logits.shape(),
        ));
    }
    if gated_logits.ncols() != vocab {
        return Err(CircuitError::shape_mismatch(
            "gated logits",
            &[gated_logits.nrows(), vocab],
            gated_logits.shape(),
        ));
    }
    let clean_log_p: Vec<Array1<f32>> = clean_logits.axis_iter(Axis(0)).map(log_softmax).collect();
    let rows = gated_logits.nrows();
    let mut kl = Array1::zeros(rows);
    let mut grad = Array2::zeros((rows, vocab));
    for (r, gated) in gated_logits.axis_iter(Axis(0)).enumerate() {
        let log_p = &clean_log_p[ctx.batch_row(r)];
        let log_q = log_softmax(gated);
        let mut value = 0.0f32;
        for ((g, &lp), &lq) in grad.row_mut(r).iter_mut().zip(log_p.iter()).zip(log_q.iter()) {
            let p = lp.exp();
            if p > 0.0 {
                value += p * (lp - lq);
            }
            *g = lq.exp() - p;
        }
        kl[r] = value;
    }
    Ok((kl, grad))
}

/// `Σ_node tanh(2 · (out + in) / (layers · heads))` over heads and MLPs,
/// where `out`/`in` sum the complexity of the node's outgoing/incoming
/// edges, and its gradient with respect to every edge complexity.
fn node_regularization(
    dims: &ModelDims,
    complexity: &BTreeMap<GateKey, ArrayD<f32>>,
) -> Result<(f32, BTreeMap<GateKey, ArrayD<f32>>)> {
    let graph = ComputationGraph::dense(*dims)?;
    let scale = 2.0 / (dims.n_layers * dims.n_heads) as f32;
    let counted = |node: &Node| matches!(node, Node::Attention { .. } | Node::Mlp { .. });

    let mut slots = Vec::new();
    let mut sums: BTreeMap<Node, f32> = BTreeMap::new();
    for (key, c) in complexity {
        for (idx, &value) in c.indexed_iter() {
            let slot = EdgeSlot {
                group: key.group,
                layer: key.layer,
                index: idx.slice().to_vec(),
            };
            let edge = graph.edge_at(&slot)?;
            for node in [edge.producer, edge.consumer].iter().filter(|n| counted(*n)) {
                *sums.entry(*node).or_insert(0.0) += value;
            }
            slots.push((slot, edge));
        }
    }

    let value: f32 = sums.values().map(|s| (scale * s).tanh()).sum();
    let dnode: BTreeMap<Node, f32> = sums
        .iter()
        .map(|(node, s)| {
            let t = (scale * s).tanh();
            (*node, scale * (1.0 - t * t))
        })
        .collect();

    let mut grad: BTreeMap<GateKey, ArrayD<f32>> = complexity
        .iter()
        .map(|(key, c)| (*key, ArrayD::zeros(c.raw_dim())))
        .collect();
    for (slot, edge) in slots {
        let d = [edge.producer, edge.consumer]
            .iter()
            .filter_map(|n| dnode.get(n))
            .sum::<f32>();
        if let Some(g) = grad.get_mut(&slot.key()) {
            g[IxDyn(&slot.index)] = d;
        }
    }
    Ok((value, grad))
}
