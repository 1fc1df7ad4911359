//! Computation graph of a frozen transformer.
//!
//! Nodes are the embedding, every attention head of every layer, every MLP,
//! and the final readout. Edges connect a producer to a consumer (and, for
//! attention consumers, one of the query/key/value input channels). Gates are
//! stored in per-layer tensors grouped by [`GateGroup`]; [`EdgeSlot`] maps an
//! edge to its position inside those tensors and back.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CircuitError, Result};

/// Hyperparameters of the frozen model that fix the graph layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelDims {
    /// Number of transformer blocks.
    pub n_layers: usize,
    /// Attention heads per block.
    pub n_heads: usize,
    /// Residual stream width.
    pub d_model: usize,
    /// Per-head width before the output projection.
    pub d_head: usize,
}

impl ModelDims {
    /// Create a new set of dimensions.
    pub fn new(n_layers: usize, n_heads: usize, d_model: usize, d_head: usize) -> Self {
        Self {
            n_layers,
            n_heads,
            d_model,
            d_head,
        }
    }

    /// Reject degenerate dimensions.
    pub fn validate(&self) -> Result<()> {
        if self.n_layers == 0 || self.n_heads == 0 || self.d_model == 0 || self.d_head == 0 {
            return Err(CircuitError::config(format!(
                "model dimensions must be positive, got {:?}",
                self
            )));
        }
        Ok(())
    }

    /// Number of residual-stream producers (embedding plus one per MLP).
    pub fn stream_producers(&self) -> usize {
        self.n_layers + 1
    }

    /// Number of attention layers visible to an MLP (or final) consumer at
    /// `layer`. The MLP of block `l` reads the attention of the same block.
    pub fn attn_layers_before_mlp(&self, layer: usize) -> usize {
        (layer + 1).min(self.n_layers)
    }
}

/// Node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    /// Token embedding (input of the residual stream).
    Embedding,
    /// A single attention head.
    AttentionHead,
    /// A block MLP.
    Mlp,
    /// The final readout feeding the unembedding.
    FinalReadout,
}

/// A node of the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Node {
    /// Token embedding.
    Embedding,
    /// Attention head `head` of block `layer`.
    Attention {
        /// Block index.
        layer: usize,
        /// Head index.
        head: usize,
    },
    /// MLP of block `layer`.
    Mlp {
        /// Block index.
        layer: usize,
    },
    /// Final readout.
    Final,
}

impl Node {
    /// Kind of this node.
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Embedding => NodeKind::Embedding,
            Node::Attention { .. } => NodeKind::AttentionHead,
            Node::Mlp { .. } => NodeKind::Mlp,
            Node::Final => NodeKind::FinalReadout,
        }
    }

    /// Block index; the embedding sits at 0 and the final readout at `n_layers`.
    pub fn layer(&self, dims: &ModelDims) -> usize {
        match *self {
            Node::Embedding => 0,
            Node::Attention { layer, .. } | Node::Mlp { layer } => layer,
            Node::Final => dims.n_layers,
        }
    }

    /// Head index for attention nodes.
    pub fn head(&self) -> Option<usize> {
        match *self {
            Node::Attention { head, .. } => Some(head),
            _ => None,
        }
    }

    /// Execution order of the node inside one forward pass. A producer may
    /// only feed consumers with a strictly larger stage.
    pub fn stage(&self) -> usize {
        match *self {
            Node::Embedding => 0,
            Node::Attention { layer, .. } => 2 * layer + 1,
            Node::Mlp { layer } => 2 * layer + 2,
            Node::Final => usize::MAX,
        }
    }

    /// Index in the residual-stream producer list (embedding = 0, MLP `l` = `l + 1`).
    pub fn stream_index(&self) -> Option<usize> {
        match *self {
            Node::Embedding => Some(0),
            Node::Mlp { layer } => Some(layer + 1),
            _ => None,
        }
    }

    /// Inverse of [`Node::stream_index`].
    pub fn from_stream_index(index: usize) -> Node {
        if index == 0 {
            Node::Embedding
        } else {
            Node::Mlp { layer: index - 1 }
        }
    }

    /// MLP consumer at `layer`, or the final readout when `layer == n_layers`.
    pub fn mlp_or_final(layer: usize, dims: &ModelDims) -> Node {
        if layer >= dims.n_layers {
            Node::Final
        } else {
            Node::Mlp { layer }
        }
    }

    /// Whether this node emits an activation other nodes can read.
    pub fn is_producer(&self) -> bool {
        !matches!(self, Node::Final)
    }

    /// Whether this node reads reconstructed inputs.
    pub fn is_consumer(&self) -> bool {
        !matches!(self, Node::Embedding)
    }

    pub(crate) fn exists_in(&self, dims: &ModelDims) -> bool {
        match *self {
            Node::Embedding | Node::Final => true,
            Node::Attention { layer, head } => layer < dims.n_layers && head < dims.n_heads,
            Node::Mlp { layer } => layer < dims.n_layers,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Embedding => write!(f, "embed"),
            Node::Attention { layer, head } => write!(f, "a{}.{}", layer, head),
            Node::Mlp { layer } => write!(f, "m{}", layer),
            Node::Final => write!(f, "final"),
        }
    }
}

/// Input channel of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    /// Attention query input.
    Query,
    /// Attention key input.
    Key,
    /// Attention value input.
    Value,
    /// The only input of an MLP or the final readout.
    Single,
}

impl Channel {
    /// Attention input channels in storage order.
    pub const QKV: [Channel; 3] = [Channel::Query, Channel::Key, Channel::Value];

    /// Storage index of an attention channel.
    pub fn qkv_index(&self) -> Option<usize> {
        match self {
            Channel::Query => Some(0),
            Channel::Key => Some(1),
            Channel::Value => Some(2),
            Channel::Single => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Channel::Query => "q",
            Channel::Key => "k",
            Channel::Value => "v",
            Channel::Single => "in",
        };
        f.write_str(s)
    }
}

/// A producer -> consumer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    /// Upstream node.
    pub producer: Node,
    /// Downstream node.
    pub consumer: Node,
    /// Consumer input channel.
    pub channel: Channel,
}

impl Edge {
    /// Create an edge.
    pub fn new(producer: Node, consumer: Node, channel: Channel) -> Self {
        Self {
            producer,
            consumer,
            channel,
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}.{}", self.producer, self.consumer, self.channel)
    }
}

/// Closed set of gate tensor families.
///
/// Edge groups hold one tensor per consumer layer; the `MlpMlp` and `AttnMlp`
/// groups carry one extra layer (`n_layers`) for the final readout. Vertex
/// groups hold one tensor per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GateGroup {
    /// Embedding/MLP producers into MLP (or final) consumers: `[L + 1]`.
    #[serde(rename = "mlp-mlp")]
    MlpMlp,
    /// Embedding/MLP producers into attention consumers: `[3, H, L + 1]`.
    #[serde(rename = "mlp-attn")]
    MlpAttn,
    /// Attention producers into MLP (or final) consumers: `[min(L + 1, N), H]`.
    #[serde(rename = "attn-mlp")]
    AttnMlp,
    /// Attention producers into attention consumers: `[3, H, L, H]`.
    #[serde(rename = "attn-attn")]
    AttnAttn,
    /// One gate per attention head: `[H]`.
    #[serde(rename = "attn")]
    AttnNode,
    /// One gate per MLP: `[1]`.
    #[serde(rename = "mlp")]
    MlpNode,
}

/// Whether gates address edges or nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    /// One gate per producer -> consumer edge.
    Edge,
    /// One gate per node.
    Vertex,
}

impl Granularity {
    /// Gate groups used at this granularity.
    pub fn groups(&self) -> &'static [GateGroup] {
        match self {
            Granularity::Edge => &GateGroup::EDGE,
            Granularity::Vertex => &GateGroup::VERTEX,
        }
    }
}

impl GateGroup {
    /// Edge-level groups.
    pub const EDGE: [GateGroup; 4] = [
        GateGroup::MlpMlp,
        GateGroup::MlpAttn,
        GateGroup::AttnMlp,
        GateGroup::AttnAttn,
    ];

    /// Vertex-level groups.
    pub const VERTEX: [GateGroup; 2] = [GateGroup::AttnNode, GateGroup::MlpNode];

    /// Stable name used in tensor bundles and logs.
    pub fn name(&self) -> &'static str {
        match self {
            GateGroup::MlpMlp => "mlp-mlp",
            GateGroup::MlpAttn => "mlp-attn",
            GateGroup::AttnMlp => "attn-mlp",
            GateGroup::AttnAttn => "attn-attn",
            GateGroup::AttnNode => "attn",
            GateGroup::MlpNode => "mlp",
        }
    }

    /// Granularity this group belongs to.
    pub fn granularity(&self) -> Granularity {
        match self {
            GateGroup::AttnNode | GateGroup::MlpNode => Granularity::Vertex,
            _ => Granularity::Edge,
        }
    }

    /// Number of per-layer tensors in this group.
    pub fn layer_count(&self, dims: &ModelDims) -> usize {
        match self {
            GateGroup::MlpMlp | GateGroup::AttnMlp => dims.n_layers + 1,
            _ => dims.n_layers,
        }
    }

    /// Shape of the gate tensor for `layer`, excluding the leading row axis.
    pub fn layer_shape(&self, dims: &ModelDims, layer: usize) -> Vec<usize> {
        let h = dims.n_heads;
        match self {
            GateGroup::MlpMlp => vec![layer + 1],
            GateGroup::MlpAttn => vec![3, h, layer + 1],
            GateGroup::AttnMlp => vec![dims.attn_layers_before_mlp(layer), h],
            GateGroup::AttnAttn => vec![3, h, layer, h],
            GateGroup::AttnNode => vec![h],
            GateGroup::MlpNode => vec![1],
        }
    }

    /// Check that `shape` (without the row axis) matches the contract.
    pub fn check_layer_shape(&self, dims: &ModelDims, layer: usize, shape: &[usize]) -> Result<()> {
        if layer >= self.layer_count(dims) {
            return Err(CircuitError::config(format!(
                "{} has {} layers, got layer {}",
                self.name(),
                self.layer_count(dims),
                layer
            )));
        }
        let expected = self.layer_shape(dims, layer);
        if expected.as_slice() != shape {
            return Err(CircuitError::shape_mismatch(
                format!("{} layer {}", self.name(), layer),
                &expected,
                shape,
            ));
        }
        Ok(())
    }
}

impl fmt::Display for GateGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One per-layer gate tensor: a group and a consumer (or node) layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GateKey {
    /// Gate group.
    pub group: GateGroup,
    /// Layer index inside the group.
    pub layer: usize,
}

impl GateKey {
    /// Create a key.
    pub fn new(group: GateGroup, layer: usize) -> Self {
        Self { group, layer }
    }

    /// Every gate tensor of a model at the given granularity.
    pub fn all(dims: &ModelDims, granularity: Granularity) -> Vec<GateKey> {
        granularity
            .groups()
            .iter()
            .flat_map(|&group| {
                (0..group.layer_count(dims)).map(move |layer| GateKey::new(group, layer))
            })
            .collect()
    }

    /// Shape of the tensor without the row axis.
    pub fn shape(&self, dims: &ModelDims) -> Vec<usize> {
        self.group.layer_shape(dims, self.layer)
    }

    /// Inverse of the `Display` form (`"mlp-attn.1"`).
    pub fn parse(name: &str) -> Result<Self> {
        let (group, layer) = name
            .rsplit_once('.')
            .ok_or_else(|| CircuitError::config(format!("malformed gate key '{}'", name)))?;
        let group = GateGroup::EDGE
            .iter()
            .chain(GateGroup::VERTEX.iter())
            .find(|g| g.name() == group)
            .copied()
            .ok_or_else(|| CircuitError::config(format!("unknown gate group '{}'", group)))?;
        let layer = layer
            .parse()
            .map_err(|_| CircuitError::config(format!("malformed layer in gate key '{}'", name)))?;
        Ok(GateKey::new(group, layer))
    }
}

impl fmt::Display for GateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.layer)
    }
}

/// Position of one edge's gate inside the grouped gate tensors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeSlot {
    /// Gate group.
    pub group: GateGroup,
    /// Consumer layer (tensor index inside the group).
    pub layer: usize,
    /// Index inside the layer tensor (row axis excluded).
    pub index: Vec<usize>,
}

impl EdgeSlot {
    /// Tensor holding this slot.
    pub fn key(&self) -> GateKey {
        GateKey::new(self.group, self.layer)
    }
}

/// Static description of the producer/consumer DAG.
#[derive(Debug, Clone)]
pub struct ComputationGraph {
    dims: ModelDims,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl ComputationGraph {
    /// Graph containing every legal edge of a model with `dims`.
    pub fn dense(dims: ModelDims) -> Result<Self> {
        dims.validate()?;
        let nodes = Self::all_nodes(&dims);
        let mut edges = Vec::new();
        for &consumer in nodes.iter().filter(|n| n.is_consumer()) {
            for channel in Self::consumer_channels(consumer) {
                for producer in Self::producers_for(&dims, consumer) {
                    edges.push(Edge::new(producer, consumer, channel));
                }
            }
        }
        Ok(Self { dims, nodes, edges })
    }

    /// Graph over an explicit edge list. Every edge is validated; cyclic or
    /// forward-referencing declarations fail before the graph exists.
    pub fn from_edges(dims: ModelDims, edges: impl IntoIterator<Item = Edge>) -> Result<Self> {
        dims.validate()?;
        let mut seen = BTreeSet::new();
        for edge in edges {
            Self::check_edge(&dims, &edge)?;
            seen.insert(edge);
        }
        Ok(Self {
            dims,
            nodes: Self::all_nodes(&dims),
            edges: seen.into_iter().collect(),
        })
    }

    /// Model dimensions.
    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }

    /// All nodes in execution order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// All edges.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Producers that may legally feed `consumer`, in execution order.
    pub fn legal_producers(&self, consumer: Node) -> Vec<Node> {
        if !consumer.is_consumer() || !consumer.exists_in(&self.dims) {
            return Vec::new();
        }
        Self::producers_for(&self.dims, consumer)
    }

    /// Input channels of a consumer.
    pub fn consumer_channels(consumer: Node) -> Vec<Channel> {
        match consumer {
            Node::Attention { .. } => Channel::QKV.to_vec(),
            Node::Mlp { .. } | Node::Final => vec![Channel::Single],
            Node::Embedding => Vec::new(),
        }
    }

    /// Gate slot of an edge.
    pub fn slot(&self, edge: &Edge) -> Result<EdgeSlot> {
        Self::check_edge(&self.dims, edge)?;
        let dims = &self.dims;
        let consumer_layer = edge.consumer.layer(dims);
        let slot = match (edge.producer, edge.consumer) {
            (p, Node::Mlp { .. } | Node::Final) if p.stream_index().is_some() => EdgeSlot {
                group: GateGroup::MlpMlp,
                layer: consumer_layer,
                index: vec![p.stream_index().unwrap_or_default()],
            },
            (Node::Attention { layer, head }, Node::Mlp { .. } | Node::Final) => EdgeSlot {
                group: GateGroup::AttnMlp,
                layer: consumer_layer,
                index: vec![layer, head],
            },
            (p, Node::Attention { head: dest, .. }) if p.stream_index().is_some() => EdgeSlot {
                group: GateGroup::MlpAttn,
                layer: consumer_layer,
                index: vec![
                    Self::channel_index(edge)?,
                    dest,
                    p.stream_index().unwrap_or_default(),
                ],
            },
            (Node::Attention { layer, head }, Node::Attention { head: dest, .. }) => EdgeSlot {
                group: GateGroup::AttnAttn,
                layer: consumer_layer,
                index: vec![Self::channel_index(edge)?, dest, layer, head],
            },
            _ => {
                return Err(CircuitError::IllegalEdge {
                    producer: edge.producer,
                    consumer: edge.consumer,
                    reason: "no gate group addresses this pair".into(),
                })
            }
        };
        Ok(slot)
    }

    /// Edge addressed by a gate slot.
    pub fn edge_at(&self, slot: &EdgeSlot) -> Result<Edge> {
        let dims = &self.dims;
        let shape = slot.group.layer_shape(dims, slot.layer);
        if slot.layer >= slot.group.layer_count(dims)
            || slot.index.len() != shape.len()
            || slot.index.iter().zip(&shape).any(|(i, n)| i >= n)
        {
            return Err(CircuitError::config(format!(
                "slot {:?} outside {} layer {} shape {:?}",
                slot.index, slot.group, slot.layer, shape
            )));
        }
        let i = &slot.index;
        let edge = match slot.group {
            GateGroup::MlpMlp => Edge::new(
                Node::from_stream_index(i[0]),
                Node::mlp_or_final(slot.layer, dims),
                Channel::Single,
            ),
            GateGroup::AttnMlp => Edge::new(
                Node::Attention { layer: i[0], head: i[1] },
                Node::mlp_or_final(slot.layer, dims),
                Channel::Single,
            ),
            GateGroup::MlpAttn => Edge::new(
                Node::from_stream_index(i[2]),
                Node::Attention { layer: slot.layer, head: i[1] },
                Channel::QKV[i[0]],
            ),
            GateGroup::AttnAttn => Edge::new(
                Node::Attention { layer: i[2], head: i[3] },
                Node::Attention { layer: slot.layer, head: i[1] },
                Channel::QKV[i[0]],
            ),
            GateGroup::AttnNode | GateGroup::MlpNode => {
                return Err(CircuitError::config(format!(
                    "{} is a vertex group and addresses nodes, not edges",
                    slot.group
                )))
            }
        };
        Ok(edge)
    }

    /// Node gated by a vertex-group entry.
    pub fn vertex_at(&self, group: GateGroup, layer: usize, index: usize) -> Result<Node> {
        let dims = &self.dims;
        match group {
            GateGroup::AttnNode if layer < dims.n_layers && index < dims.n_heads => {
                Ok(Node::Attention { layer, head: index })
            }
            GateGroup::MlpNode if layer < dims.n_layers && index == 0 => Ok(Node::Mlp { layer }),
            _ => Err(CircuitError::config(format!(
                "no vertex at {} layer {} index {}",
                group, layer, index
            ))),
        }
    }

    fn all_nodes(dims: &ModelDims) -> Vec<Node> {
        let mut nodes = vec![Node::Embedding];
        for layer in 0..dims.n_layers {
            nodes.extend((0..dims.n_heads).map(|head| Node::Attention { layer, head }));
            nodes.push(Node::Mlp { layer });
        }
        nodes.push(Node::Final);
        nodes
    }

    fn producers_for(dims: &ModelDims, consumer: Node) -> Vec<Node> {
        let layer = consumer.layer(dims);
        let (attn_layers, stream) = match consumer {
            Node::Attention { .. } => (layer, layer + 1),
            Node::Mlp { .. } | Node::Final => (dims.attn_layers_before_mlp(layer), layer + 1),
            Node::Embedding => return Vec::new(),
        };
        let mut out = Vec::new();
        for j in 0..stream {
            out.push(Node::from_stream_index(j));
        }
        for l in 0..attn_layers {
            out.extend((0..dims.n_heads).map(|head| Node::Attention { layer: l, head }));
        }
        out.sort_by_key(|n| n.stage());
        out
    }

    fn channel_index(edge: &Edge) -> Result<usize> {
        edge.channel.qkv_index().ok_or_else(|| CircuitError::IllegalEdge {
            producer: edge.producer,
            consumer: edge.consumer,
            reason: "attention consumers read through q, k or v".into(),
        })
    }

    fn check_edge(dims: &ModelDims, edge: &Edge) -> Result<()> {
        let illegal = |reason: &str| CircuitError::IllegalEdge {
            producer: edge.producer,
            consumer: edge.consumer,
            reason: reason.to_string(),
        };
        if !edge.producer.exists_in(dims) || !edge.consumer.exists_in(dims) {
            return Err(illegal("node outside the model dimensions"));
        }
        if edge.producer == edge.consumer {
            return Err(CircuitError::Cycle(edge.to_string()));
        }
        if !edge.producer.is_producer() {
            return Err(illegal("final readout has no downstream consumers"));
        }
        if !edge.consumer.is_consumer() {
            return Err(illegal("embedding has no inputs"));
        }
        if edge.producer.stage() >= edge.consumer.stage() {
            return Err(illegal("producer does not execute before consumer"));
        }
        let channel_ok = match edge.consumer {
            Node::Attention { .. } => edge.channel.qkv_index().is_some(),
            _ => edge.channel == Channel::Single,
        };
        if !channel_ok {
            return Err(illegal("channel does not belong to consumer"));
        }
        Ok(())
    }
}
