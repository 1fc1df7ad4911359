//! Discrete circuits: thresholding, dangling-edge pruning and comparison.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;

use ndarray::{ArrayD, Dimension, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CircuitError, Result};
use crate::graph::{ComputationGraph, Edge, EdgeSlot, GateKey, Granularity, ModelDims, Node};

/// Continuous keep scores, one tensor per gate key.
#[derive(Debug, Clone)]
pub struct ContinuousMask {
    dims: ModelDims,
    granularity: Granularity,
    scores: BTreeMap<GateKey, ArrayD<f32>>,
}

impl ContinuousMask {
    /// Wrap per-key scores. Layout is checked by [`ContinuousMask::discretize`].
    pub fn from_scores(
        dims: ModelDims,
        granularity: Granularity,
        scores: BTreeMap<GateKey, ArrayD<f32>>,
    ) -> Self {
        Self {
            dims,
            granularity,
            scores,
        }
    }

    /// Scores of `key`.
    pub fn get(&self, key: GateKey) -> Option<&ArrayD<f32>> {
        self.scores.get(&key)
    }

    /// Keep exactly the gates whose score is strictly above `threshold`.
    pub fn discretize(&self, threshold: f32) -> Result<Circuit> {
        if threshold.is_nan() {
            return Err(CircuitError::config("discretization threshold is NaN"));
        }
        let mut keep = BTreeMap::new();
        for key in GateKey::all(&self.dims, self.granularity) {
            let scores = self
                .scores
                .get(&key)
                .ok_or_else(|| CircuitError::config(format!("no scores for {}", key)))?;
            let expected = key.shape(&self.dims);
            if scores.shape() != expected.as_slice() {
                return Err(CircuitError::shape_mismatch(
                    key.to_string(),
                    &expected,
                    scores.shape(),
                ));
            }
            keep.insert(key, scores.mapv(|s| s > threshold));
        }
        Ok(Circuit {
            dims: self.dims,
            granularity: self.granularity,
            keep,
        })
    }
}

/// A discrete circuit: one boolean per gate.
#[derive(Debug, Clone, PartialEq)]
pub struct Circuit {
    dims: ModelDims,
    granularity: Granularity,
    keep: BTreeMap<GateKey, ArrayD<bool>>,
}

/// Result of [`Circuit::prune_dangling`].
#[derive(Debug, Clone)]
pub struct PrunedCircuit {
    /// Circuit without dangling edges.
    pub circuit: Circuit,
    /// Kept edges before pruning.
    pub edge_count: usize,
    /// Kept edges after pruning.
    pub clipped_edge_count: usize,
    /// Whether each node still has an edge after pruning.
    pub node_kept: BTreeMap<Node, bool>,
}

impl Circuit {
    fn filled(dims: ModelDims, granularity: Granularity, value: bool) -> Self {
        let keep = GateKey::all(&dims, granularity)
            .into_iter()
            .map(|key| (key, ArrayD::from_elem(IxDyn(&key.shape(&dims)), value)))
            .collect();
        Self {
            dims,
            granularity,
            keep,
        }
    }

    /// Circuit with every gate closed.
    pub fn empty(dims: ModelDims, granularity: Granularity) -> Self {
        Self::filled(dims, granularity, false)
    }

    /// Circuit with every gate open.
    pub fn full(dims: ModelDims, granularity: Granularity) -> Self {
        Self::filled(dims, granularity, true)
    }

    /// Edge circuit containing exactly `edges`.
    pub fn from_edges(dims: ModelDims, edges: impl IntoIterator<Item = Edge>) -> Result<Self> {
        let graph = ComputationGraph::dense(dims)?;
        let mut circuit = Self::empty(dims, Granularity::Edge);
        for edge in edges {
            let slot = graph.slot(&edge)?;
            circuit.set_slot(&slot, true)?;
        }
        Ok(circuit)
    }

    /// Edge circuit containing every legal edge among `nodes`. The embedding
    /// and the final readout are always included.
    pub fn from_nodes(dims: ModelDims, nodes: impl IntoIterator<Item = Node>) -> Result<Self> {
        let mut kept: BTreeSet<Node> = nodes.into_iter().collect();
        for node in &kept {
            if !node.exists_in(&dims) {
                return Err(CircuitError::config(format!("node {} is not part of the model", node)));
            }
        }
        kept.insert(Node::Embedding);
        kept.insert(Node::Final);
        let graph = ComputationGraph::dense(dims)?;
        let edges = graph
            .edges()
            .iter()
            .filter(|e| kept.contains(&e.producer) && kept.contains(&e.consumer))
            .copied()
            .collect::<Vec<_>>();
        Self::from_edges(dims, edges)
    }

    /// Model dimensions.
    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }

    /// Edge or vertex gates.
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Boolean tensor of `key`.
    pub fn get(&self, key: GateKey) -> Result<&ArrayD<bool>> {
        self.keep
            .get(&key)
            .ok_or_else(|| CircuitError::config(format!("circuit has no tensor for {}", key)))
    }

    /// Iterate over all tensors.
    pub fn iter(&self) -> impl Iterator<Item = (&GateKey, &ArrayD<bool>)> {
        self.keep.iter()
    }

    fn set_slot(&mut self, slot: &EdgeSlot, value: bool) -> Result<()> {
        let key = slot.key();
        let tensor = self
            .keep
            .get_mut(&key)
            .ok_or_else(|| CircuitError::config(format!("circuit has no tensor for {}", key)))?;
        let cell = tensor
            .get_mut(IxDyn(&slot.index))
            .ok_or_else(|| CircuitError::config(format!("slot {:?} outside {}", slot.index, key)))?;
        *cell = value;
        Ok(())
    }

    fn require_edges(&self) -> Result<()> {
        if self.granularity != Granularity::Edge {
            return Err(CircuitError::config("operation needs an edge-level circuit"));
        }
        Ok(())
    }

    /// Number of kept gates (edges, or nodes for a vertex circuit).
    pub fn edge_count(&self) -> usize {
        self.keep.values().map(|t| t.iter().filter(|&&k| k).count()).sum()
    }

    /// Kept edges in gate-key order.
    pub fn edges(&self) -> Result<Vec<Edge>> {
        self.require_edges()?;
        let graph = ComputationGraph::dense(self.dims)?;
        let mut edges = Vec::with_capacity(self.edge_count());
        for (key, tensor) in &self.keep {
            for (idx, &kept) in tensor.indexed_iter() {
                if kept {
                    let slot = EdgeSlot {
                        group: key.group,
                        layer: key.layer,
                        index: idx.slice().to_vec(),
                    };
                    edges.push(graph.edge_at(&slot)?);
                }
            }
        }
        Ok(edges)
    }

    fn check_compatible(&self, other: &Circuit) -> Result<()> {
        if self.dims != other.dims || self.granularity != other.granularity {
            return Err(CircuitError::config(format!(
                "circuits have different layouts: {:?}/{:?} vs {:?}/{:?}",
                self.dims, self.granularity, other.dims, other.granularity
            )));
        }
        Ok(())
    }

    /// Fraction of the smaller circuit's gates that the other also keeps.
    /// Zero when either circuit is empty.
    pub fn overlap(&self, other: &Circuit) -> Result<f32> {
        self.check_compatible(other)?;
        let mut shared = 0usize;
        for (key, mine) in &self.keep {
            let theirs = other.get(*key)?;
            shared += mine.iter().zip(theirs.iter()).filter(|&(&a, &b)| a && b).count();
        }
        let smaller = self.edge_count().min(other.edge_count());
        if smaller == 0 {
            return Ok(0.0);
        }
        Ok(shared as f32 / smaller as f32)
    }

    /// Remove edges whose producer cannot be reached from the embedding or
    /// whose consumer cannot reach the final readout, to a fixed point.
    pub fn prune_dangling(&self) -> Result<PrunedCircuit> {
        self.require_edges()?;
        let graph = ComputationGraph::dense(self.dims)?;
        let mut edges: BTreeSet<Edge> = self.edges()?.into_iter().collect();
        let edge_count = edges.len();

        loop {
            let forward = reachable(&edges, Node::Embedding, |e| (e.producer, e.consumer));
            let backward = reachable(&edges, Node::Final, |e| (e.consumer, e.producer));
            let before = edges.len();
            edges.retain(|e| forward.contains(&e.producer) && backward.contains(&e.consumer));
            if edges.len() == before {
                break;
            }
        }

        let mut node_kept: BTreeMap<Node, bool> =
            graph.nodes().iter().map(|n| (*n, false)).collect();
        for edge in &edges {
            node_kept.insert(edge.producer, true);
            node_kept.insert(edge.consumer, true);
        }
        let clipped_edge_count = edges.len();
        debug!(edge_count, clipped_edge_count, "dangling edges pruned");

        Ok(PrunedCircuit {
            circuit: Circuit::from_edges(self.dims, edges)?,
            edge_count,
            clipped_edge_count,
            node_kept,
        })
    }

    /// Write the circuit as JSON keyed by gate tensor name.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = CircuitFile {
            dims: self.dims,
            granularity: self.granularity,
            tensors: self.keep.iter().map(|(k, t)| (k.to_string(), t.clone())).collect(),
        };
        fs::write(path, serde_json::to_vec(&file)?)?;
        Ok(())
    }

    /// Read a circuit written by [`Circuit::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file: CircuitFile = serde_json::from_slice(&fs::read(path)?)?;
        let mut keep = BTreeMap::new();
        for (name, tensor) in file.tensors {
            keep.insert(GateKey::parse(&name)?, tensor);
        }
        let circuit = Circuit {
            dims: file.dims,
            granularity: file.granularity,
            keep,
        };
        circuit.validate()?;
        Ok(circuit)
    }

    fn validate(&self) -> Result<()> {
        let keys = GateKey::all(&self.dims, self.granularity);
        if keys.len() != self.keep.len() {
            return Err(CircuitError::config(format!(
                "circuit holds {} tensors, layout needs {}",
                self.keep.len(),
                keys.len()
            )));
        }
        for key in keys {
            let expected = key.shape(&self.dims);
            let actual = self.get(key)?.shape();
            if actual != expected.as_slice() {
                return Err(CircuitError::shape_mismatch(key.to_string(), &expected, actual));
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct CircuitFile {
    dims: ModelDims,
    granularity: Granularity,
    tensors: BTreeMap<String, ArrayD<bool>>,
}

/// Nodes reachable from `start` following `step(edge) = (from, to)`.
fn reachable(
    edges: &BTreeSet<Edge>,
    start: Node,
    step: impl Fn(&Edge) -> (Node, Node),
) -> BTreeSet<Node> {
    let mut adjacency: BTreeMap<Node, Vec<Node>> = BTreeMap::new();
    for edge in edges {
        let (from, to) = step(edge);
        adjacency.entry(from).or_default().push(to);
    }
    let mut seen = BTreeSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        for &next in adjacency.get(&node).map(Vec::as_slice).unwrap_or(&[]) {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Channel;

    fn dims() -> ModelDims {
        ModelDims::new(2, 2, 4, 2)
    }

    fn head(layer: usize, head: usize) -> Node {
        Node::Attention { layer, head }
    }

    #[test]
    fn test_discretize_is_strict() {
        let d = dims();
        let scores = GateKey::all(&d, Granularity::Vertex)
            .into_iter()
            .map(|k| (k, ArrayD::from_elem(IxDyn(&k.shape(&d)), 0.5f32)))
            .collect();
        let mask = ContinuousMask::from_scores(d, Granularity::Vertex, scores);
        assert_eq!(mask.discretize(0.4).unwrap().edge_count(), 2 * 2 + 2);
        assert_eq!(mask.discretize(0.5).unwrap().edge_count(), 0);
    }

    #[test]
    fn test_from_edges_roundtrip() {
        let edges = vec![
            Edge::new(Node::Embedding, head(0, 1), Channel::Key),
            Edge::new(head(0, 1), Node::Mlp { layer: 1 }, Channel::Single),
            Edge::new(Node::Mlp { layer: 1 }, Node::Final, Channel::Single),
        ];
        let circuit = Circuit::from_edges(dims(), edges.clone()).unwrap();
        assert_eq!(circuit.edge_count(), 3);
        let mut back = circuit.edges().unwrap();
        back.sort();
        let mut expected = edges;
        expected.sort();
        assert_eq!(back, expected);
    }

    #[test]
    fn test_from_nodes_keeps_edges_among_nodes() {
        let circuit = Circuit::from_nodes(dims(), [Node::Mlp { layer: 0 }]).unwrap();
        // embed -> m0, embed -> final, m0 -> final
        assert_eq!(circuit.edge_count(), 3);
        assert!(Circuit::from_nodes(dims(), [head(5, 0)]).is_err());
    }

    #[test]
    fn test_overlap_uses_smaller_circuit() {
        let a = Circuit::from_nodes(dims(), [Node::Mlp { layer: 0 }]).unwrap();
        let b = Circuit::full(dims(), Granularity::Edge);
        assert_eq!(a.overlap(&b).unwrap(), 1.0);
        assert_eq!(a.overlap(&Circuit::empty(dims(), Granularity::Edge)).unwrap(), 0.0);
        assert!(a.overlap(&Circuit::full(dims(), Granularity::Vertex)).is_err());
    }

    #[test]
    fn test_prune_dangling_removes_unreachable() {
        // a0.0 has no input, m0 has no path to the final readout.
        let edges = vec![
            Edge::new(Node::Embedding, head(1, 0), Channel::Value),
            Edge::new(head(1, 0), Node::Final, Channel::Single),
            Edge::new(head(0, 0), head(1, 0), Channel::Query),
            Edge::new(Node::Embedding, Node::Mlp { layer: 0 }, Channel::Single),
        ];
        let pruned = Circuit::from_edges(dims(), edges).unwrap().prune_dangling().unwrap();
        assert_eq!(pruned.edge_count, 4);
        assert_eq!(pruned.clipped_edge_count, 2);
        assert!(pruned.node_kept[&head(1, 0)]);
        assert!(!pruned.node_kept[&head(0, 0)]);
        assert!(!pruned.node_kept[&Node::Mlp { layer: 0 }]);
        let again = pruned.circuit.prune_dangling().unwrap();
        assert_eq!(again.circuit, pruned.circuit);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("circuit.json");
        let circuit = Circuit::from_nodes(dims(), [head(0, 1), Node::Mlp { layer: 1 }]).unwrap();
        circuit.save(&path).unwrap();
        assert_eq!(Circuit::load(&path).unwrap(), circuit);
    }
}
