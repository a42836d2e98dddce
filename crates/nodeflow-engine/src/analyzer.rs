//! Graph analysis: topological batches, weights and critical path
//!
//! Everything here is a pure function of the node and edge lists. The
//! resulting [`ExecutionPlan`] seeds an [`crate::ExecutionGraphStore`].
//!
//! Batching uses Kahn's algorithm in layers: every node whose dependencies
//! are all scheduled joins the next batch. Nodes inside one batch never
//! depend on each other, so they may run concurrently.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::{GraphEdge, NodeDefinition, NodeId};

/// Weight used for node types missing from the default table
pub const FALLBACK_WEIGHT: f64 = 10.0;

/// Default weight for a node type
///
/// Weights approximate relative cost. Cheap data plumbing is light,
/// I/O-bound work is heavier.
pub fn default_weight(node_type: &str) -> f64 {
    match node_type {
        "input" | "output" | "constant" => 1.0,
        "transform" | "merge" | "condition" => 5.0,
        "file-read" | "file-write" => 10.0,
        "delay" => 10.0,
        "group" | "composite" => 20.0,
        "http-request" => 25.0,
        "shell" => 30.0,
        "llm" => 50.0,
        _ => FALLBACK_WEIGHT,
    }
}

/// Default weights with optional per-type overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightTable {
    overrides: HashMap<String, f64>,
}

impl WeightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overrides(overrides: HashMap<String, f64>) -> Self {
        Self { overrides }
    }

    /// Weight for a node type
    pub fn weight_for_type(&self, node_type: &str) -> f64 {
        self.overrides
            .get(node_type)
            .copied()
            .filter(|w| usable_weight(*w))
            .unwrap_or_else(|| default_weight(node_type))
    }

    /// Weight for a concrete node; an explicit override on the node wins
    pub fn weight_for(&self, node: &NodeDefinition) -> f64 {
        match node.weight {
            Some(w) if usable_weight(w) => w,
            Some(w) => {
                log::warn!(
                    "Ignoring unusable weight {} on node '{}', using type default",
                    w,
                    node.id
                );
                self.weight_for_type(&node.node_type)
            }
            None => self.weight_for_type(&node.node_type),
        }
    }
}

fn usable_weight(w: f64) -> bool {
    w.is_finite() && w > 0.0
}

/// Scheduling plan for one set of sibling nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    /// Batches in execution order
    pub execution_order: Vec<Vec<NodeId>>,
    /// Highest cumulative weight dependency chain, first to last
    pub critical_path: Vec<NodeId>,
    /// Sum of all node weights
    pub total_weight: f64,
    /// Size of the largest batch
    pub max_parallelism: usize,
    pub weights: HashMap<NodeId, f64>,
    /// Dependency pairs (source, target) between known nodes
    pub edges: Vec<(NodeId, NodeId)>,
}

impl ExecutionPlan {
    /// Index of the batch that contains `node_id`
    pub fn batch_index(&self, node_id: &str) -> Option<usize> {
        self.execution_order
            .iter()
            .position(|batch| batch.iter().any(|id| id == node_id))
    }

    pub fn node_count(&self) -> usize {
        self.weights.len()
    }
}

/// Analyze a node set with the default weight table
pub fn analyze_execution_graph(nodes: &[NodeDefinition], edges: &[GraphEdge]) -> Result<ExecutionPlan> {
    analyze_with_weights(nodes, edges, &WeightTable::default())
}

/// Analyze a node set, resolving weights through `weights`
pub fn analyze_with_weights(
    nodes: &[NodeDefinition],
    edges: &[GraphEdge],
    weights: &WeightTable,
) -> Result<ExecutionPlan> {
    let node_ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    let dependency_edges = dependency_pairs(&node_ids, edges);

    let execution_order = topological_sort(&node_ids, &dependency_edges)?;

    let node_weights: HashMap<NodeId, f64> = nodes
        .iter()
        .map(|n| (n.id.clone(), weights.weight_for(n)))
        .collect();
    let total_weight = node_weights.values().sum();

    let critical_path = critical_path(&node_ids, &dependency_edges, &execution_order, &node_weights);
    let max_parallelism = execution_order.iter().map(Vec::len).max().unwrap_or(0);

    log::debug!(
        "Analyzed {} nodes into {} batches (max parallelism {}, total weight {})",
        node_ids.len(),
        execution_order.len(),
        max_parallelism,
        total_weight
    );

    Ok(ExecutionPlan {
        execution_order,
        critical_path,
        total_weight,
        max_parallelism,
        weights: node_weights,
        edges: dependency_edges,
    })
}

/// Deduplicated (source, target) pairs whose endpoints are both known
fn dependency_pairs(node_ids: &[&str], edges: &[GraphEdge]) -> Vec<(NodeId, NodeId)> {
    let known: HashSet<&str> = node_ids.iter().copied().collect();
    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    let mut pairs = Vec::new();

    for edge in edges {
        if !known.contains(edge.source.as_str()) || !known.contains(edge.target.as_str()) {
            log::debug!(
                "Edge '{}' references a node outside this graph, ignoring for scheduling",
                edge.id
            );
            continue;
        }
        if seen.insert((edge.source.as_str(), edge.target.as_str())) {
            pairs.push((edge.source.clone(), edge.target.clone()));
        }
    }
    pairs
}

/// Group nodes into dependency-ordered batches
///
/// Within a batch, nodes keep their insertion order. Fails with
/// [`EngineError::GraphCycle`] when some nodes can never become eligible.
pub fn topological_sort(node_ids: &[&str], edges: &[(NodeId, NodeId)]) -> Result<Vec<Vec<NodeId>>> {
    let position: HashMap<&str, usize> = node_ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut in_degree: Vec<usize> = vec![0; node_ids.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); node_ids.len()];
    for (source, target) in edges {
        if let (Some(&s), Some(&t)) = (position.get(source.as_str()), position.get(target.as_str())) {
            in_degree[t] += 1;
            successors[s].push(t);
        }
    }

    let mut current: Vec<usize> = (0..node_ids.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut batches = Vec::new();
    let mut scheduled = 0;

    while !current.is_empty() {
        scheduled += current.len();
        let mut next = Vec::new();
        for &idx in &current {
            for &succ in &successors[idx] {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    next.push(succ);
                }
            }
        }
        next.sort_unstable();
        batches.push(current.iter().map(|&i| node_ids[i].to_string()).collect());
        current = next;
    }

    if scheduled < node_ids.len() {
        let remaining: Vec<String> = (0..node_ids.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| node_ids[i].to_string())
            .collect();
        return Err(EngineError::GraphCycle { remaining });
    }

    Ok(batches)
}

/// Longest-weight dependency chain
///
/// One pass in topological order accumulates (cumulative weight,
/// predecessor) per node, then backtracks from the heaviest node. Equal
/// weights resolve to the node that appears first in `node_ids`.
fn critical_path(
    node_ids: &[&str],
    edges: &[(NodeId, NodeId)],
    execution_order: &[Vec<NodeId>],
    weights: &HashMap<NodeId, f64>,
) -> Vec<NodeId> {
    let position: HashMap<&str, usize> = node_ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); node_ids.len()];
    for (source, target) in edges {
        if let (Some(&s), Some(&t)) = (position.get(source.as_str()), position.get(target.as_str())) {
            predecessors[t].push(s);
        }
    }

    let mut cumulative: Vec<f64> = vec![0.0; node_ids.len()];
    let mut best_pred: Vec<Option<usize>> = vec![None; node_ids.len()];

    for id in execution_order.iter().flatten() {
        let Some(&idx) = position.get(id.as_str()) else {
            continue;
        };
        let mut best: Option<usize> = None;
        for &p in &predecessors[idx] {
            best = match best {
                None => Some(p),
                Some(b) if cumulative[p] > cumulative[b] || (cumulative[p] == cumulative[b] && p < b) => Some(p),
                keep => keep,
            };
        }
        let own = weights.get(id).copied().unwrap_or(FALLBACK_WEIGHT);
        cumulative[idx] = own + best.map(|b| cumulative[b]).unwrap_or(0.0);
        best_pred[idx] = best;
    }

    let mut end: Option<usize> = None;
    for idx in 0..node_ids.len() {
        end = match end {
            None => Some(idx),
            Some(e) if cumulative[idx] > cumulative[e] => Some(idx),
            keep => keep,
        };
    }

    let mut path = Vec::new();
    let mut cursor = end;
    while let Some(idx) = cursor {
        path.push(node_ids[idx].to_string());
        cursor = best_pred[idx];
    }
    path.reverse();
    path
}

/// Batches that contain more than one node
pub fn parallel_branches(plan: &ExecutionPlan) -> Vec<&[NodeId]> {
    plan.execution_order
        .iter()
        .filter(|batch| batch.len() > 1)
        .map(Vec::as_slice)
        .collect()
}
