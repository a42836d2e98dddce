//! Execution graph state for a single composite run
//!
//! The store is seeded from an [`ExecutionPlan`] and is the only place node
//! state changes. Every mutation recomputes progress through
//! [`calculate_progress`] and caches it, so reads are free. Invalid
//! transitions are logged and ignored.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analyzer::ExecutionPlan;
use crate::progress::calculate_progress;
use crate::types::{NodeDefinition, NodeId};

/// Lifecycle state of a node within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Executing,
    Completed,
    Error,
    Skipped,
}

impl NodeState {
    /// Completed, error or skipped
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Skipped)
    }
}

/// Per-run record for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionGraphNode {
    pub id: NodeId,
    pub node_type: String,
    pub weight: f64,
    pub state: NodeState,
    /// 0-100, meaningful only while executing
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Composite that owns this node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    pub is_composite: bool,
}

/// Snapshot of a run: plan, node table and cached progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionGraphState {
    pub nodes: HashMap<NodeId, ExecutionGraphNode>,
    pub edges: Vec<(NodeId, NodeId)>,
    pub execution_order: Vec<Vec<NodeId>>,
    pub critical_path: Vec<NodeId>,
    pub total_weight: f64,
    pub max_parallelism: usize,
    pub is_executing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub cached_progress: u8,
    /// Final state of composite children, keyed by child id
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub nested: HashMap<NodeId, ExecutionGraphState>,
}

impl ExecutionGraphState {
    /// Seed a state with every node pending
    pub fn from_plan(plan: &ExecutionPlan, nodes: &[NodeDefinition], parent_id: Option<&str>) -> Self {
        let table = nodes
            .iter()
            .map(|def| {
                let node = ExecutionGraphNode {
                    id: def.id.clone(),
                    node_type: def.node_type.clone(),
                    weight: plan.weights.get(&def.id).copied().unwrap_or(0.0),
                    state: NodeState::Pending,
                    progress: 0.0,
                    message: None,
                    error: None,
                    started_at: None,
                    ended_at: None,
                    parent_id: parent_id.map(str::to_string),
                    is_composite: def.is_composite(),
                };
                (def.id.clone(), node)
            })
            .collect();

        Self {
            nodes: table,
            edges: plan.edges.clone(),
            execution_order: plan.execution_order.clone(),
            critical_path: plan.critical_path.clone(),
            total_weight: plan.total_weight,
            max_parallelism: plan.max_parallelism,
            is_executing: false,
            started_at: None,
            ended_at: None,
            cached_progress: 0,
            nested: HashMap::new(),
        }
    }

    pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
        self.nodes.get(node_id).map(|n| n.state)
    }

    /// Look a node up here or in any nested composite state
    pub fn find_node(&self, node_id: &str) -> Option<&ExecutionGraphNode> {
        self.nodes
            .get(node_id)
            .or_else(|| self.nested.values().find_map(|n| n.find_node(node_id)))
    }

    /// IDs of nodes currently in `state`
    pub fn nodes_in_state(&self, state: NodeState) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.state == state)
            .map(|n| n.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Single-writer container for one run's [`ExecutionGraphState`]
#[derive(Debug, Clone)]
pub struct ExecutionGraphStore {
    state: ExecutionGraphState,
}

impl ExecutionGraphStore {
    /// Seed a store from an analyzer plan
    pub fn new(plan: &ExecutionPlan, nodes: &[NodeDefinition], parent_id: Option<&str>) -> Self {
        Self {
            state: ExecutionGraphState::from_plan(plan, nodes, parent_id),
        }
    }

    /// Cached progress, never recomputed on read
    pub fn progress(&self) -> u8 {
        self.state.cached_progress
    }

    pub fn state(&self) -> &ExecutionGraphState {
        &self.state
    }

    pub fn node(&self, node_id: &str) -> Option<&ExecutionGraphNode> {
        self.state.nodes.get(node_id)
    }

    /// Owned copy for observers and results
    pub fn snapshot(&self) -> ExecutionGraphState {
        self.state.clone()
    }

    pub fn into_state(self) -> ExecutionGraphState {
        self.state
    }

    /// Mark the run as executing
    pub fn start_execution(&mut self) {
        self.state.is_executing = true;
        self.state.started_at = Some(Utc::now());
        self.state.ended_at = None;
        self.refresh_progress();
    }

    /// pending -> executing
    pub fn start_node(&mut self, node_id: &str) -> bool {
        let Some(node) = self.state.nodes.get_mut(node_id) else {
            log::warn!("start_node: unknown node '{}'", node_id);
            return false;
        };
        if node.state != NodeState::Pending {
            log::warn!("start_node: node '{}' is {:?}, not pending", node_id, node.state);
            return false;
        }
        node.state = NodeState::Executing;
        node.progress = 0.0;
        node.started_at = Some(Utc::now());
        self.refresh_progress();
        true
    }

    /// Raise progress of an executing node, clamped to 0-100
    ///
    /// Lower values are ignored; returns false when nothing changed.
    pub fn update_node_progress(&mut self, node_id: &str, progress: f64, message: Option<String>) -> bool {
        let Some(node) = self.state.nodes.get_mut(node_id) else {
            log::warn!("update_node_progress: unknown node '{}'", node_id);
            return false;
        };
        if node.state != NodeState::Executing {
            log::debug!(
                "update_node_progress: node '{}' is {:?}, ignoring update",
                node_id,
                node.state
            );
            return false;
        }
        let reported = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 100.0) };
        if reported < node.progress {
            log::debug!(
                "update_node_progress: node '{}' reported {} below {}, keeping",
                node_id,
                reported,
                node.progress
            );
        }
        let progress = node.progress.max(reported);
        let changed = progress != node.progress || message.is_some();
        node.progress = progress;
        if message.is_some() {
            node.message = message;
        }
        if changed {
            self.refresh_progress();
        }
        changed
    }

    /// executing -> completed
    pub fn complete_node(&mut self, node_id: &str) -> bool {
        let Some(node) = self.state.nodes.get_mut(node_id) else {
            log::warn!("complete_node: unknown node '{}'", node_id);
            return false;
        };
        if node.state != NodeState::Executing {
            log::warn!("complete_node: node '{}' is {:?}, not executing", node_id, node.state);
            return false;
        }
        node.state = NodeState::Completed;
        node.progress = 100.0;
        node.ended_at = Some(Utc::now());
        self.refresh_progress();
        true
    }

    /// executing -> error
    pub fn error_node(&mut self, node_id: &str, error: impl Into<String>) -> bool {
        let Some(node) = self.state.nodes.get_mut(node_id) else {
            log::warn!("error_node: unknown node '{}'", node_id);
            return false;
        };
        if node.state != NodeState::Executing {
            log::warn!("error_node: node '{}' is {:?}, not executing", node_id, node.state);
            return false;
        }
        node.state = NodeState::Error;
        node.error = Some(error.into());
        node.ended_at = Some(Utc::now());
        self.refresh_progress();
        true
    }

    /// pending -> skipped
    pub fn skip_node(&mut self, node_id: &str) -> bool {
        let Some(node) = self.state.nodes.get_mut(node_id) else {
            log::warn!("skip_node: unknown node '{}'", node_id);
            return false;
        };
        if node.state != NodeState::Pending {
            log::debug!("skip_node: node '{}' is {:?}, not pending", node_id, node.state);
            return false;
        }
        node.state = NodeState::Skipped;
        node.ended_at = Some(Utc::now());
        self.refresh_progress();
        true
    }

    /// executing -> skipped, for an in-flight node that settled by cancellation
    pub fn cancel_node(&mut self, node_id: &str) -> bool {
        let Some(node) = self.state.nodes.get_mut(node_id) else {
            log::warn!("cancel_node: unknown node '{}'", node_id);
            return false;
        };
        if node.state != NodeState::Executing {
            log::warn!("cancel_node: node '{}' is {:?}, not executing", node_id, node.state);
            return false;
        }
        node.state = NodeState::Skipped;
        node.message = Some("cancelled".to_string());
        node.ended_at = Some(Utc::now());
        self.refresh_progress();
        true
    }

    /// Skip every node that is still pending; returns the skipped ids
    pub fn skip_pending(&mut self) -> Vec<NodeId> {
        let now = Utc::now();
        let mut skipped = Vec::new();
        for batch in &self.state.execution_order {
            for id in batch {
                if let Some(node) = self.state.nodes.get_mut(id) {
                    if node.state == NodeState::Pending {
                        node.state = NodeState::Skipped;
                        node.ended_at = Some(now);
                        skipped.push(id.clone());
                    }
                }
            }
        }
        if !skipped.is_empty() {
            self.refresh_progress();
        }
        skipped
    }

    /// Keep the final state of a composite child's own run
    pub fn attach_nested(&mut self, node_id: &str, nested: ExecutionGraphState) {
        self.state.nested.insert(node_id.to_string(), nested);
    }

    /// Mark the run finished
    pub fn complete_execution(&mut self) {
        self.state.is_executing = false;
        self.state.ended_at = Some(Utc::now());
        self.refresh_progress();
    }

    fn refresh_progress(&mut self) {
        self.state.cached_progress = calculate_progress(&self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze_execution_graph;
    use crate::types::GraphEdge;

    fn two_node_store() -> ExecutionGraphStore {
        let nodes = vec![
            NodeDefinition::new("a", "transform").with_weight(10.0),
            NodeDefinition::new("b", "transform").with_weight(10.0),
        ];
        let edges = vec![GraphEdge::new("e1", "a", "b")];
        let plan = analyze_execution_graph(&nodes, &edges).unwrap();
        ExecutionGraphStore::new(&plan, &nodes, Some("group"))
    }

    #[test]
    fn test_seeded_pending() {
        let store = two_node_store();
        assert_eq!(store.progress(), 0);
        assert_eq!(store.state().nodes_in_state(NodeState::Pending), vec!["a", "b"]);
        assert_eq!(store.node("a").unwrap().parent_id.as_deref(), Some("group"));
        assert!(!store.state().is_executing);
    }

    #[test]
    fn test_lifecycle_updates_cached_progress() {
        let mut store = two_node_store();
        store.start_execution();
        assert!(store.state().is_executing);

        assert!(store.start_node("a"));
        assert!(store.update_node_progress("a", 50.0, Some("halfway".into())));
        assert_eq!(store.progress(), 25);
        assert_eq!(store.node("a").unwrap().message.as_deref(), Some("halfway"));

        assert!(store.complete_node("a"));
        assert_eq!(store.progress(), 50);

        assert!(store.start_node("b"));
        assert!(store.update_node_progress("b", 50.0, None));
        assert_eq!(store.progress(), 75);

        assert!(store.complete_node("b"));
        store.complete_execution();
        assert_eq!(store.progress(), 100);
        assert!(!store.state().is_executing);
        assert!(store.state().ended_at.is_some());
    }

    #[test]
    fn test_double_start_is_noop() {
        let mut store = two_node_store();
        assert!(store.start_node("a"));
        let started = store.node("a").unwrap().started_at;
        assert!(!store.start_node("a"));
        assert_eq!(store.node("a").unwrap().started_at, started);
    }

    #[test]
    fn test_progress_only_while_executing() {
        let mut store = two_node_store();
        assert!(!store.update_node_progress("a", 40.0, None));
        assert_eq!(store.node("a").unwrap().progress, 0.0);

        store.start_node("a");
        store.update_node_progress("a", -3.0, None);
        assert_eq!(store.node("a").unwrap().progress, 0.0);
        store.update_node_progress("a", 140.0, None);
        assert_eq!(store.node("a").unwrap().progress, 100.0);
    }

    #[test]
    fn test_progress_never_lowered() {
        let mut store = two_node_store();
        store.start_node("a");
        assert!(store.update_node_progress("a", 80.0, None));
        assert_eq!(store.progress(), 40);

        assert!(!store.update_node_progress("a", 10.0, None));
        assert_eq!(store.node("a").unwrap().progress, 80.0);
        assert_eq!(store.progress(), 40);

        assert!(store.update_node_progress("a", 10.0, Some("second attempt".into())));
        assert_eq!(store.node("a").unwrap().progress, 80.0);
        assert_eq!(store.node("a").unwrap().message.as_deref(), Some("second attempt"));
    }

    #[test]
    fn test_error_keeps_completed_credit() {
        let mut store = two_node_store();
        store.start_node("a");
        store.complete_node("a");
        store.start_node("b");
        store.update_node_progress("b", 80.0, None);
        assert_eq!(store.progress(), 90);

        assert!(store.error_node("b", "boom"));
        assert_eq!(store.progress(), 50);
        assert_eq!(store.node("b").unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut store = two_node_store();
        assert!(!store.complete_node("a"));
        assert!(!store.error_node("a", "x"));
        assert!(!store.start_node("missing"));

        store.start_node("a");
        assert!(!store.skip_node("a"));
        assert!(store.skip_node("b"));
        assert!(!store.skip_node("b"));
    }

    #[test]
    fn test_skip_pending_counts_as_resolved() {
        let mut store = two_node_store();
        store.start_node("a");
        store.complete_node("a");
        let skipped = store.skip_pending();
        assert_eq!(skipped, vec!["b"]);
        assert_eq!(store.progress(), 100);
        assert_eq!(store.state().node_state("b"), Some(NodeState::Skipped));
    }

    #[test]
    fn test_cancel_only_from_executing() {
        let mut store = two_node_store();
        assert!(!store.cancel_node("a"));
        store.start_node("a");
        assert!(store.cancel_node("a"));
        assert_eq!(store.state().node_state("a"), Some(NodeState::Skipped));
        assert_eq!(store.node("a").unwrap().message.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_find_node_searches_nested() {
        let mut store = two_node_store();
        let inner = two_node_store().into_state();
        let mut renamed = inner.clone();
        let mut node = renamed.nodes.remove("a").unwrap();
        node.id = "deep".into();
        renamed.nodes.insert("deep".into(), node);
        store.attach_nested("b", renamed);

        assert!(store.state().find_node("a").is_some());
        assert!(store.state().find_node("deep").is_some());
        assert!(store.state().find_node("nope").is_none());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let store = two_node_store();
        let json = serde_json::to_value(store.snapshot()).unwrap();
        assert!(json.get("executionOrder").is_some());
        assert!(json.get("cachedProgress").is_some());
        assert_eq!(json["nodes"]["a"]["state"], "pending");
    }
}
