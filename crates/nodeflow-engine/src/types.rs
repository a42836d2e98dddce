//! Core types for node definition trees
//!
//! A [`NodeDefinition`] is the read-only input to the engine. Atomic nodes
//! carry a type and parameters; composite nodes additionally carry child
//! definitions and the edges among them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unique identifier for a node
pub type NodeId = String;

/// Unique identifier for an edge
pub type EdgeId = String;

/// Input key used when an edge has no target handle
pub const DEFAULT_INPUT_HANDLE: &str = "input";

/// Node type of composites built with [`NodeDefinition::composite`]
pub const COMPOSITE_NODE_TYPE: &str = "group";

/// The data type of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDataType {
    /// Accepts any type
    #[default]
    Any,
    String,
    Number,
    Boolean,
    Json,
    Binary,
}

/// Declaration of an input or output port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDefinition {
    pub id: String,
    #[serde(default)]
    pub data_type: PortDataType,
    #[serde(default)]
    pub required: bool,
}

impl PortDefinition {
    /// Create a required port
    pub fn required(id: impl Into<String>, data_type: PortDataType) -> Self {
        Self {
            id: id.into(),
            data_type,
            required: true,
        }
    }

    /// Create an optional port
    pub fn optional(id: impl Into<String>, data_type: PortDataType) -> Self {
        Self {
            id: id.into(),
            data_type,
            required: false,
        }
    }
}

/// A data edge between two sibling nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub id: EdgeId,
    pub source: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    pub target: NodeId,
    /// Key under which the source output lands in the target's input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl GraphEdge {
    /// Create an edge without handles
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_handle: None,
            target: target.into(),
            target_handle: None,
        }
    }

    /// Set the target handle
    pub fn with_target_handle(mut self, handle: impl Into<String>) -> Self {
        self.target_handle = Some(handle.into());
        self
    }

    /// Set the source handle
    pub fn with_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    /// Input key this edge writes to
    pub fn input_key(&self) -> &str {
        self.target_handle.as_deref().unwrap_or(DEFAULT_INPUT_HANDLE)
    }
}

/// Per-node retry policy. Delays are flat, not exponential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Additional attempts after the first failure
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay_ms: u64) -> Self {
        Self {
            max_retries,
            retry_delay_ms,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// A node in a definition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefinition {
    pub id: NodeId,
    /// Registry key for atomic nodes; informational for composites
    pub node_type: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<PortDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<PortDefinition>,
    /// Child nodes; non-empty makes this a composite
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeDefinition>,
    /// Edges among `children`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<GraphEdge>,
    /// Overrides the default weight for `node_type`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Run each batch's children concurrently
    #[serde(default)]
    pub parallel: bool,
    /// Upper bound on concurrently running children of a parallel composite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Child whose output becomes the composite output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_node: Option<NodeId>,
}

impl NodeDefinition {
    /// Create an atomic node
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            parameters: serde_json::Value::Null,
            inputs: Vec::new(),
            outputs: Vec::new(),
            children: Vec::new(),
            edges: Vec::new(),
            weight: None,
            retry: None,
            timeout_ms: None,
            parallel: false,
            max_concurrency: None,
            output_node: None,
        }
    }

    /// Create an empty composite node of type `group`
    pub fn composite(id: impl Into<String>) -> Self {
        Self::new(id, COMPOSITE_NODE_TYPE)
    }

    /// Has children, or is a `group` (possibly still empty)
    pub fn is_composite(&self) -> bool {
        !self.children.is_empty() || self.node_type == COMPOSITE_NODE_TYPE
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_child(mut self, child: NodeDefinition) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: Vec<NodeDefinition>) -> Self {
        self.children = children;
        self
    }

    pub fn with_edge(mut self, edge: GraphEdge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Connect two children, auto-generating the edge id
    pub fn connect(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        let id = format!("edge-{}", self.edges.len() + 1);
        self.edges.push(GraphEdge::new(id, source, target));
        self
    }

    /// Connect two children into a named target handle
    pub fn connect_handle(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        target_handle: impl Into<String>,
    ) -> Self {
        let id = format!("edge-{}", self.edges.len() + 1);
        self.edges
            .push(GraphEdge::new(id, source, target).with_target_handle(target_handle));
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_retry(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.retry = Some(RetryPolicy::new(max_retries, retry_delay_ms));
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_output_node(mut self, node_id: impl Into<String>) -> Self {
        self.output_node = Some(node_id.into());
        self
    }

    /// Find a direct child by ID
    pub fn find_child(&self, id: &str) -> Option<&NodeDefinition> {
        self.children.iter().find(|c| c.id == id)
    }

    /// Edges entering a child
    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a GraphEdge> + 'a {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    /// Edges leaving a child
    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a GraphEdge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Number of nodes in this tree, including self
    pub fn tree_size(&self) -> usize {
        1 + self.children.iter().map(NodeDefinition::tree_size).sum::<usize>()
    }

    /// Ids of every atomic node in this tree, depth first
    pub fn atomic_ids(&self) -> Vec<NodeId> {
        if !self.is_composite() {
            return vec![self.id.clone()];
        }
        self.children.iter().flat_map(NodeDefinition::atomic_ids).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_builder() {
        let group = NodeDefinition::composite("g")
            .with_child(NodeDefinition::new("a", "transform"))
            .with_child(NodeDefinition::new("b", "transform"))
            .connect_handle("a", "b", "data")
            .parallel();

        assert!(group.is_composite());
        assert!(group.parallel);
        assert_eq!(group.edges[0].id, "edge-1");
        assert_eq!(group.edges[0].input_key(), "data");
        assert_eq!(group.incoming_edges("b").count(), 1);
        assert_eq!(group.outgoing_edges("b").count(), 0);
        assert_eq!(group.tree_size(), 3);
        assert_eq!(group.atomic_ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_empty_group_is_composite() {
        let group = NodeDefinition::composite("g");
        assert!(group.is_composite());
        assert!(group.atomic_ids().is_empty());
        assert!(!NodeDefinition::new("n", "http").is_composite());
    }

    #[test]
    fn test_edge_default_handle() {
        let edge = GraphEdge::new("e", "a", "b");
        assert_eq!(edge.input_key(), DEFAULT_INPUT_HANDLE);
    }

    #[test]
    fn test_deserialize_minimal_definition() {
        let json = serde_json::json!({
            "id": "root",
            "nodeType": "group",
            "children": [
                {"id": "a", "nodeType": "http", "retry": {"maxRetries": 2, "retryDelayMs": 50}},
                {"id": "b", "nodeType": "shell", "timeoutMs": 500}
            ],
            "edges": [{"id": "e1", "source": "a", "target": "b", "targetHandle": "body"}],
            "parallel": true
        });

        let def: NodeDefinition = serde_json::from_value(json).unwrap();
        assert!(def.is_composite());
        assert_eq!(def.children[0].retry, Some(RetryPolicy::new(2, 50)));
        assert_eq!(def.children[1].timeout_ms, Some(500));
        assert_eq!(def.edges[0].input_key(), "body");
        assert!(def.parameters.is_null());
    }
}
