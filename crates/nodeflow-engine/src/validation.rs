//! Validation of node trees and executor lookup
//!
//! [`validate_executor`] is the per-invocation check the orchestrator runs
//! before calling an executor. [`validate_node_tree`] is a whole-tree
//! structural check callers can run up front; it reports every problem it
//! finds rather than stopping at the first.

use std::collections::HashSet;
use std::sync::Arc;

use crate::analyzer::topological_sort;
use crate::error::{EngineError, Result};
use crate::registry::{ExecutorRegistry, NodeExecutor};
use crate::types::{NodeDefinition, NodeId};

/// Structural problem found in a node tree
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Two children of the same composite share an id
    DuplicateNodeId { parent_id: NodeId, node_id: NodeId },
    /// An edge references a node that isn't a child of its composite
    UnknownNode {
        parent_id: NodeId,
        edge_id: String,
        node_id: NodeId,
    },
    /// Children of a composite depend on each other in a loop
    CycleDetected { parent_id: NodeId, nodes: Vec<NodeId> },
    /// An atomic node has no registered executor
    UnknownNodeType { node_id: NodeId, node_type: String },
    /// `output_node` names a node that isn't a child
    UnknownOutputNode { parent_id: NodeId, node_id: NodeId },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateNodeId { parent_id, node_id } => {
                write!(f, "Composite '{}' has more than one child '{}'", parent_id, node_id)
            }
            Self::UnknownNode {
                parent_id,
                edge_id,
                node_id,
            } => write!(
                f,
                "Edge '{}' in '{}' references unknown node '{}'",
                edge_id, parent_id, node_id
            ),
            Self::CycleDetected { parent_id, nodes } => {
                write!(f, "Cycle in '{}' among: {}", parent_id, nodes.join(", "))
            }
            Self::UnknownNodeType { node_id, node_type } => {
                write!(f, "Unknown node type '{}' for node '{}'", node_type, node_id)
            }
            Self::UnknownOutputNode { parent_id, node_id } => {
                write!(f, "Output node '{}' is not a child of '{}'", node_id, parent_id)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Resolve the executor for an atomic node
///
/// Distinguishes a missing registry ([`EngineError::NoExecutorFactory`])
/// from a registry that lacks this type ([`EngineError::NodeTypeNotFound`]).
pub fn validate_executor(
    registry: Option<&ExecutorRegistry>,
    node: &NodeDefinition,
) -> Result<Arc<dyn NodeExecutor>> {
    let registry = registry.ok_or(EngineError::NoExecutorFactory)?;
    registry
        .get_executor(&node.node_type)
        .ok_or_else(|| EngineError::NodeTypeNotFound {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
        })
}

/// Check a whole definition tree
///
/// Pass a registry to also check that every atomic node type is registered.
pub fn validate_node_tree(root: &NodeDefinition, registry: Option<&ExecutorRegistry>) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    validate_node(root, registry, &mut errors);
    errors
}

fn validate_node(node: &NodeDefinition, registry: Option<&ExecutorRegistry>, errors: &mut Vec<ValidationError>) {
    if !node.is_composite() {
        if let Some(reg) = registry {
            if !reg.has_node_type(&node.node_type) {
                errors.push(ValidationError::UnknownNodeType {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                });
            }
        }
        return;
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for child in &node.children {
        if !seen.insert(child.id.as_str()) {
            errors.push(ValidationError::DuplicateNodeId {
                parent_id: node.id.clone(),
                node_id: child.id.clone(),
            });
        }
    }

    validate_edge_references(node, &seen, errors);

    if let Some(output) = &node.output_node {
        if !seen.contains(output.as_str()) {
            errors.push(ValidationError::UnknownOutputNode {
                parent_id: node.id.clone(),
                node_id: output.clone(),
            });
        }
    }

    // Cycle check only makes sense once ids are unique
    if seen.len() == node.children.len() {
        detect_cycles(node, &seen, errors);
    }

    for child in &node.children {
        validate_node(child, registry, errors);
    }
}

fn validate_edge_references(node: &NodeDefinition, known: &HashSet<&str>, errors: &mut Vec<ValidationError>) {
    for edge in &node.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !known.contains(endpoint.as_str()) {
                errors.push(ValidationError::UnknownNode {
                    parent_id: node.id.clone(),
                    edge_id: edge.id.clone(),
                    node_id: endpoint.clone(),
                });
            }
        }
    }
}

fn detect_cycles(node: &NodeDefinition, known: &HashSet<&str>, errors: &mut Vec<ValidationError>) {
    let ids: Vec<&str> = node.children.iter().map(|c| c.id.as_str()).collect();
    let pairs: Vec<(NodeId, NodeId)> = node
        .edges
        .iter()
        .filter(|e| known.contains(e.source.as_str()) && known.contains(e.target.as_str()))
        .map(|e| (e.source.clone(), e.target.clone()))
        .collect();

    if let Err(EngineError::GraphCycle { remaining }) = topological_sort(&ids, &pairs) {
        errors.push(ValidationError::CycleDetected {
            parent_id: node.id.clone(),
            nodes: remaining,
        });
    }
}
