//! Error types for the execution engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the execution engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// No executor registry was handed to the orchestrator
    #[error("No executor registry configured")]
    NoExecutorFactory,

    /// The registry has no executor for this node type
    #[error("No executor registered for node type '{node_type}' (node '{node_id}')")]
    NodeTypeNotFound { node_id: String, node_type: String },

    /// Topological analysis found a cycle
    #[error("Cycle detected among nodes: {}", .remaining.join(", "))]
    GraphCycle { remaining: Vec<String> },

    /// Two children of one composite share an id
    #[error("Duplicate node id '{node_id}' in '{parent_id}'")]
    DuplicateNodeId { parent_id: String, node_id: String },

    /// Executor returned an error
    #[error("Node execution failed: {0}")]
    ExecutionFailed(String),

    /// Executor did not finish within its timeout
    #[error("Node '{node_id}' timed out after {timeout_ms}ms")]
    Timeout { node_id: String, timeout_ms: u64 },

    /// Failure injected by the debug controller
    #[error("Simulated {category} error at node '{node_id}'")]
    DebugSimulated {
        node_id: String,
        category: crate::debug::ErrorCategory,
    },

    /// Run was cancelled
    #[error("Execution cancelled")]
    Cancelled,

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Create an execution failed error with a message
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }

    /// Stable code reported in [`ExecutionError`]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoExecutorFactory => ErrorCode::NoExecutorFactory,
            Self::NodeTypeNotFound { .. } => ErrorCode::NodeTypeNotFound,
            Self::GraphCycle { .. } => ErrorCode::GraphCycle,
            Self::DuplicateNodeId { .. } => ErrorCode::DuplicateNodeId,
            Self::ExecutionFailed(_) => ErrorCode::ExecutionFailed,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::DebugSimulated { .. } => ErrorCode::DebugSimulated,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Config(_) | Self::Serialization(_) | Self::Io(_) => ErrorCode::Internal,
        }
    }

    /// Whether a node should be re-attempted after this error.
    ///
    /// Only node execution errors are retried. Configuration and graph
    /// structure errors are fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExecutionFailed(_) | Self::Timeout { .. } | Self::DebugSimulated { .. }
        )
    }
}

/// Machine-readable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoExecutorFactory,
    NodeTypeNotFound,
    GraphCycle,
    DuplicateNodeId,
    ExecutionFailed,
    Timeout,
    DebugSimulated,
    Cancelled,
    Internal,
}

/// Structured failure carried by an [`crate::ExecutionResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    /// Node that failed (the composite itself for structural failures)
    pub node_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ExecutionError {
    pub fn new(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            message: message.into(),
            code: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Build from an engine error, keeping its code
    pub fn from_engine(node_id: impl Into<String>, err: &EngineError) -> Self {
        Self {
            node_id: node_id.into(),
            message: err.to_string(),
            code: Some(err.code()),
            timestamp: chrono::Utc::now(),
        }
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.node_id, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::failed("boom").is_retryable());
        assert!(EngineError::Timeout {
            node_id: "a".into(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(!EngineError::NoExecutorFactory.is_retryable());
        assert!(!EngineError::GraphCycle { remaining: vec![] }.is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::DuplicateNodeId {
            parent_id: "g".into(),
            node_id: "a".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_execution_error_keeps_code() {
        let err = EngineError::NodeTypeNotFound {
            node_id: "n1".into(),
            node_type: "http".into(),
        };
        let exec = ExecutionError::from_engine("n1", &err);
        assert_eq!(exec.code, Some(ErrorCode::NodeTypeNotFound));
        assert!(exec.message.contains("http"));

        let json = serde_json::to_value(&exec).unwrap();
        assert_eq!(json["code"], "NODE_TYPE_NOT_FOUND");
        assert_eq!(json["nodeId"], "n1");
    }

    #[test]
    fn test_cycle_message_lists_nodes() {
        let err = EngineError::GraphCycle {
            remaining: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Cycle detected among nodes: a, b");
    }
}
