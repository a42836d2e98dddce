//! Transport error types

use nodeflow_engine::{ErrorCode, ExecutionError};

/// Errors raised while moving a run across a transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Worker is not running")]
    WorkerUnavailable,

    #[error("Worker dropped the request: {0}")]
    WorkerDropped(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Restart failed: {0}")]
    RestartFailed(String),
}

impl TransportError {
    /// Structured error for a result that never reached the engine
    pub fn to_execution_error(&self, node_id: &str) -> ExecutionError {
        let mut error = ExecutionError::new(node_id, self.to_string());
        error.code = Some(ErrorCode::Internal);
        error
    }
}
