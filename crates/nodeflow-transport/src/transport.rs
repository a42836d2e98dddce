//! Transport contract

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nodeflow_engine::{ExecutionResult, NodeDefinition, RunOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// Everything a run needs besides the node tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportRequest {
    pub input: Value,
    pub variables: HashMap<String, Value>,
    /// Assigned by the transport when absent, so the run can be cancelled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
}

impl TransportRequest {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Default::default()
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Split into the node input and engine run options
    pub fn into_run(self, execution_id: String, cancellation: CancellationToken) -> (Value, RunOptions) {
        let mut options = RunOptions::new()
            .with_execution_id(execution_id)
            .with_variables(self.variables)
            .with_cancellation(cancellation);
        if let Some(debug) = self.debug {
            options = options.with_debug(debug);
        }
        (self.input, options)
    }
}

/// Point-in-time transport status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportHealth {
    pub healthy: bool,
    pub transport: String,
    pub active_runs: usize,
    pub completed_runs: u64,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Where and how runs are executed
///
/// `execute` always yields a result; transport failures are reported as a
/// failed [`ExecutionResult`], the same way the engine reports node failures.
#[async_trait]
pub trait ExecutionTransport: Send + Sync {
    /// Short name for logs and health reports
    fn name(&self) -> &str;

    async fn execute(&self, node: &NodeDefinition, request: TransportRequest) -> ExecutionResult;

    /// Cancel an active run; false if no such run is known
    async fn cancel(&self, execution_id: &str) -> bool;

    async fn health(&self) -> TransportHealth;

    /// Drop all active runs and start fresh
    async fn restart(&self) -> Result<(), TransportError>;
}
